//! Engine error types.

use std::{path::PathBuf, time::Duration};

use retrace_core::{EndpointId, TraceError};
use retrace_log::LogError;
use thiserror::Error;

/// Errors from constructing an engine or loading its configuration.
///
/// Runtime failures never surface here: `start_endpoint` and
/// `stop_endpoint` report through endpoint status and the replay log.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Log pipeline could not be opened
    #[error("log pipeline error: {0}")]
    Log(#[from] LogError),

    /// Configuration file could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Trace could not be loaded or failed validation
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

/// Errors from loading the JSON configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File exists but could not be read
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// File is not valid configuration JSON
    #[error("invalid config {}: {source}", path.display())]
    Json {
        /// Config file path
        path: PathBuf,
        /// Parse error
        source: serde_json::Error,
    },
}

/// Failure of a single replayed message.
///
/// Message errors are non-fatal: the client logs them, marks itself
/// `Error` and moves on to its next message.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Target id is not a declared endpoint
    #[error("unknown target endpoint {0}")]
    UnknownTarget(EndpointId),

    /// Dial failed
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Dialed address
        addr: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Dial did not complete in time
    #[error("connect to {addr} timed out after {}ms", timeout.as_millis())]
    ConnectTimeout {
        /// Dialed address
        addr: String,
        /// Dial bound
        timeout: Duration,
    },

    /// Payload is not valid hex
    #[error("invalid payload: {0}")]
    Payload(#[from] hex::FromHexError),

    /// Write failed
    #[error("write failed: {source}")]
    Write {
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Write did not complete in time
    #[error("write timed out after {}ms", timeout.as_millis())]
    WriteTimeout {
        /// Write bound
        timeout: Duration,
    },

    /// Connection was closed by a concurrent stop while writing
    #[error("connection closed")]
    ConnectionClosed,
}
