//! Trace loading and validation errors.

use thiserror::Error;

use crate::trace::EndpointId;

/// Errors from loading or validating a trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A message names a sender that is not a declared endpoint.
    #[error("message {index}: invalid from id {id}")]
    UnknownSender {
        /// Position of the message in the trace.
        index: usize,
        /// The undeclared endpoint id.
        id: EndpointId,
    },

    /// A message names a target that is not a declared endpoint.
    #[error("message {index}: invalid to id {id}")]
    UnknownTarget {
        /// Position of the message in the trace.
        index: usize,
        /// The undeclared endpoint id.
        id: EndpointId,
    },

    /// Two endpoints share an id.
    #[error("duplicate endpoint id {0}")]
    DuplicateEndpoint(EndpointId),

    /// Trace file is not valid JSON for the trace schema.
    #[error("invalid trace: {0}")]
    Json(#[from] serde_json::Error),

    /// Trace file could not be read.
    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),
}
