//! Log pipeline errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from opening a log pipeline.
///
/// Only setup can fail. Once open, persistence is best effort and never
/// reports errors to writers.
#[derive(Debug, Error)]
pub enum LogError {
    /// Parent directory of the log file could not be created.
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Log file could not be opened for appending.
    #[error("failed to open log file {}: {source}", path.display())]
    Open {
        /// File that could not be opened.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}
