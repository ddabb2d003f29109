//! Endpoint lifecycle status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status reported for an endpoint.
///
/// Unknown or never-started endpoints report [`EndpointStatus::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Not running (never started, or stopped by the user).
    #[default]
    Idle,
    /// Task active: a client replaying its messages, or a server listening.
    Running,
    /// Client finished its message sequence without errors.
    Completed,
    /// A message action or listener setup failed.
    Error,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}
