//! Core types for the retrace replay engine.
//!
//! This crate is pure data and logic with no network I/O:
//!
//! - [`Trace`]: endpoints, ordered messages and the per-sender index the
//!   engine replays from
//! - [`EndpointStatus`]: lifecycle state reported for every endpoint
//! - [`Environment`]: time abstraction so replay timing can be observed in
//!   tests without touching the engine

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod status;
pub mod trace;

pub use env::Environment;
pub use error::TraceError;
pub use status::EndpointStatus;
pub use trace::{Endpoint, EndpointId, Globals, Message, MessageKind, Role, Trace};
