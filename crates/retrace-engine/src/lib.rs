//! Retrace replay engine.
//!
//! Turns a declarative [`Trace`](retrace_core::Trace) into live socket
//! activity: servers bind and drain, clients dial, write and close with the
//! recorded timing.
//!
//! ## Architecture
//!
//! ```text
//! retrace-engine
//!   ├─ Engine            (lifecycle, coarse state lock, run generations)
//!   ├─ client::run       (per-client replay loop)
//!   ├─ server::run       (listener accept loop + drain tasks)
//!   ├─ ConnectionTable   (per-client outbound connections)
//!   ├─ EngineConfig      (construction parameters, config file)
//!   ├─ SystemEnv         (production Environment impl)
//!   └─ LogPipeline       (retrace-log, replay log)
//! ```
//!
//! ## Cancellation
//!
//! ```text
//! shared token (replaced by stop_all)
//!   └─ per-run token (stop_endpoint)
//!        └─ per-listener token
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
pub mod config;
mod engine;
mod error;
pub mod registry;
mod server;
mod system_env;

pub use client::DIAL_TIMEOUT;
pub use config::{AppConfig, EngineConfig};
pub use engine::{Engine, EngineSnapshot};
pub use error::{ConfigError, EngineError, MessageError};
pub use registry::EndpointStats;
pub use retrace_core::{EndpointId, EndpointStatus, Environment, Trace};
pub use retrace_log::{LogPipeline, LogSubscriber};
pub use server::DRAIN_DEADLINE;
pub use system_env::SystemEnv;
