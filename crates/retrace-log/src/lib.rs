//! Replay log pipeline.
//!
//! Every engine event becomes one timestamped line that fans out to three
//! consumers:
//!
//! ```text
//! write(msg)
//!   ├─ LineRing        (last N lines, read_all)
//!   ├─ persist queue   → flush task → append-only file
//!   └─ live queue      → LogSubscriber
//! ```
//!
//! Writers never wait on disk or on a slow subscriber. Both queues are
//! bounded and drop on overflow; the ring is always updated.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
mod persist;
pub mod pipeline;
pub mod ring;

pub use error::LogError;
pub use pipeline::{LogConfig, LogPipeline, LogSubscriber, format_line};
pub use ring::LineRing;
