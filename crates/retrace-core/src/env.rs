//! Environment abstraction for replay timing.
//!
//! The `Environment` trait decouples the replay loop from the system clock.
//! Inter-message delays and elapsed-time reporting go through it, so:
//!
//! - Production: the tokio-backed implementation sleeps for real.
//! - Tests: an implementation can record the requested delays and return
//!   immediately, which makes delay semantics checkable without wall-clock
//!   waits.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Isolation: implementations must not share global state

use std::time::{Duration, Instant};

/// Abstract environment providing time and async sleeping.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Returns the current time.
    ///
    /// Subsequent calls must return times >= previous calls.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration.
    ///
    /// The replay loop races this future against cancellation, so
    /// implementations do not need to observe cancellation themselves.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Time elapsed since `earlier`, saturating at zero.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}
