//! # Bulwark Resilience
//!
//! Primitives that protect a region of code and decide what its failures
//! turn into.
//!
//! ## Features
//!
//! - **Timeouts**: [`TimeoutGuard`] bounds wall-clock time, cooperatively for
//!   blocking bodies and by cancellation for futures
//! - **Retries**: [`RetryPolicy`] re-runs an operation with pluggable
//!   [`Backoff`] and a filter of retryable error kinds
//! - **Failure handlers**: [`FailureManager`] records intercepted errors and
//!   dispatches each one to the first applicable handler of a
//!   priority-ordered [`HandlerChain`] (suppress, fall back, or translate)
//! - **Reporting**: [`Reporter`] renders success and failure messages from
//!   templates into a `bulwark_log::LogSink`
//!
//! Errors of the protected code are never wrapped: a caller sees the value,
//! a fallback value, a translated error, or the original error.
//!
//! ## Quick Start
//!
//! ```rust
//! use bulwark_resilience::prelude::*;
//! use std::time::Duration;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum FetchError { Unavailable, TimedOut }
//! # impl std::fmt::Display for FetchError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{self:?}") }
//! # }
//! impl From<TimeoutExceeded> for FetchError {
//!     fn from(_: TimeoutExceeded) -> Self { Self::TimedOut }
//! }
//!
//! let guard = TimeoutGuard::<FetchError>::new(Duration::from_millis(200))?;
//! let mut retry = RetryPolicy::new(Duration::ZERO);
//! retry.set_max_attempts(3)?;
//! let mut manager = FailureManager::new([FailureHandler::fallback_value("cached")])?;
//!
//! let mut calls = 0;
//! let outcome = manager.protect(|| {
//!     retry
//!         .run(|| {
//!             calls += 1;
//!             guard.protect(|_| if calls < 3 { Err(FetchError::Unavailable) } else { Ok("fresh") })
//!         })
//!         .map(|value| value.unwrap_or("cached"))
//! });
//!
//! assert_eq!(outcome, Ok(Some("fresh")));
//! # Ok::<(), ResilienceError>(())
//! ```

#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod backoff;
mod chain;
mod config;
mod error;
mod handler;
mod kinds;
mod manager;
mod record;
mod report;
mod retry;
mod sleeper;
mod timeout;

pub use backoff::{Backoff, JitterPolicy};
pub use chain::HandlerChain;
pub use config::{RetryConfig, TimeoutConfig};
pub use error::{ResilienceError, ResilienceResult, TimeoutExceeded};
pub use handler::{Fallback, FailureHandler, HandlerKind, Translate};
pub use kinds::{Kinds, SharedError};
pub use manager::{FailureManager, FailureManagerBuilder};
pub use record::FailureRecord;
pub use report::Reporter;
pub use retry::{MaxAttempts, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, ThreadSleeper, TrackingSleeper};
pub use timeout::{Armed, Checkpoint, Strategy, TimeoutGuard};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{
        Backoff, Checkpoint, FailureHandler, FailureManager, Kinds, ResilienceError,
        ResilienceResult, RetryPolicy, SharedError, TimeoutExceeded, TimeoutGuard,
    };
}
