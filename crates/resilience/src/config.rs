//! Serializable configuration for retry and timeout primitives
//!
//! Durations use serde's default `{ secs, nanos }` form, or strings such as
//! `"250ms"` and `"1m 30s"` when the `humantime` feature is on.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ResilienceError, ResilienceResult};

/// Settings for a [`RetryPolicy`](crate::RetryPolicy)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempt budget; `None` retries without limit
    pub max_attempts: Option<u32>,

    /// Base wait between attempts
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub delay: Duration,

    /// Re-raise the last error on exhaustion
    pub raise_last: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            delay: Duration::from_millis(100),
            raise_last: true,
        }
    }
}

impl RetryConfig {
    /// Check invariants without building a policy.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_attempts == Some(0) {
            return Err(ResilienceError::invalid_config(
                "max_attempts must be at least 1, or omitted for unbounded",
            ));
        }
        Ok(())
    }
}

/// Settings for a [`TimeoutGuard`](crate::TimeoutGuard)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub cutoff: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cutoff: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Check invariants without building a guard.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.cutoff.is_zero() {
            return Err(ResilienceError::invalid_config("cutoff must be positive"));
        }
        Ok(())
    }
}
