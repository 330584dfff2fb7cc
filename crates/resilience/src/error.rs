//! Error types for resilience operations

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the primitives themselves, as opposed to errors of the
/// protected code, which always pass through in their own type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Invalid constructor or setter argument
    #[error("Invalid resilience configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// No deadline mechanism exists for the requested strategy on this target
    #[error("Timeout strategy {strategy} is not supported on {platform}")]
    UnsupportedPlatform {
        /// Requested strategy, or `"any"` during detection
        strategy: &'static str,
        /// Target OS family
        platform: &'static str,
    },

    /// Two handlers in one chain would share a priority
    #[error("A handler with priority {priority} is already registered")]
    PriorityConflict {
        /// Contested priority
        priority: i64,
    },

    /// No handler is registered under the given priority
    #[error("No handler with priority {priority}")]
    HandlerNotFound {
        /// Requested priority
        priority: i64,
    },

    /// Deadline reached
    #[error(transparent)]
    Timeout(#[from] TimeoutExceeded),
}

impl ResilienceError {
    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an unsupported platform error for the current target
    pub fn unsupported_platform(strategy: &'static str) -> Self {
        Self::UnsupportedPlatform {
            strategy,
            platform: std::env::consts::OS,
        }
    }

    /// Whether this error came from validating arguments
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::UnsupportedPlatform { .. }
                | Self::PriorityConflict { .. }
                | Self::HandlerNotFound { .. }
        )
    }
}

/// Default error produced when a [`TimeoutGuard`](crate::TimeoutGuard)
/// deadline passes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation timed out after {elapsed:?} (cutoff {cutoff:?})")]
pub struct TimeoutExceeded {
    /// Configured deadline
    pub cutoff: Duration,
    /// Time actually spent in the protected region
    pub elapsed: Duration,
}

/// Result type for configuration and chain management
pub type ResilienceResult<T> = Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ResilienceError::invalid_config("max_attempts must be positive").to_string(),
            "Invalid resilience configuration: max_attempts must be positive"
        );
        assert_eq!(
            ResilienceError::PriorityConflict { priority: 3 }.to_string(),
            "A handler with priority 3 is already registered"
        );
        assert_eq!(
            ResilienceError::HandlerNotFound { priority: -1 }.to_string(),
            "No handler with priority -1"
        );
    }

    #[test]
    fn test_timeout_is_transparent() {
        let exceeded = TimeoutExceeded {
            cutoff: Duration::from_millis(50),
            elapsed: Duration::from_millis(51),
        };
        let err = ResilienceError::from(exceeded);
        assert_eq!(err.to_string(), exceeded.to_string());
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(ResilienceError::invalid_config("x").is_config_error());
        assert!(ResilienceError::unsupported_platform("watchdog").is_config_error());
        assert!(ResilienceError::PriorityConflict { priority: 0 }.is_config_error());
    }
}
