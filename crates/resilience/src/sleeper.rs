//! Blocking waits between retry attempts
//!
//! [`RetryPolicy`](crate::RetryPolicy) never calls `thread::sleep` directly;
//! swapping the [`Sleeper`] makes delay sequences observable without waiting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Blocks the calling thread for a duration.
pub trait Sleeper: Send + Sync + fmt::Debug {
    /// Wait for `duration`
    fn sleep(&self, duration: Duration);
}

/// Sleeps with [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) {}
}

/// Records requested durations and returns immediately.
///
/// Clones share the record, so keep one handle and give another to the policy.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested durations in order
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().clone()
    }

    /// Number of waits requested
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sum of requested durations
    pub fn total(&self) -> Duration {
        self.calls.lock().iter().sum()
    }

    /// Forget recorded waits
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) {
        self.calls.lock().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_tracking_sleeper_records_without_blocking() {
        let tracker = TrackingSleeper::new();
        let shared: Arc<dyn Sleeper> = Arc::new(tracker.clone());

        let start = Instant::now();
        shared.sleep(Duration::from_secs(60));
        shared.sleep(Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(
            tracker.calls(),
            vec![Duration::from_secs(60), Duration::from_secs(30)]
        );
        assert_eq!(tracker.total(), Duration::from_secs(90));
        tracker.clear();
        assert_eq!(tracker.call_count(), 0);
    }

    #[test]
    fn test_thread_sleeper_waits() {
        let start = Instant::now();
        ThreadSleeper.sleep(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
