//! Retry with backoff
//!
//! [`RetryPolicy`] re-invokes an operation until it succeeds, an error outside
//! its retryable kinds occurs, or the attempt budget runs out.
//!
//! ```
//! use std::time::Duration;
//! use bulwark_resilience::{Backoff, InstantSleeper, RetryPolicy};
//!
//! let mut policy = RetryPolicy::<String>::new(Duration::from_millis(10));
//! policy.set_max_attempts(5)?;
//! policy.set_backoff(Backoff::exponential(2.0)?);
//! policy.set_sleeper(InstantSleeper);
//!
//! let mut calls = 0;
//! let outcome = policy.run(|| {
//!     calls += 1;
//!     if calls < 3 { Err(format!("flaky #{calls}")) } else { Ok(calls) }
//! });
//!
//! assert_eq!(outcome, Ok(Some(3)));
//! assert_eq!(policy.attempts(), 3);
//! assert_eq!(policy.suppressed().len(), 2);
//! # Ok::<(), bulwark_resilience::ResilienceError>(())
//! ```

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::kinds::Kinds;
use crate::record::FailureRecord;
use crate::report::Reporter;
use crate::sleeper::{Sleeper, ThreadSleeper};

const DEFAULT_SUCCESS: &str = "[RETRY]: {name} succeeded after {attempts}/{max_attempts} attempts";
const DEFAULT_FAILURE: &str =
    "[RETRY]: {name} failed at attempt {attempts}/{max_attempts}; raised {raised}";

/// Attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    /// At most this many invocations per run
    Limited(NonZeroU32),
    /// Retry until success or a non-retryable error
    Unbounded,
}

impl MaxAttempts {
    /// A finite budget.
    ///
    /// # Errors
    ///
    /// Zero attempts is rejected.
    pub fn limited(attempts: u32) -> ResilienceResult<Self> {
        NonZeroU32::new(attempts)
            .map(Self::Limited)
            .ok_or_else(|| ResilienceError::invalid_config("max_attempts must be at least 1"))
    }

    /// The finite limit, if any
    pub fn get(self) -> Option<u32> {
        match self {
            Self::Limited(n) => Some(n.get()),
            Self::Unbounded => None,
        }
    }

    fn allows_another(self, made: u32) -> bool {
        match self {
            Self::Limited(n) => made < n.get(),
            Self::Unbounded => true,
        }
    }
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self::Limited(NonZeroU32::new(3).unwrap_or(NonZeroU32::MIN))
    }
}

impl fmt::Display for MaxAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unbounded => write!(f, "unbounded"),
        }
    }
}

type RetryObserver<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;

enum Step<E> {
    Wait(Duration),
    Raise(E),
    Exhausted,
}

/// Bounded or unbounded retry loop with pluggable backoff.
///
/// `attempts` restarts at zero for every run. `suppressed` keeps growing
/// across runs until [`clear_suppressed`](Self::clear_suppressed).
pub struct RetryPolicy<E> {
    name: Cow<'static, str>,
    max_attempts: MaxAttempts,
    delay: Duration,
    backoff: Backoff,
    kinds: Kinds<E>,
    raise_last: bool,
    on_retry: Option<RetryObserver<E>>,
    sleeper: Arc<dyn Sleeper>,
    reporter: Reporter,
    attempts: u32,
    suppressed: Vec<FailureRecord<E>>,
}

impl<E> RetryPolicy<E>
where
    E: Clone + fmt::Display + fmt::Debug + 'static,
{
    /// Three attempts, constant `delay`, every error retryable, last error
    /// re-raised.
    pub fn new(delay: Duration) -> Self {
        Self {
            name: Cow::Borrowed("operation"),
            max_attempts: MaxAttempts::default(),
            delay,
            backoff: Backoff::constant(),
            kinds: Kinds::any(),
            raise_last: true,
            on_retry: None,
            sleeper: Arc::new(ThreadSleeper),
            reporter: Reporter::default(),
            attempts: 0,
            suppressed: Vec::new(),
        }
    }

    /// Build from a validated [`RetryConfig`].
    pub fn from_config(config: &RetryConfig) -> ResilienceResult<Self> {
        config.validate()?;
        let mut policy = Self::new(config.delay);
        policy.max_attempts = match config.max_attempts {
            Some(n) => MaxAttempts::limited(n)?,
            None => MaxAttempts::Unbounded,
        };
        policy.raise_last = config.raise_last;
        Ok(policy)
    }

    // ---- configuration -------------------------------------------------

    /// Name used in logs and reports
    pub fn set_name(&mut self, name: impl Into<Cow<'static, str>>) {
        self.name = name.into();
    }

    /// Limit invocations per run. Zero is rejected.
    pub fn set_max_attempts(&mut self, attempts: u32) -> ResilienceResult<()> {
        self.max_attempts = MaxAttempts::limited(attempts)?;
        Ok(())
    }

    /// Retry until success or a non-retryable error.
    pub fn set_unbounded(&mut self) {
        self.max_attempts = MaxAttempts::Unbounded;
    }

    /// Base delay fed to the backoff.
    pub fn set_delay(&mut self, delay: Duration) -> ResilienceResult<()> {
        self.delay = delay;
        Ok(())
    }

    /// Base delay in seconds. Negative and non-finite values are rejected.
    pub fn set_delay_secs(&mut self, secs: f64) -> ResilienceResult<()> {
        let delay = Duration::try_from_secs_f64(secs).map_err(|_| {
            ResilienceError::invalid_config(format!(
                "delay must be a finite, non-negative number of seconds, got {secs}"
            ))
        })?;
        self.set_delay(delay)
    }

    /// Next-delay function
    pub fn set_backoff(&mut self, backoff: Backoff) {
        self.backoff = backoff;
    }

    /// Retryable error kinds. An empty set is rejected.
    pub fn set_exceptions(&mut self, kinds: Kinds<E>) -> ResilienceResult<()> {
        kinds.validate("exceptions")?;
        self.kinds = kinds;
        Ok(())
    }

    /// Whether exhaustion returns the last error (`true`) or `Ok(None)`
    pub fn set_raise_last(&mut self, raise_last: bool) {
        self.raise_last = raise_last;
    }

    /// Called with the attempt number and error before each retry
    pub fn set_on_retry(&mut self, observer: impl Fn(u32, &E) + Send + Sync + 'static) {
        self.on_retry = Some(Arc::new(observer));
    }

    /// How to block between attempts of [`run`](Self::run)
    pub fn set_sleeper(&mut self, sleeper: impl Sleeper + 'static) {
        self.sleeper = Arc::new(sleeper);
    }

    /// Outcome reporting
    pub fn set_reporter(&mut self, reporter: Reporter) {
        self.reporter = reporter;
    }

    // ---- inspection ----------------------------------------------------

    /// Name used in logs and reports
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attempt budget
    pub fn max_attempts(&self) -> MaxAttempts {
        self.max_attempts
    }

    /// Base delay
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Next-delay function
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Retryable kinds
    pub fn exceptions(&self) -> &Kinds<E> {
        &self.kinds
    }

    /// Whether exhaustion re-raises
    pub fn raise_last(&self) -> bool {
        self.raise_last
    }

    /// Invocations made by the current or most recent run
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Retryable failures captured so far
    pub fn suppressed(&self) -> &[FailureRecord<E>] {
        &self.suppressed
    }

    /// Forget captured failures; configuration is kept
    pub fn clear_suppressed(&mut self) {
        self.suppressed.clear();
    }

    // ---- execution -----------------------------------------------------

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` on exhaustion with
    /// `raise_last` off, and the error itself otherwise.
    pub fn run<T, F>(&mut self, mut op: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Result<T, E>,
    {
        self.begin();
        let mut delay = self.delay;
        loop {
            self.next_attempt();
            match op() {
                Ok(value) => {
                    self.succeeded();
                    return Ok(Some(value));
                }
                Err(error) => match self.failed(error, &mut delay) {
                    Step::Wait(wait) => self.sleeper.sleep(wait),
                    Step::Raise(error) => return Err(error),
                    Step::Exhausted => return Ok(None),
                },
            }
        }
    }

    /// Async counterpart of [`run`](Self::run); waits with `tokio::time::sleep`.
    pub async fn run_async<T, F, Fut>(&mut self, mut op: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.begin();
        let mut delay = self.delay;
        loop {
            self.next_attempt();
            match op().await {
                Ok(value) => {
                    self.succeeded();
                    return Ok(Some(value));
                }
                Err(error) => match self.failed(error, &mut delay) {
                    Step::Wait(wait) => tokio::time::sleep(wait).await,
                    Step::Raise(error) => return Err(error),
                    Step::Exhausted => return Ok(None),
                },
            }
        }
    }

    /// Wrap `f` so every call is retried with a clone of its argument.
    pub fn wrap<A, T, F>(&mut self, mut f: F) -> impl FnMut(A) -> Result<Option<T>, E>
    where
        A: Clone,
        F: FnMut(A) -> Result<T, E>,
    {
        move |arg| self.run(|| f(arg.clone()))
    }

    fn begin(&mut self) {
        self.attempts = 0;
        debug!(
            policy = %self.name,
            max_attempts = %self.max_attempts,
            backoff = self.backoff.name(),
            "Starting retry run"
        );
    }

    fn next_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    fn succeeded(&self) {
        self.reporter.success(
            DEFAULT_SUCCESS,
            &[
                ("name", &self.name),
                ("attempts", &self.attempts),
                ("max_attempts", &self.max_attempts),
            ],
        );
    }

    fn failed(&mut self, error: E, delay: &mut Duration) -> Step<E> {
        let attempt = self.attempts;
        let Some(kind) = self.kinds.classify(&error) else {
            debug!(
                policy = %self.name,
                attempt,
                error = %error,
                "Error is not retryable"
            );
            return Step::Raise(error);
        };

        self.reporter.failure(
            DEFAULT_FAILURE,
            &[
                ("name", &self.name),
                ("attempts", &attempt),
                ("max_attempts", &self.max_attempts),
                ("raised", &error),
                ("kind", &kind),
            ],
        );
        self.suppressed
            .push(FailureRecord::capture(kind, error.clone()).with_attempt(attempt));

        if !self.max_attempts.allows_another(attempt) {
            warn!(
                policy = %self.name,
                attempts = attempt,
                error = %error,
                "Retry attempts exhausted"
            );
            return if self.raise_last {
                Step::Raise(error)
            } else {
                Step::Exhausted
            };
        }

        if let Some(observer) = &self.on_retry {
            observer(attempt, &error);
        }

        *delay = self.backoff.next(*delay, attempt);
        debug!(
            policy = %self.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = ?error,
            "Retrying after failure"
        );
        Step::Wait(*delay)
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("backoff", &self.backoff)
            .field("exceptions", &self.kinds)
            .field("raise_last", &self.raise_last)
            .field("sleeper", &self.sleeper)
            .field("attempts", &self.attempts)
            .field("suppressed", &self.suppressed.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TrackingSleeper;
    use bulwark_log::MemorySink;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Failure {
        Transient(u32),
        Fatal,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Transient(n) => write!(f, "transient #{n}"),
                Self::Fatal => write!(f, "fatal"),
            }
        }
    }

    fn transient() -> Kinds<Failure> {
        Kinds::matching("Transient", |e: &Failure| matches!(e, Failure::Transient(_)))
    }

    fn policy(max_attempts: u32, delay: Duration) -> (RetryPolicy<Failure>, TrackingSleeper) {
        let sleeper = TrackingSleeper::new();
        let mut policy = RetryPolicy::new(delay);
        policy.set_max_attempts(max_attempts).expect("positive");
        policy.set_sleeper(sleeper.clone());
        policy.set_reporter(Reporter::silent());
        (policy, sleeper)
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let (mut policy, sleeper) = policy(3, Duration::ZERO);
        policy.set_exceptions(transient()).expect("non-empty");

        let mut calls = 0;
        let outcome = policy.run(|| {
            calls += 1;
            if calls < 3 { Err(Failure::Transient(calls)) } else { Ok(42) }
        });

        assert_eq!(outcome, Ok(Some(42)));
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.suppressed().len(), 2);
        assert_eq!(policy.suppressed()[1].attempt(), Some(2));
        assert_eq!(sleeper.call_count(), 2);
    }

    #[test]
    fn test_exhaustion_reraises_last_error() {
        let (mut policy, sleeper) = policy(2, Duration::from_millis(5));
        let mut calls = 0;
        let outcome: Result<Option<()>, _> = policy.run(|| {
            calls += 1;
            Err(Failure::Transient(calls))
        });

        assert_eq!(outcome, Err(Failure::Transient(2)));
        assert_eq!(policy.attempts(), 2);
        assert_eq!(policy.suppressed().len(), 2);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(5)]);
    }

    #[test]
    fn test_exhaustion_without_raise_last() {
        let (mut policy, _) = policy(2, Duration::ZERO);
        policy.set_raise_last(false);
        let outcome: Result<Option<()>, _> = policy.run(|| Err(Failure::Transient(0)));
        assert_eq!(outcome, Ok(None));
        assert_eq!(policy.attempts(), 2);
    }

    #[test]
    fn test_non_retryable_error_propagates_immediately() {
        let (mut policy, sleeper) = policy(5, Duration::ZERO);
        policy.set_exceptions(transient()).expect("non-empty");

        let outcome: Result<Option<()>, _> = policy.run(|| Err(Failure::Fatal));
        assert_eq!(outcome, Err(Failure::Fatal));
        assert_eq!(policy.attempts(), 1);
        assert!(policy.suppressed().is_empty());
        assert_eq!(sleeper.call_count(), 0);
    }

    #[test]
    fn test_attempts_reset_but_suppressed_accumulates() {
        let (mut policy, _) = policy(2, Duration::ZERO);
        let _ = policy.run(|| Err::<(), _>(Failure::Transient(1)));
        let _ = policy.run(|| Err::<(), _>(Failure::Transient(2)));
        assert_eq!(policy.attempts(), 2);
        assert_eq!(policy.suppressed().len(), 4);

        policy.clear_suppressed();
        assert!(policy.suppressed().is_empty());
        assert_eq!(policy.max_attempts().get(), Some(2));
    }

    #[test]
    fn test_on_retry_sees_each_retried_failure() {
        let (mut policy, _) = policy(3, Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        policy.set_on_retry(move |attempt, error: &Failure| {
            log.lock().push((attempt, error.clone()));
        });

        let mut calls = 0;
        let _ = policy.run(|| {
            calls += 1;
            Err::<(), _>(Failure::Transient(calls))
        });

        // the final failure is not followed by a retry
        assert_eq!(
            *seen.lock(),
            vec![(1, Failure::Transient(1)), (2, Failure::Transient(2))]
        );
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let (mut policy, sleeper) = policy(4, Duration::from_millis(10));
        policy.set_backoff(Backoff::exponential(2.0).expect("valid factor"));
        let _ = policy.run(|| Err::<(), _>(Failure::Transient(0)));
        assert_eq!(
            sleeper.calls(),
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80)
            ]
        );
    }

    #[test]
    fn test_unbounded_runs_until_success() {
        let (mut policy, sleeper) = policy(1, Duration::ZERO);
        policy.set_unbounded();
        let mut calls = 0;
        let outcome = policy.run(|| {
            calls += 1;
            if calls < 50 { Err(Failure::Transient(calls)) } else { Ok(calls) }
        });
        assert_eq!(outcome, Ok(Some(50)));
        assert_eq!(sleeper.call_count(), 49);
        assert_eq!(policy.max_attempts().to_string(), "unbounded");
    }

    #[test]
    fn test_unbounded_attempt_counter_saturates() {
        let (mut policy, _) = policy(1, Duration::ZERO);
        policy.set_unbounded();
        policy.attempts = u32::MAX - 1;
        policy.next_attempt();
        policy.next_attempt();
        assert_eq!(policy.attempts(), u32::MAX);

        let mut delay = Duration::ZERO;
        assert!(matches!(
            policy.failed(Failure::Transient(0), &mut delay),
            Step::Wait(_)
        ));
        assert_eq!(policy.suppressed().last().and_then(FailureRecord::attempt), Some(u32::MAX));
    }

    #[test]
    fn test_setters_validate_eagerly() {
        let mut policy = RetryPolicy::<Failure>::new(Duration::ZERO);
        assert!(policy.set_max_attempts(0).is_err());
        assert_eq!(policy.max_attempts().get(), Some(3));
        assert!(policy.set_delay_secs(-1.0).is_err());
        assert!(policy.set_delay_secs(f64::NAN).is_err());
        policy.set_delay_secs(0.25).expect("valid delay");
        assert_eq!(policy.delay(), Duration::from_millis(250));
        assert!(policy.set_exceptions(Kinds::empty()).is_err());
        assert_eq!(policy.exceptions().len(), 1);
    }

    #[test]
    fn test_reports_failures_and_success() {
        let (mut policy, _) = policy(3, Duration::ZERO);
        let sink = MemorySink::new();
        policy.set_name("fetch");
        policy.set_reporter(Reporter::new(sink.clone()));

        let mut calls = 0;
        let _ = policy.run(|| {
            calls += 1;
            if calls < 2 { Err(Failure::Transient(calls)) } else { Ok(()) }
        });

        assert_eq!(
            sink.messages(),
            vec![
                "[RETRY]: fetch failed at attempt 1/3; raised transient #1".to_string(),
                "[RETRY]: fetch succeeded after 2/3 attempts".to_string(),
            ]
        );
    }

    #[test]
    fn test_wrap_retries_with_same_argument() {
        let (mut policy, _) = policy(3, Duration::ZERO);
        let mut seen = Vec::new();
        {
            let mut lookup = policy.wrap(|key: String| {
                seen.push(key.clone());
                if seen.len() < 2 { Err(Failure::Transient(0)) } else { Ok(key.len()) }
            });
            assert_eq!(lookup("abc".to_string()), Ok(Some(3)));
        }
        assert_eq!(seen, vec!["abc".to_string(), "abc".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_async_sleeps_between_attempts() {
        let mut policy = RetryPolicy::<Failure>::new(Duration::from_secs(1));
        policy.set_reporter(Reporter::silent());
        let start = tokio::time::Instant::now();

        let mut calls = 0;
        let outcome = policy
            .run_async(|| {
                calls += 1;
                let current = calls;
                async move {
                    if current < 3 { Err(Failure::Transient(current)) } else { Ok(current) }
                }
            })
            .await;

        assert_eq!(outcome, Ok(Some(3)));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_max_attempts(max in 1_u32..20, succeed_at in 1_u32..40) {
            let (mut policy, _) = policy(max, Duration::ZERO);
            let mut calls = 0_u32;
            let outcome = policy.run(|| {
                calls += 1;
                if calls >= succeed_at { Ok(calls) } else { Err(Failure::Transient(calls)) }
            });

            prop_assert!(calls <= max);
            prop_assert_eq!(policy.attempts(), calls);
            if succeed_at <= max {
                prop_assert_eq!(outcome, Ok(Some(succeed_at)));
            } else {
                prop_assert_eq!(outcome, Err(Failure::Transient(max)));
            }
        }

        #[test]
        fn prop_delays_follow_iterated_backoff(
            max in 1_u32..12,
            base_ms in 0_u64..1_000,
            step_ms in 0_u64..500,
        ) {
            let (mut policy, sleeper) = policy(max, Duration::from_millis(base_ms));
            let backoff = Backoff::linear(Duration::from_millis(step_ms));
            policy.set_backoff(backoff.clone());
            let _ = policy.run(|| Err::<(), _>(Failure::Transient(0)));

            let expected: Vec<Duration> = backoff
                .delays(Duration::from_millis(base_ms))
                .take(max as usize - 1)
                .collect();
            prop_assert_eq!(sleeper.calls(), expected);
        }
    }
}
