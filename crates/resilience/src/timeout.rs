//! Deadline enforcement
//!
//! A [`TimeoutGuard`] bounds the wall-clock time of a protected region. Safe
//! Rust cannot interrupt a thread from the outside, so synchronous bodies
//! cooperate through a [`Checkpoint`]: [`Checkpoint::check`] fails once the
//! deadline has passed and [`Checkpoint::sleep`] wakes early when it does.
//! A body that blocks without reaching a checkpoint runs to completion; its
//! outcome is still replaced by the timeout error if it finished late.
//!
//! ```
//! use std::time::Duration;
//! use bulwark_resilience::{TimeoutExceeded, TimeoutGuard};
//!
//! let guard = TimeoutGuard::<TimeoutExceeded>::new(Duration::from_millis(50))?;
//! let late = guard
//!     .protect(|_| {
//!         std::thread::sleep(Duration::from_millis(300));
//!         Ok(())
//!     })
//!     .expect_err("finished after the deadline");
//!
//! // no checkpoint was reached, so the body ran its full length
//! assert!(late.elapsed >= Duration::from_millis(300));
//! # Ok::<(), bulwark_resilience::ResilienceError>(())
//! ```
//!
//! Async bodies go through [`TimeoutGuard::protect_async`], which cancels the
//! future at its next await point.
//!
//! # Strategies
//!
//! - [`Strategy::Timer`] compares the monotonic clock against the deadline at
//!   every checkpoint; no extra thread.
//! - [`Strategy::Watchdog`] parks a named background thread until the
//!   deadline, which then raises the expiry flag once and wakes any
//!   checkpoint waits.
//!
//! ```
//! use std::time::Duration;
//! use bulwark_resilience::{TimeoutExceeded, TimeoutGuard};
//!
//! let guard = TimeoutGuard::<TimeoutExceeded>::new(Duration::from_millis(20))?;
//! let outcome = guard.protect(|checkpoint| {
//!     checkpoint.sleep(Duration::from_secs(5))?;
//!     Ok("finished")
//! });
//!
//! let exceeded = outcome.expect_err("deadline passed");
//! assert!(exceeded.elapsed >= Duration::from_millis(20));
//! # Ok::<(), bulwark_resilience::ResilienceError>(())
//! ```

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::TimeoutConfig;
use crate::error::{ResilienceError, ResilienceResult, TimeoutExceeded};
use crate::report::Reporter;

const DEFAULT_SUCCESS: &str = "[TIMEOUT]: {name} ran in under {cutoff}";
const DEFAULT_FAILURE: &str = "[TIMEOUT]: {name} exceeded {cutoff} (elapsed {elapsed})";
const WATCHDOG_THREAD: &str = "bulwark-watchdog";
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// How expiry is observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Deadline checked against the monotonic clock at each checkpoint
    Timer,
    /// Background thread raises the expiry flag at the deadline
    Watchdog,
}

impl Strategy {
    /// The preferred strategy for the current target.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::UnsupportedPlatform`] on targets with neither.
    pub fn detect() -> ResilienceResult<Self> {
        if cfg!(unix) {
            Ok(Self::Timer)
        } else if cfg!(windows) {
            Ok(Self::Watchdog)
        } else {
            Err(ResilienceError::unsupported_platform("any"))
        }
    }

    fn ensure_supported(self) -> ResilienceResult<()> {
        match self {
            Self::Watchdog if cfg!(target_family = "wasm") => {
                Err(ResilienceError::unsupported_platform(self.as_str()))
            }
            _ => Ok(()),
        }
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Watchdog => "watchdog",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared expiry state of one armed region.
struct Alarm {
    strategy: Strategy,
    started: Instant,
    deadline: Instant,
    fired: AtomicBool,
    disarmed: Mutex<bool>,
    wake: Condvar,
}

impl Alarm {
    fn new(strategy: Strategy, cutoff: Duration) -> Self {
        let started = Instant::now();
        let deadline = started
            .checked_add(cutoff)
            .unwrap_or_else(|| started + FAR_FUTURE);
        Self {
            strategy,
            started,
            deadline,
            fired: AtomicBool::new(false),
            disarmed: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn fired(&self) -> bool {
        if self.strategy == Strategy::Timer && Instant::now() >= self.deadline {
            self.fired.store(true, Ordering::Release);
        }
        self.fired.load(Ordering::Acquire)
    }

    fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Wait up to `duration`; `true` if the alarm fired first.
    fn wait(&self, duration: Duration) -> bool {
        let now = Instant::now();
        let until = now.checked_add(duration).unwrap_or(self.deadline.max(now));
        let mut disarmed = self.disarmed.lock();
        loop {
            if self.fired() {
                return true;
            }
            let now = Instant::now();
            if now >= until {
                return false;
            }
            let wake_at = match self.strategy {
                Strategy::Timer => until.min(self.deadline),
                Strategy::Watchdog => until,
            };
            self.wake.wait_until(&mut disarmed, wake_at);
        }
    }

    fn watch(&self) {
        let mut disarmed = self.disarmed.lock();
        while !*disarmed {
            if Instant::now() >= self.deadline {
                self.fired.store(true, Ordering::Release);
                self.wake.notify_all();
                return;
            }
            self.wake.wait_until(&mut disarmed, self.deadline);
        }
    }

    fn disarm(&self) {
        *self.disarmed.lock() = true;
        self.wake.notify_all();
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

type MakeExc<E> = Arc<dyn Fn(TimeoutExceeded) -> E + Send + Sync>;

/// Cooperative view of the deadline handed to a protected body
pub struct Checkpoint<E> {
    alarm: Arc<Alarm>,
    cutoff: Duration,
    make: MakeExc<E>,
}

impl<E> Checkpoint<E> {
    /// Fail with the timeout error once expired.
    pub fn check(&self) -> Result<(), E> {
        if self.alarm.fired() {
            Err(self.exceeded())
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking with the timeout error if the deadline
    /// passes first.
    pub fn sleep(&self, duration: Duration) -> Result<(), E> {
        if self.alarm.wait(duration) {
            Err(self.exceeded())
        } else {
            Ok(())
        }
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.alarm.remaining()
    }

    /// Time since the region was armed
    pub fn elapsed(&self) -> Duration {
        self.alarm.elapsed()
    }

    /// Whether expiry has been observed
    pub fn is_expired(&self) -> bool {
        self.alarm.fired()
    }

    fn exceeded(&self) -> E {
        (self.make)(TimeoutExceeded {
            cutoff: self.cutoff,
            elapsed: self.alarm.elapsed(),
        })
    }
}

impl<E> fmt::Debug for Checkpoint<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("strategy", &self.alarm.strategy)
            .field("cutoff", &self.cutoff)
            .field("elapsed", &self.elapsed())
            .field("expired", &self.is_expired())
            .finish()
    }
}

/// An armed region. Dropping it disarms the alarm and joins the watchdog.
pub struct Armed<'g, E> {
    guard: &'g TimeoutGuard<E>,
    checkpoint: Checkpoint<E>,
    watchdog: Option<JoinHandle<()>>,
}

impl<E> Armed<'_, E> {
    /// Deadline view for the body
    pub fn checkpoint(&self) -> &Checkpoint<E> {
        &self.checkpoint
    }

    /// Disarm and settle the body's outcome. Past the deadline the outcome
    /// is replaced by the timeout error.
    pub fn finish<T>(mut self, result: Result<T, E>) -> Result<T, E> {
        self.disarm();
        let alarm = &self.checkpoint.alarm;
        let elapsed = alarm.elapsed();
        let cutoff = self.guard.cutoff;
        let name = &self.guard.name;

        if alarm.deadline_passed() || alarm.fired.load(Ordering::Acquire) {
            warn!(
                guard = %name,
                cutoff_ms = cutoff.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                "Deadline exceeded"
            );
            self.guard.reporter.failure(
                DEFAULT_FAILURE,
                &[
                    ("name", name),
                    ("cutoff", &Shown(cutoff)),
                    ("elapsed", &Shown(elapsed)),
                ],
            );
            return Err((self.guard.make)(TimeoutExceeded { cutoff, elapsed }));
        }

        self.guard.reporter.success(
            DEFAULT_SUCCESS,
            &[
                ("name", name),
                ("cutoff", &Shown(cutoff)),
                ("elapsed", &Shown(elapsed)),
            ],
        );
        result
    }

    fn disarm(&mut self) {
        self.checkpoint.alarm.disarm();
        if let Some(handle) = self.watchdog.take()
            && handle.join().is_err()
        {
            warn!(guard = %self.guard.name, "Watchdog thread panicked");
        }
    }
}

impl<E> Drop for Armed<'_, E> {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl<E> fmt::Debug for Armed<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Armed")
            .field("guard", &self.guard.name)
            .field("checkpoint", &self.checkpoint)
            .field("watchdog", &self.watchdog.is_some())
            .finish()
    }
}

/// Wall-clock deadline for a protected region.
pub struct TimeoutGuard<E = TimeoutExceeded> {
    name: Cow<'static, str>,
    cutoff: Duration,
    strategy: Strategy,
    make: MakeExc<E>,
    reporter: Reporter,
}

impl<E: From<TimeoutExceeded> + 'static> TimeoutGuard<E> {
    /// Guard with the default timeout error and the detected strategy.
    ///
    /// # Errors
    ///
    /// A zero cutoff is invalid; detection may fail on unsupported targets.
    pub fn new(cutoff: Duration) -> ResilienceResult<Self> {
        Self::with_exc(cutoff, E::from)
    }

    /// Cutoff in seconds; must be positive and finite.
    pub fn from_secs_f64(secs: f64) -> ResilienceResult<Self> {
        Self::new(cutoff_from_secs(secs)?)
    }

    /// Build from a validated [`TimeoutConfig`].
    pub fn from_config(config: &TimeoutConfig) -> ResilienceResult<Self> {
        config.validate()?;
        Self::new(config.cutoff)
    }
}

impl<E> TimeoutGuard<E> {
    /// Guard producing `make(exceeded)` on expiry.
    pub fn with_exc(
        cutoff: Duration,
        make: impl Fn(TimeoutExceeded) -> E + Send + Sync + 'static,
    ) -> ResilienceResult<Self> {
        validate_cutoff(cutoff)?;
        Ok(Self {
            name: Cow::Borrowed("operation"),
            cutoff,
            strategy: Strategy::detect()?,
            make: Arc::new(make),
            reporter: Reporter::default(),
        })
    }

    /// Change the error produced on expiry
    pub fn set_exc(&mut self, make: impl Fn(TimeoutExceeded) -> E + Send + Sync + 'static) {
        self.make = Arc::new(make);
    }

    /// Change the deadline. Zero is rejected.
    pub fn set_cutoff(&mut self, cutoff: Duration) -> ResilienceResult<()> {
        validate_cutoff(cutoff)?;
        self.cutoff = cutoff;
        Ok(())
    }

    /// Force a strategy.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::UnsupportedPlatform`] when the target cannot run it.
    pub fn set_strategy(&mut self, strategy: Strategy) -> ResilienceResult<()> {
        strategy.ensure_supported()?;
        self.strategy = strategy;
        Ok(())
    }

    /// Name used in logs and reports
    pub fn set_name(&mut self, name: impl Into<Cow<'static, str>>) {
        self.name = name.into();
    }

    /// Outcome reporting
    pub fn set_reporter(&mut self, reporter: Reporter) {
        self.reporter = reporter;
    }

    /// Deadline
    pub fn cutoff(&self) -> Duration {
        self.cutoff
    }

    /// Active strategy
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Name used in logs and reports
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the clock for an inline region.
    pub fn arm(&self) -> Armed<'_, E> {
        let mut strategy = self.strategy;
        let watchdog = if strategy == Strategy::Watchdog {
            let alarm = Arc::new(Alarm::new(strategy, self.cutoff));
            let watched = Arc::clone(&alarm);
            match thread::Builder::new()
                .name(WATCHDOG_THREAD.into())
                .spawn(move || watched.watch())
            {
                Ok(handle) => Some((alarm, handle)),
                Err(e) => {
                    warn!(
                        guard = %self.name,
                        error = %e,
                        "Failed to spawn watchdog thread; falling back to timer"
                    );
                    strategy = Strategy::Timer;
                    None
                }
            }
        } else {
            None
        };

        let (alarm, handle) = match watchdog {
            Some((alarm, handle)) => (alarm, Some(handle)),
            None => (Arc::new(Alarm::new(strategy, self.cutoff)), None),
        };
        debug!(
            guard = %self.name,
            strategy = strategy.as_str(),
            cutoff_ms = self.cutoff.as_millis() as u64,
            "Armed deadline"
        );

        Armed {
            guard: self,
            checkpoint: Checkpoint {
                alarm,
                cutoff: self.cutoff,
                make: Arc::clone(&self.make),
            },
            watchdog: handle,
        }
    }

    /// Run `body` under the deadline.
    pub fn protect<T>(&self, body: impl FnOnce(&Checkpoint<E>) -> Result<T, E>) -> Result<T, E> {
        let armed = self.arm();
        let result = body(armed.checkpoint());
        armed.finish(result)
    }

    /// Turn the guard into a function that arms a fresh deadline per call.
    pub fn wrap<A, T, F>(self, f: F) -> impl Fn(A) -> Result<T, E>
    where
        F: Fn(A, &Checkpoint<E>) -> Result<T, E>,
    {
        move |arg| self.protect(|checkpoint| f(arg, checkpoint))
    }

    /// Run `fut` under the deadline, dropping it at the next await point
    /// once the deadline passes.
    pub async fn protect_async<T, Fut>(&self, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(self.cutoff, fut).await {
            Ok(result) => {
                self.reporter.success(
                    DEFAULT_SUCCESS,
                    &[
                        ("name", &self.name),
                        ("cutoff", &Shown(self.cutoff)),
                        ("elapsed", &Shown(started.elapsed())),
                    ],
                );
                result
            }
            Err(_) => {
                let exceeded = TimeoutExceeded {
                    cutoff: self.cutoff,
                    elapsed: started.elapsed(),
                };
                warn!(
                    guard = %self.name,
                    cutoff_ms = self.cutoff.as_millis() as u64,
                    "Async deadline exceeded"
                );
                self.reporter.failure(
                    DEFAULT_FAILURE,
                    &[
                        ("name", &self.name),
                        ("cutoff", &Shown(exceeded.cutoff)),
                        ("elapsed", &Shown(exceeded.elapsed)),
                    ],
                );
                Err((self.make)(exceeded))
            }
        }
    }
}

impl<E> fmt::Debug for TimeoutGuard<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutGuard")
            .field("name", &self.name)
            .field("cutoff", &self.cutoff)
            .field("strategy", &self.strategy)
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

fn validate_cutoff(cutoff: Duration) -> ResilienceResult<()> {
    if cutoff.is_zero() {
        return Err(ResilienceError::invalid_config("cutoff must be positive"));
    }
    Ok(())
}

pub(crate) fn cutoff_from_secs(secs: f64) -> ResilienceResult<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ResilienceError::invalid_config(format!(
            "cutoff must be a positive, finite number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| ResilienceError::invalid_config(e.to_string()))
}

/// Debug-formatted duration for templates
struct Shown(Duration);

impl fmt::Display for Shown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_log::MemorySink;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn guard(cutoff_ms: u64, strategy: Strategy) -> TimeoutGuard {
        let mut guard = TimeoutGuard::new(Duration::from_millis(cutoff_ms)).expect("valid cutoff");
        guard.set_strategy(strategy).expect("supported");
        guard.set_reporter(Reporter::silent());
        guard
    }

    #[rstest]
    #[case::timer(Strategy::Timer)]
    #[case::watchdog(Strategy::Watchdog)]
    fn test_interrupts_sleep_at_deadline(#[case] strategy: Strategy) {
        let guard = guard(50, strategy);
        let started = Instant::now();
        let err = guard
            .protect(|cp| {
                cp.sleep(Duration::from_secs(1))?;
                Ok(())
            })
            .expect_err("deadline passed");

        assert_eq!(err.cutoff, Duration::from_millis(50));
        assert!(err.elapsed >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[rstest]
    #[case::timer(Strategy::Timer)]
    #[case::watchdog(Strategy::Watchdog)]
    fn test_fast_body_passes_through(#[case] strategy: Strategy) {
        let guard = guard(500, strategy);
        let outcome = guard.protect(|cp| {
            cp.check()?;
            cp.sleep(Duration::from_millis(5))?;
            Ok(7)
        });
        assert_eq!(outcome, Ok(7));
    }

    #[test]
    fn test_body_error_passes_through_before_deadline() {
        #[derive(Debug, PartialEq)]
        enum JobError {
            Broken,
            Late(TimeoutExceeded),
        }
        impl From<TimeoutExceeded> for JobError {
            fn from(e: TimeoutExceeded) -> Self {
                Self::Late(e)
            }
        }

        let guard = TimeoutGuard::<JobError>::new(Duration::from_millis(500)).expect("valid");
        assert_eq!(guard.protect(|_| Err::<(), _>(JobError::Broken)), Err(JobError::Broken));
    }

    #[test]
    fn test_late_blocking_body_is_replaced() {
        let guard = guard(10, Strategy::Timer);
        let outcome = guard.protect(|_| {
            thread::sleep(Duration::from_millis(30));
            Ok("too late")
        });
        assert!(outcome.is_err());
    }

    #[test]
    fn test_never_raises_early() {
        let guard = guard(200, Strategy::Watchdog);
        let armed = guard.arm();
        assert!(armed.checkpoint().check().is_ok());
        assert!(!armed.checkpoint().is_expired());
        assert!(armed.checkpoint().remaining() <= Duration::from_millis(200));
        assert_eq!(armed.finish(Ok::<_, TimeoutExceeded>(1)), Ok(1));
    }

    #[rstest]
    #[case::timer(Strategy::Timer)]
    #[case::watchdog(Strategy::Watchdog)]
    fn test_check_passes_just_before_cutoff(#[case] strategy: Strategy) {
        let guard = guard(400, strategy);
        let armed = guard.arm();
        let cp = armed.checkpoint();
        while cp.remaining() > Duration::from_millis(60) {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(cp.check(), Ok(()));
        assert!(!cp.is_expired());
        assert_eq!(cp.sleep(Duration::from_millis(10)), Ok(()));
        assert!(cp.elapsed() < Duration::from_millis(400));
        drop(armed);
    }

    #[test]
    fn test_dropping_armed_joins_watchdog() {
        let guard = guard(10_000, Strategy::Watchdog);
        let started = Instant::now();
        drop(guard.arm());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_custom_exc() {
        let mut guard =
            TimeoutGuard::with_exc(Duration::from_millis(5), |e| format!("late by {:?}", e.elapsed))
                .expect("valid");
        guard.set_reporter(Reporter::silent());
        let err = guard
            .protect(|cp| cp.sleep(Duration::from_millis(200)))
            .expect_err("expired");
        assert!(err.starts_with("late by"));

        guard.set_exc(|_| "custom".to_string());
        assert_eq!(
            guard.protect(|cp| cp.sleep(Duration::from_millis(200))),
            Err("custom".to_string())
        );
    }

    #[rstest]
    #[case(0.0)]
    #[case(-1.5)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn test_invalid_cutoff(#[case] secs: f64) {
        let err = TimeoutGuard::<TimeoutExceeded>::from_secs_f64(secs).expect_err("invalid");
        assert!(err.is_config_error());
    }

    #[test]
    fn test_zero_cutoff_rejected_by_setter() {
        let mut guard = guard(10, Strategy::Timer);
        assert!(guard.set_cutoff(Duration::ZERO).is_err());
        assert_eq!(guard.cutoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_wrap_arms_each_call() {
        let guard = guard(100, Strategy::Timer);
        let double = guard.wrap(|n: u32, cp: &Checkpoint<TimeoutExceeded>| {
            cp.check()?;
            Ok(n * 2)
        });
        assert_eq!(double(2), Ok(4));
        assert_eq!(double(5), Ok(10));
    }

    #[test]
    fn test_reports_outcomes() {
        let sink = MemorySink::new();
        let mut guard = guard(20, Strategy::Timer);
        guard.set_name("render");
        guard.set_reporter(
            Reporter::new(sink.clone())
                .success_template("{name} within {cutoff}")
                .expect("valid"),
        );

        let _ = guard.protect(|_| Ok::<_, TimeoutExceeded>(()));
        let _ = guard.protect(|cp| cp.sleep(Duration::from_millis(100)));

        let messages = sink.messages();
        assert_eq!(messages[0], "render within 20ms");
        assert!(messages[1].starts_with("[TIMEOUT]: render exceeded 20ms"));
    }

    #[test]
    fn test_detect_on_host() {
        let strategy = Strategy::detect().expect("host supported");
        if cfg!(unix) {
            assert_eq!(strategy, Strategy::Timer);
        }
        assert_eq!(Strategy::Watchdog.to_string(), "watchdog");
    }

    #[tokio::test(start_paused = true)]
    async fn test_protect_async_cancels_future() {
        let mut guard = TimeoutGuard::<TimeoutExceeded>::new(Duration::from_millis(50)).expect("valid");
        guard.set_reporter(Reporter::silent());

        let err = guard
            .protect_async(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
            .expect_err("expired");
        assert_eq!(err.cutoff, Duration::from_millis(50));
        assert_eq!(err.elapsed, Duration::from_millis(50));

        assert_eq!(guard.protect_async(async { Ok(3) }).await, Ok(3));
    }
}
