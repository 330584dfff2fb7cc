//! Backoff strategies
//!
//! A [`Backoff`] maps the current delay and the 1-based index of the attempt
//! that just failed to the next delay. Retry loops start from their base delay
//! and feed every result back in, so the realized waits are
//! `d1 = f(d0, 1)`, `d2 = f(d1, 2)`, ...

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ResilienceError, ResilienceResult};

type Step = Arc<dyn Fn(Duration, u32) -> Duration + Send + Sync>;

/// Named next-delay function.
#[derive(Clone)]
pub struct Backoff {
    name: Cow<'static, str>,
    step: Step,
}

impl Backoff {
    /// Keep the delay unchanged
    pub fn constant() -> Self {
        Self::custom("constant", |delay, _| delay)
    }

    /// Grow the delay by `step` after each failure
    pub fn linear(step: Duration) -> Self {
        Self::custom(format!("linear(+{step:?})"), move |delay, _| {
            delay.saturating_add(step)
        })
    }

    /// Multiply the delay by `factor` after each failure.
    ///
    /// # Errors
    ///
    /// `factor` must be finite and at least 1.0.
    pub fn exponential(factor: f64) -> ResilienceResult<Self> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(ResilienceError::invalid_config(format!(
                "backoff factor must be a finite number >= 1.0, got {factor}"
            )));
        }
        Ok(Self::custom(format!("exponential(x{factor})"), move |delay, _| {
            scale(delay, factor)
        }))
    }

    /// Any function of `(current_delay, attempt)`.
    pub fn custom(
        name: impl Into<Cow<'static, str>>,
        step: impl Fn(Duration, u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            step: Arc::new(step),
        }
    }

    /// Never exceed `max`
    #[must_use]
    pub fn capped(self, max: Duration) -> Self {
        let inner = self.step;
        Self::custom(format!("{} capped at {max:?}", self.name), move |delay, attempt| {
            inner(delay, attempt).min(max)
        })
    }

    /// Randomize each computed delay. The randomized value becomes the input
    /// of the next step.
    #[must_use]
    pub fn with_jitter(self, jitter: JitterPolicy) -> Self {
        if jitter == JitterPolicy::None {
            return self;
        }
        let inner = self.step;
        Self::custom(
            format!("{} with {jitter:?} jitter", self.name),
            move |delay, attempt| jitter.apply(inner(delay, attempt)),
        )
    }

    /// Delay following `current` after attempt number `attempt` failed
    pub fn next(&self, current: Duration, attempt: u32) -> Duration {
        (self.step)(current, attempt)
    }

    /// The waits a retry loop starting at `base` would perform, unbounded
    pub fn delays(&self, base: Duration) -> impl Iterator<Item = Duration> + '_ {
        let mut current = base;
        (1_u32..).map(move |attempt| {
            current = self.next(current, attempt);
            current
        })
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

impl Default for Backoff {
    fn default() -> Self {
        Self::constant()
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backoff").field(&self.name).finish()
    }
}

/// Jitter policy for avoiding thundering herd
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    /// No jitter - use calculated delay exactly
    #[default]
    None,
    /// Full jitter: random(0, `calculated_delay`)
    Full,
    /// Equal jitter: `calculated_delay/2` + random(0, `calculated_delay/2`)
    Equal,
}

impl JitterPolicy {
    /// Apply jitter to a delay using fast RNG
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return delay;
                }
                Duration::from_millis(fastrand::u64(0..=millis))
            }
            Self::Equal => {
                let millis = delay.as_millis() as u64;
                let half = millis / 2;
                let jitter = if half > 0 { fastrand::u64(0..=half) } else { 0 };
                Duration::from_millis(half + jitter)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_constant_is_identity() {
        let backoff = Backoff::constant();
        assert_eq!(
            backoff.delays(MS * 10).take(3).collect::<Vec<_>>(),
            vec![MS * 10; 3]
        );
    }

    #[test]
    fn test_linear_and_exponential_sequences() {
        let linear = Backoff::linear(MS * 5);
        assert_eq!(
            linear.delays(MS * 10).take(3).collect::<Vec<_>>(),
            vec![MS * 15, MS * 20, MS * 25]
        );

        let exponential = Backoff::exponential(2.0).expect("valid factor");
        assert_eq!(
            exponential.delays(MS * 10).take(3).collect::<Vec<_>>(),
            vec![MS * 20, MS * 40, MS * 80]
        );
    }

    #[test]
    fn test_custom_sees_attempt_index() {
        let backoff = Backoff::custom("by-attempt", |_, attempt| MS * attempt);
        assert_eq!(
            backoff.delays(Duration::ZERO).take(4).collect::<Vec<_>>(),
            vec![MS, MS * 2, MS * 3, MS * 4]
        );
    }

    #[test]
    fn test_capped() {
        let backoff = Backoff::exponential(10.0).expect("valid factor").capped(MS * 500);
        assert_eq!(
            backoff.delays(MS * 10).take(3).collect::<Vec<_>>(),
            vec![MS * 100, MS * 500, MS * 500]
        );
        assert!(backoff.name().contains("capped"));
    }

    #[test]
    fn test_exponential_saturates() {
        let backoff = Backoff::exponential(1e300).expect("valid factor");
        assert_eq!(backoff.next(Duration::from_secs(1), 1), Duration::MAX);
    }

    #[rstest]
    #[case(0.5)]
    #[case(-2.0)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn test_exponential_rejects_bad_factor(#[case] factor: f64) {
        assert!(Backoff::exponential(factor).is_err());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = MS * 100;
        for _ in 0..100 {
            let full = JitterPolicy::Full.apply(base);
            assert!(full <= base);

            let equal = JitterPolicy::Equal.apply(base);
            assert!(equal >= base / 2 && equal <= base);
        }
        assert_eq!(JitterPolicy::None.apply(base), base);
        assert_eq!(JitterPolicy::Full.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_with_jitter_none_keeps_name() {
        let backoff = Backoff::constant().with_jitter(JitterPolicy::None);
        assert_eq!(backoff.name(), "constant");
        let jittered = Backoff::constant().with_jitter(JitterPolicy::Full);
        assert!(jittered.name().contains("Full"));
        assert!(jittered.next(MS * 10, 1) <= MS * 10);
    }
}
