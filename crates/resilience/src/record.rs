//! Captured failure occurrences

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bulwark_log::Template;
use chrono::{DateTime, SecondsFormat, Utc};

/// Immutable capture of one intercepted error.
///
/// Records outlive the protected call that produced them; [`reraise`](Self::reraise)
/// stays usable for as long as the record is kept.
#[derive(Clone)]
pub struct FailureRecord<E> {
    kind: Cow<'static, str>,
    error: E,
    backtrace: Arc<Backtrace>,
    captured_at: DateTime<Utc>,
    attempt: Option<u32>,
}

impl<E> FailureRecord<E> {
    pub(crate) fn capture(kind: Cow<'static, str>, error: E) -> Self {
        Self {
            kind,
            error,
            backtrace: Arc::new(Backtrace::capture()),
            captured_at: Utc::now(),
            attempt: None,
        }
    }

    pub(crate) fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Name of the kind entry that matched the error
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The captured error value
    pub fn error(&self) -> &E {
        &self.error
    }

    /// Stack at the capture point. Empty unless `RUST_BACKTRACE` or
    /// `RUST_LIB_BACKTRACE` enables capturing.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// When the error was intercepted
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// 1-based attempt number, for records taken by a retry loop
    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    /// Take the error out of the record.
    pub fn into_error(self) -> E {
        self.error
    }

    /// Fail again with the recorded error. Never returns `Ok`.
    ///
    /// ```
    /// # use bulwark_resilience::{FailureManager, FailureHandler};
    /// let mut manager = FailureManager::<(), &str>::new([FailureHandler::suppress()])?;
    /// manager.protect(|| Err("disk full"))?;
    ///
    /// let replay: Result<(), &str> = manager.caught()[0].reraise();
    /// assert_eq!(replay, Err("disk full"));
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn reraise<T>(&self) -> Result<T, E>
    where
        E: Clone,
    {
        Err(self.error.clone())
    }

    pub(crate) fn render(&self, template: &Template) -> String
    where
        E: fmt::Display + fmt::Debug,
    {
        template.render_with(|field| match field {
            "kind" => Some(self.kind.to_string()),
            "value" => Some(self.error.to_string()),
            "debug" => Some(format!("{:?}", self.error)),
            "trace" => Some(match self.backtrace.status() {
                BacktraceStatus::Captured => self.backtrace.to_string(),
                _ => String::from("<backtrace unavailable>"),
            }),
            "time" => Some(self.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            "attempt" => self.attempt.map(|n| n.to_string()),
            _ => None,
        })
    }
}

impl<E: fmt::Display> fmt::Display for FailureRecord<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} @ {}",
            self.kind,
            self.error,
            self.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

impl<E: fmt::Debug> fmt::Debug for FailureRecord<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRecord")
            .field("kind", &self.kind)
            .field("error", &self.error)
            .field("captured_at", &self.captured_at)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
