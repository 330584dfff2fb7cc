//! Failure handlers
//!
//! A [`FailureHandler`] decides the fate of one intercepted error. The set of
//! behaviours is closed:
//!
//! | Kind | Applicable | Outcome |
//! |------|------------|---------|
//! | [`Suppress`](HandlerKind::Suppress) | always | error discarded, no value |
//! | [`Fallback`](HandlerKind::Fallback) | unless its preflight flagged it | value of the fallback call |
//! | [`Translate`](HandlerKind::Translate) | always | a new error built from a message template |

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bulwark_log::Template;
use tracing::{debug, warn};

use crate::error::{ResilienceError, ResilienceResult};
use crate::kinds::Kinds;
use crate::record::FailureRecord;

/// What a handler did with an error.
#[derive(Debug)]
pub(crate) enum Resolution<T, E> {
    Suppressed,
    Recovered(T),
    Raised(E),
}

/// A stored fallback computation.
pub struct Fallback<T, E> {
    name: Cow<'static, str>,
    call: Arc<dyn Fn() -> Result<T, E> + Send + Sync>,
    preflight: bool,
    at_risk: bool,
}

impl<T, E> Fallback<T, E> {
    /// Display name of the fallback
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the fallback once and report whether it succeeded.
    pub fn validate(&self) -> bool {
        self.error_scan().is_none()
    }

    /// Run the fallback once and return the error it produced, if any.
    ///
    /// This is a dry run: a fallback that fails only under conditions absent
    /// at scan time is not detected.
    pub fn error_scan(&self) -> Option<E> {
        (self.call)().err()
    }

    /// Whether the preflight found the fallback failing with an intercepted kind
    pub fn is_at_risk(&self) -> bool {
        self.at_risk
    }

    fn preflight(&mut self, kinds: &Kinds<E>)
    where
        E: fmt::Display,
    {
        if !self.preflight {
            return;
        }
        self.at_risk = match self.error_scan() {
            Some(error) if kinds.contains(&error) => {
                warn!(
                    fallback = %self.name,
                    error = %error,
                    "Fallback fails with an intercepted error kind; it will be skipped"
                );
                true
            }
            _ => false,
        };
    }
}

/// Error translation target.
pub struct Translate<E> {
    target: Cow<'static, str>,
    template: Option<Template>,
    make: Arc<dyn Fn(String) -> E + Send + Sync>,
}

impl<E> Translate<E> {
    /// Name of the error produced
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Message template applied to the intercepted error. `None` uses the
    /// error's `Display` output, the same as a `"{value}"` template.
    pub fn template(&self) -> Option<&Template> {
        self.template.as_ref()
    }

    fn message(&self, record: &FailureRecord<E>) -> String
    where
        E: fmt::Display + fmt::Debug,
    {
        match &self.template {
            Some(template) => record.render(template),
            None => record.error().to_string(),
        }
    }
}

/// Closed set of handler behaviours.
pub enum HandlerKind<T, E> {
    /// Discard the error
    Suppress,
    /// Replace the error with the result of another computation
    Fallback(Fallback<T, E>),
    /// Replace the error with a different one
    Translate(Translate<E>),
}

/// A prioritized policy for intercepted errors.
pub struct FailureHandler<T, E> {
    kind: HandlerKind<T, E>,
    priority: i64,
    pinned: bool,
    activated: bool,
    returned: Option<T>,
}

impl<T, E> FailureHandler<T, E> {
    fn from_kind(kind: HandlerKind<T, E>) -> Self {
        Self {
            kind,
            priority: 0,
            pinned: false,
            activated: false,
            returned: None,
        }
    }

    /// Swallow the error; the protected call completes without a value.
    pub fn suppress() -> Self {
        Self::from_kind(HandlerKind::Suppress)
    }

    /// Produce a value by calling `f`. Arguments are whatever `f` captures.
    pub fn fallback(f: impl Fn() -> Result<T, E> + Send + Sync + 'static) -> Self {
        Self::fallback_named("fallback", f)
    }

    /// Like [`fallback`](Self::fallback), with a name for logs and `Display`.
    pub fn fallback_named(
        name: impl Into<Cow<'static, str>>,
        f: impl Fn() -> Result<T, E> + Send + Sync + 'static,
    ) -> Self {
        Self::from_kind(HandlerKind::Fallback(Fallback {
            name: name.into(),
            call: Arc::new(f),
            preflight: true,
            at_risk: false,
        }))
    }

    /// Fall back to a fixed value.
    pub fn fallback_value(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::fallback_named("value", move || Ok(value.clone()))
    }

    /// Translate the error into `make(message)`, where the message is the
    /// original error's `Display` output.
    pub fn translate(
        target: impl Into<Cow<'static, str>>,
        make: impl Fn(String) -> E + Send + Sync + 'static,
    ) -> Self {
        Self::from_kind(HandlerKind::Translate(Translate {
            target: target.into(),
            template: None,
            make: Arc::new(make),
        }))
    }

    /// Translate with a custom message template.
    ///
    /// Fields: `{kind}`, `{value}`, `{debug}`, `{trace}`, `{time}`, `{attempt}`.
    pub fn translate_with(
        target: impl Into<Cow<'static, str>>,
        template: &str,
        make: impl Fn(String) -> E + Send + Sync + 'static,
    ) -> ResilienceResult<Self> {
        let template = Template::parse(template)
            .map_err(|e| ResilienceError::invalid_config(e.to_string()))?;
        Ok(Self::from_kind(HandlerKind::Translate(Translate {
            target: target.into(),
            template: Some(template),
            make: Arc::new(make),
        })))
    }

    /// Pin the handler to an explicit priority. Pinned handlers keep it when
    /// a manager auto-assigns the others.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self.pinned = true;
        self
    }

    /// Skip the fallback dry run performed when the handler joins a manager.
    /// No effect on other kinds.
    #[must_use]
    pub fn without_preflight(mut self) -> Self {
        if let HandlerKind::Fallback(fallback) = &mut self.kind {
            fallback.preflight = false;
        }
        self
    }

    /// The handler's behaviour
    pub fn kind(&self) -> &HandlerKind<T, E> {
        &self.kind
    }

    /// Short name: `Suppress`, `Fallback(name)` or `Translate(target)`
    pub fn name(&self) -> Cow<'_, str> {
        match &self.kind {
            HandlerKind::Suppress => Cow::Borrowed("Suppress"),
            HandlerKind::Fallback(fallback) => Cow::Owned(format!("Fallback({})", fallback.name)),
            HandlerKind::Translate(translate) => {
                Cow::Owned(format!("Translate({})", translate.target))
            }
        }
    }

    /// Current priority
    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Whether the priority was chosen explicitly
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Whether this handler resolved the most recent dispatch
    pub fn activated(&self) -> bool {
        self.activated
    }

    /// Value produced by the last activation of a fallback
    pub fn returned(&self) -> Option<&T> {
        self.returned.as_ref()
    }

    /// Whether the handler may be invoked.
    pub fn is_applicable(&self) -> bool {
        match &self.kind {
            HandlerKind::Suppress | HandlerKind::Translate(_) => true,
            HandlerKind::Fallback(fallback) => !fallback.at_risk,
        }
    }

    /// Human-readable summary.
    pub fn describe(&self) -> String {
        self.to_string()
    }

    pub(crate) fn assign_priority(&mut self, priority: i64) {
        self.priority = priority;
    }

    pub(crate) fn pin(&mut self) {
        self.pinned = true;
    }

    pub(crate) fn reset(&mut self) {
        self.activated = false;
        self.returned = None;
    }

    pub(crate) fn preflight(&mut self, kinds: &Kinds<E>)
    where
        E: fmt::Display,
    {
        if let HandlerKind::Fallback(fallback) = &mut self.kind {
            fallback.preflight(kinds);
        }
    }

    pub(crate) fn invoke(&mut self, record: &FailureRecord<E>) -> Resolution<T, E>
    where
        T: Clone,
        E: fmt::Display + fmt::Debug,
    {
        self.activated = true;
        debug!(
            handler = %self.name(),
            priority = self.priority,
            kind = record.kind(),
            "Failure handler activated"
        );

        match &self.kind {
            HandlerKind::Suppress => Resolution::Suppressed,
            HandlerKind::Fallback(fallback) => match (fallback.call)() {
                Ok(value) => {
                    self.returned = Some(value.clone());
                    Resolution::Recovered(value)
                }
                Err(error) => {
                    warn!(
                        fallback = %fallback.name,
                        error = %error,
                        "Fallback failed; its error propagates"
                    );
                    Resolution::Raised(error)
                }
            },
            HandlerKind::Translate(translate) => {
                Resolution::Raised((translate.make)(translate.message(record)))
            }
        }
    }
}

impl<T, E> fmt::Display for FailureHandler<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.priority)?;
        if !self.is_applicable() {
            write!(f, " (at risk)")?;
        }
        Ok(())
    }
}

impl<T: fmt::Debug, E> fmt::Debug for FailureHandler<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureHandler")
            .field("name", &self.name())
            .field("priority", &self.priority)
            .field("pinned", &self.pinned)
            .field("activated", &self.activated)
            .field("returned", &self.returned)
            .finish_non_exhaustive()
    }
}
