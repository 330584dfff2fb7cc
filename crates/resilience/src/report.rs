//! Success and failure reports
//!
//! Retry and timeout primitives describe each outcome with a [`Template`]
//! rendered from keyword fields, and forward the message to a [`LogSink`].

use std::fmt::Display;
use std::sync::Arc;

use bulwark_log::{Level, LogSink, Template, TracingSink};

use crate::error::{ResilienceError, ResilienceResult};

/// Template-driven reporting of protected-call outcomes.
///
/// Without custom templates each primitive uses its own built-in wording.
#[derive(Clone)]
pub struct Reporter {
    sink: Option<Arc<dyn LogSink>>,
    success: Option<Template>,
    failure: Option<Template>,
    success_level: Level,
    failure_level: Level,
}

impl Reporter {
    /// Report into `sink` with the built-in templates
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
            success: None,
            failure: None,
            success_level: Level::Debug,
            failure_level: Level::Warn,
        }
    }

    /// Report nothing
    pub fn silent() -> Self {
        Self {
            sink: None,
            ..Self::default()
        }
    }

    /// Replace the success message.
    pub fn success_template(mut self, template: &str) -> ResilienceResult<Self> {
        self.success = Some(parse(template)?);
        Ok(self)
    }

    /// Replace the failure message.
    pub fn failure_template(mut self, template: &str) -> ResilienceResult<Self> {
        self.failure = Some(parse(template)?);
        Ok(self)
    }

    /// Severities for success and failure reports (default: debug, warn)
    #[must_use]
    pub fn levels(mut self, success: Level, failure: Level) -> Self {
        self.success_level = success;
        self.failure_level = failure;
        self
    }

    /// Whether any sink is attached
    pub fn is_silent(&self) -> bool {
        self.sink.is_none()
    }

    pub(crate) fn success(&self, default: &str, fields: &[(&str, &dyn Display)]) {
        self.emit(self.success.as_ref(), default, self.success_level, fields);
    }

    pub(crate) fn failure(&self, default: &str, fields: &[(&str, &dyn Display)]) {
        self.emit(self.failure.as_ref(), default, self.failure_level, fields);
    }

    fn emit(
        &self,
        custom: Option<&Template>,
        default: &str,
        level: Level,
        fields: &[(&str, &dyn Display)],
    ) {
        let Some(sink) = &self.sink else { return };
        if !sink.enabled(level) {
            return;
        }
        let message = match custom {
            Some(template) => template.render(fields),
            None => match Template::parse(default) {
                Ok(template) => template.render(fields),
                Err(_) => default.to_owned(),
            },
        };
        sink.emit(level, &message);
    }
}

fn parse(template: &str) -> ResilienceResult<Template> {
    Template::parse(template).map_err(|e| ResilienceError::invalid_config(e.to_string()))
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(TracingSink)
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("silent", &self.is_silent())
            .field("success", &self.success.as_ref().map(Template::source))
            .field("failure", &self.failure.as_ref().map(Template::source))
            .field("success_level", &self.success_level)
            .field("failure_level", &self.failure_level)
            .finish()
    }
}
