//! Logger builder implementation

#[macro_use]
mod format;

use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{
    Error, Result,
    config::{Config, Format},
    writer,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Guard returned by a successful initialization
///
/// Holds the configuration the global subscriber was installed with.
#[derive(Debug)]
pub struct LoggerGuard {
    config: Option<Config>,
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Build and install the global subscriber
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Filter string cannot be parsed
    /// - A global subscriber is already installed
    pub fn build(self) -> Result<LoggerGuard> {
        let filter = EnvFilter::try_new(&self.config.level)
            .map_err(|e| Error::Filter(format!("{}: {e}", self.config.level)))?;

        let writer = writer::make_writer(&self.config.writer);
        let display = &self.config.display;

        let fmt_layer: BoxedLayer = match self.config.format {
            Format::Pretty => create_fmt_layer!(pretty, display, writer),
            Format::Compact => create_fmt_layer!(compact, display, writer),
            Format::Json => create_json_layer!(display, writer),
        };

        Registry::default()
            .with(fmt_layer)
            .with(filter)
            .try_init()
            .map_err(|e| Error::Init(e.to_string()))?;

        Ok(LoggerGuard {
            config: Some(self.config),
        })
    }
}

impl LoggerGuard {
    #[cfg(test)]
    pub(crate) fn noop() -> Self {
        Self { config: None }
    }

    /// Configuration of the installed subscriber, `None` when initialization
    /// was skipped because a subscriber already existed.
    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected_before_install() {
        let config = Config {
            level: "bulwark=loudest".into(),
            ..Config::test()
        };
        let err = LoggerBuilder::from_config(config)
            .build()
            .expect_err("filter must not parse");
        assert!(matches!(err, Error::Filter(_)));
    }

    #[test]
    fn test_noop_guard_has_no_config() {
        assert!(LoggerGuard::noop().config().is_none());
    }
}
