//! # Bulwark Log
//!
//! Subscriber setup and message sinks shared by the bulwark crates.
//!
//! Two concerns live here:
//!
//! - **Setup**: [`init`], [`init_with`] and [`auto_init`] install a
//!   `tracing-subscriber` stack (env filter plus a compact, pretty or JSON
//!   formatter) described by a serde-friendly [`Config`].
//! - **Reporting**: [`LogSink`] receives already-rendered messages with a
//!   severity, and [`Template`] renders `{field}` placeholders from keyword
//!   data. The resilience primitives use both to report successes and
//!   failures of protected calls.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bulwark_log::{LogSink, Level, MemorySink, Template};
//!
//! let _guard = bulwark_log::auto_init()?;
//!
//! let template = Template::parse("{name} finished after {attempts} attempts")?;
//! let sink = MemorySink::new();
//! sink.emit(Level::Info, &template.render(&[("name", &"sync"), ("attempts", &3)]));
//! assert_eq!(sink.messages(), vec!["sync finished after 3 attempts"]);
//! # Ok::<(), bulwark_log::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod builder;
mod config;
mod sink;
mod template;
mod writer;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Format, Level, WriterConfig};
pub use sink::{Entry, LogSink, MemorySink, TracingSink};
pub use template::Template;

// Re-export tracing macros
pub use tracing::{debug, error, info, instrument, span, trace, warn};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Level, LogSink, Result, Template, auto_init, debug, error, info, init, init_with, trace,
        warn,
    };
}

/// Result type for logger operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for logger operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filter parsing error
    #[error("Invalid filter: {0}")]
    Filter(String),

    /// A global subscriber was already installed
    #[error("Logger already initialized: {0}")]
    Init(String),

    /// Message template could not be parsed
    #[error("Invalid template {template:?}: {reason}")]
    Template {
        /// The offending template source
        template: String,
        /// What is wrong with it
        reason: String,
    },
}

// Test initialization guard
#[cfg(test)]
static TEST_INIT: std::sync::OnceLock<()> = std::sync::OnceLock::new();

// ============================================================================
// Initialization Functions
// ============================================================================

/// Auto-detect and initialize the best logging configuration
///
/// `BULWARK_LOG` / `RUST_LOG` select [`Config::from_env`]; otherwise debug
/// builds get [`Config::development`] and release builds [`Config::production`].
#[cfg(not(test))]
pub fn auto_init() -> Result<LoggerGuard> {
    if std::env::var("BULWARK_LOG").is_ok() || std::env::var("RUST_LOG").is_ok() {
        init_with(Config::from_env())
    } else if cfg!(debug_assertions) {
        init_with(Config::development())
    } else {
        init_with(Config::production())
    }
}

/// Auto-detect and initialize the best logging configuration
#[cfg(test)]
pub fn auto_init() -> Result<LoggerGuard> {
    init_test()
}

/// Initialize with default configuration
pub fn init() -> Result<LoggerGuard> {
    init_with(Config::default())
}

/// Initialize with custom configuration
pub fn init_with(config: Config) -> Result<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Initialize for tests
#[cfg(test)]
pub fn init_test() -> Result<LoggerGuard> {
    TEST_INIT.get_or_init(|| {
        if !tracing::dispatcher::has_been_set() {
            let _ = init_with(Config::test());
        }
    });
    Ok(LoggerGuard::noop())
}
