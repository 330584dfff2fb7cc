//! Message sinks
//!
//! A [`LogSink`] accepts a rendered message and its severity. Producers render
//! first and forward the finished string; sinks never see templates.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Level;

/// Destination for rendered messages.
pub trait LogSink: Send + Sync {
    /// Forward one rendered message.
    fn emit(&self, level: Level, message: &str);

    /// Whether a message at `level` would be kept. Producers may skip
    /// rendering when this returns `false`.
    fn enabled(&self, _level: Level) -> bool {
        true
    }
}

impl<F> LogSink for F
where
    F: Fn(Level, &str) + Send + Sync,
{
    fn emit(&self, level: Level, message: &str) {
        self(level, message);
    }
}

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn emit(&self, level: Level, message: &str) {
        (**self).emit(level, message);
    }

    fn enabled(&self, level: Level) -> bool {
        (**self).enabled(level)
    }
}

/// Forwards messages as `tracing` events under the `bulwark` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, level: Level, message: &str) {
        match level {
            Level::Trace => tracing::trace!(target: "bulwark", "{message}"),
            Level::Debug => tracing::debug!(target: "bulwark", "{message}"),
            Level::Info => tracing::info!(target: "bulwark", "{message}"),
            Level::Warn => tracing::warn!(target: "bulwark", "{message}"),
            Level::Error => tracing::error!(target: "bulwark", "{message}"),
        }
    }

    fn enabled(&self, level: Level) -> bool {
        match level {
            Level::Trace => tracing::enabled!(target: "bulwark", tracing::Level::TRACE),
            Level::Debug => tracing::enabled!(target: "bulwark", tracing::Level::DEBUG),
            Level::Info => tracing::enabled!(target: "bulwark", tracing::Level::INFO),
            Level::Warn => tracing::enabled!(target: "bulwark", tracing::Level::WARN),
            Level::Error => tracing::enabled!(target: "bulwark", tracing::Level::ERROR),
        }
    }
}

/// One message captured by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Severity the message was emitted at
    pub level: Level,
    /// Rendered message
    pub message: String,
}

/// Keeps every message in memory.
///
/// Clones share the same buffer, so a handle kept by the caller observes
/// messages emitted through a clone handed to a producer.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of captured entries in emission order
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().clone()
    }

    /// Captured messages without their levels
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Remove and return everything captured so far
    pub fn take(&self) -> Vec<Entry> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Number of captured entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been captured
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, level: Level, message: &str) {
        self.entries.lock().push(Entry {
            level,
            message: message.to_owned(),
        });
    }
}

impl fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySink")
            .field("entries", &self.len())
            .finish()
    }
}
