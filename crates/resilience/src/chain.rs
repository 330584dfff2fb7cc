//! Priority-ordered handler collection

use std::fmt;
use std::ops::Index;
use std::slice;

use crate::error::{ResilienceError, ResilienceResult};
use crate::handler::{FailureHandler, Resolution};
use crate::record::FailureRecord;

/// Handlers sorted by ascending priority, no two sharing one.
pub struct HandlerChain<T, E> {
    handlers: Vec<FailureHandler<T, E>>,
}

impl<T, E> HandlerChain<T, E> {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Insert a handler at its priority.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::PriorityConflict`] if the priority is taken.
    pub fn insert(&mut self, handler: FailureHandler<T, E>) -> ResilienceResult<()> {
        match self.locate(handler.priority()) {
            Ok(_) => Err(ResilienceError::PriorityConflict {
                priority: handler.priority(),
            }),
            Err(pos) => {
                self.handlers.insert(pos, handler);
                Ok(())
            }
        }
    }

    /// Remove and return the handler at `priority`.
    pub fn remove(&mut self, priority: i64) -> ResilienceResult<FailureHandler<T, E>> {
        let pos = self
            .locate(priority)
            .map_err(|_| ResilienceError::HandlerNotFound { priority })?;
        Ok(self.handlers.remove(pos))
    }

    /// Move the handler at `old` to `new`, pinning it there.
    pub fn set_priority(&mut self, old: i64, new: i64) -> ResilienceResult<()> {
        let pos = self
            .locate(old)
            .map_err(|_| ResilienceError::HandlerNotFound { priority: old })?;
        if old != new && self.locate(new).is_ok() {
            return Err(ResilienceError::PriorityConflict { priority: new });
        }

        let mut handler = self.handlers.remove(pos);
        handler.assign_priority(new);
        handler.pin();
        self.insert(handler)
    }

    /// Handler at `priority`
    pub fn get(&self, priority: i64) -> Option<&FailureHandler<T, E>> {
        self.locate(priority).ok().map(|pos| &self.handlers[pos])
    }

    /// Iterate in ascending priority order
    pub fn iter(&self) -> slice::Iter<'_, FailureHandler<T, E>> {
        self.handlers.iter()
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Priorities in ascending order
    pub fn priorities(&self) -> Vec<i64> {
        self.handlers.iter().map(FailureHandler::priority).collect()
    }

    /// One past the highest priority, or 0 for an empty chain
    pub fn next_free_priority(&self) -> i64 {
        self.handlers
            .last()
            .map_or(0, |h| h.priority().saturating_add(1))
    }

    /// Renumber handlers `0..len` keeping their order.
    pub fn normalize(&mut self) {
        for (priority, handler) in (0_i64..).zip(self.handlers.iter_mut()) {
            handler.assign_priority(priority);
        }
    }

    /// The handler that resolved the most recent dispatch
    pub fn activated(&self) -> Option<&FailureHandler<T, E>> {
        self.handlers.iter().find(|h| h.activated())
    }

    /// Invoke the first applicable handler. `None` when nothing applies.
    pub(crate) fn dispatch(&mut self, record: &FailureRecord<E>) -> Option<Resolution<T, E>>
    where
        T: Clone,
        E: fmt::Display + fmt::Debug,
    {
        for handler in &mut self.handlers {
            handler.reset();
        }
        self.handlers
            .iter_mut()
            .find(|h| h.is_applicable())
            .map(|h| h.invoke(record))
    }

    fn locate(&self, priority: i64) -> Result<usize, usize> {
        self.handlers
            .binary_search_by_key(&priority, FailureHandler::priority)
    }
}

impl<T, E> Default for HandlerChain<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Index<usize> for HandlerChain<T, E> {
    type Output = FailureHandler<T, E>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.handlers[index]
    }
}

impl<'a, T, E> IntoIterator for &'a HandlerChain<T, E> {
    type Item = &'a FailureHandler<T, E>;
    type IntoIter = slice::Iter<'a, FailureHandler<T, E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T, E> fmt::Debug for HandlerChain<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(ToString::to_string))
            .finish()
    }
}
