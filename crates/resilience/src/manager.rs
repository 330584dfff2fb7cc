//! Failure manager
//!
//! [`FailureManager`] protects a region of code. Errors of an intercepted kind
//! are recorded and handed to the first applicable handler of its
//! [`HandlerChain`]; every other error passes through untouched.
//!
//! ```
//! use bulwark_resilience::{FailureHandler, FailureManager, Kinds};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum CacheError { Miss, Corrupt }
//! # impl std::fmt::Display for CacheError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{self:?}") }
//! # }
//!
//! let mut manager = FailureManager::builder()
//!     .handler(FailureHandler::fallback(|| Ok("from origin")))
//!     .exceptions(Kinds::matching("miss", |e: &CacheError| *e == CacheError::Miss))
//!     .build()?;
//!
//! assert_eq!(manager.protect(|| Err(CacheError::Miss)), Ok(Some("from origin")));
//! assert_eq!(manager.protect(|| Err(CacheError::Corrupt)), Err(CacheError::Corrupt));
//! assert_eq!(manager.caught().len(), 1);
//! # Ok::<(), bulwark_resilience::ResilienceError>(())
//! ```

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use tracing::{debug, warn};

use crate::chain::HandlerChain;
use crate::error::{ResilienceError, ResilienceResult};
use crate::handler::{FailureHandler, Resolution};
use crate::kinds::Kinds;
use crate::record::FailureRecord;

/// Coordinates interception, recording and dispatch for protected code.
pub struct FailureManager<T, E> {
    name: Cow<'static, str>,
    chain: HandlerChain<T, E>,
    kinds: Kinds<E>,
    assign_priorities: bool,
    caught: Vec<FailureRecord<E>>,
}

/// Builder for [`FailureManager`]
pub struct FailureManagerBuilder<T, E> {
    name: Cow<'static, str>,
    handlers: Vec<FailureHandler<T, E>>,
    kinds: Kinds<E>,
    assign_priorities: bool,
}

impl<T, E> FailureManagerBuilder<T, E>
where
    T: Clone,
    E: Clone + fmt::Display + fmt::Debug + 'static,
{
    /// Name used in logs
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a handler
    #[must_use]
    pub fn handler(mut self, handler: FailureHandler<T, E>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Append several handlers, in order
    #[must_use]
    pub fn handlers(mut self, handlers: impl IntoIterator<Item = FailureHandler<T, E>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Error kinds to intercept (default: all)
    #[must_use]
    pub fn exceptions(mut self, kinds: Kinds<E>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Number unpinned handlers automatically (default: true)
    #[must_use]
    pub fn assign_priorities(mut self, assign: bool) -> Self {
        self.assign_priorities = assign;
        self
    }

    /// Validate and build.
    ///
    /// Unpinned handlers receive ascending priorities from 0 in the order
    /// given, skipping values pinned by other handlers.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::InvalidConfig`] for an empty kind set, or an
    ///   unpinned handler while priority assignment is off
    /// - [`ResilienceError::PriorityConflict`] for duplicate pinned priorities
    pub fn build(self) -> ResilienceResult<FailureManager<T, E>> {
        self.kinds.validate("exceptions")?;

        let taken: BTreeSet<i64> = self
            .handlers
            .iter()
            .filter(|h| h.is_pinned())
            .map(FailureHandler::priority)
            .collect();

        let mut chain = HandlerChain::new();
        let mut next = 0_i64;
        for mut handler in self.handlers {
            if !handler.is_pinned() {
                if !self.assign_priorities {
                    return Err(unpinned_error(&handler));
                }
                while taken.contains(&next) {
                    next += 1;
                }
                handler.assign_priority(next);
                next += 1;
            }
            ensure_free(&chain, handler.priority())?;
            handler.preflight(&self.kinds);
            chain.insert(handler)?;
        }

        debug!(
            manager = %self.name,
            handlers = chain.len(),
            kinds = ?self.kinds,
            "Failure manager built"
        );

        Ok(FailureManager {
            name: self.name,
            chain,
            kinds: self.kinds,
            assign_priorities: self.assign_priorities,
            caught: Vec::new(),
        })
    }
}

impl<T, E> FailureManager<T, E>
where
    T: Clone,
    E: Clone + fmt::Display + fmt::Debug + 'static,
{
    /// Start building a manager
    pub fn builder() -> FailureManagerBuilder<T, E> {
        FailureManagerBuilder {
            name: Cow::Borrowed("failure-manager"),
            handlers: Vec::new(),
            kinds: Kinds::any(),
            assign_priorities: true,
        }
    }

    /// Manager intercepting every error, with auto-assigned priorities.
    pub fn new(handlers: impl IntoIterator<Item = FailureHandler<T, E>>) -> ResilienceResult<Self> {
        Self::builder().handlers(handlers).build()
    }

    /// Run `body` under protection.
    ///
    /// Returns `Ok(Some(value))` on success or fallback, `Ok(None)` when a
    /// handler suppressed the error, and `Err` for a translated error, an
    /// error no handler took, or an error outside the intercepted kinds.
    pub fn protect<F>(&mut self, body: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.settle(body())
    }

    /// Async counterpart of [`protect`](Self::protect).
    pub async fn protect_async<Fut>(&mut self, body: Fut) -> Result<Option<T>, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.settle(body.await)
    }

    /// Wrap `f` so every call runs under [`protect`](Self::protect).
    pub fn wrap<A, F>(&mut self, mut f: F) -> impl FnMut(A) -> Result<Option<T>, E>
    where
        F: FnMut(A) -> Result<T, E>,
    {
        move |arg| self.protect(|| f(arg))
    }

    /// Add a handler, returning the priority it ended up with.
    ///
    /// An unpinned handler is placed after the current last one.
    pub fn add_handler(&mut self, mut handler: FailureHandler<T, E>) -> ResilienceResult<i64> {
        if !handler.is_pinned() {
            if !self.assign_priorities {
                return Err(unpinned_error(&handler));
            }
            handler.assign_priority(self.chain.next_free_priority());
        }
        let priority = handler.priority();
        ensure_free(&self.chain, priority)?;
        handler.preflight(&self.kinds);
        self.chain.insert(handler)?;
        debug!(manager = %self.name, priority, "Failure handler added");
        Ok(priority)
    }

    /// Remove the handler registered at `priority`.
    pub fn del_handler(&mut self, priority: i64) -> ResilienceResult<FailureHandler<T, E>> {
        let handler = self.chain.remove(priority)?;
        debug!(manager = %self.name, priority, "Failure handler removed");
        Ok(handler)
    }

    /// Move a handler to another priority.
    pub fn set_priority(&mut self, old: i64, new: i64) -> ResilienceResult<()> {
        self.chain.set_priority(old, new)
    }

    /// Renumber handlers `0..n` keeping their order.
    pub fn normalize_priorities(&mut self) {
        self.chain.normalize();
    }

    /// The handler chain
    pub fn handlers(&self) -> &HandlerChain<T, E> {
        &self.chain
    }

    /// Intercepted kinds
    pub fn exceptions(&self) -> &Kinds<E> {
        &self.kinds
    }

    /// Replace the intercepted kinds. Fallback preflights already performed
    /// are not repeated.
    pub fn set_exceptions(&mut self, kinds: Kinds<E>) -> ResilienceResult<()> {
        kinds.validate("exceptions")?;
        self.kinds = kinds;
        Ok(())
    }

    /// Intercepted errors in occurrence order
    pub fn caught(&self) -> &[FailureRecord<E>] {
        &self.caught
    }

    /// Forget the interception history
    pub fn clear_caught(&mut self) {
        self.caught.clear();
    }

    /// Handler that resolved the most recent intercepted error
    pub fn activated(&self) -> Option<&FailureHandler<T, E>> {
        self.chain.activated()
    }

    /// Value of the fallback that resolved the most recent intercepted error
    pub fn returned(&self) -> Option<&T> {
        self.activated().and_then(FailureHandler::returned)
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    fn settle(&mut self, outcome: Result<T, E>) -> Result<Option<T>, E> {
        let error = match outcome {
            Ok(value) => return Ok(Some(value)),
            Err(error) => error,
        };

        let Some(kind) = self.kinds.classify(&error) else {
            debug!(manager = %self.name, error = %error, "Error outside intercepted kinds");
            return Err(error);
        };

        let record = FailureRecord::capture(kind, error.clone());
        let resolution = self.chain.dispatch(&record);
        if resolution.is_none() {
            warn!(
                manager = %self.name,
                kind = record.kind(),
                error = %error,
                "No applicable failure handler; error propagates"
            );
        }
        self.caught.push(record);

        match resolution {
            None => Err(error),
            Some(Resolution::Suppressed) => Ok(None),
            Some(Resolution::Recovered(value)) => Ok(Some(value)),
            Some(Resolution::Raised(translated)) => Err(translated),
        }
    }
}

fn ensure_free<T, E>(chain: &HandlerChain<T, E>, priority: i64) -> ResilienceResult<()> {
    match chain.get(priority) {
        Some(_) => Err(ResilienceError::PriorityConflict { priority }),
        None => Ok(()),
    }
}

fn unpinned_error<T, E>(handler: &FailureHandler<T, E>) -> ResilienceError {
    ResilienceError::invalid_config(format!(
        "handler {} needs an explicit priority when assign_priorities is off",
        handler.name()
    ))
}

impl<T, E> fmt::Debug for FailureManager<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureManager")
            .field("name", &self.name)
            .field("handlers", &self.chain)
            .field("exceptions", &self.kinds)
            .field("assign_priorities", &self.assign_priorities)
            .field("caught", &self.caught.len())
            .finish()
    }
}
