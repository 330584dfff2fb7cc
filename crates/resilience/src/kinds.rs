//! Error kind sets
//!
//! A [`Kinds`] decides which errors a primitive takes ownership of. Anything
//! it does not match passes through untouched and unrecorded.

use std::any::type_name;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{ResilienceError, ResilienceResult};

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

enum Label<E> {
    Fixed(Cow<'static, str>),
    Dynamic(fn(&E) -> Cow<'static, str>),
}

impl<E> Clone for Label<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(name) => Self::Fixed(name.clone()),
            Self::Dynamic(f) => Self::Dynamic(*f),
        }
    }
}

struct Entry<E> {
    label: Label<E>,
    test: Predicate<E>,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            test: Arc::clone(&self.test),
        }
    }
}

/// Ordered set of named error predicates.
///
/// The first matching entry names the kind recorded for an error.
pub struct Kinds<E> {
    entries: Vec<Entry<E>>,
}

impl<E: 'static> Kinds<E> {
    /// Match every error. Recorded under the error type's name.
    pub fn any() -> Self {
        Self {
            entries: vec![Entry {
                label: Label::Fixed(Cow::Borrowed(short_type_name::<E>())),
                test: Arc::new(|_: &E| true),
            }],
        }
    }
}

impl<E> Kinds<E> {
    /// A set with no entries. Primitives reject it; build on it with [`or`](Self::or).
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Match errors for which `pred` holds, recorded as `name`.
    pub fn matching(
        name: impl Into<Cow<'static, str>>,
        pred: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::empty().or(name, pred)
    }

    /// Add another entry.
    #[must_use]
    pub fn or(
        mut self,
        name: impl Into<Cow<'static, str>>,
        pred: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.entries.push(Entry {
            label: Label::Fixed(name.into()),
            test: Arc::new(pred),
        });
        self
    }

    /// Kind name of the first entry matching `error`.
    pub fn classify(&self, error: &E) -> Option<Cow<'static, str>> {
        self.entries
            .iter()
            .find(|entry| (entry.test)(error))
            .map(|entry| match &entry.label {
                Label::Fixed(name) => name.clone(),
                Label::Dynamic(f) => f(error),
            })
    }

    /// Whether any entry matches `error`.
    pub fn contains(&self, error: &E) -> bool {
        self.entries.iter().any(|entry| (entry.test)(error))
    }

    /// Entry names in order. Entries labelled per error show as `*`.
    pub fn names(&self) -> Vec<Cow<'static, str>> {
        self.entries
            .iter()
            .map(|entry| match &entry.label {
                Label::Fixed(name) => name.clone(),
                Label::Dynamic(_) => Cow::Borrowed("*"),
            })
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn validate(&self, option: &str) -> ResilienceResult<()> {
        if self.is_empty() {
            return Err(ResilienceError::invalid_config(format!(
                "{option} must name at least one error kind"
            )));
        }
        Ok(())
    }
}

impl Kinds<SharedError> {
    /// Match any [`SharedError`], recorded under its concrete type's name.
    pub fn any_error() -> Self {
        Self {
            entries: vec![Entry {
                label: Label::Dynamic(|e: &SharedError| Cow::Borrowed(e.kind_name())),
                test: Arc::new(|_: &SharedError| true),
            }],
        }
    }

    /// Match errors whose concrete type is `K`.
    pub fn of<K: StdError + 'static>() -> Self {
        Self::empty().or_of::<K>()
    }

    /// Add a concrete type to the set.
    #[must_use]
    pub fn or_of<K: StdError + 'static>(self) -> Self {
        self.or(short_type_name::<K>(), |e: &SharedError| e.is::<K>())
    }
}

impl<E: 'static> Default for Kinds<E> {
    fn default() -> Self {
        Self::any()
    }
}

impl<E> Clone for Kinds<E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<E> fmt::Debug for Kinds<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    if full.contains('<') {
        return full;
    }
    full.rsplit("::").next().unwrap_or(full)
}

/// Cloneable, type-erased error.
///
/// Clones share one allocation, so the value handed back to a caller after a
/// retry or a failed dispatch is the very error the protected code produced
/// (see [`SharedError::ptr_eq`]).
#[derive(Clone)]
pub struct SharedError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
    kind: &'static str,
}

impl SharedError {
    /// Wrap an error value.
    pub fn new<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Self {
            inner: Arc::new(error),
            kind: short_type_name::<E>(),
        }
    }

    /// Name of the wrapped error's concrete type
    pub fn kind_name(&self) -> &'static str {
        self.kind
    }

    /// Whether the wrapped error is a `K`
    pub fn is<K: StdError + 'static>(&self) -> bool {
        self.inner.is::<K>()
    }

    /// Borrow the wrapped error as `K`
    pub fn downcast_ref<K: StdError + 'static>(&self) -> Option<&K> {
        self.inner.downcast_ref::<K>()
    }

    /// Whether both handles point at the same error value
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// The shared error itself
    pub fn into_inner(self) -> Arc<dyn StdError + Send + Sync + 'static> {
        self.inner
    }
}

impl<E: StdError + Send + Sync + 'static> From<E> for SharedError {
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl Deref for SharedError {
    type Target = dyn StdError + Send + Sync + 'static;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, thiserror::Error)]
    #[error("bad value: {0}")]
    struct ValueError(i32);

    #[derive(Debug, thiserror::Error)]
    #[error("missing key")]
    struct KeyError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum AppError {
        Transient,
        Fatal,
    }

    #[test]
    fn test_any_matches_everything() {
        let kinds = Kinds::<AppError>::any();
        assert!(kinds.contains(&AppError::Transient));
        assert_eq!(kinds.classify(&AppError::Fatal).as_deref(), Some("AppError"));
    }

    #[test]
    fn test_first_matching_entry_names_the_kind() {
        let kinds = Kinds::matching("transient", |e: &AppError| *e == AppError::Transient)
            .or("anything", |_| true);
        assert_eq!(
            kinds.classify(&AppError::Transient).as_deref(),
            Some("transient")
        );
        assert_eq!(kinds.classify(&AppError::Fatal).as_deref(), Some("anything"));
        assert_eq!(kinds.names(), vec!["transient", "anything"]);
    }

    #[test]
    fn test_empty_set_is_rejected() {
        let err = Kinds::<AppError>::empty()
            .validate("exceptions")
            .expect_err("empty set");
        assert!(err.is_config_error());
        assert!(Kinds::<AppError>::any().validate("exceptions").is_ok());
    }

    #[test]
    fn test_shared_error_type_matching() {
        let kinds = Kinds::of::<ValueError>();
        let value: SharedError = ValueError(7).into();
        let key: SharedError = KeyError.into();

        assert!(kinds.contains(&value));
        assert!(!kinds.contains(&key));
        assert_eq!(kinds.classify(&value).as_deref(), Some("ValueError"));

        let both = Kinds::of::<ValueError>().or_of::<KeyError>();
        assert!(both.contains(&key));
    }

    #[test]
    fn test_any_error_labels_by_concrete_type() {
        let kinds = Kinds::any_error();
        let key: SharedError = KeyError.into();
        assert_eq!(kinds.classify(&key).as_deref(), Some("KeyError"));
        assert_eq!(kinds.names(), vec!["*"]);
    }

    fn matched<E>(kinds: &Kinds<E>, errors: &[E]) -> Vec<String> {
        errors
            .iter()
            .filter_map(|e| kinds.classify(e))
            .map(Cow::into_owned)
            .collect()
    }

    fn is_refused(e: &&str) -> bool {
        *e == "refused"
    }

    #[test]
    fn test_lookup_works_for_borrowed_errors() {
        let owned = [String::from("timeout"), String::from("refused")];
        let errors: Vec<&str> = owned.iter().map(String::as_str).collect();
        let kinds = Kinds::matching("net", is_refused);

        assert_eq!(matched(&kinds, &errors), vec!["net"]);
        assert_eq!(kinds.len(), 1);
        assert_eq!(format!("{kinds:?}"), r#"["net"]"#);
    }

    #[test]
    fn test_shared_error_identity_and_downcast() {
        let original = SharedError::new(ValueError(3));
        let copy = original.clone();
        assert!(SharedError::ptr_eq(&original, &copy));
        assert!(!SharedError::ptr_eq(&original, &SharedError::new(ValueError(3))));
        assert_eq!(copy.downcast_ref::<ValueError>().map(|e| e.0), Some(3));
        assert_eq!(copy.to_string(), "bad value: 3");
        assert_eq!(copy.kind_name(), "ValueError");
    }
}
