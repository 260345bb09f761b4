//! Equality comparers deciding whether a write or recomputation counts as a
//! change.
//!
//! Observable and computed values only propagate when the comparer says the
//! old and new values differ. [`default`] is structural equality through
//! `PartialEq`; [`never`] treats every write as a change; [`from_fn`] covers
//! everything else (epsilon comparison for floats, key-based identity, and
//! so on).

use std::sync::Arc;

/// Strategy deciding whether two values are interchangeable for propagation
/// purposes.
///
/// Cheap to clone; clones share the underlying function.
pub struct EqualityComparer<T> {
    eq: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T> Clone for EqualityComparer<T> {
    fn clone(&self) -> Self {
        Self {
            eq: self.eq.clone(),
        }
    }
}

impl<T> EqualityComparer<T> {
    /// Build a comparer from an arbitrary predicate.
    pub fn from_fn(eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self { eq: Arc::new(eq) }
    }

    /// Whether `a` and `b` compare equal under this strategy.
    pub fn are_equal(&self, a: &T, b: &T) -> bool {
        (self.eq)(a, b)
    }
}

/// Structural equality through `PartialEq`. The default everywhere.
pub fn default<T: PartialEq>() -> EqualityComparer<T> {
    EqualityComparer::from_fn(|a: &T, b: &T| a == b)
}

/// Treats every write as a change, even when the values compare equal.
/// Useful for values whose identity matters more than their content.
pub fn never<T>() -> EqualityComparer<T> {
    EqualityComparer::from_fn(|_: &T, _: &T| false)
}

/// Custom predicate, alias for [`EqualityComparer::from_fn`].
pub fn from_fn<T>(eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> EqualityComparer<T> {
    EqualityComparer::from_fn(eq)
}
