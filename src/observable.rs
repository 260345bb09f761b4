use crate::arena::next_guid;
use crate::atom::Atom;
use crate::comparer::{self, EqualityComparer};
use parking_lot::RwLock;
use std::sync::Arc;

/// Write transform applied to a value before it is stored and compared.
///
/// The reference enhancer stores values as handed in; custom enhancers can
/// normalize on the way in (clamping, interning, deduplication) so that the
/// comparer sees canonical values and spurious propagation is avoided.
///
/// Cheap to clone; clones share the underlying function.
pub struct Enhancer<T> {
    apply: Arc<dyn Fn(T) -> T + Send + Sync>,
}

impl<T> Clone for Enhancer<T> {
    fn clone(&self) -> Self {
        Self {
            apply: self.apply.clone(),
        }
    }
}

impl<T> Enhancer<T> {
    /// Build an enhancer from an arbitrary transform.
    pub fn from_fn(apply: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        Self {
            apply: Arc::new(apply),
        }
    }

    /// Run the transform.
    pub fn apply(&self, value: T) -> T {
        (self.apply)(value)
    }
}

/// The stock enhancers.
pub mod enhancer {
    use super::Enhancer;

    /// Store values exactly as written. The default.
    pub fn reference<T>() -> Enhancer<T> {
        Enhancer::from_fn(|value| value)
    }

    /// Custom transform, alias for [`Enhancer::from_fn`].
    pub fn from_fn<T>(apply: impl Fn(T) -> T + Send + Sync + 'static) -> Enhancer<T> {
        Enhancer::from_fn(apply)
    }
}

/// A mutable cell holding a value of type `T`, observable by derivations.
///
/// Reading through [`get`](ObservableValue::get) inside a reaction or
/// computed value subscribes that derivation; writing through
/// [`set`](ObservableValue::set) marks dependents stale and schedules the
/// affected reactions. Writes that the comparer considers equal to the
/// current value propagate nothing.
///
/// # Example
/// ```ignore
/// let celsius = Arc::new(ObservableValue::new(21.5));
///
/// let _logger = autorun({
///     let celsius = celsius.clone();
///     move || println!("{} degrees", celsius.get())
/// });
///
/// celsius.set(21.5); // same value, nothing happens
/// celsius.set(23.0); // logger runs once
/// ```
pub struct ObservableValue<T> {
    atom: Atom,
    value: RwLock<T>,
    equals: EqualityComparer<T>,
    enhance: Enhancer<T>,
}

impl<T: Clone + Send + Sync + 'static> ObservableValue<T> {
    /// Create an observable value with an auto-generated name, `PartialEq`
    /// comparison and reference storage.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::named(format!("ObservableValue@{}", next_guid()), value)
    }

    /// Create an observable value with the given debug name.
    pub fn named(name: impl Into<String>, value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_options(name, value, comparer::default(), enhancer::reference())
    }

    /// Create an observable value with an explicit comparer and enhancer.
    pub fn with_options(
        name: impl Into<String>,
        value: T,
        equals: EqualityComparer<T>,
        enhance: Enhancer<T>,
    ) -> Self {
        let value = enhance.apply(value);
        Self {
            atom: Atom::new(name),
            value: RwLock::new(value),
            equals,
            enhance,
        }
    }

    /// Read the current value, subscribing the tracking derivation (if any).
    pub fn get(&self) -> T {
        self.atom.report_observed();
        self.value.read().clone()
    }

    /// Read the current value without establishing a dependency edge.
    pub fn get_untracked(&self) -> T {
        self.value.read().clone()
    }

    /// Write a new value.
    ///
    /// The enhancer runs first, then the comparer decides whether anything
    /// actually changed. Only a genuine change stores the value and
    /// propagates; reactions triggered by a bare write run before this call
    /// returns, writes inside a transaction defer them to batch exit.
    pub fn set(&self, value: T) {
        let value = self.enhance.apply(value);
        let changed = {
            let current = self.value.read();
            !self.equals.are_equal(&current, &value)
        };
        if changed {
            *self.value.write() = value;
            self.atom.report_changed();
        }
    }

    /// Derive the next value from the current one and write it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = {
            let current = self.value.read();
            f(&current)
        };
        self.set(next);
    }

    /// The debug name of the backing atom.
    pub fn name(&self) -> String {
        self.atom.name()
    }

    /// The backing atom (internal use only)
    pub(crate) fn atom(&self) -> &Atom {
        &self.atom
    }
}
