use crate::arena::{
    AtomMetadata, ComputationDepthGuard, DerivationHandle, ObserverMetadata, TrackingGuard,
    atom_arena_insert, current_observer, next_guid, observer_arena_insert,
};
use crate::atom::Atom;
use crate::comparer::{self, EqualityComparer};
use crate::error::ReactiveError;
use crate::transaction::{BatchGuard, in_batch};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Lazily memoized derived value that is itself observable.
///
/// A ComputedValue composes an atom (so derivations can depend on it) with a
/// derivation (so it can depend on other observables). Evaluation is lazy:
/// nothing runs at construction, and while the computed is observed the
/// cached value is reused until an input genuinely changes.
///
/// # Staleness resolution
/// When an indirect input changes, the computed is only marked possibly
/// stale. On the next read it resolves upstream first: each possibly-stale
/// input is brought up to date, and if all of them compare equal to their
/// previous values the computed demotes itself without re-running and
/// without notifying its own observers. Chains of computeds therefore stop
/// propagating at the first level where values stabilize.
///
/// # Suspension
/// With zero observers there is nobody to keep the cache coherent for, so an
/// unobserved computed simply re-evaluates on every read (untracked, no
/// subscriptions). When the last observer unsubscribes mid-transaction the
/// upstream subscriptions are kept until the batch closes, avoiding churn if
/// something re-observes within the same transaction.
///
/// # Example
/// ```ignore
/// let width = ObservableValue::new(3.0);
/// let height = ObservableValue::new(4.0);
///
/// let area = ComputedValue::new(move || width.get() * height.get());
///
/// let a1 = area.get(); // evaluates
/// let a2 = area.get(); // unobserved: evaluates again
///
/// let _display = autorun(move || println!("area = {}", area.get()));
/// // observed from here on: cached until width or height changes
/// ```
pub struct ComputedValue<T> {
    /// Output atom others subscribe to. Owned here so Atom::Drop cleans up.
    atom: Atom,

    /// The derivation driving recomputation. Owned here so DerivationHandle
    /// frees the arena slot on drop.
    derivation: DerivationHandle,

    /// Cached result of the most recent evaluation.
    value: Arc<RwLock<Option<T>>>,

    /// The user computation, shared with the arena closure.
    compute: Arc<Mutex<Box<dyn FnMut() -> T + Send>>>,
}

impl<T: Clone + Send + Sync + 'static> ComputedValue<T> {
    /// Create a computed value with an auto-generated name and `PartialEq`
    /// change detection. The computation does not run until the first read.
    pub fn new<F>(compute: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
        T: PartialEq,
    {
        Self::named(format!("ComputedValue@{}", next_guid()), compute)
    }

    /// Create a computed value with the given debug name.
    pub fn named<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
        T: PartialEq,
    {
        Self::with_options(name, compute, comparer::default())
    }

    /// Create a computed value with an explicit equality comparer.
    pub fn with_options<F>(
        name: impl Into<String>,
        compute: F,
        equals: EqualityComparer<T>,
    ) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        let name: String = name.into();
        let atom_id = atom_arena_insert(AtomMetadata::new(name.clone()));

        let value: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));
        let compute: Arc<Mutex<Box<dyn FnMut() -> T + Send>>> =
            Arc::new(Mutex::new(Box::new(compute) as Box<dyn FnMut() -> T + Send>));

        // The arena closure re-evaluates, compares against the previous
        // result and only on a genuine change confirms the propagation so
        // possibly-stale observers upgrade to stale.
        let value_in_closure = value.clone();
        let compute_in_closure = compute.clone();
        let callback: Box<dyn FnMut() + Send> = Box::new(move || {
            let previous = value_in_closure.read().clone();
            let next = {
                let mut compute = compute_in_closure.lock();
                (compute)()
            };
            let changed = match &previous {
                Some(previous) => !equals.are_equal(previous, &next),
                None => true,
            };
            *value_in_closure.write() = Some(next);
            if changed {
                atom_id.propagate_change_confirmed();
            }
        });

        let observer_id = observer_arena_insert(ObserverMetadata::computed(name, callback, atom_id));
        atom_id.set_derivation(observer_id);

        Self {
            atom: Atom::from_raw(atom_id),
            derivation: DerivationHandle::new(observer_id),
            value,
            compute,
        }
    }

    /// Read the computed value.
    ///
    /// Observed (or read inside a batch or tracked run): subscribes the
    /// tracking derivation, resolves staleness and returns the cache.
    /// Unobserved outside any batch: re-evaluates untracked on every call.
    ///
    /// Reading a computed from within its own evaluation is a dependency
    /// cycle and panics.
    pub fn get(&self) -> T {
        let observer = self.derivation.id();
        let atom = self.atom.id();

        if observer.is_running() {
            panic!(
                "{}",
                ReactiveError::DerivationCycle {
                    name: observer.name()
                }
            );
        }

        if in_batch() == 0 && !atom.is_observed() && current_observer().is_none() {
            if observer.should_compute() {
                if crate::config::get().computed_requires_reaction {
                    tracing::warn!(
                        computed = %observer.name(),
                        "computed value read outside a reactive context; it recomputes on every access"
                    );
                }
                // Evaluate untracked: with no observers there is nothing to
                // keep subscribed, and the state stays NotTracking so the
                // next unobserved read evaluates again.
                let _batch = BatchGuard::new();
                self.compute_untracked();
            }
        } else {
            atom.report_observed();
            observer.update_if_necessary();
        }

        self.value
            .read()
            .clone()
            .expect("computed value is evaluated before it is returned")
    }

    fn compute_untracked(&self) {
        let observer = self.derivation.id();
        // Same reentry guard as tracked runs: a cyclic read must fail fast
        // here, before it would block on the compute closure's mutex
        if observer.enter_run() {
            panic!(
                "{}",
                ReactiveError::DerivationCycle {
                    name: observer.name()
                }
            );
        }
        struct EvalGuard(crate::arena::ObserverId);
        impl Drop for EvalGuard {
            fn drop(&mut self) {
                self.0.exit_run();
            }
        }
        let _running = EvalGuard(observer);

        let _untracked = TrackingGuard::new(None);
        let _purity = ComputationDepthGuard::new();
        let next = {
            let mut compute = self.compute.lock();
            (compute)()
        };
        *self.value.write() = Some(next);
    }

    /// The debug name of this computed value.
    pub fn name(&self) -> String {
        self.atom.name()
    }

    /// The backing atom (internal use only)
    pub(crate) fn atom(&self) -> &Atom {
        &self.atom
    }
}
