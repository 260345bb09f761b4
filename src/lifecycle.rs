//! Lifecycle hooks and graph introspection.
//!
//! Anything backed by an atom can report when it gains its first observer or
//! loses its last one. Typical use: lazily starting an expensive feed when
//! somebody actually looks at the value, and stopping it when nobody does.
//!
//! The observed hook fires immediately on the zero-to-one transition. The
//! unobserved hook is deferred to the close of the outermost batch, so state
//! that is unsubscribed and re-subscribed within one transaction never sees
//! a spurious stop/start pair.

use crate::arena::{AtomId, HookKind, add_hook, remove_hook};
use crate::atom::Atom;
use crate::computed::ComputedValue;
use crate::observable::ObservableValue;
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// Types backed by an atom in the dependency graph.
///
/// Implemented by [`Atom`], [`ObservableValue`] and [`ComputedValue`]; the
/// lifecycle and introspection functions accept any of them.
pub trait Observable: sealed::Sealed {
    /// The backing atom's arena id.
    #[doc(hidden)]
    fn atom_id(&self) -> AtomId;
}

impl sealed::Sealed for Atom {}
impl Observable for Atom {
    fn atom_id(&self) -> AtomId {
        self.id()
    }
}

impl<T: Clone + Send + Sync + 'static> sealed::Sealed for ObservableValue<T> {}
impl<T: Clone + Send + Sync + 'static> Observable for ObservableValue<T> {
    fn atom_id(&self) -> AtomId {
        self.atom().id()
    }
}

impl<T: Clone + Send + Sync + 'static> sealed::Sealed for ComputedValue<T> {}
impl<T: Clone + Send + Sync + 'static> Observable for ComputedValue<T> {
    fn atom_id(&self) -> AtomId {
        self.atom().id()
    }
}

/// Registration receipt for a lifecycle hook. Dropping the handle does
/// nothing; call [`dispose`](HookHandle::dispose) to unregister.
pub struct HookHandle {
    atom: AtomId,
    kind: HookKind,
    id: u64,
}

impl HookHandle {
    /// Unregister the hook. No-op if already disposed.
    pub fn dispose(&self) {
        remove_hook(self.atom, self.kind, self.id);
    }
}

/// Invoke `listener` whenever `target` gains its first observer.
pub fn on_become_observed(
    target: &impl Observable,
    listener: impl Fn() + Send + Sync + 'static,
) -> HookHandle {
    let atom = target.atom_id();
    let id = add_hook(atom, HookKind::Observed, Arc::new(listener));
    HookHandle {
        atom,
        kind: HookKind::Observed,
        id,
    }
}

/// Invoke `listener` whenever `target` settles back to zero observers at the
/// close of a transaction.
pub fn on_become_unobserved(
    target: &impl Observable,
    listener: impl Fn() + Send + Sync + 'static,
) -> HookHandle {
    let atom = target.atom_id();
    let id = add_hook(atom, HookKind::Unobserved, Arc::new(listener));
    HookHandle {
        atom,
        kind: HookKind::Unobserved,
        id,
    }
}

/// Whether any derivation currently depends on `target`.
pub fn is_observed(target: &impl Observable) -> bool {
    target.atom_id().is_observed()
}

/// Number of derivations currently depending on `target`.
pub fn observer_count(target: &impl Observable) -> usize {
    target.atom_id().observer_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObservableValue, Reaction, run_in_action};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hooks_fire_once_per_transition() {
        let value = Arc::new(ObservableValue::new(1));
        let observed = Arc::new(AtomicUsize::new(0));
        let unobserved = Arc::new(AtomicUsize::new(0));

        let observed_in_hook = observed.clone();
        let _on = on_become_observed(&*value, move || {
            observed_in_hook.fetch_add(1, Ordering::Relaxed);
        });
        let unobserved_in_hook = unobserved.clone();
        let _off = on_become_unobserved(&*value, move || {
            unobserved_in_hook.fetch_add(1, Ordering::Relaxed);
        });

        let value_in_effect = value.clone();
        let reaction = Reaction::new("watcher", move || {
            value_in_effect.get();
        });
        assert_eq!(observed.load(Ordering::Relaxed), 1);
        assert_eq!(unobserved.load(Ordering::Relaxed), 0);
        assert!(is_observed(&*value));

        reaction.dispose();
        assert_eq!(unobserved.load(Ordering::Relaxed), 1);
        assert!(!is_observed(&*value));
    }

    #[test]
    fn resubscribe_within_transaction_does_not_flap() {
        let value = Arc::new(ObservableValue::new(1));
        let unobserved = Arc::new(AtomicUsize::new(0));

        let unobserved_in_hook = unobserved.clone();
        let _off = on_become_unobserved(&*value, move || {
            unobserved_in_hook.fetch_add(1, Ordering::Relaxed);
        });

        let value_in_first = value.clone();
        let first = Reaction::new("first watcher", move || {
            value_in_first.get();
        });

        let value_in_second = value.clone();
        let second = run_in_action(|| {
            first.dispose();
            // Observer count touched zero, but a new watcher arrives in the
            // same transaction
            Reaction::new("second watcher", move || {
                value_in_second.get();
            })
        });
        assert_eq!(unobserved.load(Ordering::Relaxed), 0);

        second.dispose();
        assert_eq!(unobserved.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disposed_hook_stops_firing() {
        let value = Arc::new(ObservableValue::new(1));
        let observed = Arc::new(AtomicUsize::new(0));

        let observed_in_hook = observed.clone();
        let hook = on_become_observed(&*value, move || {
            observed_in_hook.fetch_add(1, Ordering::Relaxed);
        });
        hook.dispose();

        let value_in_effect = value.clone();
        let _reaction = Reaction::new("watcher", move || {
            value_in_effect.get();
        });
        assert_eq!(observed.load(Ordering::Relaxed), 0);
        assert_eq!(observer_count(&*value), 1);
    }
}
