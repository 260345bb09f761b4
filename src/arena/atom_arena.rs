// Atom arena - storage for atom (observable cell) metadata
//
// This module defines AtomMetadata, AtomId, and the bookkeeping that hangs
// off the cell side of the dependency graph:
//
// - the observer set of each atom (which derivations currently depend on it)
// - the "become observed" / "become unobserved" lifecycle hook registry
// - the pending-unobservation queue drained at the close of the outermost
//   batch, so a cell that briefly drops to zero observers inside a
//   transaction never flaps its lifecycle hooks
// - the change-propagation walk (propagate_changed / propagate_maybe_changed
//   / propagate_change_confirmed)
//
// PRINCIPLED MODEL:
// - Atom = only has observers (no sources of its own)
// - Derivation (reaction/computed) = tracks sources
// - ComputedValue = Atom + Derivation (has BOTH an AtomId and an ObserverId);
//   the atom carries a back-link to the derivation it fronts so that reads
//   and unobservation can pull or suspend the computation behind it.

use crate::hash::GraphHashBuilder;
use papaya::HashMap as PapayaHashMap;
use parking_lot::RwLock;
use slab::Slab;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use super::observer_arena::{DerivationState, ObserverId, current_observer};

/// Global atom arena - stores all atom metadata
static ATOM_ARENA: RwLock<Slab<AtomMetadata>> = RwLock::new(Slab::new());

/// Monotone clock stamped onto an atom every time it reports a change.
static VERSION_CLOCK: AtomicU64 = AtomicU64::new(0);

// Atoms whose observer count dropped to zero and that are waiting for the
// outermost batch on this thread to close before their unobserved hooks fire
// (and, for computed values, before the backing derivation is suspended).
// Thread-local like the batch depth itself: propagation and finalization are
// confined to the thread driving the transaction.
thread_local! {
    static PENDING_UNOBSERVATIONS: RefCell<Vec<AtomId>> = const { RefCell::new(Vec::new()) };
}

/// Lifecycle listener invoked when an atom transitions between observed and
/// unobserved.
pub(crate) type HookFn = Arc<dyn Fn() + Send + Sync>;

/// Which lifecycle transition a hook listens to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum HookKind {
    /// Observer count went from zero to one.
    Observed,
    /// Observer count returned to zero and stayed there until batch close.
    Unobserved,
}

#[derive(Default)]
struct HookSet {
    observed: Vec<(u64, HookFn)>,
    unobserved: Vec<(u64, HookFn)>,
}

/// Global map: AtomId -> lifecycle hooks. Kept out of AtomMetadata so atoms
/// without hooks (the overwhelming majority) pay nothing for the feature.
/// Uses papaya's lock-free HashMap for efficient concurrent reads.
static ATOM_HOOKS: LazyLock<PapayaHashMap<AtomId, RwLock<HookSet>>> =
    LazyLock::new(PapayaHashMap::new);

static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(0);

/// Register a lifecycle hook for an atom, returning the id used to remove it.
pub(crate) fn add_hook(atom: AtomId, kind: HookKind, hook: HookFn) -> u64 {
    let id = NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed);
    let guard = ATOM_HOOKS.pin();
    let set = guard.get_or_insert_with(atom, || RwLock::new(HookSet::default()));
    match kind {
        HookKind::Observed => set.write().observed.push((id, hook)),
        HookKind::Unobserved => set.write().unobserved.push((id, hook)),
    }
    id
}

/// Remove a previously registered lifecycle hook. No-op if already removed.
pub(crate) fn remove_hook(atom: AtomId, kind: HookKind, id: u64) {
    let guard = ATOM_HOOKS.pin();
    if let Some(set) = guard.get(&atom) {
        let mut set = set.write();
        match kind {
            HookKind::Observed => set.observed.retain(|(hook_id, _)| *hook_id != id),
            HookKind::Unobserved => set.unobserved.retain(|(hook_id, _)| *hook_id != id),
        }
    }
}

/// Invoke the hooks for one lifecycle transition of an atom.
///
/// Hooks are cloned out before invocation so user callbacks run without any
/// arena or registry lock held and may freely re-enter the runtime.
fn fire_hooks(atom: AtomId, kind: HookKind) {
    let hooks: Vec<HookFn> = {
        let guard = ATOM_HOOKS.pin();
        match guard.get(&atom) {
            Some(set) => {
                let set = set.read();
                let list = match kind {
                    HookKind::Observed => &set.observed,
                    HookKind::Unobserved => &set.unobserved,
                };
                list.iter().map(|(_, hook)| hook.clone()).collect()
            }
            None => return,
        }
    };
    for hook in hooks {
        hook();
    }
}

/// Unique identifier for an atom in the arena.
///
/// This is a zero-cost wrapper around a slab index. When the owning `Atom`
/// is dropped it removes itself from the arena, making this AtomId stale.
/// Accessing a stale AtomId returns None.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct AtomId(u32);

/// Sentinel for "no backing derivation" in AtomMetadata::derivation.
const NO_DERIVATION: u32 = u32::MAX;

impl AtomId {
    /// Create a new AtomId from a raw index
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the atom metadata with a closure (read-only)
    ///
    /// Returns None if the atom has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&AtomMetadata) -> R,
    {
        let arena = ATOM_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Debug name of this atom, or a placeholder for stale ids.
    pub(crate) fn name(self) -> String {
        self.with(|metadata| metadata.name.to_string())
            .unwrap_or_else(|| "<dropped atom>".to_string())
    }

    /// Record that this atom is being read.
    ///
    /// If a derivation is currently tracking, the edge is established in both
    /// directions: the atom joins the derivation's source set and the
    /// derivation joins the atom's observer set. Repeat reads within the same
    /// tracked run are deduplicated through the run-id stamp.
    ///
    /// Outside a tracked run this is a no-op for propagation. It may still
    /// queue an unobserved atom for finalization (so a computed value read
    /// untracked inside a batch gets suspended when the batch closes), and it
    /// raises the configured diagnostic for reads outside a reactive context.
    pub(crate) fn report_observed(self) {
        if let Some(observer) = current_observer() {
            let run = observer.run_id();
            let fresh = self
                .with(|metadata| metadata.last_accessed_by.swap(run, Ordering::AcqRel) != run)
                .unwrap_or(false);
            if fresh {
                observer.add_source(self);
                self.add_observer(observer);
            }
        } else {
            if crate::config::get().observable_requires_reaction {
                tracing::warn!(
                    atom = %self.name(),
                    "observable read outside a reactive context"
                );
            }
            if crate::transaction::in_batch() > 0 && self.observer_count() == 0 {
                self.queue_for_unobservation();
            }
        }
    }

    /// Add an observer to this atom, firing the observed hooks on the
    /// zero-to-one transition.
    pub(crate) fn add_observer(self, observer: ObserverId) {
        let became_observed = self
            .with(|metadata| {
                metadata.observers.write().insert(observer);
                !metadata.is_being_observed.swap(true, Ordering::AcqRel)
            })
            .unwrap_or(false);
        if became_observed {
            fire_hooks(self, HookKind::Observed);
        }
    }

    /// Remove an observer from this atom. When the observer set empties the
    /// atom is queued for unobservation rather than finalized immediately;
    /// re-subscription before the batch closes cancels the transition.
    pub(crate) fn remove_observer(self, observer: ObserverId) {
        let now_empty = self
            .with(|metadata| {
                let mut observers = metadata.observers.write();
                observers.remove(&observer);
                observers.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            self.queue_for_unobservation();
        }
    }

    /// Snapshot the observer set.
    ///
    /// Propagation iterates the snapshot without holding the arena lock, so
    /// scheduling and cascading are free to re-enter the arenas.
    pub(crate) fn observers_snapshot(self) -> Vec<ObserverId> {
        self.with(|metadata| metadata.observers.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of derivations currently depending on this atom.
    pub(crate) fn observer_count(self) -> usize {
        self.with(|metadata| metadata.observers.read().len())
            .unwrap_or(0)
    }

    /// Whether any derivation currently depends on this atom.
    pub(crate) fn is_observed(self) -> bool {
        self.observer_count() > 0
    }

    /// Version stamped by the most recent `propagate_changed`.
    pub(crate) fn last_changed(self) -> u64 {
        self.with(|metadata| metadata.last_changed.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Link this atom to the derivation computing its value (computed values
    /// only). Called once during construction.
    pub(crate) fn set_derivation(self, observer: ObserverId) {
        self.with(|metadata| {
            metadata
                .derivation
                .store(observer.index() as u32, Ordering::Release);
        });
    }

    /// The derivation behind this atom, if it fronts a computed value.
    pub(crate) fn derivation(self) -> Option<ObserverId> {
        self.with(|metadata| {
            let raw = metadata.derivation.load(Ordering::Acquire);
            (raw != NO_DERIVATION).then(|| ObserverId::new(raw))
        })
        .flatten()
    }

    /// Full write path for callers holding only an id: the purity/policy
    /// check, then propagation inside its own batch.
    pub(crate) fn report_changed(self) {
        crate::arena::check_state_modification_allowed(self);
        let _batch = crate::transaction::BatchGuard::new();
        self.propagate_changed();
    }

    fn queue_for_unobservation(self) {
        let newly_pending = self
            .with(|metadata| {
                !metadata
                    .is_pending_unobservation
                    .swap(true, Ordering::AcqRel)
            })
            .unwrap_or(false);
        if newly_pending {
            PENDING_UNOBSERVATIONS.with(|queue| queue.borrow_mut().push(self));
        }
    }

    // =========================================================================
    // Change propagation
    // =========================================================================

    /// Mark every observer of this atom stale.
    ///
    /// Observers that were up to date additionally react to the transition:
    /// a reaction schedules itself, a computed value cascades a weaker
    /// "possibly stale" mark to its own observers. Observers already marked
    /// in this pass are upgraded silently, which terminates the walk on
    /// diamonds and cycles.
    pub(crate) fn propagate_changed(self) {
        self.with(|metadata| {
            metadata
                .last_changed
                .store(next_version(), Ordering::Release);
        });
        for observer in self.observers_snapshot() {
            match observer.state() {
                DerivationState::UpToDate => {
                    cov_mark::hit!(observer_marked_stale);
                    observer.on_become_stale();
                    observer.set_state(DerivationState::Stale);
                }
                DerivationState::PossiblyStale => observer.set_state(DerivationState::Stale),
                DerivationState::Stale | DerivationState::NotTracking => {}
            }
        }
    }

    /// Mark up-to-date observers of this atom possibly stale and cascade.
    ///
    /// Used when a computed value's inputs changed but its own output has not
    /// been re-evaluated yet: downstream derivations only *might* need to
    /// recompute. Observers already marked stop the cascade.
    pub(crate) fn propagate_maybe_changed(self) {
        for observer in self.observers_snapshot() {
            if observer.state() == DerivationState::UpToDate {
                cov_mark::hit!(maybe_changed_cascades);
                observer.set_state(DerivationState::PossiblyStale);
                observer.on_become_stale();
            } else {
                cov_mark::hit!(maybe_changed_terminates);
            }
        }
    }

    /// Confirm that a computed value genuinely changed: its possibly-stale
    /// observers are upgraded to stale and will recompute when pulled.
    /// Up-to-date observers already saw the new value during this pass and
    /// are left alone.
    pub(crate) fn propagate_change_confirmed(self) {
        self.with(|metadata| {
            metadata
                .last_changed
                .store(next_version(), Ordering::Release);
        });
        for observer in self.observers_snapshot() {
            if observer.state() == DerivationState::PossiblyStale {
                cov_mark::hit!(confirmed_upgrades_possibly_stale);
                observer.set_state(DerivationState::Stale);
            }
        }
    }
}

/// Metadata for an atom stored in the arena.
///
/// The actual value (if the atom fronts one) lives outside the arena in the
/// owning `ObservableValue`/`ComputedValue`. The arena only carries the graph
/// bookkeeping, which keeps it compact and cache friendly.
pub struct AtomMetadata {
    /// Debug name used in diagnostics and error messages.
    pub(crate) name: Box<str>,

    /// Derivations currently depending on this atom.
    pub(crate) observers: RwLock<HashSet<ObserverId, GraphHashBuilder>>,

    /// Tracks the zero/non-zero observer transitions for lifecycle hooks.
    pub(crate) is_being_observed: AtomicBool,

    /// Set while the atom sits in the pending-unobservation queue.
    pub(crate) is_pending_unobservation: AtomicBool,

    /// Run id of the tracked run that last read this atom. Deduplicates
    /// repeat reads within a single run without touching the source set.
    pub(crate) last_accessed_by: AtomicU64,

    /// Version stamp of the most recent confirmed change.
    pub(crate) last_changed: AtomicU64,

    /// Backing derivation for computed values, NO_DERIVATION otherwise.
    pub(crate) derivation: AtomicU32,
}

impl AtomMetadata {
    /// Create metadata for a fresh, unobserved atom.
    pub(crate) fn new(name: impl Into<Box<str>>) -> Self {
        Self {
            name: name.into(),
            observers: RwLock::new(HashSet::with_hasher(GraphHashBuilder)),
            is_being_observed: AtomicBool::new(false),
            is_pending_unobservation: AtomicBool::new(false),
            last_accessed_by: AtomicU64::new(0),
            last_changed: AtomicU64::new(0),
            derivation: AtomicU32::new(NO_DERIVATION),
        }
    }
}

/// Insert an atom into the arena and return its ID
pub(crate) fn atom_arena_insert(metadata: AtomMetadata) -> AtomId {
    let mut arena = ATOM_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    AtomId::new(key as u32)
}

/// Remove an atom from the arena along with its hook registrations
pub(crate) fn atom_arena_remove(id: AtomId) -> Option<AtomMetadata> {
    {
        let guard = ATOM_HOOKS.pin();
        guard.remove(&id);
    }
    let mut arena = ATOM_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

/// Advance the global change clock.
pub(crate) fn next_version() -> u64 {
    VERSION_CLOCK.fetch_add(1, Ordering::Relaxed) + 1
}

/// Finalize atoms that lost their last observer during the batch that just
/// closed.
///
/// For each queued atom that is still unobserved: fire the unobserved hooks
/// (once, only if the atom had actually been observed) and suspend the
/// backing derivation of computed values, releasing their upstream
/// subscriptions. Suspension can push further atoms onto the queue, so the
/// drain loops until it runs dry.
pub(crate) fn drain_pending_unobservations() {
    loop {
        let batch: Vec<AtomId> =
            PENDING_UNOBSERVATIONS.with(|queue| std::mem::take(&mut *queue.borrow_mut()));
        if batch.is_empty() {
            break;
        }
        for atom in batch {
            let (fire, suspend) = atom
                .with(|metadata| {
                    metadata
                        .is_pending_unobservation
                        .store(false, Ordering::Release);
                    if metadata.observers.read().is_empty() {
                        let was_observed =
                            metadata.is_being_observed.swap(false, Ordering::AcqRel);
                        let raw = metadata.derivation.load(Ordering::Acquire);
                        let backing = (raw != NO_DERIVATION).then(|| ObserverId::new(raw));
                        (was_observed, backing)
                    } else {
                        (false, None)
                    }
                })
                .unwrap_or((false, None));
            if fire {
                fire_hooks(atom, HookKind::Unobserved);
            }
            if let Some(observer) = suspend {
                cov_mark::hit!(unobserved_computed_suspended);
                observer.suspend();
            }
        }
    }
}
