// Observer arena - storage for derivation (reaction and computed) metadata
//
// This module defines ObserverMetadata, a unified struct for both reactions
// and computed values, and the staleness state machine driving minimal
// recomputation.
//
// FOUR-STATE STALENESS SYSTEM:
// - NotTracking (0): never ran, or suspended; must compute before use
// - UpToDate (1): value/effect is current
// - PossiblyStale (2): an indirect input changed, verify upstream first
// - Stale (3): a direct input changed, must recompute
//
// States only escalate during a propagation pass. A derivation returns to
// UpToDate either by re-running or by the possibly-stale resolution step
// confirming that no upstream value actually changed, in which case neither
// it nor anything downstream re-runs.

use crate::hash::GraphHashBuilder;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use super::atom_arena::AtomId;

/// Staleness classification of a derivation - uses u8 for AtomicU8 storage.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DerivationState {
    /// Never ran or currently suspended; has no valid dependency set.
    NotTracking = 0,
    /// Current; cached results are valid.
    UpToDate = 1,
    /// An indirect input may have changed; resolve upstream before deciding.
    PossiblyStale = 2,
    /// A direct input definitely changed; must re-run.
    Stale = 3,
}

impl DerivationState {
    /// Convert from u8 to DerivationState
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => DerivationState::NotTracking,
            1 => DerivationState::UpToDate,
            2 => DerivationState::PossiblyStale,
            _ => DerivationState::Stale,
        }
    }
}

/// Global observer arena - stores all derivation metadata
static OBSERVER_ARENA: RwLock<Slab<ObserverMetadata>> = RwLock::new(Slab::new());

/// Run-id source for tracked runs. Each tracked run gets a fresh id, which
/// atoms use to deduplicate repeat reads within that run.
static RUN_CLOCK: AtomicU64 = AtomicU64::new(0);

// Thread-local currently tracking derivation.
// Reads establish dependency edges against this observer. Saved and restored
// with stack discipline so nested tracked runs unwind correctly.
thread_local! {
    static CURRENT_OBSERVER: RefCell<Option<ObserverId>> = const { RefCell::new(None) };
}

// Depth of computed evaluations on this thread. Non-zero means we are inside
// a pure computation and observable writes are a contract violation.
thread_local! {
    static COMPUTATION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Get the currently tracking derivation (if any)
pub(crate) fn current_observer() -> Option<ObserverId> {
    CURRENT_OBSERVER.with(|current| *current.borrow())
}

fn set_current_observer(observer: Option<ObserverId>) -> Option<ObserverId> {
    CURRENT_OBSERVER.with(|current| current.replace(observer))
}

/// RAII guard installing a derivation as the tracking target (or clearing it
/// for untracked sections). Restores the previous target when dropped, even
/// if the tracked closure panics.
pub(crate) struct TrackingGuard {
    previous: Option<ObserverId>,
}

impl TrackingGuard {
    pub(crate) fn new(observer: Option<ObserverId>) -> Self {
        let previous = set_current_observer(observer);
        Self { previous }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        set_current_observer(self.previous);
    }
}

/// RAII guard marking the thread as inside a pure computation.
pub(crate) struct ComputationDepthGuard;

impl ComputationDepthGuard {
    pub(crate) fn new() -> Self {
        COMPUTATION_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for ComputationDepthGuard {
    fn drop(&mut self) {
        COMPUTATION_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Fail fast when a write arrives from inside a pure computation, and raise
/// the configured diagnostic for writes to observed state outside an action.
pub(crate) fn check_state_modification_allowed(atom: AtomId) {
    if COMPUTATION_DEPTH.with(Cell::get) > 0 && atom.is_observed() {
        panic!(
            "{}",
            crate::error::ReactiveError::ComputedMutatesState { atom: atom.name() }
        );
    }
    if crate::config::get().enforce_actions
        && crate::transaction::in_batch() == 0
        && atom.is_observed()
    {
        tracing::warn!(
            atom = %atom.name(),
            "observed atom mutated outside an action"
        );
    }
}

/// Unique identifier for a derivation in the arena.
///
/// This is a zero-cost wrapper around a slab index. When the owning handle
/// is dropped the entry is removed, making this ObserverId stale. Accessing
/// a stale ObserverId returns None.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObserverId(u32);

impl ObserverId {
    /// Create a new ObserverId from a raw index
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the observer metadata with a closure (read-only)
    ///
    /// Returns None if the derivation has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&ObserverMetadata) -> R,
    {
        let arena = OBSERVER_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Debug name of this derivation, or a placeholder for stale ids.
    pub(crate) fn name(self) -> String {
        self.with(|metadata| metadata.name.to_string())
            .unwrap_or_else(|| "<dropped derivation>".to_string())
    }

    /// Current staleness state. Stale ids read as UpToDate so propagation
    /// walks skip them.
    pub(crate) fn state(self) -> DerivationState {
        self.with(|metadata| metadata.state())
            .unwrap_or(DerivationState::UpToDate)
    }

    /// Set the staleness state
    pub(crate) fn set_state(self, state: DerivationState) {
        self.with(|metadata| metadata.set_state(state));
    }

    /// Run id of the most recent tracked run of this derivation.
    pub(crate) fn run_id(self) -> u64 {
        self.with(|metadata| metadata.run_id.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Add an atom to this derivation's source set
    pub(crate) fn add_source(self, source: AtomId) {
        self.with(|metadata| {
            metadata.sources.write().insert(source);
        });
    }

    /// Remove an atom from this derivation's source set
    ///
    /// Called when an atom is dropped to clean up back-references.
    pub(crate) fn remove_source(self, source: AtomId) {
        self.with(|metadata| {
            metadata.sources.write().remove(&source);
        });
    }

    /// Drain the source set, returning the atoms that were subscribed.
    pub(crate) fn take_sources(self) -> Vec<AtomId> {
        self.with(|metadata| metadata.sources.write().drain().collect())
            .unwrap_or_default()
    }

    /// Snapshot the source set without clearing it.
    pub(crate) fn sources_snapshot(self) -> Vec<AtomId> {
        self.with(|metadata| metadata.sources.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// The atom this derivation writes through (computed values only).
    pub(crate) fn output(self) -> Option<AtomId> {
        self.with(|metadata| metadata.output).flatten()
    }

    /// Whether the derivation is mid-run on some call stack.
    pub(crate) fn is_running(self) -> bool {
        self.with(|metadata| metadata.is_running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Flip the running flag on. Returns whether it was already set, in which
    /// case the caller is re-entering a live evaluation.
    pub(crate) fn enter_run(self) -> bool {
        self.with(|metadata| metadata.is_running.swap(true, Ordering::AcqRel))
            .unwrap_or(true)
    }

    /// Clear the running flag.
    pub(crate) fn exit_run(self) {
        self.with(|metadata| metadata.is_running.store(false, Ordering::Release));
    }

    /// Mark disposed. Returns true if this call performed the transition.
    pub(crate) fn set_disposed(self) -> bool {
        self.with(|metadata| !metadata.disposed.swap(true, Ordering::AcqRel))
            .unwrap_or(false)
    }

    /// Whether the derivation has been disposed.
    pub(crate) fn is_disposed(self) -> bool {
        self.with(|metadata| metadata.disposed.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    /// Mark scheduled. Returns true if the derivation was not already queued.
    pub(crate) fn set_scheduled(self) -> bool {
        self.with(|metadata| !metadata.scheduled.swap(true, Ordering::AcqRel))
            .unwrap_or(false)
    }

    /// Clear the scheduled flag (the runner owns the queue slot from here).
    pub(crate) fn clear_scheduled(self) {
        self.with(|metadata| metadata.scheduled.store(false, Ordering::Release));
    }

    /// React to one of this derivation's inputs becoming stale.
    ///
    /// A reaction schedules itself for the next drain. A computed value does
    /// not recompute eagerly; it cascades a possibly-stale mark through its
    /// output atom so consumers decide lazily whether work is needed.
    pub(crate) fn on_become_stale(self) {
        match self.output() {
            Some(output) => output.propagate_maybe_changed(),
            None => crate::reaction::schedule(self),
        }
    }

    /// Decide whether this derivation has to re-run, resolving possibly-stale
    /// inputs upstream-first.
    ///
    /// For a possibly-stale derivation each source fronting a computed value
    /// is pulled (untracked, so the resolution itself records no edges). If
    /// any pull confirms a change our own state flips to Stale and resolution
    /// stops. If every upstream input compared equal the derivation is demoted
    /// back to UpToDate without running, and nothing downstream re-runs.
    pub(crate) fn should_compute(self) -> bool {
        match self.state() {
            DerivationState::UpToDate => false,
            DerivationState::NotTracking | DerivationState::Stale => true,
            DerivationState::PossiblyStale => {
                let _untracked = TrackingGuard::new(None);
                for source in self.sources_snapshot() {
                    if let Some(upstream) = source.derivation() {
                        upstream.update_if_necessary();
                        if self.state() == DerivationState::Stale {
                            cov_mark::hit!(upstream_confirmed_change);
                            return true;
                        }
                    }
                }
                cov_mark::hit!(possibly_stale_demoted);
                self.set_state(DerivationState::UpToDate);
                false
            }
        }
    }

    /// Re-run the derivation if the state machine says so.
    pub(crate) fn update_if_necessary(self) {
        if self.should_compute() {
            self.run_tracked();
        }
    }

    /// Execute this derivation's closure with dependency tracking.
    ///
    /// The previous source set is torn down first; reads during the run
    /// rebuild exactly the edges the latest run touched. The derivation is
    /// installed as the tracking target with stack discipline, so nested
    /// tracked runs (a computed evaluated while another derivation runs)
    /// save and restore correctly.
    ///
    /// Re-entering a derivation that is already mid-run is a dependency
    /// cycle and fails fast.
    pub(crate) fn run_tracked(self) {
        if self.enter_run() {
            panic!(
                "{}",
                crate::error::ReactiveError::DerivationCycle { name: self.name() }
            );
        }

        // Restores the running flag and, if the closure panicked before
        // completing, reverts the state to Stale so the next access retries
        // instead of trusting a half-built result.
        struct RunGuard {
            observer: ObserverId,
            completed: bool,
        }
        impl Drop for RunGuard {
            fn drop(&mut self) {
                self.observer.with(|metadata| {
                    metadata.is_running.store(false, Ordering::Release);
                    if !self.completed {
                        metadata.set_state(DerivationState::Stale);
                    }
                });
            }
        }
        let mut guard = RunGuard {
            observer: self,
            completed: false,
        };

        for source in self.take_sources() {
            source.remove_observer(self);
        }

        self.set_state(DerivationState::UpToDate);
        self.with(|metadata| {
            metadata
                .run_id
                .store(RUN_CLOCK.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Release);
        });

        {
            let _tracking = TrackingGuard::new(Some(self));
            let _purity = self.output().map(|_| ComputationDepthGuard::new());
            self.run_callback();
        }

        guard.completed = true;
    }

    /// Run the closure stored in the arena for this derivation.
    ///
    /// The closure is taken out of the arena for the duration of the call
    /// because it may itself create atoms or derivations, which needs the
    /// arena write lock. A drop guard restores it even if it panics.
    pub(crate) fn run_callback(self) {
        struct CallbackGuard {
            observer: ObserverId,
            callback: Option<Box<dyn FnMut() + Send>>,
        }

        impl CallbackGuard {
            fn run(&mut self) {
                if let Some(ref mut callback) = self.callback {
                    callback();
                }
            }
        }

        impl Drop for CallbackGuard {
            fn drop(&mut self) {
                if let Some(callback) = self.callback.take() {
                    let arena = OBSERVER_ARENA.read();
                    if let Some(metadata) = arena.get(self.observer.index()) {
                        *metadata.callback.lock() = Some(callback);
                    }
                }
            }
        }

        let callback = {
            let arena = OBSERVER_ARENA.read();
            arena
                .get(self.index())
                .and_then(|metadata| metadata.callback.lock().take())
        };

        if let Some(callback) = callback {
            let mut guard = CallbackGuard {
                observer: self,
                callback: Some(callback),
            };
            guard.run();
        }
    }

    /// Release this derivation's subscriptions and reset it to NotTracking.
    ///
    /// Used when a computed value loses its last observer: the cached result
    /// is no longer kept current, and the next read recomputes from scratch.
    pub(crate) fn suspend(self) {
        for source in self.take_sources() {
            source.remove_observer(self);
        }
        self.set_state(DerivationState::NotTracking);
    }
}

/// Unified metadata for reactions and computed values stored in the arena.
///
/// Both kinds share the staleness state machine and the source set; they
/// differ only in whether an output atom is attached (computed values) and
/// in what their closure does. The closure is stored directly in the arena
/// so the scheduler and the pull path can run any derivation by id.
pub struct ObserverMetadata {
    /// Debug name used in diagnostics and error messages.
    pub(crate) name: Box<str>,

    /// Staleness state, see DerivationState.
    pub(crate) state: AtomicU8,

    /// Run id assigned at the start of each tracked run.
    pub(crate) run_id: AtomicU64,

    /// Guards against re-entrant runs (dependency cycles, overlapping
    /// reaction execution).
    pub(crate) is_running: AtomicBool,

    /// Reactions: set while sitting in the pending queue.
    pub(crate) scheduled: AtomicBool,

    /// Reactions: disposed derivations never run again.
    pub(crate) disposed: AtomicBool,

    /// The atom fronting this derivation's result (computed values only).
    pub(crate) output: Option<AtomId>,

    /// The derivation body. Reactions store their effect; computed values
    /// store a recompute-compare-propagate closure built at construction.
    pub(crate) callback: Mutex<Option<Box<dyn FnMut() + Send>>>,

    /// Atoms read during the most recent tracked run.
    pub(crate) sources: RwLock<HashSet<AtomId, GraphHashBuilder>>,
}

impl ObserverMetadata {
    /// Metadata for a reaction: no output atom, effect stored as callback.
    pub(crate) fn reaction(name: impl Into<Box<str>>, callback: Box<dyn FnMut() + Send>) -> Self {
        Self::new(name, callback, None)
    }

    /// Metadata for a computed value: fronted by `output`.
    pub(crate) fn computed(
        name: impl Into<Box<str>>,
        callback: Box<dyn FnMut() + Send>,
        output: AtomId,
    ) -> Self {
        Self::new(name, callback, Some(output))
    }

    fn new(
        name: impl Into<Box<str>>,
        callback: Box<dyn FnMut() + Send>,
        output: Option<AtomId>,
    ) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(DerivationState::NotTracking as u8),
            run_id: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            output,
            callback: Mutex::new(Some(callback)),
            sources: RwLock::new(HashSet::with_hasher(GraphHashBuilder)),
        }
    }

    /// Current staleness state
    pub(crate) fn state(&self) -> DerivationState {
        DerivationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the staleness state
    pub(crate) fn set_state(&self, state: DerivationState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Insert derivation metadata into the arena and return its ID
pub(crate) fn observer_arena_insert(metadata: ObserverMetadata) -> ObserverId {
    let mut arena = OBSERVER_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    ObserverId::new(key as u32)
}

/// Remove a derivation from the arena
pub(crate) fn observer_arena_remove(id: ObserverId) -> Option<ObserverMetadata> {
    let mut arena = OBSERVER_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

/// Owning handle over an arena slot. Dropping it unsubscribes the derivation
/// from every source, removes it from the pending queue, and frees the slot.
pub(crate) struct DerivationHandle {
    id: ObserverId,
}

impl DerivationHandle {
    pub(crate) fn new(id: ObserverId) -> Self {
        Self { id }
    }

    pub(crate) fn id(&self) -> ObserverId {
        self.id
    }
}

impl Drop for DerivationHandle {
    fn drop(&mut self) {
        crate::reaction::remove_from_pending(self.id);
        for source in self.id.take_sources() {
            source.remove_observer(self.id);
        }
        observer_arena_remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_access_returns_defaults() {
        let metadata = ObserverMetadata::reaction("doomed", Box::new(|| {}));
        let id = observer_arena_insert(metadata);

        observer_arena_remove(id);

        assert_eq!(id.state(), DerivationState::UpToDate);
        assert!(id.is_disposed());
        assert!(id.take_sources().is_empty());
    }

    #[test]
    fn tracking_guard_restores_on_panic() {
        let outer = observer_arena_insert(ObserverMetadata::reaction("outer", Box::new(|| {})));
        let inner = observer_arena_insert(ObserverMetadata::reaction("inner", Box::new(|| {})));

        let _outer_guard = TrackingGuard::new(Some(outer));
        assert_eq!(current_observer(), Some(outer));

        let result = std::panic::catch_unwind(|| {
            let _inner_guard = TrackingGuard::new(Some(inner));
            assert_eq!(current_observer(), Some(inner));
            panic!("tracked closure failed");
        });

        assert!(result.is_err());
        assert_eq!(current_observer(), Some(outer));

        drop(_outer_guard);
        assert_eq!(current_observer(), None);
        observer_arena_remove(outer);
        observer_arena_remove(inner);
    }

    #[test]
    fn callback_restored_after_panic() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_callback = runs.clone();
        let callback = Box::new(move || {
            if runs_in_callback.fetch_add(1, Ordering::Relaxed) == 0 {
                panic!("first run fails");
            }
        });

        let id = observer_arena_insert(ObserverMetadata::reaction("flaky", callback));

        let result = std::panic::catch_unwind(|| id.run_callback());
        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // The closure survived the panic and can run again.
        id.run_callback();
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        observer_arena_remove(id);
    }

    #[test]
    fn run_tracked_rejects_reentry() {
        let id = observer_arena_insert(ObserverMetadata::reaction("loop", Box::new(|| {})));
        id.with(|metadata| metadata.is_running.store(true, Ordering::Release));

        let result = std::panic::catch_unwind(|| id.run_tracked());
        assert!(result.is_err());

        id.with(|metadata| metadata.is_running.store(false, Ordering::Release));
        observer_arena_remove(id);
    }
}
