// Arena-based storage for reactive graph metadata
//
// Two arenas back the dependency graph:
// - Atom arena: cell-side metadata (observer sets, lifecycle bookkeeping,
//   change versions)
// - Observer arena: derivation-side metadata (staleness state, source sets,
//   the derivation closures)
//
// The arenas are global statics behind RwLocks. AtomId and ObserverId are
// lightweight newtypes indexing into the slabs; user-facing types (Atom,
// ObservableValue, ComputedValue, Reaction) are thin owning handles whose
// Drop impls free the slots. Values never live in the arenas, only graph
// bookkeeping does.

// Note: observer_arena is declared first because atom_arena depends on
// ObserverId.
pub(crate) mod observer_arena;

pub(crate) mod atom_arena;

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) use atom_arena::{
    AtomId, AtomMetadata, HookKind, add_hook, atom_arena_insert, atom_arena_remove,
    drain_pending_unobservations, remove_hook,
};
pub(crate) use observer_arena::{
    ComputationDepthGuard, DerivationHandle, DerivationState, ObserverId, ObserverMetadata,
    TrackingGuard, check_state_modification_allowed, current_observer, observer_arena_insert,
};

/// Counter behind the auto-generated debug names (`ObservableValue@7`,
/// `Autorun@12`, ...). Never reset.
static GUID: AtomicU64 = AtomicU64::new(0);

/// Next value of the global naming counter.
pub(crate) fn next_guid() -> u64 {
    GUID.fetch_add(1, Ordering::Relaxed) + 1
}
