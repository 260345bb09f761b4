use crate::arena::{AtomId, AtomMetadata, atom_arena_insert, atom_arena_remove, next_guid};

/// Minimal observable cell: graph identity plus an observer list, no value
/// semantics of its own.
///
/// An Atom is the unit the dependency tracker works with. Higher layers
/// (observable values, computed values, instrumented objects) hold their data
/// wherever they like and call [`report_observed`](Atom::report_observed)
/// when the data is read and [`report_changed`](Atom::report_changed) when it
/// is written. The runtime takes care of the rest: edges, staleness and
/// scheduling.
///
/// # Usage
/// ```ignore
/// struct Clock {
///     seconds: u64,
///     atom: Atom,
/// }
///
/// impl Clock {
///     fn get(&self) -> u64 {
///         self.atom.report_observed();
///         self.seconds
///     }
///
///     fn tick(&mut self) {
///         self.seconds += 1;
///         self.atom.report_changed();
///     }
/// }
/// ```
pub struct Atom {
    id: AtomId,
}

impl Atom {
    /// Create a new atom with the given debug name.
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        let id = atom_arena_insert(AtomMetadata::new(name));
        Atom { id }
    }

    /// Create a new atom with an auto-generated name.
    pub fn unnamed() -> Self {
        Self::new(format!("Atom@{}", next_guid()))
    }

    /// Get the arena id for this atom (internal use only)
    pub(crate) fn id(&self) -> AtomId {
        self.id
    }

    /// Wrap an existing AtomId (internal use only)
    ///
    /// Use this when the id was created elsewhere (e.g. in ComputedValue) and
    /// the Atom should only contribute cleanup via Drop.
    pub(crate) fn from_raw(id: AtomId) -> Self {
        Self { id }
    }

    /// The debug name this atom was created with.
    pub fn name(&self) -> String {
        self.id.name()
    }

    /// Record a read of the state behind this atom.
    ///
    /// If a derivation is currently tracking, it subscribes to this atom;
    /// repeat reads within the same run are deduplicated. Outside a tracked
    /// run this only feeds the configured read-policy diagnostics.
    pub fn report_observed(&self) {
        self.id.report_observed();
    }

    /// Record that the state behind this atom changed.
    ///
    /// Marks every dependent derivation stale and schedules the affected
    /// reactions. The propagation runs inside its own batch, so a bare write
    /// outside any transaction still drains reactions synchronously before
    /// this call returns, while writes inside a transaction defer the drain
    /// to the outermost batch exit.
    ///
    /// Calling this while a computed value is being evaluated is a contract
    /// violation and panics.
    pub fn report_changed(&self) {
        self.id.report_changed();
    }

    /// Whether any derivation currently depends on this atom.
    pub fn is_observed(&self) -> bool {
        self.id.is_observed()
    }

    /// Version stamp of the most recent reported change, from a global
    /// monotone clock. Zero for an atom that never changed.
    pub fn last_changed(&self) -> u64 {
        self.id.last_changed()
    }
}

impl Drop for Atom {
    fn drop(&mut self) {
        // Drop the back-references so no derivation keeps a stale source id
        for observer in self.id.observers_snapshot() {
            observer.remove_source(self.id);
        }
        atom_arena_remove(self.id);
    }
}

// NOTE: Atom intentionally does NOT implement Clone. Dropping an Atom frees
// its arena slot; a cloned handle would free it twice. Share an Arc<Atom>
// instead when multiple owners are needed.
