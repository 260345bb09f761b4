use std::cell::Cell;

// Thread-local batch depth counter.
// While > 0, writes mark staleness immediately but the reaction drain and
// the unobservation finalization wait for the outermost batch to close.
thread_local! {
    static BATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Current batch nesting depth on this thread.
pub(crate) fn in_batch() -> usize {
    BATCH_DEPTH.with(Cell::get)
}

/// Open a batch.
///
/// Batches nest: writes inside any batch propagate staleness right away, but
/// reactions run and lifecycle hooks fire only when the outermost batch
/// closes. Prefer [`run_in_action`], which pairs the calls panic-safely;
/// the explicit functions exist for callers whose scope does not nest, such
/// as instrumentation layers bracketing foreign call sites.
pub fn start_batch() {
    BATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

/// Close a batch.
///
/// Closing the outermost batch drains the pending reactions to a fixed
/// point and then finalizes atoms that lost their last observer during the
/// transaction (firing unobserved hooks, suspending unobserved computed
/// values). Reactions themselves run inside nested batches, so the drain
/// happens exactly once per logical update.
pub fn end_batch() {
    let depth = BATCH_DEPTH.with(|depth| {
        let current = depth.get();
        debug_assert!(current > 0, "end_batch without a matching start_batch");
        depth.set(current.saturating_sub(1));
        current
    });
    if depth == 1 {
        crate::reaction::run_reactions();
        crate::arena::drain_pending_unobservations();
    }
}

/// RAII pairing of start_batch/end_batch. Closes the batch on drop, so the
/// pairing holds even when the enclosed code panics.
pub(crate) struct BatchGuard;

impl BatchGuard {
    pub(crate) fn new() -> Self {
        start_batch();
        Self
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        end_batch();
    }
}

/// Run `f` as a single transaction.
///
/// All writes inside `f` land before any reaction runs, so no reaction ever
/// observes a partially applied update, and a reaction affected by several
/// writes runs once, not once per write.
///
/// Transactions nest; only the outermost one triggers the drain.
///
/// # Example
/// ```ignore
/// let x = ObservableValue::new(1);
/// let y = ObservableValue::new(2);
///
/// run_in_action(|| {
///     x.set(10);
///     y.set(20);
/// }); // reactions reading x and y run once, seeing 10 and 20 together
/// ```
pub fn run_in_action<R>(f: impl FnOnce() -> R) -> R {
    let _guard = BatchGuard::new();
    f()
}
