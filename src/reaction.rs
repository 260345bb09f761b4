use crate::arena::{
    DerivationHandle, ObserverId, ObserverMetadata, TrackingGuard, current_observer, next_guid,
    observer_arena_insert,
};
use crate::error::ReactiveError;
use crate::hash::GraphHashBuilder;
use crate::transaction::{BatchGuard, in_batch};
use indexmap::IndexSet;
use parking_lot::RwLock;
use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

// Reactions scheduled for the next drain, in first-scheduled order.
// The IndexSet keeps insertion order and deduplicates, so a reaction touched
// by several writes in one transaction runs once, at its earliest position.
// Thread-local to match the batch depth: reactions drain on the thread whose
// writes scheduled them.
thread_local! {
    static PENDING_REACTIONS: RefCell<IndexSet<ObserverId, GraphHashBuilder>> =
        RefCell::new(IndexSet::default());
}

/// Pluggable drain strategy. The default runs the drain synchronously at the
/// close of the outermost batch; hosts with an event loop can defer it to a
/// tick of their own choosing.
static REACTION_SCHEDULER: RwLock<Option<Arc<dyn Fn(&dyn Fn()) + Send + Sync>>> =
    RwLock::new(None);

// Reentrancy guard for the drain loop on this thread. Reactions scheduled
// while the drain runs join the active drain instead of starting another.
thread_local! {
    static IS_RUNNING_REACTIONS: Cell<bool> = const { Cell::new(false) };
}

/// Install a custom drain strategy, e.g. to defer reaction execution to a
/// host event-loop tick. The strategy receives the drain procedure and
/// decides when to invoke it. Passing `None` restores the synchronous
/// default.
pub fn set_reaction_scheduler(scheduler: Option<Arc<dyn Fn(&dyn Fn()) + Send + Sync>>) {
    *REACTION_SCHEDULER.write() = scheduler;
}

/// Queue a derivation for the next drain and kick the drain off if nothing
/// defers it.
pub(crate) fn schedule(observer: ObserverId) {
    if observer.is_disposed() {
        return;
    }
    if observer.set_scheduled() {
        PENDING_REACTIONS.with(|queue| queue.borrow_mut().insert(observer));
    }
    run_reactions();
}

/// Remove a derivation from this thread's pending queue (disposal path).
/// Preserves the order of the remaining entries. A derivation queued on a
/// different thread is skipped by its drain through the disposed flag.
pub(crate) fn remove_from_pending(observer: ObserverId) {
    observer.clear_scheduled();
    PENDING_REACTIONS.with(|queue| queue.borrow_mut().shift_remove(&observer));
}

/// Drain pending reactions unless something defers the drain: an open batch,
/// a tracked run in progress, or a drain already running on this thread.
pub(crate) fn run_reactions() {
    if in_batch() > 0 || current_observer().is_some() {
        return;
    }
    if IS_RUNNING_REACTIONS.with(Cell::get) {
        return;
    }
    if PENDING_REACTIONS.with(|queue| queue.borrow().is_empty()) {
        return;
    }
    let scheduler = REACTION_SCHEDULER.read().clone();
    match scheduler {
        Some(scheduler) => scheduler(&run_pending_reactions),
        None => run_pending_reactions(),
    }
}

/// The drain procedure: run every pending reaction, in order, to a fixed
/// point.
///
/// Each iteration takes the whole queue, so reactions scheduled by running
/// reactions settle within the same drain. An iteration count past the
/// configured bound means the graph is feeding back into itself; the queue
/// is dropped and the drain fails fast.
fn run_pending_reactions() {
    struct DrainGuard;
    impl Drop for DrainGuard {
        fn drop(&mut self) {
            IS_RUNNING_REACTIONS.with(|running| running.set(false));
        }
    }

    IS_RUNNING_REACTIONS.with(|running| running.set(true));
    let _guard = DrainGuard;

    let max_iterations = crate::config::get().max_reaction_iterations;
    let mut iterations = 0u32;
    loop {
        let batch: Vec<ObserverId> =
            PENDING_REACTIONS.with(|queue| queue.borrow_mut().drain(..).collect());
        if batch.is_empty() {
            break;
        }
        iterations += 1;
        if iterations > max_iterations {
            let name = batch
                .first()
                .map(|observer| observer.name())
                .unwrap_or_default();
            for observer in &batch {
                observer.clear_scheduled();
            }
            panic!(
                "{}",
                ReactiveError::RunawayReactions {
                    name,
                    iterations: max_iterations
                }
            );
        }
        for observer in batch {
            run_reaction(observer);
        }
    }
}

/// Run one scheduled reaction.
///
/// The run is wrapped in its own batch so every write it performs lands in
/// one transaction. Staleness is re-checked at run time: a reaction whose
/// possibly-stale inputs resolved to equal values is a no-op here. A panic
/// in the effect is converted to a [`ReactiveError::ReactionFailed`],
/// delivered to the registered error handlers and swallowed so sibling
/// reactions in the same drain still run; with error boundaries disabled the
/// panic resumes after delivery.
fn run_reaction(observer: ObserverId) {
    observer.clear_scheduled();
    if observer.is_disposed() {
        return;
    }

    let _batch = BatchGuard::new();
    if observer.should_compute() {
        let result = catch_unwind(AssertUnwindSafe(|| observer.run_tracked()));
        if let Err(payload) = result {
            let error = ReactiveError::ReactionFailed {
                name: observer.name(),
                message: panic_message(payload.as_ref()),
            };
            crate::error::notify_handlers(&error);
            if crate::config::get().disable_error_boundaries {
                drop(_batch);
                resume_unwind(payload);
            }
            tracing::error!(%error, "reaction failed");
        }
    }
    if observer.is_disposed() {
        // Disposed from within its own run: drop the edges it just rebuilt
        for source in observer.take_sources() {
            source.remove_observer(observer);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a closure without tracking dependencies.
///
/// Reads inside the closure do not create edges, so the enclosing reaction
/// or computed value will not re-run when those observables change. The
/// previous tracking target is restored on all exit paths, including panics.
///
/// # Example
/// ```ignore
/// let _logger = autorun(move || {
///     let level = level.get();                  // tracked
///     let stamp = untracked(|| clock.get());    // not tracked
///     println!("[{stamp}] level changed to {level}");
/// });
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = TrackingGuard::new(None);
    f()
}

/// Side-effecting derivation: runs its effect once at creation to establish
/// dependencies, then again whenever one of them genuinely changes.
///
/// Reactions are the terminal nodes of the graph. They run exactly once per
/// logical update: all writes of a transaction are applied first, then each
/// affected reaction executes a single time against the settled state.
///
/// Dropping the handle disposes the reaction; [`dispose`](Reaction::dispose)
/// does so explicitly and is idempotent.
///
/// # Example
/// ```ignore
/// let temperature = Arc::new(ObservableValue::new(21.0));
///
/// let reaction = Reaction::new("log temperature", {
///     let temperature = temperature.clone();
///     move || println!("{} degrees", temperature.get())
/// });
///
/// temperature.set(23.5); // effect runs once
/// reaction.dispose();
/// temperature.set(25.0); // nothing happens
/// ```
pub struct Reaction {
    derivation: DerivationHandle,
}

impl Reaction {
    /// Create a reaction and run its effect once to establish the initial
    /// dependency set.
    ///
    /// The initial run goes through the scheduler like any other: created
    /// inside a transaction, the effect first runs when the transaction
    /// closes; created outside one, it runs before `new` returns. Panics in
    /// the effect are routed to the error handlers either way.
    pub fn new<F>(name: impl Into<String>, effect: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let metadata = ObserverMetadata::reaction(name.into(), Box::new(effect));
        let id = observer_arena_insert(metadata);
        let reaction = Self {
            derivation: DerivationHandle::new(id),
        };
        schedule(id);
        reaction
    }

    /// Stop this reaction: unsubscribe from every source, leave the pending
    /// queue, and never run again. Safe to call any number of times.
    pub fn dispose(&self) {
        let id = self.derivation.id();
        if !id.set_disposed() {
            return;
        }
        remove_from_pending(id);
        if !id.is_running() {
            let _batch = BatchGuard::new();
            for source in id.take_sources() {
                source.remove_observer(id);
            }
        }
        // A reaction disposed mid-run cleans its edges up when the run ends.
    }

    /// Whether this reaction has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.derivation.id().is_disposed()
    }

    /// The debug name this reaction was created with.
    pub fn name(&self) -> String {
        self.derivation.id().name()
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        self.dispose();
        // DerivationHandle frees the arena slot afterwards.
    }
}

/// Create an auto-named reaction from an effect closure.
///
/// Equivalent to `Reaction::new("Autorun@N", effect)`.
pub fn autorun<F>(effect: F) -> Reaction
where
    F: FnMut() + Send + 'static,
{
    Reaction::new(format!("Autorun@{}", next_guid()), effect)
}
