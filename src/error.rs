//! Error taxonomy and the reaction error handler registry.
//!
//! Contract violations (cycles, impure computations, runaway feedback) fail
//! fast: the runtime panics with the error's `Display` text. Effect failures
//! are different: a panic inside a reaction body is caught at the scheduler
//! boundary, converted to [`ReactiveError::ReactionFailed`], handed to every
//! registered handler and then swallowed so independently scheduled
//! reactions still run.

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Errors raised by the reactive runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// A reaction's effect panicked. Reported to the error handlers; other
    /// reactions in the same drain are unaffected.
    #[error("reaction '{name}' failed: {message}")]
    ReactionFailed {
        /// Debug name of the failing reaction.
        name: String,
        /// Panic payload, stringified.
        message: String,
    },

    /// An observable that something depends on was written while a computed
    /// value was being evaluated. Computations must be pure reads.
    #[error("computed value is not allowed to mutate observed atom '{atom}'")]
    ComputedMutatesState {
        /// Debug name of the atom that was written.
        atom: String,
    },

    /// A derivation re-entered its own evaluation.
    #[error("cycle detected while evaluating derivation '{name}'")]
    DerivationCycle {
        /// Debug name of the re-entered derivation.
        name: String,
    },

    /// Reactions kept scheduling each other past the configured bound;
    /// the remaining queue was dropped.
    #[error(
        "reactions failed to stabilize after {iterations} iterations, \
         likely a feedback loop (first still pending: '{name}')"
    )]
    RunawayReactions {
        /// Debug name of the first reaction still pending when the bound hit.
        name: String,
        /// The configured iteration bound.
        iterations: u32,
    },
}

type ErrorHandler = Arc<dyn Fn(&ReactiveError) + Send + Sync>;

static ERROR_HANDLERS: RwLock<Vec<(u64, ErrorHandler)>> = RwLock::new(Vec::new());
static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(0);

/// Registration receipt from [`on_reaction_error`]. Dropping the handle does
/// nothing; call [`dispose`](HandlerHandle::dispose) to unregister.
pub struct HandlerHandle {
    id: u64,
}

impl HandlerHandle {
    /// Unregister the handler. No-op if already disposed.
    pub fn dispose(&self) {
        ERROR_HANDLERS
            .write()
            .retain(|(handler_id, _)| *handler_id != self.id);
    }
}

/// Register a handler invoked with every isolated reaction failure.
pub fn on_reaction_error(
    handler: impl Fn(&ReactiveError) + Send + Sync + 'static,
) -> HandlerHandle {
    let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
    ERROR_HANDLERS.write().push((id, Arc::new(handler)));
    HandlerHandle { id }
}

/// Deliver an error to every registered handler.
///
/// Handlers are cloned out first so they run without the registry lock held
/// and may register or dispose handlers themselves.
pub(crate) fn notify_handlers(error: &ReactiveError) {
    let handlers: Vec<ErrorHandler> = ERROR_HANDLERS
        .read()
        .iter()
        .map(|(_, handler)| handler.clone())
        .collect();
    for handler in handlers {
        handler(error);
    }
}
