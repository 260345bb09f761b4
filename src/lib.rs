#![deny(missing_docs)]

//! Fine-grained push-pull reactivity for plain Rust state.
//!
//! This crate keeps derived state consistent with minimal recomputation and
//! without manual subscription wiring. Reads performed inside a derivation
//! are recorded as dependency edges; writes mark exactly the derivations
//! that could be affected; computed values re-run only when an input
//! genuinely changed; reactions run exactly once per logical update, after
//! all writes of a transaction have been applied.
//!
//! # Quick Start
//!
//! ```ignore
//! use trellis::{ComputedValue, ObservableValue, autorun, run_in_action};
//! use std::sync::Arc;
//!
//! let price = Arc::new(ObservableValue::new(12.0));
//! let quantity = Arc::new(ObservableValue::new(2.0));
//!
//! let total = Arc::new(ComputedValue::new({
//!     let (price, quantity) = (price.clone(), quantity.clone());
//!     move || price.get() * quantity.get()
//! }));
//!
//! let _receipt = autorun({
//!     let total = total.clone();
//!     move || println!("total: {}", total.get())
//! });
//! // prints "total: 24"
//!
//! price.set(12.0);     // same value: nothing runs
//!
//! run_in_action(|| {
//!     price.set(10.0);
//!     quantity.set(3.0);
//! });
//! // prints "total: 30" exactly once, never an intermediate mix
//! ```
//!
//! # Core Types
//!
//! - [`Atom`] - bare observable cell for state living in your own structs.
//!   Call [`report_observed`](Atom::report_observed) on read and
//!   [`report_changed`](Atom::report_changed) on write.
//! - [`ObservableValue`] - a value-owning cell with an equality comparer and
//!   a write [`Enhancer`].
//! - [`ComputedValue`] - lazily memoized derivation, itself observable.
//! - [`Reaction`] / [`autorun`] - side-effecting derivation, terminal node
//!   of the graph.
//!
//! # Transactions
//!
//! [`run_in_action`] (or the explicit [`start_batch`]/[`end_batch`] pair)
//! batches writes: staleness propagates immediately, but reactions run and
//! lifecycle hooks fire only when the outermost batch closes. A reaction
//! affected by several writes in one transaction runs once.
//!
//! # Escape hatches and policy
//!
//! [`untracked`] reads without establishing edges. [`configure`] installs
//! process-wide policy: diagnostics for reads or writes outside reactive
//! contexts, the runaway-reaction bound, error-boundary behavior and a
//! custom reaction scheduler. Reaction failures are isolated per reaction
//! and reported to handlers registered with [`on_reaction_error`].
//!
//! # Instrumented objects
//!
//! [`ObservableObject`] maps string-keyed fields onto atoms explicitly, with
//! per-field [`Annotation`]s applied through a builder. No transparent
//! interception is involved.
//!
//! # Threading model
//!
//! Tracking, propagation and scheduling are a synchronous call-stack
//! discipline confined to one logical thread of control. The arenas are
//! lock-protected so handles may be created and dropped from anywhere, but
//! mutating the same graph concurrently from several threads is out of
//! contract.

// Internal modules
pub(crate) mod arena;
mod atom;
pub mod comparer;
mod computed;
mod config;
mod error;
mod hash;
mod lifecycle;
mod object;
mod observable;
mod reaction;
mod transaction;

// Core types
pub use atom::Atom;
pub use computed::ComputedValue;
pub use observable::ObservableValue;
pub use reaction::Reaction;

// Derivation helpers
pub use reaction::{autorun, set_reaction_scheduler, untracked};
pub use transaction::{end_batch, run_in_action, start_batch};

// Change detection and write transforms
pub use comparer::EqualityComparer;
pub use observable::{Enhancer, enhancer};

// Lifecycle hooks and introspection
pub use arena::atom_arena::AtomId;
pub use lifecycle::{
    HookHandle, Observable, is_observed, observer_count, on_become_observed, on_become_unobserved,
};

// Policy and error handling
pub use config::{Config, ConfigOptions, configure};
pub use error::{HandlerHandle, ReactiveError, on_reaction_error};

// Explicit object instrumentation
pub use object::{Annotation, ObjectBuilder, ObservableObject};

#[cfg(test)]
mod tests;
