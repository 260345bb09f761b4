//! Global runtime policy.
//!
//! The flags here only produce diagnostics or bound runaway feedback; none of
//! them alter what propagates or in which order. They are process-wide and
//! are typically set once at startup.

use crate::reaction::set_reaction_scheduler;
use parking_lot::RwLock;
use std::sync::Arc;

/// Effective runtime policy. Read through [`get`], written through
/// [`configure`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Warn when observed state is written outside any action/batch.
    pub enforce_actions: bool,

    /// Warn when a computed value is read outside a reactive context (where
    /// it recomputes on every access instead of caching).
    pub computed_requires_reaction: bool,

    /// Warn when an observable is read outside a reactive context.
    pub observable_requires_reaction: bool,

    /// Let panics in reaction effects propagate to the host instead of
    /// isolating them per reaction. Debugging aid only.
    pub disable_error_boundaries: bool,

    /// Drain iterations after which feedback between reactions is declared
    /// runaway and the drain fails fast.
    pub max_reaction_iterations: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enforce_actions: false,
            computed_requires_reaction: false,
            observable_requires_reaction: false,
            disable_error_boundaries: false,
            max_reaction_iterations: 100,
        }
    }
}

static CONFIG: RwLock<Option<Config>> = RwLock::new(None);

/// Snapshot of the current policy.
pub(crate) fn get() -> Config {
    CONFIG.read().clone().unwrap_or_default()
}

/// Partial policy update passed to [`configure`]. Fields left at `None` keep
/// their current value.
///
/// ```ignore
/// configure(ConfigOptions {
///     enforce_actions: Some(true),
///     max_reaction_iterations: Some(500),
///     ..ConfigOptions::default()
/// });
/// ```
#[derive(Default)]
pub struct ConfigOptions {
    /// See [`Config::enforce_actions`].
    pub enforce_actions: Option<bool>,
    /// See [`Config::computed_requires_reaction`].
    pub computed_requires_reaction: Option<bool>,
    /// See [`Config::observable_requires_reaction`].
    pub observable_requires_reaction: Option<bool>,
    /// See [`Config::disable_error_boundaries`].
    pub disable_error_boundaries: Option<bool>,
    /// See [`Config::max_reaction_iterations`].
    pub max_reaction_iterations: Option<u32>,
    /// Install a custom reaction drain strategy, e.g. to defer drains to a
    /// host event-loop tick. See
    /// [`set_reaction_scheduler`](crate::set_reaction_scheduler).
    pub reaction_scheduler: Option<Arc<dyn Fn(&dyn Fn()) + Send + Sync>>,
}

/// Apply a partial policy update.
pub fn configure(options: ConfigOptions) {
    let mut config = CONFIG.write();
    let mut next = config.clone().unwrap_or_default();
    if let Some(enforce_actions) = options.enforce_actions {
        next.enforce_actions = enforce_actions;
    }
    if let Some(computed_requires_reaction) = options.computed_requires_reaction {
        next.computed_requires_reaction = computed_requires_reaction;
    }
    if let Some(observable_requires_reaction) = options.observable_requires_reaction {
        next.observable_requires_reaction = observable_requires_reaction;
    }
    if let Some(disable_error_boundaries) = options.disable_error_boundaries {
        next.disable_error_boundaries = disable_error_boundaries;
        if disable_error_boundaries {
            tracing::warn!(
                "error boundaries disabled: a panicking reaction aborts its whole drain"
            );
        }
    }
    if let Some(max_reaction_iterations) = options.max_reaction_iterations {
        next.max_reaction_iterations = max_reaction_iterations;
    }
    *config = Some(next);
    drop(config);

    if let Some(scheduler) = options.reaction_scheduler {
        set_reaction_scheduler(Some(scheduler));
    }
}
