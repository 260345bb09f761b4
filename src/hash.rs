//! Zero-sized hash builder for the runtime's internal hash collections.
//!
//! Observer sets, source sets, and the pending-reaction queue all hash small
//! integer ids. `GraphHashBuilder` wraps foldhash with a fixed seed so those
//! collections carry no per-instance hasher state and produce deterministic
//! layouts. HashDoS resistance is irrelevant here since the keys are
//! crate-generated arena indices, never attacker-controlled input.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` over foldhash with a fixed seed.
///
/// Every instance hashes identically, so ids hash to the same buckets across
/// all of the runtime's collections.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphHashBuilder;

impl BuildHasher for GraphHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e3779b97f4a7c15).build_hasher()
    }
}
