//! Clock Tree
//!
//! A clock is a node in a tree of logical-time domains. Every data cell and
//! computation belongs to exactly one clock; the root clock exists for the
//! lifetime of the engine and sub-clocks form independently batchable
//! domains beneath it.
//!
//! Each clock owns four queues of pending work for its domain: data
//! changes, sub-clock activations, computation updates scheduled from
//! other domains, and deferred disposals. An update pass drains these
//! queues step by step until the domain settles.
//!
//! # Invariants
//!
//! - `depth` strictly increases moving away from the root.
//! - A clock's absolute time is its own `local_time` plus the local times
//!   of all its ancestors.
//! - The root clock has no parent and is never disposed.

use std::collections::HashMap;

use indexmap::IndexMap;

use super::node::NodeId;
use super::queue::Queue;

/// Unique identifier for a clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(u64);

impl ClockId {
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Run state of a clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClockState {
    /// No pending work is known for this domain.
    Idle,

    /// The domain has queued work and is waiting to be activated. It has
    /// already been pushed onto its parent's sub-clock queue.
    Stale,

    /// The domain's update pass is currently on the call stack.
    Running,
}

/// A logical-time domain.
#[derive(Debug)]
pub(crate) struct Clock {
    /// Parent domain, `None` only for the root clock.
    pub parent: Option<ClockId>,

    /// Distance from the root. The root has depth zero.
    pub depth: u32,

    /// Steps this domain's own update passes have executed.
    pub local_time: u64,

    /// Current run state.
    pub state: ClockState,

    /// Cells with pending writes in this domain.
    pub changes: Queue<NodeId>,

    /// Child domains waiting to be activated.
    pub subclocks: Queue<ClockId>,

    /// Computations of this domain invalidated from another domain.
    pub updates: Queue<NodeId>,

    /// Nodes whose disposal was deferred until the pass settles.
    pub disposes: Queue<NodeId>,

    /// Domains that must be brought up to date before computations of this
    /// domain run, with a reference count per domain so the entry can be
    /// removed when the last reading computation drops the dependency.
    pub preclocks: IndexMap<ClockId, u32>,
}

impl Clock {
    pub fn new(parent: Option<ClockId>, depth: u32) -> Self {
        Self {
            parent,
            depth,
            local_time: 0,
            state: ClockState::Idle,
            changes: Queue::new(),
            subclocks: Queue::new(),
            updates: Queue::new(),
            disposes: Queue::new(),
            preclocks: IndexMap::new(),
        }
    }

    /// Check whether any of the four work queues holds items.
    pub fn has_work(&self) -> bool {
        !self.changes.is_empty()
            || !self.subclocks.is_empty()
            || !self.updates.is_empty()
            || !self.disposes.is_empty()
    }
}

/// Find the closest common ancestor of two clocks.
///
/// Walks the deeper side up until both are at the same depth, then walks
/// both up together until they meet. Since every clock descends from the
/// root, a common ancestor always exists.
pub(crate) fn common_ancestor(
    clocks: &HashMap<ClockId, Clock>,
    a: ClockId,
    b: ClockId,
) -> ClockId {
    let mut a = a;
    let mut b = b;

    while clocks[&a].depth > clocks[&b].depth {
        a = clocks[&a].parent.expect("non-root clock has a parent");
    }
    while clocks[&b].depth > clocks[&a].depth {
        b = clocks[&b].parent.expect("non-root clock has a parent");
    }
    while a != b {
        a = clocks[&a].parent.expect("non-root clock has a parent");
        b = clocks[&b].parent.expect("non-root clock has a parent");
    }
    a
}

/// Check whether `a` is `b` itself or one of `b`'s ancestors.
pub(crate) fn is_ancestor(clocks: &HashMap<ClockId, Clock>, a: ClockId, b: ClockId) -> bool {
    common_ancestor(clocks, a, b) == a
}
