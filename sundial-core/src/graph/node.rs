//! Graph Nodes
//!
//! This module defines the node types stored in the dependency-graph arena
//! and the edge records that connect them.
//!
//! # Edge storage
//!
//! Every node keeps a `Log` of the computations that depend on it: a slot
//! array with a free list. Each live slot holds the dependent's id plus the
//! index of the matching entry in the dependent's own `sources` list, and
//! that entry holds the source id plus the log slot index back. An edge can
//! therefore be detached from either end in O(1) by slot invalidation, with
//! no scanning; fragmented logs are compacted at quiescence.
//!
//! # Dependency rebinding
//!
//! A computation's `sources` list always reflects exactly the reads of its
//! most recent run. Each run bumps the node's generation; re-reads stamp
//! the existing source slot with the new generation, and slots that were
//! not re-stamped are deactivated when the run completes. Deactivated slots
//! keep their position so a later run can reactivate them in O(1) through
//! the source index.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use super::clock::ClockId;

/// Unique identifier for a node in the dependency graph.
///
/// Ids are handed out by the scheduler from a monotonic counter and are
/// never reused, so a stale id held by a disposed handle can only miss the
/// arena, never alias a different node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a computation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    /// The cached value is up to date.
    Current,

    /// An upstream change invalidated this node; it will re-run during the
    /// active (or next) update pass.
    Stale,

    /// The node's closure is on the call stack right now. Reading a
    /// running node is the circular-dependency fault.
    Running,

    /// The node has been disposed or its disposal is queued. It never runs
    /// again.
    Disposed,
}

/// A dependency edge, stored in the source's log.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    /// The computation that read the source.
    pub dependent: NodeId,

    /// Index of the matching `SourceSlot` in the dependent's `sources`.
    pub source_slot: usize,

    /// Stamp set during the mark phase of a propagation step and cleared
    /// when the edge is resolved.
    pub marked: bool,
}

/// Slot array of dependency edges with a free list.
#[derive(Debug, Default)]
pub(crate) struct Log {
    slots: Vec<Option<Edge>>,
    free: Vec<usize>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edge, reusing a freed slot when one is available.
    pub fn insert(&mut self, edge: Edge) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(edge);
                slot
            }
            None => {
                self.slots.push(Some(edge));
                self.slots.len() - 1
            }
        }
    }

    /// Invalidate a slot. Safe to call on an already-freed slot.
    pub fn remove(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if entry.take().is_some() {
                self.free.push(slot);
            }
        }
    }

    pub fn slot(&self, slot: usize) -> Option<&Edge> {
        self.slots.get(slot).and_then(|entry| entry.as_ref())
    }

    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut Edge> {
        self.slots.get_mut(slot).and_then(|entry| entry.as_mut())
    }

    /// Upper bound of slot indices, including freed holes.
    pub fn slots_len(&self) -> usize {
        self.slots.len()
    }

    /// Number of live edges.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &Edge> {
        self.slots.iter().filter_map(|entry| entry.as_ref())
    }

    /// Drop every edge and reset the free list.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }

    /// Whether enough slots are holes that compaction is worthwhile.
    pub fn is_fragmented(&self) -> bool {
        self.slots.len() >= 32 && self.free.len() * 2 > self.slots.len()
    }

    /// Take the live edges out, leaving the log empty. The caller is
    /// responsible for rebuilding and fixing the dependents' back-pointers.
    pub fn drain_live(&mut self) -> Vec<Edge> {
        let live = self.iter_live().copied().collect();
        self.clear();
        live
    }

    /// Re-populate from a compacted edge list; edge `i` lands in slot `i`.
    pub fn rebuild(&mut self, edges: Vec<Edge>) {
        debug_assert!(self.slots.is_empty());
        self.slots.extend(edges.into_iter().map(Some));
    }
}

/// One tracked read in a computation's `sources` list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SourceSlot {
    /// The node that was read.
    pub source: NodeId,

    /// Index of the matching edge in the source's log. Only meaningful
    /// while `active` is set.
    pub log_slot: usize,

    /// Generation of the run that last read this source.
    pub gen: u64,

    /// Whether the edge currently exists in the source's log.
    pub active: bool,
}

/// Equality thunk captured at cell creation, used for conflicting-write
/// detection on type-erased pending values.
pub(crate) type EqFn = fn(&dyn Any, &dyn Any) -> bool;

/// Compare two type-erased values as `T`.
pub(crate) fn eq_any<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Type-erased computation closure. Receives the previous value (for
/// accumulator-style computations) and produces the new one.
pub(crate) type ComputeFn = Rc<RefCell<dyn FnMut(Option<Box<dyn Any>>) -> Box<dyn Any>>>;

/// A mutable cell in the dependency graph.
pub(crate) struct DataNode {
    /// The domain whose change queue schedules writes to this cell.
    pub clock: ClockId,

    /// Absolute clock time of the last applied write.
    pub time: u64,

    /// Current value.
    pub value: Box<dyn Any>,

    /// Deferred write waiting for the next time step, if any.
    pub pending: Option<Box<dyn Any>>,

    /// Equality thunk for conflicting-write detection.
    pub eq: EqFn,

    /// Computations that read this cell on their most recent run.
    pub log: Log,
}

impl DataNode {
    pub fn new(clock: ClockId, time: u64, value: Box<dyn Any>, eq: EqFn) -> Self {
        Self {
            clock,
            time,
            value,
            pending: None,
            eq,
            log: Log::new(),
        }
    }
}

/// A derived computation in the dependency graph.
pub(crate) struct ComputationNode {
    /// The domain this computation runs in.
    pub clock: ClockId,

    /// The closure to re-run. Root scopes carry no closure and never run.
    pub func: Option<ComputeFn>,

    /// Cached result of the most recent run. `None` before the first run
    /// and for root scopes.
    pub value: Option<Box<dyn Any>>,

    /// Lifecycle state.
    pub state: NodeState,

    /// Bumped at the start of every run; stamps source slots.
    pub gen: u64,

    /// Outstanding marked inbound edges for the active propagation step.
    /// The node becomes eligible to run when this returns to zero.
    pub marks: u32,

    /// Set when the mark phase recursed through this node's own dependents,
    /// so a forced early run knows its downstream is already counted.
    pub downstream_marked: bool,

    /// Reads performed by the most recent run.
    pub sources: Vec<SourceSlot>,

    /// Source id to `sources` index, for O(1) idempotent registration.
    pub source_index: HashMap<NodeId, usize>,

    /// Computations that read this node on their most recent run.
    pub log: Log,

    /// Nodes created during the most recent run, strictly owned: disposed
    /// and recreated wholesale on every re-run.
    pub children: SmallVec<[NodeId; 4]>,

    /// Cleanup callbacks registered during the most recent run. The flag
    /// passed on invocation is `true` only at final disposal.
    pub cleanups: Vec<Box<dyn FnOnce(bool)>>,

    /// Cross-clock dependencies this node holds references on, as
    /// (reader clock, source clock) pairs. Released before each re-run and
    /// at disposal.
    pub preclock_refs: SmallVec<[(ClockId, ClockId); 2]>,
}

impl ComputationNode {
    pub fn new(clock: ClockId, func: Option<ComputeFn>) -> Self {
        Self {
            clock,
            func,
            value: None,
            state: NodeState::Current,
            gen: 0,
            marks: 0,
            downstream_marked: false,
            sources: Vec::new(),
            source_index: HashMap::new(),
            log: Log::new(),
            children: SmallVec::new(),
            cleanups: Vec::new(),
            preclock_refs: SmallVec::new(),
        }
    }
}

/// A node in the dependency-graph arena.
pub(crate) enum Node {
    Data(DataNode),
    Computation(ComputationNode),
}

impl Node {
    pub fn clock(&self) -> ClockId {
        match self {
            Node::Data(data) => data.clock,
            Node::Computation(comp) => comp.clock,
        }
    }

    pub fn log(&self) -> &Log {
        match self {
            Node::Data(data) => &data.log,
            Node::Computation(comp) => &comp.log,
        }
    }

    pub fn log_mut(&mut self) -> &mut Log {
        match self {
            Node::Data(data) => &mut data.log,
            Node::Computation(comp) => &mut comp.log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(dependent: u64, source_slot: usize) -> Edge {
        Edge {
            dependent: NodeId::from_raw(dependent),
            source_slot,
            marked: false,
        }
    }

    #[test]
    fn log_reuses_freed_slots() {
        let mut log = Log::new();
        let a = log.insert(edge(1, 0));
        let b = log.insert(edge(2, 0));
        assert_eq!((a, b), (0, 1));

        log.remove(a);
        assert_eq!(log.live_count(), 1);

        let c = log.insert(edge(3, 0));
        assert_eq!(c, a);
        assert_eq!(log.live_count(), 2);
        assert_eq!(log.slots_len(), 2);
    }

    #[test]
    fn log_remove_is_idempotent() {
        let mut log = Log::new();
        let slot = log.insert(edge(1, 0));
        log.remove(slot);
        log.remove(slot);
        assert_eq!(log.live_count(), 0);

        // The double remove must not have pushed the slot twice.
        let a = log.insert(edge(2, 0));
        let b = log.insert(edge(3, 0));
        assert_ne!(a, b);
    }

    #[test]
    fn log_compaction_threshold() {
        let mut log = Log::new();
        for i in 0..40 {
            log.insert(edge(i, 0));
        }
        assert!(!log.is_fragmented());

        for slot in 0..21 {
            log.remove(slot);
        }
        assert!(log.is_fragmented());

        let live = log.drain_live();
        assert_eq!(live.len(), 19);
        log.rebuild(live);
        assert_eq!(log.live_count(), 19);
        assert!(!log.is_fragmented());
    }

    #[test]
    fn eq_thunk_compares_through_any() {
        let a: Box<dyn Any> = Box::new(5i32);
        let b: Box<dyn Any> = Box::new(5i32);
        let c: Box<dyn Any> = Box::new(7i32);
        assert!(eq_any::<i32>(a.as_ref(), b.as_ref()));
        assert!(!eq_any::<i32>(a.as_ref(), c.as_ref()));
    }
}
