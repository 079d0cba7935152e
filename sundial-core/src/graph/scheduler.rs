//! Update Scheduler
//!
//! The scheduler owns the dependency-graph arena and the clock tree, and
//! runs the propagation algorithm that keeps every computation consistent
//! with the cells it reads.
//!
//! # Algorithm
//!
//! Propagation is two-phase per time step, which is what prevents the
//! classic diamond glitch (a computation with two paths to one cell must
//! not run until both paths have settled):
//!
//! 1. Apply every queued write for the step, then walk outward from each
//!    changed node along dependent edges, stamping each edge and
//!    incrementing a per-computation mark counter. A computation's own
//!    dependents are walked only the first time it is reached.
//!
//! 2. Walk the same edges again, clearing stamps and decrementing
//!    counters. When a counter returns to zero the computation re-runs,
//!    then resolves its own downstream edges, depth-first.
//!
//! A computation whose counter has not returned to zero can still be read
//! before it runs, when a re-running computation discovers a brand new
//! dependency on it. That read force-resolves the node: its stale sources
//! first, recursively, then the node itself. Its counters are zeroed so
//! the later edge walk skips it. This pull half of the design is what
//! keeps dynamically rebound dependencies glitch-free.
//!
//! # Scheduler context
//!
//! The engine is single-threaded by design; all state lives in a
//! thread-local `Runtime`. The context pointers (structural owner, running
//! node, listening flag, current clock) are saved and restored with RAII
//! guards around every context switch, so a fault that unwinds out of a
//! user closure cannot leave stale pointers behind. The `RefCell` holding
//! the runtime is never borrowed across a user-closure call.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::error::ReactiveError;

use super::clock::{is_ancestor, Clock, ClockId, ClockState};
use super::node::{
    ComputationNode, ComputeFn, DataNode, Edge, EqFn, Node, NodeId, NodeState, SourceSlot,
};

/// Default bound on time steps per update pass before the runaway fault.
pub(crate) const DEFAULT_MAX_ITERATIONS: usize = 100_000;

/// Process-wide scheduler state for one thread.
pub(crate) struct Runtime {
    nodes: HashMap<NodeId, Node>,
    clocks: HashMap<ClockId, Clock>,
    root: ClockId,

    /// Clock new nodes attach to and writes route through.
    current_clock: ClockId,

    /// Structural owner for nodes created right now.
    owner: Option<NodeId>,

    /// Computation whose closure is executing, for dependency capture.
    running: Option<NodeId>,

    /// Cleared inside `sample` regions.
    listening: bool,

    /// Nesting depth of open event scopes. Writes defer while nonzero.
    active: u32,

    max_iterations: usize,
    next_node: u64,
    next_clock: u64,
}

impl Runtime {
    fn new() -> Self {
        let root = ClockId::from_raw(0);
        let mut clocks = HashMap::new();
        clocks.insert(root, Clock::new(None, 0));
        Self {
            nodes: HashMap::new(),
            clocks,
            root,
            current_clock: root,
            owner: None,
            running: None,
            listening: true,
            active: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            next_node: 0,
            next_clock: 1,
        }
    }

    fn alloc_node(&mut self) -> NodeId {
        let id = NodeId::from_raw(self.next_node);
        self.next_node += 1;
        id
    }

    fn alloc_clock(&mut self, parent: ClockId) -> ClockId {
        let id = ClockId::from_raw(self.next_clock);
        self.next_clock += 1;
        let depth = self.clocks[&parent].depth + 1;
        self.clocks.insert(id, Clock::new(Some(parent), depth));
        id
    }

    /// Sum of this clock's local time and all ancestors' local times.
    fn absolute_time(&self, clock: ClockId) -> u64 {
        let mut time = 0;
        let mut cursor = Some(clock);
        while let Some(id) = cursor {
            let clock = &self.clocks[&id];
            time += clock.local_time;
            cursor = clock.parent;
        }
        time
    }

    fn clock_pending(&self, clock: ClockId) -> bool {
        let clock = &self.clocks[&clock];
        clock.has_work() || clock.state == ClockState::Stale
    }

    /// Mark a clock and its ancestor chain stale so a later pass knows
    /// those domains must be visited. Each clock is pushed onto its
    /// parent's sub-clock queue exactly once per Idle-to-Stale transition.
    fn mark_clock_stale(&mut self, clock: ClockId) {
        let mut cursor = clock;
        loop {
            let (state, parent) = {
                let clock = &self.clocks[&cursor];
                (clock.state, clock.parent)
            };
            match state {
                ClockState::Running | ClockState::Stale => break,
                ClockState::Idle => {
                    self.clocks.get_mut(&cursor).expect("clock exists").state = ClockState::Stale;
                    match parent {
                        Some(parent) => {
                            self.clocks
                                .get_mut(&parent)
                                .expect("parent clock exists")
                                .subclocks
                                .push(cursor);
                            cursor = parent;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Drop the cross-clock references a computation holds, decrementing
    /// the refcounted clock-precedes-clock entries it created.
    fn release_preclocks(&mut self, id: NodeId) {
        let refs = match self.nodes.get_mut(&id) {
            Some(Node::Computation(comp)) => std::mem::take(&mut comp.preclock_refs),
            _ => return,
        };
        for (reader, source) in refs {
            if let Some(clock) = self.clocks.get_mut(&reader) {
                if let Some(count) = clock.preclocks.get_mut(&source) {
                    *count -= 1;
                    if *count == 0 {
                        clock.preclocks.swap_remove(&source);
                    }
                }
            }
        }
    }

    /// Restore the scheduler to a consistent state after an aborted pass.
    ///
    /// Queues are drained, mark counters and edge stamps are cleared,
    /// Running and Stale nodes return to Current, and the context pointers
    /// go back to their idle values. Node values are untouched.
    fn reset_after_fault(&mut self) {
        for clock in self.clocks.values_mut() {
            clock.state = ClockState::Idle;
            clock.changes.clear();
            clock.subclocks.clear();
            clock.updates.clear();
            clock.disposes.clear();
        }
        for node in self.nodes.values_mut() {
            match node {
                Node::Data(data) => {
                    data.pending = None;
                }
                Node::Computation(comp) => {
                    comp.marks = 0;
                    comp.downstream_marked = false;
                    if comp.state == NodeState::Stale || comp.state == NodeState::Running {
                        comp.state = NodeState::Current;
                    }
                }
            }
            let log = node.log_mut();
            for slot in 0..log.slots_len() {
                if let Some(edge) = log.slot_mut(slot) {
                    edge.marked = false;
                }
            }
        }
        self.owner = None;
        self.running = None;
        self.listening = true;
        self.current_clock = self.root;
        self.active = 0;
    }

    /// Compact fragmented dependents logs, fixing the back-pointers held
    /// by each dependent's source slot. Only called at quiescence, when no
    /// edge walk is on the stack.
    fn sweep_logs(&mut self) {
        let fragmented: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.log().is_fragmented())
            .map(|(id, _)| *id)
            .collect();
        for id in fragmented {
            debug!(node = id.raw(), "compacting dependents log");
            let live = self
                .nodes
                .get_mut(&id)
                .expect("node exists")
                .log_mut()
                .drain_live();
            for (slot, edge) in live.iter().enumerate() {
                if let Some(Node::Computation(comp)) = self.nodes.get_mut(&edge.dependent) {
                    if let Some(entry) = comp.sources.get_mut(edge.source_slot) {
                        entry.log_slot = slot;
                    }
                }
            }
            self.nodes
                .get_mut(&id)
                .expect("node exists")
                .log_mut()
                .rebuild(live);
        }
    }
}

thread_local! {
    static RUNTIME: RefCell<Runtime> = RefCell::new(Runtime::new());
}

/// Run `f` with the thread's runtime borrowed. Never call user code from
/// inside `f`; the borrow must not be held across a user-closure call.
fn with<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.borrow_mut()))
}

// ---------------------------------------------------------------------------
// Context guards
// ---------------------------------------------------------------------------

/// Saves the scheduler context pointers and restores them on drop, so a
/// panic unwinding out of a user closure cannot leave them stale.
struct CtxGuard {
    saved: Option<(Option<NodeId>, Option<NodeId>, bool, ClockId)>,
}

impl CtxGuard {
    fn swap(
        owner: Option<NodeId>,
        running: Option<NodeId>,
        listening: bool,
        clock: ClockId,
    ) -> Self {
        let saved = with(|rt| {
            let saved = (rt.owner, rt.running, rt.listening, rt.current_clock);
            rt.owner = owner;
            rt.running = running;
            rt.listening = listening;
            rt.current_clock = clock;
            saved
        });
        Self { saved: Some(saved) }
    }

    fn restore(mut self) {
        self.restore_now();
    }

    fn restore_now(&mut self) {
        if let Some((owner, running, listening, clock)) = self.saved.take() {
            with(|rt| {
                rt.owner = owner;
                rt.running = running;
                rt.listening = listening;
                rt.current_clock = clock;
            });
        }
    }
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        self.restore_now();
    }
}

/// Opens an event scope. The outermost scope flushes the root clock when
/// it closes; a panic inside any scope resets the scheduler.
struct EventGuard {
    open: bool,
}

impl EventGuard {
    fn begin() -> Self {
        with(|rt| rt.active += 1);
        Self { open: true }
    }

    fn finish(&mut self) -> Result<(), ReactiveError> {
        let outermost = with(|rt| rt.active == 1);
        let result = if outermost { flush_root() } else { Ok(()) };
        self.open = false;
        with(|rt| {
            rt.active = rt.active.saturating_sub(1);
            if outermost && result.is_ok() {
                rt.sweep_logs();
            }
        });
        result
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        if self.open {
            with(|rt| {
                rt.active = rt.active.saturating_sub(1);
                if std::thread::panicking() {
                    rt.reset_after_fault();
                }
            });
        }
    }
}

/// Run `f` inside an event scope. Writes made anywhere below `f` defer
/// onto their clocks' change queues; the outermost scope flushes them all
/// in one pass when `f` completes.
fn with_event<R>(f: impl FnOnce() -> Result<R, ReactiveError>) -> Result<R, ReactiveError> {
    let mut guard = EventGuard::begin();
    let value = f()?;
    guard.finish()?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// Node creation
// ---------------------------------------------------------------------------

/// Create a data cell in the current clock domain, owned by the current
/// scope if one is active.
pub(crate) fn create_data(value: Box<dyn Any>, eq: EqFn) -> NodeId {
    with(|rt| {
        let id = rt.alloc_node();
        let clock = rt.current_clock;
        let time = rt.absolute_time(clock);
        rt.nodes
            .insert(id, Node::Data(DataNode::new(clock, time, value, eq)));
        if let Some(owner) = rt.owner {
            if let Some(Node::Computation(parent)) = rt.nodes.get_mut(&owner) {
                parent.children.push(id);
            }
        }
        id
    })
}

/// Create a computation in the current clock domain and run it once to
/// establish its value and initial dependencies.
pub(crate) fn create_computation(func: ComputeFn) -> Result<NodeId, ReactiveError> {
    with_event(|| {
        let id = with(|rt| {
            let id = rt.alloc_node();
            let clock = rt.current_clock;
            rt.nodes
                .insert(id, Node::Computation(ComputationNode::new(clock, Some(func))));
            match rt.owner {
                Some(owner) => {
                    if let Some(Node::Computation(parent)) = rt.nodes.get_mut(&owner) {
                        parent.children.push(id);
                    }
                }
                None => {
                    warn!(
                        node = id.raw(),
                        "computation created outside any root scope will never be disposed"
                    );
                }
            }
            id
        });
        run_computation(id)?;
        Ok(id)
    })
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Track a read of a data cell by the running computation, if any.
pub(crate) fn touch_data(id: NodeId) {
    settle_for_read(id);
    with(|rt| log_read(rt, id));
}

/// Bring a cell's domain current without registering a dependency.
pub(crate) fn touch_data_untracked(id: NodeId) {
    settle_for_read(id);
}

/// Prepare a computation for reading: settle its domain, fault on a
/// self-read, force-resolve it if stale, then track the read.
pub(crate) fn touch_computation(id: NodeId) {
    touch_computation_inner(id);
    with(|rt| log_read(rt, id));
}

/// As `touch_computation`, without registering a dependency.
pub(crate) fn touch_computation_untracked(id: NodeId) {
    touch_computation_inner(id);
}

fn touch_computation_inner(id: NodeId) {
    settle_for_read(id);
    let state = with(|rt| match rt.nodes.get(&id) {
        Some(Node::Computation(comp)) => Some(comp.state),
        _ => None,
    });
    match state {
        Some(NodeState::Running) => {
            panic!("{}", ReactiveError::CircularDependency);
        }
        Some(NodeState::Stale) => {
            if let Err(err) = with_event(|| force_update(id)) {
                panic!("reactive engine fault during read: {err}");
            }
        }
        _ => {}
    }
}

/// Access a cell's current value.
///
/// # Panics
///
/// Panics if the cell has been disposed.
pub(crate) fn with_data_value<R>(id: NodeId, f: impl FnOnce(&dyn Any) -> R) -> R {
    with(|rt| match rt.nodes.get(&id) {
        Some(Node::Data(data)) => f(data.value.as_ref()),
        _ => panic!("signal read after dispose"),
    })
}

/// Access a computation's cached value.
///
/// # Panics
///
/// Panics if the computation has been disposed or has never run.
pub(crate) fn with_computation_value<R>(id: NodeId, f: impl FnOnce(&dyn Any) -> R) -> R {
    with(|rt| match rt.nodes.get(&id) {
        Some(Node::Computation(comp)) => match comp.value.as_ref() {
            Some(value) => f(value.as_ref()),
            None => panic!("computation read before its first run"),
        },
        _ => panic!("computation read after dispose"),
    })
}

/// Whether a node is still present in the arena.
pub(crate) fn node_exists(id: NodeId) -> bool {
    with(|rt| rt.nodes.contains_key(&id))
}

/// Number of live dependent edges on a node.
pub(crate) fn dependent_count(id: NodeId) -> usize {
    with(|rt| rt.nodes.get(&id).map_or(0, |node| node.log().live_count()))
}

/// Whether a computation is gone or its disposal is already queued.
pub(crate) fn computation_disposed(id: NodeId) -> bool {
    with(|rt| match rt.nodes.get(&id) {
        Some(Node::Computation(comp)) => comp.state == NodeState::Disposed,
        Some(Node::Data(_)) => false,
        None => true,
    })
}

/// A read of a node in a foreign domain must see that domain fully
/// settled, never a half-updated world.
fn settle_for_read(id: NodeId) {
    enum Need {
        None,
        Update(ClockId),
        Cycle,
    }
    let need = with(|rt| {
        let Some(node) = rt.nodes.get(&id) else {
            return Need::None;
        };
        let clock = node.clock();
        if clock == rt.current_clock {
            return Need::None;
        }
        match rt.clocks[&clock].state {
            ClockState::Running => {
                if is_ancestor(&rt.clocks, clock, rt.current_clock) {
                    Need::None
                } else {
                    Need::Cycle
                }
            }
            _ => {
                if rt.clock_pending(clock) {
                    Need::Update(clock)
                } else {
                    Need::None
                }
            }
        }
    });
    match need {
        Need::None => {}
        Need::Cycle => {
            panic!("{}", ReactiveError::ClockCycle);
        }
        Need::Update(clock) => {
            if let Err(err) = with_event(|| update_clock_if_pending(clock)) {
                panic!("reactive engine fault during read: {err}");
            }
        }
    }
}

/// Register the running computation as a dependent of `source`.
///
/// Registration is idempotent per run: the first read this run stamps or
/// creates the edge, repeat reads are no-ops. The first read of a source
/// in a foreign, non-ancestor domain also records a refcounted
/// clock-precedes-clock entry on the reader's clock.
fn log_read(rt: &mut Runtime, source: NodeId) {
    if !rt.listening {
        return;
    }
    let Some(reader) = rt.running else {
        return;
    };
    let Some(source_clock) = rt.nodes.get(&source).map(|node| node.clock()) else {
        return;
    };

    enum Reg {
        Repeat,
        Stamped,
        Attach(usize),
    }
    let reg = {
        let Some(Node::Computation(comp)) = rt.nodes.get_mut(&reader) else {
            return;
        };
        let gen = comp.gen;
        match comp.source_index.get(&source).copied() {
            Some(index) => {
                let slot = &mut comp.sources[index];
                if slot.gen == gen {
                    Reg::Repeat
                } else if slot.active {
                    slot.gen = gen;
                    Reg::Stamped
                } else {
                    slot.gen = gen;
                    slot.active = true;
                    Reg::Attach(index)
                }
            }
            None => {
                comp.sources.push(SourceSlot {
                    source,
                    log_slot: 0,
                    gen,
                    active: true,
                });
                let index = comp.sources.len() - 1;
                comp.source_index.insert(source, index);
                Reg::Attach(index)
            }
        }
    };

    if matches!(reg, Reg::Repeat) {
        return;
    }

    // first touch of this source this run: renew the cross-clock record
    let reader_clock = rt.current_clock;
    if source_clock != reader_clock && !is_ancestor(&rt.clocks, source_clock, reader_clock) {
        *rt.clocks
            .get_mut(&reader_clock)
            .expect("reader clock exists")
            .preclocks
            .entry(source_clock)
            .or_insert(0) += 1;
        if let Some(Node::Computation(comp)) = rt.nodes.get_mut(&reader) {
            comp.preclock_refs.push((reader_clock, source_clock));
        }
    }

    if let Reg::Attach(index) = reg {
        let edge = Edge {
            dependent: reader,
            source_slot: index,
            marked: false,
        };
        let log_slot = match rt.nodes.get_mut(&source) {
            Some(node) => node.log_mut().insert(edge),
            None => return,
        };
        if let Some(Node::Computation(comp)) = rt.nodes.get_mut(&reader) {
            comp.sources[index].log_slot = log_slot;
        }
    }
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

/// Write a cell. Outside any event scope the write propagates before this
/// returns; inside one it defers onto the cell's clock. A second write of
/// a different value to the same cell in one pass is rejected.
pub(crate) fn write_data(id: NodeId, value: Box<dyn Any>) -> Result<(), ReactiveError> {
    with_event(|| {
        // a foreign domain behind the current frontier is brought current
        // before the write lands
        let foreign = with(|rt| {
            let Some(Node::Data(data)) = rt.nodes.get(&id) else {
                return None;
            };
            let clock = data.clock;
            if clock != rt.current_clock
                && !is_ancestor(&rt.clocks, clock, rt.current_clock)
                && rt.clocks[&clock].state != ClockState::Running
                && rt.clock_pending(clock)
            {
                Some(clock)
            } else {
                None
            }
        });
        if let Some(clock) = foreign {
            update_clock_if_pending(clock)?;
        }

        enum Outcome {
            Queued(ClockId),
            SameValue,
            Conflict { last_write: u64 },
            Missing,
        }
        let outcome = with(|rt| {
            let Some(Node::Data(data)) = rt.nodes.get_mut(&id) else {
                return Outcome::Missing;
            };
            let (has_pending, conflicts) = match data.pending.as_ref() {
                Some(pending) => (true, !(data.eq)(pending.as_ref(), value.as_ref())),
                None => (false, false),
            };
            if conflicts {
                Outcome::Conflict {
                    last_write: data.time,
                }
            } else if has_pending {
                Outcome::SameValue
            } else {
                data.pending = Some(value);
                Outcome::Queued(data.clock)
            }
        });
        match outcome {
            Outcome::Missing => Err(ReactiveError::Disposed),
            Outcome::Conflict { last_write } => {
                debug!(
                    cell = id.raw(),
                    last_write, "conflicting write rejected, first pending value stands"
                );
                Err(ReactiveError::ConflictingWrite)
            }
            Outcome::SameValue => Ok(()),
            Outcome::Queued(clock) => {
                with(|rt| {
                    rt.clocks
                        .get_mut(&clock)
                        .expect("cell clock exists")
                        .changes
                        .push(id);
                    rt.mark_clock_stale(clock);
                });
                Ok(())
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

/// Drive the root clock until no domain has pending work.
fn flush_root() -> Result<(), ReactiveError> {
    loop {
        let pending = with(|rt| {
            let root = rt.root;
            if rt.clock_pending(root) {
                Some(root)
            } else {
                None
            }
        });
        match pending {
            Some(root) => run_pass(root)?,
            None => return Ok(()),
        }
    }
}

/// Bring a clock up to date if it has queued or signalled work.
fn update_clock_if_pending(clock: ClockId) -> Result<(), ReactiveError> {
    let pending = with(|rt| match rt.clocks[&clock].state {
        ClockState::Running => None,
        _ => Some(rt.clock_pending(clock)),
    });
    match pending {
        None => {
            with(|rt| rt.reset_after_fault());
            Err(ReactiveError::ClockCycle)
        }
        Some(true) => run_pass(clock),
        Some(false) => Ok(()),
    }
}

/// Run one clock's update pass to quiescence.
fn run_pass(clock: ClockId) -> Result<(), ReactiveError> {
    let entered = with(|rt| {
        let state = &mut rt.clocks.get_mut(&clock).expect("clock exists").state;
        if *state == ClockState::Running {
            false
        } else {
            *state = ClockState::Running;
            true
        }
    });
    if !entered {
        with(|rt| rt.reset_after_fault());
        return Err(ReactiveError::ClockCycle);
    }
    match run_pass_steps(clock) {
        Ok(()) => {
            with(|rt| {
                if let Some(entry) = rt.clocks.get_mut(&clock) {
                    entry.state = ClockState::Idle;
                }
            });
            Ok(())
        }
        Err(err) => {
            error!(clock = clock.raw(), %err, "update pass aborted");
            with(|rt| rt.reset_after_fault());
            Err(err)
        }
    }
}

fn run_pass_steps(clock: ClockId) -> Result<(), ReactiveError> {
    let budget = with(|rt| rt.max_iterations);
    let mut steps = 0usize;
    loop {
        let has_work = with(|rt| rt.clocks[&clock].has_work());
        if !has_work {
            return Ok(());
        }
        steps += 1;
        if steps > budget {
            return Err(ReactiveError::RunawayUpdate { iterations: steps });
        }
        trace!(clock = clock.raw(), step = steps, "update step");
        with(|rt| rt.clocks.get_mut(&clock).expect("clock exists").local_time += 1);

        // settle foreign domains this domain's computations read from
        let preclocks: Vec<ClockId> =
            with(|rt| rt.clocks[&clock].preclocks.keys().copied().collect());
        for pre in preclocks {
            update_clock_if_pending(pre)?;
        }

        // apply every queued write of the step, then mark the entire
        // downstream closure before resolving anything: the barrier
        // between the two phases is what keeps diamonds glitch-free
        let changed = with(|rt| rt.clocks.get_mut(&clock).expect("clock exists").changes.take());
        with(|rt| {
            let now = rt.absolute_time(clock);
            for id in &changed {
                if let Some(Node::Data(data)) = rt.nodes.get_mut(id) {
                    if let Some(value) = data.pending.take() {
                        data.value = value;
                        data.time = now;
                    }
                }
            }
            for id in &changed {
                mark_downstream(rt, *id, clock);
            }
        });
        for id in &changed {
            resolve_downstream(*id)?;
        }

        // activate stale child domains
        let subclocks = with(|rt| {
            rt.clocks
                .get_mut(&clock)
                .expect("clock exists")
                .subclocks
                .take()
        });
        for sub in subclocks {
            update_clock_if_pending(sub)?;
        }

        // computations of this domain invalidated from other domains
        let updates = with(|rt| rt.clocks.get_mut(&clock).expect("clock exists").updates.take());
        for id in updates {
            force_update(id)?;
        }

        // deferred disposals run last, once the step's updates settled
        let disposes = with(|rt| {
            rt.clocks
                .get_mut(&clock)
                .expect("clock exists")
                .disposes
                .take()
        });
        for id in disposes {
            dispose_now(id)?;
        }
    }
}

/// Mark phase: stamp live edges and count inbound marks on each reachable
/// computation, recursing into a computation's own dependents only on its
/// first mark. Dependents in a foreign domain are scheduled onto their own
/// clock's update queue instead of being walked here.
fn mark_downstream(rt: &mut Runtime, id: NodeId, pass_clock: ClockId) {
    let len = match rt.nodes.get(&id) {
        Some(node) => node.log().slots_len(),
        None => return,
    };
    for slot in 0..len {
        let dependent = {
            let Some(node) = rt.nodes.get_mut(&id) else {
                return;
            };
            match node.log_mut().slot_mut(slot) {
                Some(edge) if !edge.marked => {
                    edge.marked = true;
                    edge.dependent
                }
                _ => continue,
            }
        };
        enum Action {
            None,
            Unmark,
            Recurse,
            Schedule(ClockId),
        }
        let action = match rt.nodes.get_mut(&dependent) {
            Some(Node::Computation(comp)) if comp.state != NodeState::Disposed => {
                comp.marks += 1;
                if comp.state == NodeState::Current {
                    comp.state = NodeState::Stale;
                }
                if comp.marks == 1 && comp.state == NodeState::Stale {
                    if comp.clock == pass_clock {
                        comp.downstream_marked = true;
                        Action::Recurse
                    } else {
                        Action::Schedule(comp.clock)
                    }
                } else {
                    Action::None
                }
            }
            _ => Action::Unmark,
        };
        match action {
            Action::None => {}
            Action::Unmark => {
                if let Some(node) = rt.nodes.get_mut(&id) {
                    if let Some(edge) = node.log_mut().slot_mut(slot) {
                        edge.marked = false;
                    }
                }
            }
            Action::Recurse => mark_downstream(rt, dependent, pass_clock),
            Action::Schedule(target_clock) => {
                rt.clocks
                    .get_mut(&target_clock)
                    .expect("dependent clock exists")
                    .updates
                    .push(dependent);
                rt.mark_clock_stale(target_clock);
            }
        }
    }
}

/// Resolve phase: clear stamps, decrement counters, and run each
/// computation of the pass clock exactly once when its counter returns to
/// zero, depth-first into its own downstream.
fn resolve_downstream(id: NodeId) -> Result<(), ReactiveError> {
    let mut cursor = 0;
    loop {
        let next = with(|rt| {
            let node = rt.nodes.get(&id)?;
            let log = node.log();
            for slot in cursor..log.slots_len() {
                if let Some(edge) = log.slot(slot) {
                    if edge.marked {
                        return Some((slot, edge.dependent));
                    }
                }
            }
            None
        });
        let Some((slot, dependent)) = next else {
            return Ok(());
        };
        cursor = slot + 1;
        let run = with(|rt| {
            let source_clock = rt.nodes.get(&id).map(|node| node.clock());
            if let Some(node) = rt.nodes.get_mut(&id) {
                if let Some(edge) = node.log_mut().slot_mut(slot) {
                    edge.marked = false;
                }
            }
            match rt.nodes.get_mut(&dependent) {
                Some(Node::Computation(comp)) => {
                    comp.marks = comp.marks.saturating_sub(1);
                    comp.marks == 0
                        && comp.state == NodeState::Stale
                        && Some(comp.clock) == source_clock
                }
                _ => false,
            }
        });
        if run {
            run_computation(dependent)?;
            resolve_downstream(dependent)?;
        }
    }
}

/// Pull-resolve a stale computation ahead of the edge walk: stale sources
/// first, recursively, then the node itself, then its downstream.
fn force_update(id: NodeId) -> Result<(), ReactiveError> {
    // claim the node so a concurrent resolve cannot run it twice, and so
    // a read cycle through the force chain is detectable
    let claim = with(|rt| match rt.nodes.get_mut(&id) {
        Some(Node::Computation(comp)) if comp.state == NodeState::Stale => {
            comp.state = NodeState::Running;
            Some(comp.downstream_marked)
        }
        _ => None,
    });
    let Some(premarked) = claim else {
        return Ok(());
    };

    loop {
        let next = with(|rt| {
            let Some(Node::Computation(comp)) = rt.nodes.get(&id) else {
                return Ok(None);
            };
            for slot in comp.sources.iter() {
                if !slot.active {
                    continue;
                }
                if let Some(Node::Computation(source)) = rt.nodes.get(&slot.source) {
                    match source.state {
                        NodeState::Stale => return Ok(Some(slot.source)),
                        NodeState::Running => return Err(ReactiveError::CircularDependency),
                        _ => {}
                    }
                }
            }
            Ok(None)
        });
        match next {
            Ok(Some(source)) => force_update(source)?,
            Ok(None) => break,
            Err(err) => {
                with(|rt| rt.reset_after_fault());
                return Err(err);
            }
        }
    }

    run_computation(id)?;

    // a node scheduled across clocks was never walked by the mark phase,
    // so its own downstream still needs marking before the resolve
    if !premarked {
        let clock = with(|rt| rt.nodes.get(&id).map(|node| node.clock()));
        if let Some(clock) = clock {
            with(|rt| mark_downstream(rt, id, clock));
        }
    }
    resolve_downstream(id)
}

/// Re-run one computation: dispose the children of its previous run, fire
/// its cleanups, release its cross-clock refs, execute its closure with
/// the context pointed at it, then deactivate sources it did not re-read.
fn run_computation(id: NodeId) -> Result<(), ReactiveError> {
    struct Prep {
        func: ComputeFn,
        prev: Option<Box<dyn Any>>,
        children: SmallVec<[NodeId; 4]>,
        cleanups: Vec<Box<dyn FnOnce(bool)>>,
        clock: ClockId,
    }
    let prep = with(|rt| {
        let Some(Node::Computation(comp)) = rt.nodes.get_mut(&id) else {
            return None;
        };
        if comp.state == NodeState::Disposed {
            return None;
        }
        let func = comp.func.clone()?;
        comp.gen += 1;
        comp.state = NodeState::Running;
        comp.downstream_marked = false;
        Some(Prep {
            func,
            prev: comp.value.take(),
            children: std::mem::take(&mut comp.children),
            cleanups: std::mem::take(&mut comp.cleanups),
            clock: comp.clock,
        })
    });
    let Some(prep) = prep else {
        return Ok(());
    };

    with(|rt| rt.release_preclocks(id));

    // children of the previous run are disposed outright; the re-run
    // recreates the ones it still needs
    for child in prep.children {
        dispose_now(child)?;
    }
    for cleanup in prep.cleanups {
        cleanup(false);
    }

    let ctx = CtxGuard::swap(Some(id), Some(id), true, prep.clock);
    let value = {
        let mut func = prep.func.borrow_mut();
        (&mut *func)(prep.prev)
    };
    ctx.restore();

    with(|rt| {
        let Some(Node::Computation(comp)) = rt.nodes.get_mut(&id) else {
            return;
        };
        comp.value = Some(value);
        comp.marks = 0;
        if comp.state == NodeState::Running {
            comp.state = NodeState::Current;
        }
        // sources not re-read this run stop waking this node
        let gen = comp.gen;
        let mut dropped: SmallVec<[(NodeId, usize); 4]> = SmallVec::new();
        for slot in comp.sources.iter_mut() {
            if slot.active && slot.gen < gen {
                slot.active = false;
                dropped.push((slot.source, slot.log_slot));
            }
        }
        for (source, log_slot) in dropped {
            if let Some(node) = rt.nodes.get_mut(&source) {
                node.log_mut().remove(log_slot);
            }
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Disposal
// ---------------------------------------------------------------------------

/// Dispose a node. Mid-pass the disposal defers onto the current clock's
/// disposal queue; at quiescence it runs immediately. Idempotent.
pub(crate) fn dispose_node(id: NodeId) {
    let deferred = with(|rt| {
        if !rt.nodes.contains_key(&id) {
            return None;
        }
        if rt.active > 0 {
            if let Some(Node::Computation(comp)) = rt.nodes.get_mut(&id) {
                if comp.state == NodeState::Disposed {
                    return None;
                }
                comp.state = NodeState::Disposed;
            }
            let clock = rt.current_clock;
            rt.clocks
                .get_mut(&clock)
                .expect("current clock exists")
                .disposes
                .push(id);
            rt.mark_clock_stale(clock);
            Some(true)
        } else {
            Some(false)
        }
    });
    if let Some(false) = deferred {
        if let Err(err) = with_event(|| dispose_now(id)) {
            panic!("reactive engine fault during dispose: {err}");
        }
    }
}

/// Tear a node down: detach every edge, dispose owned children leaves
/// first, then run this node's cleanups with the final flag.
fn dispose_now(id: NodeId) -> Result<(), ReactiveError> {
    struct Teardown {
        children: SmallVec<[NodeId; 4]>,
        cleanups: Vec<Box<dyn FnOnce(bool)>>,
    }
    let teardown = with(|rt| {
        let Some(node) = rt.nodes.get_mut(&id) else {
            return None;
        };
        let (children, cleanups, sources, dependents) = match node {
            Node::Computation(comp) => {
                comp.state = NodeState::Disposed;
                let children = std::mem::take(&mut comp.children);
                let cleanups = std::mem::take(&mut comp.cleanups);
                let sources: Vec<(NodeId, usize)> = comp
                    .sources
                    .iter()
                    .filter(|slot| slot.active)
                    .map(|slot| (slot.source, slot.log_slot))
                    .collect();
                comp.sources.clear();
                comp.source_index.clear();
                let dependents: Vec<(NodeId, usize, bool)> = comp
                    .log
                    .iter_live()
                    .map(|edge| (edge.dependent, edge.source_slot, edge.marked))
                    .collect();
                comp.log.clear();
                (children, cleanups, sources, dependents)
            }
            Node::Data(data) => {
                data.pending = None;
                let dependents: Vec<(NodeId, usize, bool)> = data
                    .log
                    .iter_live()
                    .map(|edge| (edge.dependent, edge.source_slot, edge.marked))
                    .collect();
                data.log.clear();
                (SmallVec::new(), Vec::new(), Vec::new(), dependents)
            }
        };
        for (source, log_slot) in sources {
            if let Some(node) = rt.nodes.get_mut(&source) {
                node.log_mut().remove(log_slot);
            }
        }
        // detach dependents, repairing mark counters so a mid-pass
        // disposal cannot strand a half-resolved computation
        for (dependent, source_slot, marked) in dependents {
            let mut reschedule = None;
            if let Some(Node::Computation(comp)) = rt.nodes.get_mut(&dependent) {
                if let Some(slot) = comp.sources.get_mut(source_slot) {
                    slot.active = false;
                }
                comp.source_index.remove(&id);
                if marked {
                    comp.marks = comp.marks.saturating_sub(1);
                    if comp.marks == 0 && comp.state == NodeState::Stale {
                        reschedule = Some(comp.clock);
                    }
                }
            }
            if let Some(clock) = reschedule {
                rt.clocks
                    .get_mut(&clock)
                    .expect("dependent clock exists")
                    .updates
                    .push(dependent);
                rt.mark_clock_stale(clock);
            }
        }
        rt.release_preclocks(id);
        Some(Teardown { children, cleanups })
    });
    let Some(teardown) = teardown else {
        return Ok(());
    };

    for child in teardown.children {
        dispose_now(child)?;
    }
    for cleanup in teardown.cleanups {
        cleanup(true);
    }

    with(|rt| {
        rt.nodes.remove(&id);
    });
    debug!(node = id.raw(), "node disposed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Run `f` with a fresh unowned root scope as the structural owner.
/// The scope body runs untracked; computations created inside listen for
/// their own runs as usual.
pub(crate) fn run_root<R>(f: impl FnOnce(NodeId) -> R) -> R {
    let id = with(|rt| {
        let id = rt.alloc_node();
        let clock = rt.current_clock;
        rt.nodes
            .insert(id, Node::Computation(ComputationNode::new(clock, None)));
        id
    });
    let (running, clock) = with(|rt| (rt.running, rt.current_clock));
    let ctx = CtxGuard::swap(Some(id), running, false, clock);
    let value = f(id);
    ctx.restore();
    value
}

/// Run `f` with dependency registration suppressed.
pub(crate) fn sample<R>(f: impl FnOnce() -> R) -> R {
    struct ListenGuard {
        saved: Option<bool>,
    }
    impl Drop for ListenGuard {
        fn drop(&mut self) {
            if let Some(saved) = self.saved.take() {
                with(|rt| rt.listening = saved);
            }
        }
    }
    let guard = ListenGuard {
        saved: Some(with(|rt| std::mem::replace(&mut rt.listening, false))),
    };
    let value = f();
    drop(guard);
    value
}

/// Run `f` in an event scope: writes made inside coalesce into one pass
/// that settles when the outermost scope closes.
pub(crate) fn batch<R>(f: impl FnOnce() -> R) -> Result<R, ReactiveError> {
    with_event(|| Ok(f()))
}

/// Run `f` under a fresh sub-clock of the current domain, settling the
/// sub-clock's queues before returning.
pub(crate) fn run_subclock<R>(f: impl FnOnce() -> R) -> Result<R, ReactiveError> {
    with_event(|| {
        let (child, owner, running, listening) =
            with(|rt| (rt.alloc_clock(rt.current_clock), rt.owner, rt.running, rt.listening));
        let ctx = CtxGuard::swap(owner, running, listening, child);
        let value = f();
        ctx.restore();
        update_clock_if_pending(child)?;
        Ok(value)
    })
}

/// Register a cleanup on the owner scope active right now.
pub(crate) fn register_cleanup(cleanup: Box<dyn FnOnce(bool)>) -> Result<(), ReactiveError> {
    with(|rt| {
        let Some(owner) = rt.owner else {
            return Err(ReactiveError::OutsideScope);
        };
        match rt.nodes.get_mut(&owner) {
            Some(Node::Computation(comp)) if comp.state != NodeState::Disposed => {
                comp.cleanups.push(cleanup);
                Ok(())
            }
            _ => Err(ReactiveError::OutsideScope),
        }
    })
}

/// Set the time-step budget after which a pass is declared runaway.
pub(crate) fn set_max_update_iterations(limit: usize) {
    with(|rt| rt.max_iterations = limit.max(1));
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::graph::node::eq_any;

    fn int_cell(value: i32) -> NodeId {
        create_data(Box::new(value), eq_any::<i32>)
    }

    fn read_int(cell: NodeId) -> i32 {
        touch_data(cell);
        with_data_value(cell, |value| *value.downcast_ref::<i32>().expect("i32 cell"))
    }

    fn computation_value(id: NodeId) -> i32 {
        touch_computation_untracked(id);
        with_computation_value(id, |value| *value.downcast_ref::<i32>().expect("i32 value"))
    }

    #[test]
    fn immediate_write_applies_and_propagates() {
        let cell = int_cell(1);
        let func: ComputeFn = Rc::new(RefCell::new(move |_prev: Option<Box<dyn Any>>| {
            Box::new(read_int(cell) * 2) as Box<dyn Any>
        }));
        let comp = create_computation(func).expect("creation settles");
        assert_eq!(computation_value(comp), 2);

        write_data(cell, Box::new(5i32)).expect("write settles");
        assert_eq!(computation_value(comp), 10);
    }

    #[test]
    fn repeat_reads_register_one_edge() {
        let cell = int_cell(1);
        let func: ComputeFn = Rc::new(RefCell::new(move |_prev: Option<Box<dyn Any>>| {
            Box::new(read_int(cell) + read_int(cell)) as Box<dyn Any>
        }));
        let comp = create_computation(func).expect("creation settles");
        assert_eq!(dependent_count(cell), 1);
        assert_eq!(computation_value(comp), 2);

        // the edge count stays one across re-runs
        write_data(cell, Box::new(3i32)).expect("write settles");
        assert_eq!(dependent_count(cell), 1);
        assert_eq!(computation_value(comp), 6);
    }

    #[test]
    fn deferred_writes_conflict_on_different_values() {
        let cell = int_cell(0);
        let second = batch(|| {
            write_data(cell, Box::new(1i32)).expect("first write accepted");
            write_data(cell, Box::new(2i32))
        })
        .expect("batch settles");
        assert_eq!(second, Err(ReactiveError::ConflictingWrite));
        // the first pending write won
        assert_eq!(read_int(cell), 1);
    }

    #[test]
    fn deferred_rewrite_of_same_value_is_allowed() {
        let cell = int_cell(0);
        let second = batch(|| {
            write_data(cell, Box::new(4i32)).expect("first write accepted");
            write_data(cell, Box::new(4i32))
        })
        .expect("batch settles");
        assert_eq!(second, Ok(()));
        assert_eq!(read_int(cell), 4);
    }

    #[test]
    fn runaway_pass_is_reported_and_resets() {
        set_max_update_iterations(16);
        let cell = int_cell(0);
        let func: ComputeFn = Rc::new(RefCell::new(move |_prev: Option<Box<dyn Any>>| {
            let value = read_int(cell);
            // unconditional self-retrigger
            let _ = write_data(cell, Box::new(value + 1));
            Box::new(value) as Box<dyn Any>
        }));
        let result = create_computation(func);
        assert!(matches!(
            result,
            Err(ReactiveError::RunawayUpdate { iterations: 17 })
        ));

        // the scheduler reset: ordinary work proceeds
        set_max_update_iterations(DEFAULT_MAX_ITERATIONS);
        let other = int_cell(7);
        assert_eq!(read_int(other), 7);
        write_data(other, Box::new(9i32)).expect("engine usable after reset");
        assert_eq!(read_int(other), 9);
    }

    #[test]
    fn dispose_detaches_dependent_edges() {
        let cell = int_cell(1);
        let func: ComputeFn = Rc::new(RefCell::new(move |_prev: Option<Box<dyn Any>>| {
            Box::new(read_int(cell)) as Box<dyn Any>
        }));
        let comp = create_computation(func).expect("creation settles");
        assert_eq!(dependent_count(cell), 1);

        dispose_node(comp);
        assert!(!node_exists(comp));
        assert_eq!(dependent_count(cell), 0);

        // a write after disposal propagates to nobody
        write_data(cell, Box::new(2i32)).expect("write settles");
    }
}
