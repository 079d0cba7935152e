//! Dependency Graph
//!
//! This module implements the dependency graph and the update scheduler
//! that drives it: the arena of data cells and computations, the edge
//! records connecting them, the clock tree of logical-time domains, and
//! the two-phase propagation algorithm.
//!
//! # Overview
//!
//! The graph is a DAG where nodes are cells (sources) or computations
//! (derived values), and an edge from A to B means B read A on its most
//! recent run. Edges are rediscovered on every run, which is what lets a
//! computation's dependency set change between runs.
//!
//! # Design Decisions
//!
//! 1. The graph is centralized in one arena rather than spread across
//!    reference-counted nodes because:
//!    - It enables the two-phase mark/resolve ordering for batch updates
//!    - Edge detach is O(1) slot invalidation from either end
//!    - Cyclic node-edge-node references reduce to plain index pairs
//!
//! 2. The arena is indexed by node ID for O(1) lookups, and IDs are never
//!    reused, so stale handles can only miss, never alias.
//!
//! 3. Every node keeps a dependents log (reverse edges) so invalidation
//!    walks exactly the affected subgraph and never re-scans the whole
//!    graph.

mod clock;
mod node;
mod queue;
pub(crate) mod scheduler;

pub use clock::ClockId;
pub use node::NodeId;
pub use queue::Queue;

pub(crate) use node::{eq_any, ComputeFn};
