//! Error types for the reactive engine.
//!
//! The taxonomy splits into two groups:
//!
//! - Usage errors (`ConflictingWrite`, `OutsideScope`, `Disposed`): the
//!   caller asked for something the current engine state cannot honor. The
//!   offending call is rejected and the engine remains consistent.
//!
//! - Graph-integrity faults (`CircularDependency`, `ClockCycle`,
//!   `RunawayUpdate`): the computation graph itself is structurally
//!   invalid. The in-flight update pass is aborted and the scheduler state
//!   is reset before the error reaches the caller.
//!
//! None of these are retried or swallowed internally.

use thiserror::Error;

/// Errors surfaced by the reactive engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// Two different values were written to the same cell within a single
    /// update pass, before the first write had been applied.
    ///
    /// The first pending write stands; the conflicting one is dropped.
    #[error("conflicting writes: two different values for one cell in a single update pass")]
    ConflictingWrite,

    /// A cleanup was registered while no computation or root scope was
    /// active to own it.
    #[error("cleanup registered outside any computation or root scope")]
    OutsideScope,

    /// A computation read its own value (directly or through a cycle of
    /// forced updates) while it was running.
    #[error("circular dependency: a computation read a node that is currently running")]
    CircularDependency,

    /// A clock domain was asked to come up to date while it was already
    /// running and is not an ancestor of the requesting domain.
    #[error("circular clock dependency between time domains")]
    ClockCycle,

    /// An update pass failed to settle within the configured iteration
    /// budget. This indicates an unconditionally self-re-triggering write.
    #[error("update pass failed to settle after {iterations} time steps")]
    RunawayUpdate {
        /// Number of time steps executed before the pass was aborted.
        iterations: usize,
    },

    /// A write addressed a cell whose owning scope has been disposed.
    #[error("write to a disposed cell")]
    Disposed,
}
