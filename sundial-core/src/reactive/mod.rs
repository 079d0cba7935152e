//! Reactive Primitives
//!
//! This module implements the typed public surface of the engine: signals,
//! computations, reactive sequences, and the scope operations.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a cell holding mutable state. When a signal is read while a
//! computation is running, the signal registers that computation as a
//! dependent. When the signal's value changes, exactly the affected
//! computations re-run, in dependency order.
//!
//! ## Computations
//!
//! A Computation is a derived value produced by re-running a closure. Its
//! dependencies are rediscovered on every run, so an `if` that stops
//! reading a cell also stops the computation from being woken by it.
//! Computations created during a run are owned by the running computation
//! and are disposed when it re-runs or is disposed.
//!
//! ## Scopes
//!
//! `root` opens an ownership scope with an explicit disposer, `batch`
//! coalesces writes into a single settle, `sample` reads without
//! subscribing, `subclock` opens an independently batched time domain, and
//! `on_cleanup` registers teardown callbacks on the current scope.
//!
//! # Implementation Notes
//!
//! Dependency capture uses a thread-local scheduler context: while a
//! computation's closure runs, the scheduler records every cell and
//! computation it reads. The engine is single-threaded; handles are cheap
//! `Copy` ids into a thread-local arena and are deliberately not `Send`.

mod computation;
mod scope;
mod signal;
mod vec;

pub use computation::{Computation, Observable};
pub use scope::{
    batch, on_cleanup, root, sample, set_max_update_iterations, subclock, RootScope,
};
pub use signal::Signal;
pub use vec::ReactiveVec;
