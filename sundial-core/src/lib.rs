//! Sundial Core
//!
//! This crate provides the core runtime of the Sundial reactive
//! computation engine. It implements:
//!
//! - Reactive primitives (signals, computations, reactive sequences)
//! - Automatic dependency tracking with per-run rebinding
//! - Glitch-free, topologically ordered update propagation
//! - Hierarchical clock domains with independent batching
//! - Structural ownership with deterministic disposal
//!
//! # Architecture
//!
//! The crate is organized into two layers:
//!
//! - `reactive`: the typed public primitives and scope operations
//! - `graph`: the dependency-graph arena, clock tree, and update scheduler
//!
//! The engine is single-threaded by design: all state lives in a
//! thread-local scheduler, reads and writes are synchronous calls, and
//! propagation recursion is the call stack. Handles are therefore cheap
//! `Copy` values that are deliberately not `Send`.
//!
//! # Example
//!
//! ```rust,ignore
//! use sundial_core::reactive::{batch, Computation, Signal};
//!
//! // Create a cell
//! let count = Signal::new(1);
//!
//! // Create a derived value
//! let doubled = Computation::new(move || count.get() * 2);
//! assert_eq!(doubled.get(), 2);
//!
//! // Update the cell; the computation re-runs before set returns
//! count.set(5).unwrap();
//! assert_eq!(doubled.get(), 10);
//!
//! // Coalesce several writes into one settle
//! batch(|| {
//!     count.set(6).unwrap();
//! }).unwrap();
//! ```

pub mod graph;
pub mod reactive;

mod error;

pub use error::ReactiveError;
