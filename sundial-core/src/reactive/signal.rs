//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read while a computation is running, the signal
//!    registers that computation as a dependent.
//!
//! 2. Writing a signal outside any batch applies the value and re-runs the
//!    affected computations before `set` returns. Inside a batch the write
//!    is deferred onto the signal's clock and settles with the batch.
//!
//! 3. Two different values written to one signal in a single pass are a
//!    conflicting-write error; the first write stands.
//!
//! # Ownership
//!
//! A signal created inside a computation or root scope is owned by it and
//! is disposed with it. Signals created at top level are unowned and live
//! for the lifetime of the thread.
//!
//! # Memory Layout
//!
//! The handle is a `Copy` id into the thread-local arena; the value lives
//! in the arena node together with its pending slot and dependents log.

use std::fmt::Debug;
use std::marker::PhantomData;

use crate::error::ReactiveError;
use crate::graph::scheduler;
use crate::graph::{eq_any, NodeId};

/// A reactive cell holding a value of type `T`.
///
/// # Type Parameters
///
/// - `T`: The stored type. `Clone` is needed because reads hand out owned
///   values; `PartialEq` feeds conflicting-write detection.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (affected computations re-run)
/// count.set(5)?;
/// ```
pub struct Signal<T: 'static> {
    id: NodeId,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a new signal with the given initial value, owned by the
    /// current scope if one is active.
    pub fn new(value: T) -> Self {
        Self {
            id: scheduler::create_data(Box::new(value), eq_any::<T>),
            _marker: PhantomData,
        }
    }

    /// Get the signal's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value.
    ///
    /// If a computation is running and not sampling, it becomes a
    /// dependent of this signal.
    ///
    /// # Panics
    ///
    /// Panics if the signal's owning scope has been disposed, or if
    /// settling a foreign clock domain for this read faults.
    pub fn get(&self) -> T {
        scheduler::touch_data(self.id);
        self.read_value()
    }

    /// Get the current value without registering a dependency.
    ///
    /// # Panics
    ///
    /// Panics if the signal's owning scope has been disposed.
    pub fn get_untracked(&self) -> T {
        scheduler::touch_data_untracked(self.id);
        self.read_value()
    }

    /// Set a new value.
    ///
    /// Outside any batch the affected computations have re-run by the time
    /// this returns. Inside a batch the write is deferred; a later write
    /// of a different value to this signal in the same pass is rejected
    /// with [`ReactiveError::ConflictingWrite`].
    pub fn set(&self, value: T) -> Result<(), ReactiveError> {
        scheduler::write_data(self.id, Box::new(value))
    }

    /// Update the value using a function of the current value.
    ///
    /// The read does not register a dependency.
    pub fn update<F>(&self, f: F) -> Result<(), ReactiveError>
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.get_untracked());
        self.set(next)
    }

    fn read_value(&self) -> T {
        scheduler::with_data_value(self.id, |value| {
            value
                .downcast_ref::<T>()
                .expect("signal value type")
                .clone()
        })
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + PartialEq + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Signal");
        s.field("id", &self.id.raw());
        if scheduler::node_exists(self.id) {
            s.field("value", &self.get_untracked());
        } else {
            s.field("value", &"<disposed>");
        }
        s.finish()
    }
}
