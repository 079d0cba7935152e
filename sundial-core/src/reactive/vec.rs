//! Reactive Sequence
//!
//! A batched-mutation reactive sequence built purely on top of the signal
//! and computation primitives; the graph needs no special support for it.
//!
//! # How It Works
//!
//! Mutators do not touch the backing storage directly. Each call enqueues
//! a mutation record and, once per settle window, bumps an internal
//! generation cell. A single derived computation subscribes to the
//! generation, drains the queue against the backing storage, and publishes
//! a snapshot. Readers depend on that computation, so any number of
//! mutations inside one batch produce exactly one downstream re-run, and
//! the single generation write per window never trips the conflicting-
//! write rule.

use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

use crate::error::ReactiveError;

use super::computation::{Computation, Observable};
use super::signal::Signal;

/// A queued structural edit.
enum Mutation<T> {
    Push(T),
    Pop,
    Insert(usize, T),
    Remove(usize),
    Set(usize, T),
    Clear,
    Replace(Vec<T>),
}

/// A reactive sequence of values.
///
/// Reads subscribe the running computation to the sequence as a whole;
/// mutations made inside one batch are observed exactly once.
pub struct ReactiveVec<T: 'static> {
    pending: Rc<RefCell<Vec<Mutation<T>>>>,
    generation: Signal<u64>,
    contents: Computation<Vec<T>>,
}

impl<T: 'static> Clone for ReactiveVec<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Rc::clone(&self.pending),
            generation: self.generation,
            contents: self.contents,
        }
    }
}

impl<T> ReactiveVec<T>
where
    T: Clone + 'static,
{
    /// Create a reactive sequence with the given initial items, owned by
    /// the current scope if one is active.
    pub fn new(initial: Vec<T>) -> Self {
        let base = Rc::new(RefCell::new(initial));
        let pending: Rc<RefCell<Vec<Mutation<T>>>> = Rc::new(RefCell::new(Vec::new()));
        let generation = Signal::new(0u64);
        let contents = Computation::new({
            let base = Rc::clone(&base);
            let pending = Rc::clone(&pending);
            move || {
                generation.get();
                let mut items = base.borrow_mut();
                for mutation in pending.borrow_mut().drain(..) {
                    apply(&mut items, mutation);
                }
                items.clone()
            }
        });
        Self {
            pending,
            generation,
            contents,
        }
    }

    /// Append a value.
    pub fn push(&self, value: T) -> Result<(), ReactiveError> {
        self.enqueue(Mutation::Push(value))
    }

    /// Remove the last value, if any.
    pub fn pop(&self) -> Result<(), ReactiveError> {
        self.enqueue(Mutation::Pop)
    }

    /// Insert a value at `index`, clamped to the sequence length at apply
    /// time.
    pub fn insert(&self, index: usize, value: T) -> Result<(), ReactiveError> {
        self.enqueue(Mutation::Insert(index, value))
    }

    /// Remove the value at `index`. Out of range at apply time, the edit
    /// is ignored.
    pub fn remove(&self, index: usize) -> Result<(), ReactiveError> {
        self.enqueue(Mutation::Remove(index))
    }

    /// Overwrite the value at `index`. Out of range at apply time, the
    /// edit is ignored.
    pub fn set(&self, index: usize, value: T) -> Result<(), ReactiveError> {
        self.enqueue(Mutation::Set(index, value))
    }

    /// Remove every value.
    pub fn clear(&self) -> Result<(), ReactiveError> {
        self.enqueue(Mutation::Clear)
    }

    /// Replace the whole sequence.
    pub fn replace(&self, values: Vec<T>) -> Result<(), ReactiveError> {
        self.enqueue(Mutation::Replace(values))
    }

    /// Snapshot the sequence, subscribing the running computation.
    pub fn read(&self) -> Vec<T> {
        self.contents.get()
    }

    /// Snapshot the sequence without subscribing.
    pub fn read_untracked(&self) -> Vec<T> {
        self.contents.get_untracked()
    }

    /// Number of items (a tracked read).
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the sequence is empty (a tracked read).
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// The item at `index`, if any (a tracked read).
    pub fn get(&self, index: usize) -> Option<T> {
        self.read().get(index).cloned()
    }

    /// Derive a sequence by mapping each item.
    pub fn map<U, F>(&self, mut f: F) -> Computation<Vec<U>>
    where
        U: Clone + 'static,
        F: FnMut(&T) -> U + 'static,
    {
        let this = self.clone();
        Computation::new(move || this.read().iter().map(&mut f).collect())
    }

    fn enqueue(&self, mutation: Mutation<T>) -> Result<(), ReactiveError> {
        let first = {
            let mut pending = self.pending.borrow_mut();
            pending.push(mutation);
            pending.len() == 1
        };
        if first {
            // one generation bump per settle window; later mutations in
            // the same window ride along on the queued edit list
            let next = self.generation.get_untracked() + 1;
            self.generation.set(next)
        } else {
            Ok(())
        }
    }
}

impl<T> Observable for ReactiveVec<T>
where
    T: Clone + 'static,
{
    fn track(&self) {
        self.contents.track();
    }
}

impl<T> Debug for ReactiveVec<T>
where
    T: Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveVec")
            .field("items", &self.read_untracked())
            .finish()
    }
}

fn apply<T>(items: &mut Vec<T>, mutation: Mutation<T>) {
    match mutation {
        Mutation::Push(value) => items.push(value),
        Mutation::Pop => {
            items.pop();
        }
        Mutation::Insert(index, value) => {
            let index = index.min(items.len());
            items.insert(index, value);
        }
        Mutation::Remove(index) => {
            if index < items.len() {
                items.remove(index);
            }
        }
        Mutation::Set(index, value) => {
            if let Some(slot) = items.get_mut(index) {
                *slot = value;
            }
        }
        Mutation::Clear => items.clear(),
        Mutation::Replace(values) => *items = values,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::reactive::batch;

    #[test]
    fn mutators_apply_in_order() {
        let vec = ReactiveVec::new(vec![1, 2, 3]);
        assert_eq!(vec.read(), vec![1, 2, 3]);

        vec.push(4).unwrap();
        assert_eq!(vec.read(), vec![1, 2, 3, 4]);

        vec.pop().unwrap();
        vec.insert(0, 0).unwrap();
        assert_eq!(vec.read(), vec![0, 1, 2, 3]);

        vec.remove(1).unwrap();
        assert_eq!(vec.read(), vec![0, 2, 3]);

        vec.set(2, 9).unwrap();
        assert_eq!(vec.read(), vec![0, 2, 9]);

        vec.replace(vec![5, 6]).unwrap();
        assert_eq!(vec.read(), vec![5, 6]);

        vec.clear().unwrap();
        assert!(vec.is_empty());
    }

    #[test]
    fn out_of_range_edits_are_ignored() {
        let vec = ReactiveVec::new(vec![1]);
        vec.remove(10).unwrap();
        vec.set(10, 9).unwrap();
        vec.insert(10, 2).unwrap();
        // the insert clamped to the end
        assert_eq!(vec.read(), vec![1, 2]);
    }

    #[test]
    fn batched_mutations_settle_once() {
        let vec = ReactiveVec::new(vec![1]);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let observed = {
            let vec = vec.clone();
            Computation::new(move || {
                counter.set(counter.get() + 1);
                vec.read()
            })
        };
        assert_eq!(runs.get(), 1);

        batch(|| {
            vec.push(2).unwrap();
            vec.push(3).unwrap();
            vec.remove(0).unwrap();
        })
        .unwrap();

        // three edits, one re-run, final state only
        assert_eq!(runs.get(), 2);
        assert_eq!(observed.get(), vec![2, 3]);
    }

    #[test]
    fn sequential_mutations_settle_individually() {
        let vec = ReactiveVec::new(Vec::new());
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let _observed = {
            let vec = vec.clone();
            Computation::new(move || {
                counter.set(counter.get() + 1);
                vec.len()
            })
        };
        assert_eq!(runs.get(), 1);

        vec.push(1).unwrap();
        assert_eq!(runs.get(), 2);

        vec.push(2).unwrap();
        assert_eq!(runs.get(), 3);
        assert_eq!(vec.read_untracked(), vec![1, 2]);
    }

    #[test]
    fn map_derives_a_dependent_sequence() {
        let vec = ReactiveVec::new(vec![1, 2]);
        let doubled = vec.map(|value| value * 2);
        assert_eq!(doubled.get(), vec![2, 4]);

        vec.push(5).unwrap();
        assert_eq!(doubled.get(), vec![2, 4, 10]);
    }
}
