//! Computation Implementation
//!
//! A Computation is a derived value produced by re-running a closure
//! whenever anything it read on its previous run changes.
//!
//! # How Computations Work
//!
//! 1. On creation, the closure runs once to produce the initial value and
//!    discover the initial dependency set.
//!
//! 2. When a dependency changes, the computation re-runs during the same
//!    propagation pass, after every dependency it reads has settled and
//!    exactly once per pass, no matter how many paths reach it.
//!
//! 3. Each re-run rediscovers dependencies from scratch: a source the new
//!    run does not read stops waking the computation.
//!
//! # Ownership
//!
//! Computations created while another computation is running are owned by
//! it: they are disposed (cleanups included) when the owner re-runs or is
//! disposed. Computations created at top level, outside any `root`, can
//! never be disposed.
//!
//! # Accumulators
//!
//! `with_seed` threads the previous value into each run, for
//! accumulator-style computations such as counters and folds.

use std::any::Any;
use std::cell::RefCell;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::graph::scheduler;
use crate::graph::{ComputeFn, NodeId};

use super::scope::sample;
use super::signal::Signal;

/// A derived, automatically re-evaluated value.
///
/// The handle reads like a cell: `get` returns the cached value and
/// registers the running computation, if any, as a dependent.
pub struct Computation<T: 'static> {
    id: NodeId,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for Computation<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Computation<T> {}

impl<T> Computation<T>
where
    T: Clone + 'static,
{
    /// Create a computation from a closure and run it once.
    ///
    /// # Panics
    ///
    /// Panics if the initial settle faults (for example, the closure's
    /// writes never stop re-triggering it).
    pub fn new<F>(mut f: F) -> Self
    where
        F: FnMut() -> T + 'static,
    {
        let func: ComputeFn = Rc::new(RefCell::new(move |_prev: Option<Box<dyn Any>>| {
            Box::new(f()) as Box<dyn Any>
        }));
        Self::create(func)
    }

    /// Create an accumulator-style computation seeded with a prior value.
    ///
    /// The closure receives the value produced by the previous run, or the
    /// seed on the first run.
    pub fn with_seed<F>(seed: T, mut f: F) -> Self
    where
        F: FnMut(T) -> T + 'static,
    {
        let mut seed = Some(seed);
        let func: ComputeFn = Rc::new(RefCell::new(move |prev: Option<Box<dyn Any>>| {
            let prev = match prev {
                Some(value) => *value.downcast::<T>().expect("computation value type"),
                None => seed.take().expect("seed is consumed by the first run"),
            };
            Box::new(f(prev)) as Box<dyn Any>
        }));
        Self::create(func)
    }

    /// Create a computation with statically declared dependencies.
    ///
    /// The listed sources are tracked; the body runs sampled, so nothing
    /// it reads subscribes. The computation re-runs exactly when one of
    /// `deps` changes.
    pub fn on<D, F>(deps: D, mut f: F) -> Self
    where
        D: Observable + 'static,
        F: FnMut() -> T + 'static,
    {
        Self::new(move || {
            deps.track();
            sample(|| f())
        })
    }

    /// As [`Computation::on`], threading the previous value into each run.
    pub fn on_with_seed<D, F>(deps: D, seed: T, mut f: F) -> Self
    where
        D: Observable + 'static,
        F: FnMut(T) -> T + 'static,
    {
        Self::with_seed(seed, move |prev| {
            deps.track();
            sample(|| f(prev))
        })
    }

    fn create(func: ComputeFn) -> Self {
        match scheduler::create_computation(func) {
            Ok(id) => Self {
                id,
                _marker: PhantomData,
            },
            Err(err) => panic!("reactive engine fault while creating computation: {err}"),
        }
    }

    /// Get the computation's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value.
    ///
    /// If a computation is running and not sampling, it becomes a
    /// dependent of this one. A stale value is brought current first.
    ///
    /// # Panics
    ///
    /// Panics if the computation reads itself while running (a circular
    /// dependency), or if it has been disposed.
    pub fn get(&self) -> T {
        scheduler::touch_computation(self.id);
        self.read_value()
    }

    /// Get the current value without registering a dependency.
    ///
    /// # Panics
    ///
    /// As [`Computation::get`].
    pub fn get_untracked(&self) -> T {
        scheduler::touch_computation_untracked(self.id);
        self.read_value()
    }

    /// Dispose of the computation: owned children first, leaves before
    /// root, then its cleanups with the final flag. Idempotent. During an
    /// active pass the disposal is deferred until the pass settles.
    pub fn dispose(&self) {
        scheduler::dispose_node(self.id);
    }

    /// Check whether the computation has been disposed or its disposal is
    /// already queued.
    pub fn is_disposed(&self) -> bool {
        scheduler::computation_disposed(self.id)
    }

    fn read_value(&self) -> T {
        scheduler::with_computation_value(self.id, |value| {
            value
                .downcast_ref::<T>()
                .expect("computation value type")
                .clone()
        })
    }
}

impl<T> Debug for Computation<T>
where
    T: Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Computation");
        s.field("id", &self.id.raw());
        s.field("disposed", &self.is_disposed());
        s.finish()
    }
}

/// Something a computation can subscribe to.
///
/// `track` registers the receiver as a dependency of the running
/// computation without producing a value. Tuples track each member, which
/// is how [`Computation::on`] accepts several sources at once.
pub trait Observable {
    /// Register the receiver as a dependency of the running computation.
    fn track(&self);
}

impl<T> Observable for Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    fn track(&self) {
        scheduler::touch_data(self.id());
    }
}

impl<T> Observable for Computation<T>
where
    T: Clone + 'static,
{
    fn track(&self) {
        scheduler::touch_computation(self.id);
    }
}

impl<O: Observable> Observable for &O {
    fn track(&self) {
        O::track(*self);
    }
}

impl<A: Observable, B: Observable> Observable for (A, B) {
    fn track(&self) {
        self.0.track();
        self.1.track();
    }
}

impl<A: Observable, B: Observable, C: Observable> Observable for (A, B, C) {
    fn track(&self) {
        self.0.track();
        self.1.track();
        self.2.track();
    }
}

impl<A: Observable, B: Observable, C: Observable, D: Observable> Observable for (A, B, C, D) {
    fn track(&self) {
        self.0.track();
        self.1.track();
        self.2.track();
        self.3.track();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::reactive::batch;

    #[test]
    fn computation_runs_on_creation() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let derived = Computation::new(move || {
            counter.set(counter.get() + 1);
            42
        });

        assert_eq!(runs.get(), 1);
        assert_eq!(derived.get(), 42);
        // reads return the cached value without re-running
        assert_eq!(derived.get(), 42);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn computation_reruns_once_per_write() {
        let signal = Signal::new(1);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let doubled = Computation::new(move || {
            counter.set(counter.get() + 1);
            signal.get() * 2
        });
        assert_eq!(doubled.get(), 2);
        assert_eq!(runs.get(), 1);

        signal.set(5).unwrap();
        assert_eq!(doubled.get(), 10);
        assert_eq!(runs.get(), 2);

        signal.set(6).unwrap();
        assert_eq!(doubled.get(), 12);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn with_seed_threads_previous_value() {
        let signal = Signal::new(1);
        let total = Computation::with_seed(0, move |sum| sum + signal.get());
        assert_eq!(total.get(), 1);

        signal.set(2).unwrap();
        assert_eq!(total.get(), 3);

        signal.set(10).unwrap();
        assert_eq!(total.get(), 13);
    }

    #[test]
    fn branch_flip_prunes_stale_dependency() {
        let which = Signal::new(true);
        let a = Signal::new(10);
        let b = Signal::new(20);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let picked = Computation::new(move || {
            counter.set(counter.get() + 1);
            if which.get() {
                a.get()
            } else {
                b.get()
            }
        });
        assert_eq!(picked.get(), 10);
        assert_eq!(runs.get(), 1);

        // while the branch reads `a`, writes to `b` are invisible
        b.set(21).unwrap();
        assert_eq!(runs.get(), 1);

        which.set(false).unwrap();
        assert_eq!(picked.get(), 21);
        assert_eq!(runs.get(), 2);

        // after the flip, writes to `a` no longer wake the computation
        a.set(11).unwrap();
        assert_eq!(runs.get(), 2);

        b.set(22).unwrap();
        assert_eq!(picked.get(), 22);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn on_tracks_only_declared_sources() {
        let trigger = Signal::new(0);
        let data = Signal::new(1);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let snapshot = Computation::on(trigger, move || {
            counter.set(counter.get() + 1);
            data.get()
        });
        assert_eq!(snapshot.get(), 1);
        assert_eq!(runs.get(), 1);

        // the body read `data` sampled, so writing it changes nothing
        data.set(2).unwrap();
        assert_eq!(snapshot.get(), 1);
        assert_eq!(runs.get(), 1);

        // the declared trigger re-runs the body, which sees fresh data
        trigger.set(1).unwrap();
        assert_eq!(snapshot.get(), 2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn on_accepts_tuples_of_sources() {
        let left = Signal::new(1);
        let right = Signal::new(2);
        let hidden = Signal::new(100);

        let sum = Computation::on((left, right), move || {
            left.get_untracked() + right.get_untracked() + hidden.get_untracked()
        });
        assert_eq!(sum.get(), 103);

        hidden.set(200).unwrap();
        assert_eq!(sum.get(), 103);

        left.set(10).unwrap();
        assert_eq!(sum.get(), 212);
    }

    #[test]
    fn disposed_computation_stops_updating() {
        let signal = Signal::new(1);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let derived = Computation::new(move || {
            counter.set(counter.get() + 1);
            signal.get()
        });
        assert_eq!(runs.get(), 1);

        derived.dispose();
        assert!(derived.is_disposed());

        signal.set(2).unwrap();
        assert_eq!(runs.get(), 1);

        // disposing again has no additional effect
        derived.dispose();
        assert!(derived.is_disposed());
    }

    #[test]
    fn batched_writes_settle_once() {
        let a = Signal::new(1);
        let b = Signal::new(2);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();

        let sum = Computation::new(move || {
            counter.set(counter.get() + 1);
            a.get() + b.get()
        });
        assert_eq!(sum.get(), 3);
        assert_eq!(runs.get(), 1);

        batch(|| {
            a.set(10).unwrap();
            b.set(20).unwrap();
        })
        .unwrap();

        assert_eq!(sum.get(), 30);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    #[should_panic(expected = "circular dependency")]
    fn self_read_is_a_circular_dependency() {
        let trigger = Signal::new(0);
        let holder: Rc<Cell<Option<Computation<i32>>>> = Rc::new(Cell::new(None));
        let inner = holder.clone();

        let looped = Computation::new(move || {
            let step = trigger.get();
            match inner.get() {
                Some(me) => me.get() + step,
                None => step,
            }
        });
        holder.set(Some(looped));

        // the re-run reads the computation from inside its own closure
        let _ = trigger.set(1);
    }
}
