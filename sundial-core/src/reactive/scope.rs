//! Scope Operations
//!
//! Free functions controlling the scheduler context around a region of
//! code: ownership roots, untracked reads, batched writes, sub-clock
//! domains, and cleanup registration.

use crate::error::ReactiveError;
use crate::graph::scheduler;
use crate::graph::NodeId;

/// Handle to a root ownership scope, yielded by [`root`].
///
/// The handle is `Copy`; disposing it tears down every computation, cell,
/// and cleanup created under the scope, leaves before root. Disposal is
/// idempotent.
#[derive(Debug, Clone, Copy)]
pub struct RootScope {
    id: NodeId,
}

impl RootScope {
    /// Dispose the scope and everything it owns.
    ///
    /// During an active pass the disposal is deferred until the pass
    /// settles.
    ///
    /// # Panics
    ///
    /// Panics if a cleanup's writes fault the settle that follows.
    pub fn dispose(&self) {
        scheduler::dispose_node(self.id);
    }
}

/// Run `f` under a fresh root scope that owns everything created inside.
///
/// The scope body runs untracked. The scope is passed to `f` so it can be
/// disposed from inside or handed out for later disposal; a scope that is
/// never disposed lives for the lifetime of the thread.
pub fn root<R>(f: impl FnOnce(RootScope) -> R) -> R {
    scheduler::run_root(|id| f(RootScope { id }))
}

/// Run `f` with dependency registration suppressed.
///
/// Reads inside `f` return current values without subscribing the running
/// computation. Computations created inside still track their own runs as
/// usual.
pub fn sample<R>(f: impl FnOnce() -> R) -> R {
    scheduler::sample(f)
}

/// Run `f` in a batched event scope.
///
/// Writes made inside (at any nesting depth) defer onto their clocks and
/// settle in one pass when the outermost batch closes, so dependents
/// observe only the final state and re-run once.
pub fn batch<R>(f: impl FnOnce() -> R) -> Result<R, ReactiveError> {
    scheduler::batch(f)
}

/// Run `f` under a fresh sub-clock of the current domain.
///
/// Cells and computations created inside belong to the sub-clock, which
/// batches independently: its queues settle before `subclock` returns,
/// and later writes into the domain settle it before any outside reader
/// observes its cells.
pub fn subclock<R>(f: impl FnOnce() -> R) -> Result<R, ReactiveError> {
    scheduler::run_subclock(f)
}

/// Register a cleanup on the currently running computation or root scope.
///
/// The callback runs with `false` each time the owner re-runs, and with
/// `true` exactly once when the owner is disposed.
pub fn on_cleanup<F>(f: F) -> Result<(), ReactiveError>
where
    F: FnOnce(bool) + 'static,
{
    scheduler::register_cleanup(Box::new(f))
}

/// Set the time-step budget after which a propagation pass is declared
/// runaway. The default is 100 000.
pub fn set_max_update_iterations(limit: usize) {
    scheduler::set_max_update_iterations(limit);
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::reactive::{Computation, Signal};

    #[test]
    fn root_disposal_tears_down_owned_subtree() {
        let signal = Signal::new(1);
        let runs = Rc::new(Cell::new(0));
        let cleanups = Rc::new(Cell::new(0));

        let scope = root(|scope| {
            let counter = runs.clone();
            let finals = cleanups.clone();
            let _derived = Computation::new(move || {
                counter.set(counter.get() + 1);
                let _ = on_cleanup({
                    let finals = finals.clone();
                    move |_final| finals.set(finals.get() + 1)
                });
                signal.get()
            });
            scope
        });
        assert_eq!(runs.get(), 1);

        scope.dispose();
        assert_eq!(cleanups.get(), 1);

        // the owned computation is gone; writes reach nobody
        signal.set(2).unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn root_disposal_is_idempotent() {
        let cleanups = Rc::new(Cell::new(0));
        let scope = root(|scope| {
            let finals = cleanups.clone();
            let _ = on_cleanup(move |_final| finals.set(finals.get() + 1));
            scope
        });

        scope.dispose();
        scope.dispose();
        assert_eq!(cleanups.get(), 1);
    }

    #[test]
    fn cleanup_outside_any_scope_is_an_error() {
        let result = on_cleanup(|_final| {});
        assert_eq!(result, Err(ReactiveError::OutsideScope));
    }

    #[test]
    fn cleanup_runs_nonfinal_on_rerun_and_final_on_dispose() {
        let signal = Signal::new(0);
        let log: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));

        let (derived, scope) = root(|scope| {
            let log = log.clone();
            let derived = Computation::new(move || {
                let log = log.clone();
                let _ = on_cleanup(move |is_final| log.borrow_mut().push(is_final));
                signal.get()
            });
            (derived, scope)
        });
        assert_eq!(derived.get(), 0);
        assert!(log.borrow().is_empty());

        signal.set(1).unwrap();
        assert_eq!(*log.borrow(), vec![false]);

        scope.dispose();
        assert_eq!(*log.borrow(), vec![false, true]);
    }

    #[test]
    fn sample_suppresses_tracking_but_not_creation() {
        let outer = Signal::new(1);
        let inner = Signal::new(10);
        let outer_runs = Rc::new(Cell::new(0));
        let inner_runs = Rc::new(Cell::new(0));

        let nested: Rc<Cell<Option<Computation<i32>>>> = Rc::new(Cell::new(None));
        let slot = nested.clone();
        let outer_counter = outer_runs.clone();
        let inner_counter = inner_runs.clone();

        let _watcher = Computation::new(move || {
            outer_counter.set(outer_counter.get() + 1);
            sample(|| {
                // reads in here do not subscribe the watcher
                let _ = outer.get();
                // but computations created in here track normally
                let inner_counter = inner_counter.clone();
                slot.set(Some(Computation::new(move || {
                    inner_counter.set(inner_counter.get() + 1);
                    inner.get()
                })));
            });
        });
        assert_eq!(outer_runs.get(), 1);
        assert_eq!(inner_runs.get(), 1);

        // the sampled read did not subscribe the watcher
        outer.set(2).unwrap();
        assert_eq!(outer_runs.get(), 1);

        // the nested computation tracked its own read
        inner.set(11).unwrap();
        assert_eq!(inner_runs.get(), 2);
        assert_eq!(nested.get().expect("created").get_untracked(), 11);
    }

    #[test]
    fn batch_returns_body_value() {
        let signal = Signal::new(1);
        let value = batch(|| {
            signal.set(2).unwrap();
            "done"
        })
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(signal.get(), 2);
    }

    #[test]
    fn nested_batches_settle_with_the_outermost() {
        let signal = Signal::new(0);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let _watcher = Computation::new(move || {
            counter.set(counter.get() + 1);
            signal.get()
        });
        assert_eq!(runs.get(), 1);

        batch(|| {
            batch(|| {
                signal.set(1).unwrap();
            })
            .unwrap();
            // the inner batch closed without settling
            assert_eq!(runs.get(), 1);
        })
        .unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn subclock_settles_before_returning() {
        let (local, mirror) = subclock(|| {
            let local = Signal::new(1);
            let mirror = Computation::new(move || local.get());
            local.set(5).unwrap();
            // inside the domain the write is still pending
            assert_eq!(mirror.get_untracked(), 1);
            (local, mirror)
        })
        .unwrap();

        // the sub-clock settled on the way out
        assert_eq!(mirror.get_untracked(), 5);
        assert_eq!(local.get(), 5);
    }

    #[test]
    fn root_scope_reads_a_settled_subclock_cell() {
        let cell = subclock(|| Signal::new(7)).unwrap();
        // reading from the root domain settles the sub-clock first
        assert_eq!(cell.get(), 7);

        cell.set(8).unwrap();
        assert_eq!(cell.get(), 8);
    }
}
