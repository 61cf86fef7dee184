//! Memos (lazily evaluated derived cells).

use crate::node::{NodeCallback, ReactiveNode};
use crate::root::Root;
use crate::signal::{make_read_signal, ReadSignal};

/// Creates a memoized computation from some signals.
///
/// The output is derived from all the cells that are read within the memo
/// closure. The closure does not run on creation: the value is computed on
/// first read and cached, and recomputed only when one of its transitive
/// dependencies has actually changed value. Dependents are not notified when
/// the recomputed output compares equal to the cached one, which is why the
/// output must implement [`PartialEq`].
///
/// The returned handle is read-only: derived cells cannot be written to.
///
/// # Example
/// ```
/// # use alder_reactive::*;
/// let state = create_signal(0);
/// let double = create_memo(move || state.get() * 2);
///
/// assert_eq!(double.get(), 0);
/// state.set(1);
/// assert_eq!(double.get(), 2);
/// ```
///
/// # Memos chain
/// ```
/// # use alder_reactive::*;
/// let state = create_signal(1);
/// let squared = create_memo(move || state.get() * state.get());
/// let stringified = create_memo(move || squared.get().to_string());
/// assert_eq!(stringified.get_clone(), "1");
/// state.set(3);
/// assert_eq!(stringified.get_clone(), "9");
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_memo<T>(mut f: impl FnMut() -> T + 'static) -> ReadSignal<T>
where
    T: PartialEq + 'static,
{
    let callback = NodeCallback::Memo(Box::new(move |slot| {
        let new = f();
        match slot.as_mut().and_then(|value| value.downcast_mut::<T>()) {
            Some(old) if *old == new => false,
            Some(old) => {
                *old = new;
                true
            }
            None => {
                *slot = Some(Box::new(new));
                true
            }
        }
    }));
    let id = Root::with(|root| root.nodes.borrow_mut().insert(ReactiveNode::memo(callback)));
    make_read_signal(id)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn memo() {
        let state = create_signal(0);
        let double = create_memo(move || state.get() * 2);

        assert_eq!(double.get(), 0);
        state.set(1);
        assert_eq!(double.get(), 2);
        state.set(2);
        assert_eq!(double.get(), 4);
    }

    #[test]
    fn memo_is_lazy_and_cached() {
        let state = create_signal(0);
        let runs = Rc::new(Cell::new(0));
        let double = create_memo({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                state.get() * 2
            }
        });
        // Nothing runs until the first read.
        assert_eq!(runs.get(), 0);

        assert_eq!(double.get(), 0);
        assert_eq!(double.get(), 0);
        assert_eq!(runs.get(), 1); // cached between reads

        state.set(2);
        assert_eq!(runs.get(), 1); // no subscriber, still lazy
        assert_eq!(double.get(), 4);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn dependency_on_memo() {
        let state = create_signal(0);
        let double = create_memo(move || state.get() * 2);
        let quadruple = create_memo(move || double.get() * 2);

        assert_eq!(quadruple.get(), 0);
        state.set(1);
        assert_eq!(quadruple.get(), 4);
    }

    #[test]
    fn diamond_recomputes_once() {
        let a = create_signal("a".to_string());
        let b = create_memo(move || a.get_clone());
        let c = create_memo(move || a.get_clone());
        let runs = Rc::new(Cell::new(0));
        let d = create_memo({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                format!("{} {}", b.get_clone(), c.get_clone())
            }
        });

        assert_eq!(d.get_clone(), "a a");
        assert_eq!(runs.get(), 1);

        a.set("aa".to_string());
        assert_eq!(d.get_clone(), "aa aa");
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn diamond_effect_runs_once_per_write() {
        let a = create_signal(0);
        let b = create_memo(move || a.get() + 1);
        let c = create_memo(move || a.get() + 2);
        let runs = Rc::new(Cell::new(0));
        create_effect({
            let runs = runs.clone();
            move || {
                let _ = b.get() + c.get();
                runs.set(runs.get() + 1);
            }
        });
        assert_eq!(runs.get(), 1);

        a.set(1);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn unchanged_output_stops_propagation() {
        let a = create_signal("a".to_string());
        let constant = create_memo({
            move || {
                a.track();
                "foo"
            }
        });
        let runs = Rc::new(Cell::new(0));
        let dependent = create_memo({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                constant.get()
            }
        });

        assert_eq!(dependent.get(), "foo");
        a.set("aa".to_string());
        assert_eq!(dependent.get(), "foo");
        // The middle memo re-ran but produced an equal value, so the
        // dependent never did.
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn effect_skipped_when_memo_output_unchanged() {
        let a = create_signal(0);
        let parity = create_memo(move || a.get() % 2);
        let runs = Rc::new(Cell::new(0));
        create_effect({
            let runs = runs.clone();
            move || {
                let _ = parity.get();
                runs.set(runs.get() + 1);
            }
        });
        assert_eq!(runs.get(), 1);

        a.set(2); // parity unchanged
        assert_eq!(runs.get(), 1);

        a.set(3);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn lazy_subscription() {
        let a = create_signal(0);
        let runs = Rc::new(Cell::new(0));
        let b = create_memo({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                a.get()
            }
        });
        assert_eq!(b.get(), 0);
        assert_eq!(runs.get(), 1);

        // Without a subscriber, writes do not invoke the memo closure.
        a.set(1);
        a.set(2);
        assert_eq!(runs.get(), 1);

        // An effect subscription activates it.
        create_effect(move || {
            let _ = b.get();
        });
        assert_eq!(runs.get(), 2);
        a.set(3);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn untracked_dependencies_are_not_tracked() {
        let state = create_signal(1);
        let double = create_memo(move || state.get_untracked() * 2);

        assert_eq!(double.get(), 2);
        state.set(2);
        // Still the old value: the read was untracked.
        assert_eq!(double.get(), 2);
    }

    #[test]
    fn memos_should_recreate_dependencies_each_time() {
        let condition = create_signal(true);
        let state1 = create_signal(0);
        let state2 = create_signal(1);
        let runs = Rc::new(Cell::new(0));

        let switch = create_memo({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                if condition.get() {
                    state1.get()
                } else {
                    state2.get()
                }
            }
        });
        create_effect(move || {
            let _ = switch.get();
        });
        assert_eq!(runs.get(), 1);

        state1.set(1);
        assert_eq!(runs.get(), 2);

        state2.set(2);
        assert_eq!(runs.get(), 2); // not tracked

        condition.set(false);
        assert_eq!(runs.get(), 3);

        state1.set(2);
        assert_eq!(runs.get(), 3); // not tracked

        state2.set(3);
        assert_eq!(runs.get(), 4); // tracked after condition.set
    }

    #[test]
    fn peek_matches_value() {
        let state = create_signal(2);
        let double = create_memo(move || state.get() * 2);
        assert_eq!(double.get_untracked(), 4);
        assert_eq!(double.get(), 4);

        state.set(3);
        assert_eq!(double.get_untracked(), 6);
        assert_eq!(double.get(), 6);
    }

    #[test]
    fn self_dependent_memo_is_a_cycle() {
        let trigger = create_signal(0);
        let own_handle: Rc<Cell<Option<ReadSignal<i32>>>> = Rc::new(Cell::new(None));
        let memo = create_memo({
            let own_handle = own_handle.clone();
            move || {
                trigger.track();
                match own_handle.get() {
                    Some(own) => own.get_untracked(),
                    None => 0,
                }
            }
        });
        assert_eq!(memo.get(), 0);
        own_handle.set(Some(memo));

        trigger.set(1);
        let err = catch_unwind(AssertUnwindSafe(|| memo.get())).unwrap_err();
        assert_eq!(err.downcast_ref::<ReactiveError>(), Some(&ReactiveError::Cycle));
    }

    #[test]
    fn mutual_memo_cycle_is_detected() {
        let trigger = create_signal(0);
        let head_handle: Rc<Cell<Option<ReadSignal<i32>>>> = Rc::new(Cell::new(None));

        let first = create_memo({
            let head_handle = head_handle.clone();
            move || {
                trigger.track();
                match head_handle.get() {
                    Some(head) => head.get(),
                    None => 0,
                }
            }
        });
        let second = create_memo(move || first.get());
        let third = create_memo(move || second.get());
        let fourth = create_memo(move || third.get());
        assert_eq!(fourth.get(), 0);
        head_handle.set(Some(fourth));

        trigger.set(1);
        let err = catch_unwind(AssertUnwindSafe(|| fourth.get())).unwrap_err();
        assert_eq!(err.downcast_ref::<ReactiveError>(), Some(&ReactiveError::Cycle));
    }

    #[test]
    fn panics_are_captured_and_recovered_from() {
        let state = create_signal(0);
        let fallible = create_memo(move || {
            let value = state.get();
            if value == 1 {
                panic!("bad state");
            }
            value
        });
        let recovering = create_memo(move || {
            catch_unwind(AssertUnwindSafe(|| fallible.get())).unwrap_or(-1)
        });

        assert_eq!(recovering.get(), 0);

        state.set(1);
        assert_eq!(recovering.get(), -1);

        state.set(2);
        assert_eq!(recovering.get(), 2);
    }

    #[test]
    fn captured_panic_reraises_until_recompute() {
        let state = create_signal(1);
        let fallible = create_memo(move || {
            if state.get() == 1 {
                panic!("bad state");
            }
            state.get()
        });

        assert!(catch_unwind(AssertUnwindSafe(|| fallible.get())).is_err());
        // Still the same captured panic on a second read.
        assert!(catch_unwind(AssertUnwindSafe(|| fallible.get())).is_err());

        state.set(5);
        assert_eq!(fallible.get(), 5);
    }
}
