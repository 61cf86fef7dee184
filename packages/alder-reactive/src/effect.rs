//! Side effects!

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;

use smallvec::SmallVec;

use crate::error::{raise, ReactiveError};
use crate::node::{LinkId, NodeCallback, NodeFlags, NodeId, NodeType, ReactiveNode};
use crate::root::Root;

/// Teardown closure returned by an effect run. It is invoked before the next
/// run of the effect and when the effect is disposed.
pub type CleanupFn = Box<dyn FnOnce()>;

/// Conversion of an effect closure's return value into an optional teardown.
///
/// Implemented for `()` (no teardown) and for `Option<F>` where `F` is a
/// closure (the teardown to keep), so a single [`create_effect`] covers both:
///
/// ```
/// # use alder_reactive::*;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let state = create_signal(0);
/// let torn_down = Rc::new(Cell::new(0));
/// create_effect({
///     let torn_down = torn_down.clone();
///     move || {
///         let _ = state.get();
///         let torn_down = torn_down.clone();
///         Some(move || torn_down.set(torn_down.get() + 1))
///     }
/// });
/// assert_eq!(torn_down.get(), 0);
/// state.set(1); // the previous run's teardown fires first
/// assert_eq!(torn_down.get(), 1);
/// ```
pub trait EffectCleanup {
    /// Convert the return value into the teardown to retain, if any.
    fn into_cleanup(self) -> Option<CleanupFn>;
}

impl EffectCleanup for () {
    fn into_cleanup(self) -> Option<CleanupFn> {
        None
    }
}

impl<F: FnOnce() + 'static> EffectCleanup for Option<F> {
    fn into_cleanup(self) -> Option<CleanupFn> {
        self.map(|f| Box::new(f) as CleanupFn)
    }
}

/// A handle for disposing an effect created with [`create_effect`].
///
/// Disposing unsubscribes the effect from everything it observed and runs its
/// pending teardown; disposing twice is a no-op.
#[derive(Debug)]
pub struct EffectHandle {
    id: NodeId,
    _phantom: PhantomData<Rc<()>>,
}

impl Clone for EffectHandle {
    fn clone(&self) -> Self {
        *self
    }
}
impl Copy for EffectHandle {}

impl EffectHandle {
    /// Tear the effect down. Subsequent writes to the cells it observed no
    /// longer re-run it.
    pub fn dispose(self) {
        Root::with(|root| root.dispose_effect(self.id));
    }

    /// Whether the effect has been disposed.
    pub fn is_disposed(self) -> bool {
        Root::with(|root| {
            root.nodes
                .borrow()
                .get(self.id)
                .is_none_or(|node| node.flags.contains(NodeFlags::DISPOSED))
        })
    }
}

/// Creates an effect on signals used inside the effect closure.
///
/// The closure runs once immediately and again whenever any cell it read has
/// changed, at most once per batch. Returning a teardown closure (see
/// [`EffectCleanup`]) makes it run before the next run and on disposal.
///
/// # Example
/// ```
/// # use alder_reactive::*;
/// let state = create_signal(0);
///
/// create_effect(move || {
///     println!("new state = {}", state.get());
/// });
/// // Prints "new state = 0"
///
/// state.set(1);
/// // Prints "new state = 1"
/// ```
///
/// `create_effect` should only be used for creating **side-effects**. If you
/// want derived state, you probably want [`create_memo`](crate::create_memo)
/// instead.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect<R: EffectCleanup>(mut f: impl FnMut() -> R + 'static) -> EffectHandle {
    let callback: Box<dyn FnMut() -> Option<CleanupFn>> = Box::new(move || f().into_cleanup());
    Root::with(|root| {
        let id = root
            .nodes
            .borrow_mut()
            .insert(ReactiveNode::effect(NodeCallback::Effect(callback)));
        // A panicking first run tears the effect down before propagating.
        if let Err(payload) = root.run_effect(id) {
            root.dispose_effect(id);
            resume_unwind(payload);
        }
        EffectHandle {
            id,
            _phantom: PhantomData,
        }
    })
}

impl Root {
    /// Run an effect's compute closure inside the start/end bracket.
    ///
    /// The bracket pairs unconditionally: the previous teardown runs first,
    /// the dependency list is primed, a batch is opened and the evaluation
    /// context swapped in; afterwards the dependency list is swept, the
    /// context restored and the batch closed, whether or not the closure
    /// panicked. A panic payload is handed back to the caller.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub(crate) fn run_effect(&self, id: NodeId) -> Result<(), Box<dyn Any + Send>> {
        {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return Ok(());
            };
            if node.flags.contains(NodeFlags::RUNNING) {
                drop(nodes);
                raise(ReactiveError::Cycle);
            }
            node.flags.insert(NodeFlags::RUNNING);
            node.flags.remove(NodeFlags::DISPOSED);
        }
        // A panicking teardown has already disposed the effect and closed its
        // own bracket; hand the payload to the caller like a compute panic.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.run_cleanup(id))) {
            return Err(payload);
        }
        self.prepare_sources(id);
        self.start_batch();
        let prev_context = self.eval_context.replace(Some(id));

        // The teardown may have disposed the effect already; skip the closure
        // then, but still unwind the bracket below.
        let mut callback = {
            let mut nodes = self.nodes.borrow_mut();
            nodes.get_mut(id).and_then(|node| {
                if node.flags.contains(NodeFlags::DISPOSED) {
                    None
                } else {
                    node.callback.take()
                }
            })
        };
        let result = match callback.as_mut() {
            Some(NodeCallback::Effect(f)) => Some(catch_unwind(AssertUnwindSafe(|| f()))),
            _ => None,
        };
        let outcome = {
            let mut nodes = self.nodes.borrow_mut();
            if let Some(callback) = callback {
                if let Some(node) = nodes.get_mut(id) {
                    node.callback = Some(callback);
                }
            }
            match result {
                Some(Ok(cleanup)) => {
                    if let Some(node) = nodes.get_mut(id) {
                        node.cleanup = cleanup;
                    }
                    Ok(())
                }
                Some(Err(payload)) => Err(payload),
                None => Ok(()),
            }
        };

        self.cleanup_sources(id);
        self.eval_context.set(prev_context);
        let disposed = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get_mut(id) {
                Some(node) => {
                    node.flags.remove(NodeFlags::RUNNING);
                    node.flags.contains(NodeFlags::DISPOSED)
                }
                None => false,
            }
        };
        if disposed {
            self.dispose_effect_now(id);
        }
        self.end_batch();
        outcome
    }

    /// Run an effect's stored teardown, outside any evaluation context and
    /// inside a batch. A panicking teardown disposes the effect before the
    /// panic propagates.
    pub(crate) fn run_cleanup(&self, id: NodeId) {
        let cleanup = {
            let mut nodes = self.nodes.borrow_mut();
            nodes.get_mut(id).and_then(|node| node.cleanup.take())
        };
        let Some(cleanup) = cleanup else { return };
        self.start_batch();
        let prev_context = self.eval_context.take();
        let result = catch_unwind(AssertUnwindSafe(cleanup));
        self.eval_context.set(prev_context);
        match result {
            Ok(()) => self.end_batch(),
            Err(payload) => {
                if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
                    node.flags.remove(NodeFlags::RUNNING);
                    node.flags.insert(NodeFlags::DISPOSED);
                }
                self.dispose_effect_now(id);
                let _ = self.end_batch_internal();
                resume_unwind(payload);
            }
        }
    }

    /// Mark an effect disposed. Tear-down happens immediately unless the
    /// effect is currently running, in which case it happens when the run's
    /// bracket closes.
    pub(crate) fn dispose_effect(&self, id: NodeId) {
        let running = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else { return };
            node.flags.insert(NodeFlags::DISPOSED);
            node.flags.contains(NodeFlags::RUNNING)
        };
        if !running {
            self.dispose_effect_now(id);
        }
    }

    /// Full disposal: unsubscribe and free every dependency link, drop the
    /// compute closure, run the pending teardown, unlink from the pending
    /// queue, and free the record.
    pub(crate) fn dispose_effect_now(&self, id: NodeId) {
        let deps: SmallVec<[(NodeId, LinkId); 4]> = {
            let nodes = self.nodes.borrow();
            let links = self.links.borrow();
            let Some(node) = nodes.get(id) else { return };
            debug_assert_eq!(node.ty, NodeType::Effect);
            let mut deps = SmallVec::new();
            let mut cursor = node.dependencies;
            while let Some(link) = cursor {
                deps.push((links[link].source, link));
                cursor = links[link].next_dep;
            }
            deps
        };
        for &(source, link) in &deps {
            self.unsubscribe_link(source, link);
        }
        {
            let mut nodes = self.nodes.borrow_mut();
            let mut links = self.links.borrow_mut();
            for &(_, link) in &deps {
                links.remove(link);
            }
            let node = &mut nodes[id];
            node.callback = None;
            node.dependencies = None;
            node.dependencies_tail = None;
        }
        self.run_cleanup(id);
        let notified = self
            .nodes
            .borrow()
            .get(id)
            .is_some_and(|node| node.flags.contains(NodeFlags::NOTIFIED));
        if notified {
            self.unqueue_effect(id);
        }
        self.nodes.borrow_mut().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn effect() {
        let state = create_signal(0);
        let double = create_signal(-1);

        create_effect(move || {
            double.set(state.get() * 2);
        });
        // Creating the effect runs it once immediately.
        assert_eq!(double.get(), 0);

        state.set(1);
        assert_eq!(double.get(), 2);
        state.set(2);
        assert_eq!(double.get(), 4);
    }

    #[test]
    fn effect_with_explicit_dependencies() {
        let state = create_signal(0);
        let double = create_signal(-1);

        create_effect(on(state, move || {
            double.set(state.get_untracked() * 2);
        }));
        assert_eq!(double.get(), 0);

        state.set(1);
        assert_eq!(double.get(), 2);
    }

    #[test]
    fn effect_should_only_subscribe_once_to_same_signal() {
        let state = create_signal(0);
        let runs = Rc::new(Cell::new(0));
        create_effect({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                // Track twice, subscribe once.
                state.track();
                state.track();
            }
        });
        assert_eq!(runs.get(), 1);

        state.set(1);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn effect_should_recreate_dependencies_each_time() {
        let condition = create_signal(true);
        let state1 = create_signal(0);
        let state2 = create_signal(1);
        let runs = Rc::new(Cell::new(0));

        create_effect({
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                if condition.get() {
                    state1.track();
                } else {
                    state2.track();
                }
            }
        });
        assert_eq!(runs.get(), 1);

        state1.set(1);
        assert_eq!(runs.get(), 2);

        state2.set(1);
        assert_eq!(runs.get(), 2); // not tracked

        condition.set(false);
        assert_eq!(runs.get(), 3);

        state1.set(2);
        assert_eq!(runs.get(), 3); // not tracked

        state2.set(2);
        assert_eq!(runs.get(), 4); // tracked after condition.set
    }

    #[test]
    fn dispose_stops_the_effect() {
        let state = create_signal(0);
        let runs = Rc::new(Cell::new(0));
        let handle = create_effect({
            let runs = runs.clone();
            move || {
                state.track();
                runs.set(runs.get() + 1);
            }
        });
        assert_eq!(runs.get(), 1);

        handle.dispose();
        assert!(handle.is_disposed());

        state.set(1);
        assert_eq!(runs.get(), 1);
        state.set(2);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn double_dispose_is_a_noop() {
        let state = create_signal(0);
        let handle = create_effect(move || {
            state.track();
        });
        handle.dispose();
        handle.dispose();
        assert!(handle.is_disposed());
        state.set(1);
    }

    #[test]
    fn cleanup_runs_before_next_run() {
        let state = create_signal(0);
        let torn_down = Rc::new(Cell::new(0));
        create_effect({
            let torn_down = torn_down.clone();
            move || {
                let _ = state.get();
                let torn_down = torn_down.clone();
                Some(move || torn_down.set(torn_down.get() + 1))
            }
        });
        assert_eq!(torn_down.get(), 0);

        state.set(1);
        assert_eq!(torn_down.get(), 1);

        state.set(2);
        assert_eq!(torn_down.get(), 2);
    }

    #[test]
    fn cleanup_runs_on_dispose() {
        let state = create_signal(0);
        let torn_down = Rc::new(Cell::new(false));
        let handle = create_effect({
            let torn_down = torn_down.clone();
            move || {
                let _ = state.get();
                let torn_down = torn_down.clone();
                Some(move || torn_down.set(true))
            }
        });
        assert!(!torn_down.get());

        handle.dispose();
        assert!(torn_down.get());
    }

    #[test]
    fn effect_runs_once_per_batch() {
        let a = create_signal(1);
        let b = create_signal(2);
        let runs = Rc::new(Cell::new(0));
        create_effect({
            let runs = runs.clone();
            move || {
                let _ = a.get() + b.get();
                runs.set(runs.get() + 1);
            }
        });
        assert_eq!(runs.get(), 1);

        a.set(10);
        b.set(20);
        assert_eq!(runs.get(), 3);

        batch(move || {
            a.set(100);
            b.set(200);
        });
        assert_eq!(runs.get(), 4);
    }

    #[test]
    fn effect_ordering_within_drain() {
        let state = create_signal(0);
        let order = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let order = order.clone();
            create_effect(move || {
                state.track();
                order.borrow_mut().push(name);
            });
        }
        order.borrow_mut().clear();
        state.set(1);
        // Every notified effect runs exactly once per drain.
        let mut ran = order.borrow().clone();
        ran.sort_unstable();
        assert_eq!(ran, vec!["a", "b"]);
    }

    #[test]
    fn self_feeding_effect_is_a_cycle() {
        let state = create_signal(0);
        let err = catch_unwind(AssertUnwindSafe(|| {
            create_effect(move || {
                let current = state.get();
                state.set(current + 1);
            });
        }))
        .unwrap_err();
        assert_eq!(err.downcast_ref::<ReactiveError>(), Some(&ReactiveError::Cycle));
    }

    #[test]
    fn panicking_first_run_disposes_and_propagates() {
        let state = create_signal(0);
        let result = catch_unwind(AssertUnwindSafe(|| {
            create_effect::<()>(move || {
                let _ = state.get();
                panic!("boom");
            });
        }));
        assert!(result.is_err());
        // The failed effect no longer re-runs.
        state.set(1);
    }

    #[test]
    fn panicking_rerun_propagates_after_the_drain() {
        let state = create_signal(0);
        let survivor_runs = Rc::new(Cell::new(0));
        create_effect(move || {
            if state.get() == 1 {
                panic!("boom");
            }
        });
        create_effect({
            let survivor_runs = survivor_runs.clone();
            move || {
                state.track();
                survivor_runs.set(survivor_runs.get() + 1);
            }
        });
        assert_eq!(survivor_runs.get(), 1);

        let result = catch_unwind(AssertUnwindSafe(|| state.set(1)));
        assert!(result.is_err());
        // The drain keeps going past the panicking effect.
        assert_eq!(survivor_runs.get(), 2);
    }

    #[test]
    fn panicking_cleanup_disposes_and_propagates() {
        let state = create_signal(0);
        let handle = create_effect(move || {
            let _ = state.get();
            Some(|| panic!("teardown failed"))
        });
        let result = catch_unwind(AssertUnwindSafe(|| state.set(1)));
        assert!(result.is_err());
        assert!(handle.is_disposed());
        // Further writes are inert.
        state.set(2);
    }

    #[test]
    fn dispose_inside_batch() {
        let state = create_signal(0);
        let runs = Rc::new(Cell::new(0));
        let handle = create_effect({
            let runs = runs.clone();
            move || {
                state.track();
                runs.set(runs.get() + 1);
            }
        });
        batch(move || {
            state.set(1);
            handle.dispose();
        });
        // Disposed while queued: the drain skips it.
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn effect_disposing_itself_mid_run() {
        let state = create_signal(0);
        let handle: Rc<Cell<Option<EffectHandle>>> = Rc::new(Cell::new(None));
        let runs = Rc::new(Cell::new(0));
        let created = create_effect({
            let handle = handle.clone();
            let runs = runs.clone();
            move || {
                state.track();
                runs.set(runs.get() + 1);
                if state.get_untracked() > 0 {
                    if let Some(handle) = handle.get() {
                        handle.dispose();
                    }
                }
            }
        });
        handle.set(Some(created));
        state.set(1);
        assert_eq!(runs.get(), 2);
        assert!(created.is_disposed());

        state.set(2);
        assert_eq!(runs.get(), 2);
    }
}
