//! The engine context: evaluation state, batching, and the effect queue.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::resume_unwind;

use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::node::{Link, LinkId, NodeFlags, NodeId, ReactiveNode};

/// The struct managing the state of the reactive system. One per thread,
/// created lazily on first use; state is disjoint across threads.
pub(crate) struct Root {
    /// All reactive records: signals, memos, and effects.
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    /// All dependency edges.
    pub links: RefCell<SlotMap<LinkId, Link>>,
    /// The consumer currently evaluating, if any.
    pub eval_context: Cell<Option<NodeId>>,
    /// Nesting depth of open batches.
    pub batch_depth: Cell<u32>,
    /// Drain passes performed by the current outermost batch. Guards against
    /// runaway feedback within one batch.
    pub batch_iteration: Cell<u32>,
    /// Head of the pending-effects queue, linked through `next_queued`.
    pub pending_effects: Cell<Option<NodeId>>,
    /// Nesting depth of untracked scopes.
    pub untracked_depth: Cell<u32>,
}

thread_local! {
    static ROOT: Root = Root::new();
}

impl Root {
    fn new() -> Self {
        Self {
            nodes: RefCell::new(SlotMap::with_key()),
            links: RefCell::new(SlotMap::with_key()),
            eval_context: Cell::new(None),
            batch_depth: Cell::new(0),
            batch_iteration: Cell::new(0),
            pending_effects: Cell::new(None),
            untracked_depth: Cell::new(0),
        }
    }

    /// Access the current thread's root.
    pub fn with<R>(f: impl FnOnce(&Root) -> R) -> R {
        ROOT.with(f)
    }

    pub fn start_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    /// Close a batch, draining the pending-effects queue when this was the
    /// outermost one. Re-raises the first panic captured during the drain.
    pub fn end_batch(&self) {
        if let Some(payload) = self.end_batch_internal() {
            resume_unwind(payload);
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn end_batch_internal(&self) -> Option<Box<dyn Any + Send>> {
        if self.batch_depth.get() > 1 {
            self.batch_depth.set(self.batch_depth.get() - 1);
            return None;
        }
        let mut first_error: Option<Box<dyn Any + Send>> = None;
        while let Some(head) = self.pending_effects.take() {
            self.batch_iteration.set(self.batch_iteration.get() + 1);
            // Detach the whole queue up front; effects notified from here on
            // enqueue into a fresh queue picked up by the next pass.
            let mut queue: SmallVec<[NodeId; 8]> = SmallVec::new();
            {
                let mut nodes = self.nodes.borrow_mut();
                let mut cursor = Some(head);
                while let Some(id) = cursor {
                    let Some(node) = nodes.get_mut(id) else { break };
                    cursor = node.next_queued.take();
                    queue.push(id);
                }
            }
            for id in queue {
                let runnable = {
                    let mut nodes = self.nodes.borrow_mut();
                    let Some(node) = nodes.get_mut(id) else { continue };
                    node.flags.remove(NodeFlags::NOTIFIED);
                    !node.flags.contains(NodeFlags::DISPOSED)
                };
                if runnable && self.needs_to_recompute(id) {
                    if let Err(payload) = self.run_effect(id) {
                        first_error.get_or_insert(payload);
                    }
                }
            }
        }
        self.batch_iteration.set(0);
        self.batch_depth.set(self.batch_depth.get() - 1);
        first_error
    }

    /// Link an effect onto the head of the pending queue.
    pub fn enqueue_effect(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if let Some(node) = nodes.get_mut(id) {
            node.next_queued = self.pending_effects.get();
            self.pending_effects.set(Some(id));
        }
    }

    /// Splice an effect out of the pending queue, if present.
    pub fn unqueue_effect(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        let mut prev: Option<NodeId> = None;
        let mut cursor = self.pending_effects.get();
        while let Some(current) = cursor {
            if current == id {
                let next = nodes[current].next_queued.take();
                match prev {
                    Some(prev) => nodes[prev].next_queued = next,
                    None => self.pending_effects.set(next),
                }
                return;
            }
            prev = Some(current);
            cursor = nodes.get(current).and_then(|node| node.next_queued);
        }
    }
}

/// Batch signal writes together and only run effects once at the end of the
/// scope.
///
/// Returns the closure's result. Nested batches flush only when the outermost
/// one exits.
///
/// # Example
///
/// ```
/// # use alder_reactive::*;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let greeting = create_signal("a".to_string());
/// let name = create_signal("b".to_string());
/// let runs = Rc::new(Cell::new(0));
/// create_effect({
///     let runs = runs.clone();
///     move || {
///         let _ = format!("{greeting} {name}");
///         runs.set(runs.get() + 1);
///     }
/// });
/// assert_eq!(runs.get(), 1);
/// batch(move || {
///     greeting.set("A".to_string());
///     name.set("B".to_string());
/// });
/// assert_eq!(runs.get(), 2);
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    Root::with(|root| {
        if root.batch_depth.get() > 0 {
            return f();
        }
        // The guard only fires when `f` unwinds; the drain error of a normal
        // exit propagates from the explicit `end_batch` below.
        struct BatchGuard<'a>(&'a Root);
        impl Drop for BatchGuard<'_> {
            fn drop(&mut self) {
                let _ = self.0.end_batch_internal();
            }
        }
        root.start_batch();
        let guard = BatchGuard(root);
        let ret = f();
        std::mem::forget(guard);
        root.end_batch();
        ret
    })
}

/// Run the passed closure without tracking any signal reads.
///
/// # Example
///
/// ```
/// # use alder_reactive::*;
/// let state = create_signal(1);
/// let double = create_memo(move || untrack(|| state.get() * 2));
/// assert_eq!(double.get(), 2);
///
/// state.set(2);
/// // The memo still holds the old value because the read was untracked.
/// assert_eq!(double.get(), 2);
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    Root::with(|root| {
        if root.untracked_depth.get() > 0 {
            return f();
        }
        struct UntrackGuard<'a> {
            root: &'a Root,
            prev: Option<NodeId>,
        }
        impl Drop for UntrackGuard<'_> {
            fn drop(&mut self) {
                self.root
                    .untracked_depth
                    .set(self.root.untracked_depth.get() - 1);
                self.root.eval_context.set(self.prev);
            }
        }
        let prev = root.eval_context.take();
        root.untracked_depth.set(root.untracked_depth.get() + 1);
        let _guard = UntrackGuard { root, prev };
        f()
    })
}
