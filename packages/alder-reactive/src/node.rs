//! Graph records and dependency edges.

use std::any::Any;

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::effect::CleanupFn;
use crate::error::CapturedPanic;

new_key_type! {
    /// Key of a reactive record (signal, memo, or effect) in the node arena.
    pub(crate) struct NodeId;
    /// Key of a dependency edge in the link arena.
    pub(crate) struct LinkId;
}

bitflags! {
    /// State word for memos and effects. Signals carry an empty word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        /// The compute closure is currently executing.
        const RUNNING = 1 << 0;
        /// Already notified in the current change epoch (queued for effects).
        const NOTIFIED = 1 << 1;
        /// The cached value may be stale and must be refreshed before use.
        const OUTDATED = 1 << 2;
        /// Permanently torn down; no further work.
        const DISPOSED = 1 << 3;
        /// The cached "value" is a captured panic to re-raise on read.
        const HAS_ERROR = 1 << 4;
        /// Reads by this consumer establish subscriptions.
        const TRACKING = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeType {
    Signal,
    Memo,
    Effect,
}

/// Recompute callback stored on a consumer node.
pub(crate) enum NodeCallback {
    /// Recomputes the cached value in place and reports whether it changed.
    Memo(Box<dyn FnMut(&mut Option<Box<dyn Any>>) -> bool>),
    /// Runs the side effect and returns the next teardown, if any.
    Effect(Box<dyn FnMut() -> Option<CleanupFn>>),
}

/// A reactive record. One per signal, memo, or effect.
///
/// Memos populate both halves: they are a source to their subscribers and a
/// consumer to their dependencies.
pub(crate) struct ReactiveNode {
    pub ty: NodeType,
    /// Payload. Signals and computed memos have one; effects never do.
    pub value: Option<Box<dyn Any>>,
    pub callback: Option<NodeCallback>,
    /// Bumped on every accepted value change.
    pub version: u64,
    pub flags: NodeFlags,
    /// Head of the subscriber list: links whose `source` is this node.
    pub subscribers: Option<LinkId>,
    /// Head and tail of the dependency list: links whose `target` is this
    /// node, ordered by first read during the most recent run.
    pub dependencies: Option<LinkId>,
    pub dependencies_tail: Option<LinkId>,
    /// Scratch slot pointing at this source's link for the consumer currently
    /// evaluating. Valid only inside a prepare/cleanup bracket.
    pub current_link: Option<LinkId>,
    /// Teardown returned by the previous effect run.
    pub cleanup: Option<CleanupFn>,
    /// Intrusive link in the pending-effects queue.
    pub next_queued: Option<NodeId>,
    /// Captured panic from the last failed recompute.
    pub error: Option<CapturedPanic>,
}

impl ReactiveNode {
    fn new(ty: NodeType, flags: NodeFlags) -> Self {
        Self {
            ty,
            value: None,
            callback: None,
            version: 0,
            flags,
            subscribers: None,
            dependencies: None,
            dependencies_tail: None,
            current_link: None,
            cleanup: None,
            next_queued: None,
            error: None,
        }
    }

    pub fn signal(value: Box<dyn Any>) -> Self {
        let mut node = Self::new(NodeType::Signal, NodeFlags::empty());
        node.value = Some(value);
        node
    }

    pub fn memo(callback: NodeCallback) -> Self {
        let mut node = Self::new(NodeType::Memo, NodeFlags::OUTDATED);
        node.callback = Some(callback);
        node
    }

    pub fn effect(callback: NodeCallback) -> Self {
        let mut node = Self::new(NodeType::Effect, NodeFlags::TRACKING);
        node.callback = Some(callback);
        node
    }
}

/// A dependency edge between a source and a consumer.
///
/// Every link is a member of two doubly-linked lists at once: the source's
/// subscriber list (`prev_sub`/`next_sub`) and the consumer's dependency list
/// (`prev_dep`/`next_dep`).
pub(crate) struct Link {
    /// Source version at the last confirmed read. `None` marks a link primed
    /// for reuse that has not been read in the current pass.
    pub version: Option<u64>,
    pub source: NodeId,
    pub target: NodeId,
    pub prev_sub: Option<LinkId>,
    pub next_sub: Option<LinkId>,
    pub prev_dep: Option<LinkId>,
    pub next_dep: Option<LinkId>,
    /// Saved `current_link` of the source while a consumer pass is active.
    pub rollback: Option<LinkId>,
}
