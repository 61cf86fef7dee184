//! The dependency-tracking engine.
//!
//! Consumers (memos and effects) discover their sources through reads. Every
//! in-use (consumer, source) pair is represented by one [`Link`] that sits in
//! the source's subscriber list and the consumer's dependency list at the
//! same time. Around every consumer run the dependency list is primed
//! ([`Root::prepare_sources`]) and then swept ([`Root::cleanup_sources`]) so
//! that only the sources actually read in that run stay linked, in first-read
//! order.

use std::panic::{catch_unwind, AssertUnwindSafe};

use smallvec::SmallVec;

use crate::error::{raise, CapturedPanic, ReactiveError};
use crate::node::{Link, LinkId, NodeCallback, NodeFlags, NodeId, NodeType};
use crate::root::Root;

impl Root {
    /// Register a read of `source` by the currently evaluating consumer.
    ///
    /// Returns the link to stamp, or `None` when there is no consumer or the
    /// link was already confirmed in this pass.
    pub(crate) fn add_dependency(&self, source: NodeId) -> Option<LinkId> {
        let target = self.eval_context.get()?;
        let mut nodes = self.nodes.borrow_mut();
        let mut links = self.links.borrow_mut();

        let current = nodes[source].current_link;
        let reusable = current
            .and_then(|link| links.get(link))
            .map(|link| (link.target, link.version));
        match reusable {
            Some((owner, version)) if owner == target => {
                if version.is_some() {
                    // Already confirmed in this pass; the stamp stands.
                    return None;
                }
                let link = current.expect("current link vanished");
                links[link].version = Some(0);
                // Move to the tail so dependency order reflects first use in
                // this pass.
                let tail = nodes[target].dependencies_tail;
                if tail != Some(link) {
                    let prev = links[link].prev_dep;
                    let next = links[link].next_dep;
                    if let Some(prev) = prev {
                        links[prev].next_dep = next;
                    }
                    if let Some(next) = next {
                        links[next].prev_dep = prev;
                    }
                    if nodes[target].dependencies == Some(link) {
                        nodes[target].dependencies = next;
                    }
                    links[link].prev_dep = tail;
                    links[link].next_dep = None;
                    if let Some(tail) = tail {
                        links[tail].next_dep = Some(link);
                    } else {
                        nodes[target].dependencies = Some(link);
                    }
                    nodes[target].dependencies_tail = Some(link);
                }
                Some(link)
            }
            _ => {
                // Fresh edge, appended at the dependency tail. The previous
                // occupant of the scratch slot is preserved for rollback.
                let tail = nodes[target].dependencies_tail;
                let link = links.insert(Link {
                    version: Some(0),
                    source,
                    target,
                    prev_sub: None,
                    next_sub: None,
                    prev_dep: tail,
                    next_dep: None,
                    rollback: current,
                });
                if let Some(tail) = tail {
                    links[tail].next_dep = Some(link);
                } else {
                    nodes[target].dependencies = Some(link);
                }
                nodes[target].dependencies_tail = Some(link);
                nodes[source].current_link = Some(link);
                let tracking = nodes[target].flags.contains(NodeFlags::TRACKING);
                drop(nodes);
                drop(links);
                if tracking {
                    self.subscribe_link(source, link);
                }
                Some(link)
            }
        }
    }

    /// Insert `link` into the subscriber list of `source`.
    ///
    /// A memo gaining its first subscriber activates: it marks itself
    /// outdated-and-tracking and subscribes to all of its own sources, so a
    /// live sub-graph is subscribed all the way down.
    pub(crate) fn subscribe_link(&self, source: NodeId, link: LinkId) {
        let activate: Option<SmallVec<[(NodeId, LinkId); 4]>> = {
            let mut nodes = self.nodes.borrow_mut();
            let links = self.links.borrow();
            let node = &mut nodes[source];
            if node.ty == NodeType::Memo && node.subscribers.is_none() {
                node.flags.insert(NodeFlags::OUTDATED | NodeFlags::TRACKING);
                let mut deps = SmallVec::new();
                let mut cursor = node.dependencies;
                while let Some(dep) = cursor {
                    deps.push((links[dep].source, dep));
                    cursor = links[dep].next_dep;
                }
                Some(deps)
            } else {
                None
            }
        };
        if let Some(deps) = activate {
            for (dep_source, dep_link) in deps {
                self.subscribe_link(dep_source, dep_link);
            }
        }

        let mut nodes = self.nodes.borrow_mut();
        let mut links = self.links.borrow_mut();
        let head = nodes[source].subscribers;
        // Guard against inserting a link that is already in the list.
        if head != Some(link) && links[link].prev_sub.is_none() {
            links[link].next_sub = head;
            if let Some(head) = head {
                links[head].prev_sub = Some(link);
            }
            nodes[source].subscribers = Some(link);
        }
    }

    /// Remove `link` from the subscriber list of `source`.
    ///
    /// A memo losing its last subscriber deactivates and unsubscribes from
    /// all of its own sources.
    pub(crate) fn unsubscribe_link(&self, source: NodeId, link: LinkId) {
        let deactivate: Option<SmallVec<[(NodeId, LinkId); 4]>> = {
            let mut nodes = self.nodes.borrow_mut();
            let mut links = self.links.borrow_mut();
            let node = &mut nodes[source];
            if node.subscribers.is_none() {
                return;
            }
            let prev = links[link].prev_sub.take();
            let next = links[link].next_sub.take();
            if let Some(prev) = prev {
                links[prev].next_sub = next;
            }
            if let Some(next) = next {
                links[next].prev_sub = prev;
            }
            if node.subscribers == Some(link) {
                node.subscribers = next;
            }
            if node.ty == NodeType::Memo && node.subscribers.is_none() {
                node.flags.remove(NodeFlags::TRACKING);
                let mut deps = SmallVec::new();
                let mut cursor = node.dependencies;
                while let Some(dep) = cursor {
                    deps.push((links[dep].source, dep));
                    cursor = links[dep].next_dep;
                }
                Some(deps)
            } else {
                None
            }
        };
        if let Some(deps) = deactivate {
            for (dep_source, dep_link) in deps {
                self.unsubscribe_link(dep_source, dep_link);
            }
        }
    }

    /// Prime a consumer's dependency list for the upcoming run: every link is
    /// marked unconfirmed and parked in its source's scratch slot so reads
    /// can re-use it.
    pub(crate) fn prepare_sources(&self, target: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        let mut links = self.links.borrow_mut();
        let mut tail = None;
        let mut cursor = nodes[target].dependencies;
        while let Some(link) = cursor {
            let source = links[link].source;
            links[link].rollback = nodes[source].current_link;
            nodes[source].current_link = Some(link);
            links[link].version = None;
            tail = Some(link);
            cursor = links[link].next_dep;
        }
        nodes[target].dependencies_tail = tail;
    }

    /// Sweep a consumer's dependency list after a run, walking backwards from
    /// the tail. Links that were not confirmed are unsubscribed and freed;
    /// every source gets its scratch slot restored.
    pub(crate) fn cleanup_sources(&self, target: NodeId) {
        let mut new_head = None;
        let mut new_tail = None;
        let mut cursor = self.nodes.borrow()[target].dependencies_tail;
        while let Some(link) = cursor {
            let (prev, unused, source, rollback) = {
                let links = self.links.borrow();
                let link = &links[link];
                (link.prev_dep, link.version.is_none(), link.source, link.rollback)
            };
            if unused {
                self.unsubscribe_link(source, link);
                let mut nodes = self.nodes.borrow_mut();
                let mut links = self.links.borrow_mut();
                let next = links[link].next_dep;
                if let Some(prev) = prev {
                    links[prev].next_dep = next;
                }
                if let Some(next) = next {
                    links[next].prev_dep = prev;
                }
                nodes[source].current_link = rollback;
                links.remove(link);
            } else {
                if new_tail.is_none() {
                    new_tail = Some(link);
                }
                new_head = Some(link);
                let mut nodes = self.nodes.borrow_mut();
                let mut links = self.links.borrow_mut();
                nodes[source].current_link = rollback;
                links[link].rollback = None;
            }
            cursor = prev;
        }
        let mut nodes = self.nodes.borrow_mut();
        nodes[target].dependencies = new_head;
        nodes[target].dependencies_tail = new_tail;
    }

    /// Propagate a dirty notification from a source to its subscribers.
    ///
    /// Memos mark themselves outdated and pass the notification on; effects
    /// enqueue themselves for the batch drain. Each consumer is notified at
    /// most once per change epoch.
    pub(crate) fn notify(&self, id: NodeId) {
        let subscribers: Option<SmallVec<[NodeId; 4]>> = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else { return };
            if node.flags.contains(NodeFlags::NOTIFIED) {
                return;
            }
            match node.ty {
                NodeType::Signal => return,
                NodeType::Memo => {
                    node.flags.insert(NodeFlags::OUTDATED | NodeFlags::NOTIFIED);
                    let links = self.links.borrow();
                    let mut targets = SmallVec::new();
                    let mut cursor = node.subscribers;
                    while let Some(link) = cursor {
                        targets.push(links[link].target);
                        cursor = links[link].next_sub;
                    }
                    Some(targets)
                }
                NodeType::Effect => {
                    node.flags.insert(NodeFlags::NOTIFIED);
                    None
                }
            }
        };
        match subscribers {
            Some(targets) => {
                for target in targets {
                    self.notify(target);
                }
            }
            None => self.enqueue_effect(id),
        }
    }

    /// Whether any dependency of `target` drifted since its last run.
    ///
    /// The walk stops at the first drifted dependency in use order, refreshing
    /// memo sources along the way, so a consumer never observes a half-updated
    /// set of inputs.
    pub(crate) fn needs_to_recompute(&self, target: NodeId) -> bool {
        let mut cursor = {
            let nodes = self.nodes.borrow();
            match nodes.get(target) {
                Some(node) => node.dependencies,
                None => return false,
            }
        };
        while let Some(link) = cursor {
            let (source, version, next) = {
                let links = self.links.borrow();
                let link = &links[link];
                (link.source, link.version, link.next_dep)
            };
            if version != Some(self.nodes.borrow()[source].version) {
                return true;
            }
            if !self.refresh(source) {
                return true;
            }
            if version != Some(self.nodes.borrow()[source].version) {
                return true;
            }
            cursor = next;
        }
        false
    }

    /// Bring a memo's cached value up to date.
    ///
    /// Returns `false` when the memo is already running, which indicates a
    /// cycle. Signals are always fresh.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub(crate) fn refresh(&self, id: NodeId) -> bool {
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            if node.ty != NodeType::Memo {
                return true;
            }
            node.flags.remove(NodeFlags::NOTIFIED);
            if node.flags.contains(NodeFlags::RUNNING) {
                return false;
            }
            if node.flags.contains(NodeFlags::TRACKING) && !node.flags.contains(NodeFlags::OUTDATED)
            {
                return true;
            }
            node.flags.remove(NodeFlags::OUTDATED);
            node.flags.insert(NodeFlags::RUNNING);
        }

        // Once computed at least once, the cached value stands unless a
        // dependency's version drifted.
        let version = self.nodes.borrow()[id].version;
        if version > 0 && !self.needs_to_recompute(id) {
            self.nodes.borrow_mut()[id].flags.remove(NodeFlags::RUNNING);
            return true;
        }

        let (mut callback, mut value) = {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            (node.callback.take(), node.value.take())
        };
        let prev_context = self.eval_context.get();
        self.prepare_sources(id);
        self.eval_context.set(Some(id));
        let result = match callback.as_mut() {
            Some(NodeCallback::Memo(compute)) => {
                catch_unwind(AssertUnwindSafe(|| compute(&mut value)))
            }
            _ => Ok(false),
        };
        self.eval_context.set(prev_context);
        self.cleanup_sources(id);

        let mut nodes = self.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.callback = callback;
        match result {
            Ok(changed) => {
                let had_error = node.flags.contains(NodeFlags::HAS_ERROR);
                if changed || had_error || node.version == 0 {
                    node.flags.remove(NodeFlags::HAS_ERROR);
                    node.error = None;
                    node.version += 1;
                }
                node.value = value;
            }
            Err(payload) => {
                node.value = value;
                node.error = Some(CapturedPanic::from_payload(payload));
                node.flags.insert(NodeFlags::HAS_ERROR);
                node.version += 1;
            }
        }
        node.flags.remove(NodeFlags::RUNNING);
        true
    }

    /// The tracked read protocol shared by signal and memo handles: register
    /// the dependency, refresh memo sources, stamp the link with the version
    /// just observed, and re-raise a captured compute panic.
    pub(crate) fn track_read(&self, id: NodeId) {
        let (ty, running) = {
            let nodes = self.nodes.borrow();
            let node = &nodes[id];
            (node.ty, node.flags.contains(NodeFlags::RUNNING))
        };
        if ty == NodeType::Memo && running {
            raise(ReactiveError::Cycle);
        }
        let link = self.add_dependency(id);
        if ty == NodeType::Memo {
            self.refresh(id);
        }
        if let Some(link) = link {
            let version = self.nodes.borrow()[id].version;
            self.links.borrow_mut()[link].version = Some(version);
        }
        self.reraise_captured(id);
    }

    /// The untracked read protocol: refresh memo sources without registering
    /// a dependency. Also used for memo peeks.
    pub(crate) fn untracked_read(&self, id: NodeId) {
        if self.nodes.borrow()[id].ty != NodeType::Memo {
            return;
        }
        if !self.refresh(id) {
            raise(ReactiveError::Cycle);
        }
        self.reraise_captured(id);
    }

    fn reraise_captured(&self, id: NodeId) {
        let nodes = self.nodes.borrow();
        let node = &nodes[id];
        if node.flags.contains(NodeFlags::HAS_ERROR) {
            node.error
                .as_ref()
                .expect("error flag set without a captured panic")
                .reraise();
        }
    }
}
