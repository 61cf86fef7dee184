//! Reactive signals.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::create_effect;
use crate::effect::EffectHandle;
use crate::error::{raise, ReactiveError};
use crate::node::{NodeFlags, NodeId, NodeType, ReactiveNode};
use crate::root::Root;

/// A read-only reactive value.
///
/// Every [`Signal`] dereferences to a `ReadSignal`, and [`create_memo`] hands
/// one out directly: the read-only handle is the common currency between
/// plain and derived cells.
///
/// # Example
/// ```
/// # use alder_reactive::*;
/// let signal: Signal<i32> = create_signal(123);
/// let read_signal: ReadSignal<i32> = *signal;
/// assert_eq!(read_signal.get(), 123);
/// signal.set(456);
/// assert_eq!(read_signal.get(), 456);
/// ```
///
/// [`create_memo`]: crate::create_memo
pub struct ReadSignal<T: 'static> {
    pub(crate) id: NodeId,
    _phantom: PhantomData<Rc<T>>,
}

/// A reactive value that can be read and written to.
///
/// This is the writable analog of [`ReadSignal`]. See [`create_signal`] for
/// more information.
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// Create a new [`Signal`].
///
/// Signals are reactive atoms, pieces of state that can be read and written
/// to and which will automatically update anything that depends on them.
///
/// # Usage
/// The simplest way to use a signal is with [`.get()`](ReadSignal::get) and
/// [`.set(...)`](Signal::set). For values that are not [`Copy`] but
/// [`Clone`], use [`.get_clone()`](ReadSignal::get_clone), or borrow in place
/// with [`.with(...)`](ReadSignal::with).
///
/// ```rust
/// # use alder_reactive::*;
/// let signal = create_signal(1);
/// assert_eq!(signal.get(), 1);
/// signal.set(2);
/// assert_eq!(signal.get(), 2);
/// ```
///
/// # Reactivity
/// Accessing a signal inside a memo or effect automatically registers it as a
/// dependency, so related state updates by itself:
///
/// ```rust
/// # use alder_reactive::*;
/// let signal = create_signal(1);
/// let double = create_memo(move || signal.get() * 2);
/// assert_eq!(double.get(), 2);
/// signal.set(2);
/// assert_eq!(double.get(), 4);
/// ```
///
/// # Ownership
/// The handle is `Copy`; the value itself lives in the reactive graph for the
/// lifetime of the thread. This makes it painless to move handles into
/// closures and event handlers.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal<T>(value: T) -> Signal<T> {
    let id = Root::with(|root| root.nodes.borrow_mut().insert(ReactiveNode::signal(Box::new(value))));
    Signal(ReadSignal {
        id,
        _phantom: PhantomData,
    })
}

pub(crate) fn make_read_signal<T>(id: NodeId) -> ReadSignal<T> {
    ReadSignal {
        id,
        _phantom: PhantomData,
    }
}

impl<T> ReadSignal<T> {
    /// Get the value. The type must implement [`Copy`]; otherwise use
    /// [`ReadSignal::get_clone`] or [`ReadSignal::with`].
    ///
    /// When called inside a memo or effect, the cell is automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.with(|value| *value)
    }

    /// Get the value, [`Clone`]-ing it automatically.
    ///
    /// When called inside a memo or effect, the cell is automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.with(Clone::clone)
    }

    /// Get a value from the cell by reference.
    ///
    /// When called inside a memo or effect, the cell is automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        Root::with(|root| {
            root.track_read(self.id);
            self.read_with(root, f)
        })
    }

    /// Get the value without tracking it. The type must implement [`Copy`].
    ///
    /// On a derived cell this still refreshes the cached value; it only skips
    /// the dependency registration.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Get the value without tracking it, [`Clone`]-ing it automatically.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get a value from the cell by reference, without tracking it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        Root::with(|root| {
            root.untracked_read(self.id);
            self.read_with(root, f)
        })
    }

    fn read_with<U>(self, root: &Root, f: impl FnOnce(&T) -> U) -> U {
        let nodes = root.nodes.borrow();
        let node = nodes.get(self.id).expect("cell was removed from its root");
        let value = node.value.as_ref().expect("value is being updated");
        f(value.downcast_ref().expect("wrong signal type"))
    }

    /// Track the cell in the current reactive scope without reading it. This
    /// is done automatically when calling [`ReadSignal::get`] and friends.
    pub fn track(self) {
        Root::with(|root| root.track_read(self.id));
    }

    /// Run `f` with the current value now and again every time the value
    /// changes. Returns a handle for cancelling the subscription.
    ///
    /// Signals read inside `f` itself are deliberately not subscribed to.
    ///
    /// # Example
    /// ```
    /// # use alder_reactive::*;
    /// use std::cell::RefCell;
    /// use std::rc::Rc;
    ///
    /// let state = create_signal(0);
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let subscription = state.subscribe({
    ///     let seen = seen.clone();
    ///     move |value| seen.borrow_mut().push(value)
    /// });
    /// state.set(1);
    /// state.set(2);
    /// subscription.dispose();
    /// state.set(3);
    /// assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    /// ```
    pub fn subscribe(self, mut f: impl FnMut(T) + 'static) -> EffectHandle
    where
        T: Clone,
    {
        create_effect(move || {
            let value = self.get_clone();
            Root::with(|root| root.with_tracking_paused(|| f(value)));
        })
    }
}

impl Root {
    /// Run `f` with the current consumer's tracking turned off, so reads made
    /// by a subscription callback do not widen the subscription.
    pub(crate) fn with_tracking_paused(&self, f: impl FnOnce()) {
        let Some(context) = self.eval_context.get() else {
            return f();
        };
        let was_tracking = {
            let mut nodes = self.nodes.borrow_mut();
            let flags = &mut nodes[context].flags;
            let was = flags.contains(NodeFlags::TRACKING);
            flags.remove(NodeFlags::TRACKING);
            was
        };
        struct RestoreTracking<'a> {
            root: &'a Root,
            context: NodeId,
            restore: bool,
        }
        impl Drop for RestoreTracking<'_> {
            fn drop(&mut self) {
                if self.restore {
                    if let Some(node) = self.root.nodes.borrow_mut().get_mut(self.context) {
                        node.flags.insert(NodeFlags::TRACKING);
                    }
                }
            }
        }
        let _guard = RestoreTracking {
            root: self,
            context,
            restore: was_tracking,
        };
        f()
    }
}

impl<T: PartialEq> Signal<T> {
    /// Set a new value and notify dependents.
    ///
    /// Writing a value equal to the current one notifies nobody.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T) {
        self.replace(new);
    }

    /// Set a new value, returning the previous one. Dependents are notified
    /// only when the value actually changed.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace(self, new: T) -> T {
        Root::with(|root| {
            if let Some(context) = root.eval_context.get() {
                let inside_memo = root
                    .nodes
                    .borrow()
                    .get(context)
                    .is_some_and(|node| node.ty == NodeType::Memo);
                if inside_memo {
                    raise(ReactiveError::WriteInsideMemo);
                }
            }
            let changed = self.0.read_with(root, |value| *value != new);
            if changed && root.batch_iteration.get() > 100 {
                raise(ReactiveError::Cycle);
            }
            let old = {
                let mut nodes = root.nodes.borrow_mut();
                let node = &mut nodes[self.0.id];
                let slot = node
                    .value
                    .as_mut()
                    .expect("value is being updated")
                    .downcast_mut::<T>()
                    .expect("wrong signal type");
                let old = std::mem::replace(slot, new);
                if changed {
                    node.version += 1;
                }
                old
            };
            if changed {
                #[cfg(feature = "trace")]
                tracing::trace!(version = root.nodes.borrow()[self.0.id].version, "signal updated");
                let targets: SmallVec<[NodeId; 4]> = {
                    let nodes = root.nodes.borrow();
                    let links = root.links.borrow();
                    let mut targets = SmallVec::new();
                    let mut cursor = nodes[self.0.id].subscribers;
                    while let Some(link) = cursor {
                        targets.push(links[link].target);
                        cursor = links[link].next_sub;
                    }
                    targets
                };
                root.start_batch();
                for target in targets {
                    root.notify(target);
                }
                root.end_batch();
            }
            old
        })
    }
}

/// We manually implement `Clone` + `Copy` for the handles so that we don't
/// get extra bounds on `T`.
impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

impl<T: Default> Default for Signal<T> {
    fn default() -> Self {
        create_signal(Default::default())
    }
}
impl<T: Default> Default for ReadSignal<T> {
    fn default() -> Self {
        *create_signal(Default::default())
    }
}

// Forward `PartialEq`, `Eq`, `Hash` from the inner type.
impl<T: PartialEq> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for ReadSignal<T> {}
impl<T: Hash> Hash for ReadSignal<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for Signal<T> {}
impl<T: Hash> Hash for Signal<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Formatting forwards to the payload.
impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

// Serde implementations forward to the payload as well.
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for ReadSignal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de>> serde::Deserialize<'de> for ReadSignal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(*create_signal(T::deserialize(deserializer)?))
    }
}
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Signal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de>> serde::Deserialize<'de> for Signal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(create_signal(T::deserialize(deserializer)?))
    }
}
