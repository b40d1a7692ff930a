// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::ThreadRegistry;
use crate::loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use crate::loom::thread;
use cordyceps::{Linked, list};
use core::fmt;
use core::marker::PhantomPinned;
use core::panic::Location;
use core::ptr::{self, NonNull};
use std::sync::Arc;

/// An opaque ID that uniquely identifies a promise for the lifetime of the process.
///
/// IDs are handed out from a global counter and are never reused, so an ID recorded as the
/// waiter of another promise keeps referring to the same invocation even after that invocation
/// has been collected.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        #[cfg(loom)]
        crate::loom::lazy_static! {
            static ref NEXT_ID: AtomicU64 = AtomicU64::new(1);
        }
        #[cfg(not(loom))]
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a promise is in its lifecycle, as far as introspection is concerned.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
#[repr(u8)]
pub enum PromiseState {
    /// The invocation is currently being driven by some thread.
    Running = 0,
    /// The invocation is parked at a suspension point.
    Suspended = 1,
    /// The invocation completed and its result sits in the promise's slot.
    Resolved = 2,
    /// The promise was marked for removal and waits for the next collection pass.
    Deleted = 3,
}

impl PromiseState {
    fn from_u8(bits: u8) -> Self {
        match bits {
            0 => Self::Running,
            1 => Self::Suspended,
            2 => Self::Resolved,
            3 => Self::Deleted,
            // this should never happen unless someone stored garbage into the state byte
            _ => unreachable!("invalid promise state {bits:#b}"),
        }
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            PromiseState::Running => "running",
            PromiseState::Suspended => "suspended",
            PromiseState::Resolved => "resolved",
            PromiseState::Deleted => "deleted",
        })
    }
}

/// Identity of the thread that created a promise (and owns the registry it lives in).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    id: thread::ThreadId,
    name: Option<Arc<str>>,
}

impl ThreadInfo {
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            id: current.id(),
            name: current.name().map(Arc::from),
        }
    }

    pub fn id(&self) -> thread::ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }
}

impl fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({:?})", self.id),
            None => write!(f, "{:?}", self.id),
        }
    }
}

/// The bookkeeping record for one task invocation.
///
/// A `Promise` is created detached, then handed to [`ThreadRegistry::add`] which moves it into a
/// heap node next to a caller-chosen slot and links that node into the registry's intrusive list.
/// From that point on the node is visible to [`ThreadRegistry::for_promise`] until a collection
/// pass destroys it, which can only happen after it was marked for removal.
///
/// Visitors only ever see the header (this type); the typed slot is reachable exclusively through
/// the [`PromiseHandle`] returned by `add`.
pub struct Promise {
    /// Intrusive list pointers, only touched while holding the registry's list lock.
    links: list::Links<Promise>,
    /// Destroys the node this header is embedded in.
    vtable: &'static VTable,
    id: Id,
    name: Option<Box<str>>,
    location: &'static Location<'static>,
    thread: ThreadInfo,
    state: AtomicU8,
    /// Id of the promise awaiting this one, `0` if none.
    waiter: AtomicU64,
    marked: AtomicBool,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

struct VTable {
    deallocate: unsafe fn(NonNull<Promise>),
}

/// A promise header followed by its typed slot.
///
/// `repr(C)` so that a pointer to the node is also a valid pointer to its header.
#[repr(C)]
pub(crate) struct Node<S> {
    /// This must be the first field of the `Node` struct!
    header: Promise,
    slot: S,
}

/// Exclusive owner of a registered promise node.
///
/// The handle keeps the owning [`ThreadRegistry`] alive, so the node can be marked from any thread
/// even after the creating thread exited. Dropping the handle (or calling
/// [`PromiseHandle::mark_for_removal`]) marks the node; the node and its slot are destroyed by the
/// next [`ThreadRegistry::collect`] pass.
pub struct PromiseHandle<S> {
    node: NonNull<Node<S>>,
    registry: Arc<ThreadRegistry>,
}

/// An owned copy of a promise's introspection fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromiseSnapshot {
    pub id: Id,
    pub name: Option<String>,
    pub location: &'static Location<'static>,
    pub thread: ThreadInfo,
    pub state: PromiseState,
    pub waiter: Option<Id>,
}

// === impl Promise ===

impl Promise {
    const UNBOUND_VTABLE: VTable = VTable {
        deallocate: unbound_deallocate,
    };

    /// Create a new, unregistered promise tagged with `location` and owned by the calling thread.
    pub fn new(location: &'static Location<'static>) -> Self {
        Self {
            links: list::Links::new(),
            vtable: &Self::UNBOUND_VTABLE,
            id: Id::next(),
            name: None,
            location,
            thread: ThreadInfo::current(),
            state: AtomicU8::new(PromiseState::Running as u8),
            waiter: AtomicU64::new(0),
            marked: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<Box<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The source location that created this promise.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    pub fn state(&self) -> PromiseState {
        PromiseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The promise currently awaiting this one, if any.
    pub fn waiter(&self) -> Option<Id> {
        match self.waiter.load(Ordering::Acquire) {
            0 => None,
            id => Some(Id(id)),
        }
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> PromiseSnapshot {
        PromiseSnapshot {
            id: self.id,
            name: self.name.as_deref().map(ToOwned::to_owned),
            location: self.location,
            thread: self.thread.clone(),
            state: self.state(),
            waiter: self.waiter(),
        }
    }

    /// Flag this promise as logically gone. Returns `false` if it was already flagged.
    pub(crate) fn mark(&self) -> bool {
        self.state.store(PromiseState::Deleted as u8, Ordering::Release);
        !self.marked.swap(true, Ordering::AcqRel)
    }

    /// Destroys the node `ptr` is embedded in, including its slot.
    ///
    /// # Safety
    ///
    /// `ptr` must point to the header of a live node that has been unlinked from its list, and
    /// no other reference to the node may exist.
    pub(crate) unsafe fn deallocate(ptr: NonNull<Promise>) {
        // Safety: ensured by caller
        unsafe {
            debug_assert!(
                ptr.as_ref().is_marked_for_removal(),
                "a promise may not be destroyed before it was marked for removal!"
            );
            let deallocate = ptr.as_ref().vtable.deallocate;
            deallocate(ptr);
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("location", &self.location)
            .field("thread", &self.thread)
            .field("state", &self.state())
            .field("waiter", &self.waiter())
            .field("marked", &self.is_marked_for_removal())
            .finish_non_exhaustive()
    }
}

// Safety: all mutable header state is atomic, the links are only accessed while the owning
// registry's list lock is held.
unsafe impl Send for Promise {}
// Safety: see above
unsafe impl Sync for Promise {}

// Safety: promises are heap-allocated by `ThreadRegistry::add` and never moved until a collection
// pass unlinks and frees them.
unsafe impl Linked<list::Links<Self>> for Promise {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: using `ptr::addr_of_mut!` avoids creating a temporary reference, and since
        // `target` is `NonNull` a pointer to one of its fields can't be null either.
        unsafe {
            let links = ptr::addr_of_mut!((*target.as_ptr()).links);
            NonNull::new_unchecked(links)
        }
    }
}

unsafe fn unbound_deallocate(ptr: NonNull<Promise>) {
    unreachable!("promise ({ptr:p}) was never added to a registry and cannot be deallocated!");
}

// === impl Node ===

impl<S> Node<S> {
    const VTABLE: VTable = VTable {
        deallocate: Self::deallocate,
    };

    /// Allocate a node for `header` and `slot`, returning a pointer that is owned by the caller.
    pub(crate) fn allocate(mut header: Promise, slot: S) -> NonNull<Self> {
        header.vtable = &Self::VTABLE;
        NonNull::from(Box::leak(Box::new(Self { header, slot })))
    }

    /// # Safety
    ///
    /// `ptr` must point to the header of a `Node<S>` with the same `S`, allocated by
    /// [`Node::allocate`].
    unsafe fn deallocate(ptr: NonNull<Promise>) {
        // Safety: ensured by caller
        unsafe {
            tracing::trace!(
                promise.addr = ?ptr,
                promise.id = %ptr.as_ref().id,
                "Promise::deallocate"
            );
            drop(Box::from_raw(ptr.cast::<Self>().as_ptr()));
        }
    }
}

// === impl PromiseHandle ===

impl<S> PromiseHandle<S> {
    pub(crate) fn new(node: NonNull<Node<S>>, registry: Arc<ThreadRegistry>) -> Self {
        Self { node, registry }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Promise> {
        self.node.cast()
    }

    pub fn promise(&self) -> &Promise {
        // Safety: the node can't be collected before it is marked, and marking consumes the
        // handle. Projecting through the raw pointer keeps this borrow disjoint from the slot.
        unsafe { &*ptr::addr_of!((*self.node.as_ptr()).header) }
    }

    pub fn id(&self) -> Id {
        self.promise().id
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn slot(&self) -> &S {
        // Safety: see `promise`
        unsafe { &*ptr::addr_of!((*self.node.as_ptr()).slot) }
    }

    pub fn slot_mut(&mut self) -> &mut S {
        // Safety: see `promise`, the handle is the only way to reach the slot and we hold it
        // mutably. Visitors only ever borrow the header.
        unsafe { &mut *ptr::addr_of_mut!((*self.node.as_ptr()).slot) }
    }

    pub fn set_state(&self, state: PromiseState) {
        debug_assert_ne!(
            state,
            PromiseState::Deleted,
            "use `mark_for_removal` to delete a promise"
        );
        self.promise().state.store(state as u8, Ordering::Release);
    }

    /// Record `waiter` as the promise awaiting this one.
    pub fn set_waiter(&self, waiter: Id) {
        self.promise().waiter.store(waiter.as_u64(), Ordering::Release);
    }

    /// Mark the node for removal. It stays visible to visitors until the next collection pass.
    pub fn mark_for_removal(self) {
        drop(self);
    }
}

impl<S> Drop for PromiseHandle<S> {
    fn drop(&mut self) {
        // Safety: the node is alive until marked, and this is the last use of it through the
        // handle.
        unsafe {
            self.registry.mark(self.header_ptr());
        }
    }
}

impl<S> fmt::Debug for PromiseHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseHandle")
            .field("promise", self.promise())
            .field("addr", &self.node)
            .finish_non_exhaustive()
    }
}

// Safety: the handle is the exclusive owner of the slot, the header is `Sync`
unsafe impl<S: Send> Send for PromiseHandle<S> {}
// Safety: shared access only hands out `&S`
unsafe impl<S: Sync> Sync for PromiseHandle<S> {}
