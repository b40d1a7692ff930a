// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Mutex;
use crate::metrics::Metrics;
use crate::promise::{Node, Promise, PromiseHandle, PromiseSnapshot, ThreadInfo};
use cordyceps::List;
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

/// The per-thread collection of promises.
///
/// Only the owning thread may [`add`][ThreadRegistry::add] promises, but any thread may mark them
/// (by dropping their [`PromiseHandle`]), iterate them, or run a collection pass. All list
/// mutations and traversals are serialized by a single lock, while marking only touches atomics
/// in the promise header and never takes the lock.
///
/// The registry is reference counted: every outstanding [`PromiseHandle`] keeps it alive, so by
/// the time the last reference goes away every node is marked and the final collection in `Drop`
/// leaves the list empty.
///
/// This also means a slot may keep its own registry alive. A result that is never observed but
/// itself owns a handle into the same registry (a task returning a task spawned on the same
/// thread, say) forms a cycle: the registry outlives its thread, and its teardown collection only
/// runs once an explicit [`collect`][ThreadRegistry::collect], for example through
/// [`GlobalRegistry::collect`](crate::GlobalRegistry::collect), destroys the outer slot.
pub struct ThreadRegistry {
    thread: ThreadInfo,
    promises: Mutex<List<Promise>>,
    metrics: Arc<dyn Metrics>,
}

// === impl ThreadRegistry ===

impl ThreadRegistry {
    /// Create a registry owned by the calling thread and register it with the [global
    /// registry](crate::global).
    pub fn make(metrics: Arc<dyn Metrics>) -> Arc<Self> {
        let this = Arc::new(Self {
            thread: ThreadInfo::current(),
            promises: Mutex::new(List::new()),
            metrics,
        });

        this.metrics.registry_created();
        crate::global().register(&this);

        tracing::debug!(thread = %this.thread, "created thread registry");

        this
    }

    /// The thread that owns this registry.
    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    /// Move `promise` into a new node next to `slot` and link it at the head of the list.
    ///
    /// # Panics
    ///
    /// Panics if called from any thread other than the one owning this registry.
    #[track_caller]
    pub fn add<S: Send + 'static>(self: &Arc<Self>, promise: Promise, slot: S) -> PromiseHandle<S> {
        assert!(
            self.thread.is_current(),
            "promises may only be added to a registry by its owning thread (owner: {}, current: {})",
            self.thread,
            ThreadInfo::current(),
        );

        let id = promise.id();
        let node = Node::allocate(promise, slot);
        self.promises.lock().push_front(node.cast());
        self.metrics.promise_created();

        tracing::trace!(promise.id = %id, thread = %self.thread, "ThreadRegistry::add");

        PromiseHandle::new(node, self.clone())
    }

    /// Mark the promise behind `handle` for removal.
    ///
    /// # Panics
    ///
    /// Panics if `handle` belongs to a different registry.
    #[track_caller]
    pub fn mark_for_removal<S>(&self, handle: PromiseHandle<S>) {
        assert!(
            core::ptr::eq(Arc::as_ptr(handle.registry()), self),
            "promise {} does not belong to this registry",
            handle.id()
        );
        drop(handle);
    }

    /// Flag the promise at `ptr` as logically gone.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a node that is linked into this registry and has not been collected.
    pub(crate) unsafe fn mark(&self, ptr: NonNull<Promise>) {
        // Safety: ensured by caller
        let promise = unsafe { ptr.as_ref() };
        let id = promise.id();

        if promise.mark() {
            self.metrics.promise_marked();
            tracing::trace!(promise.id = %id, "marked promise for removal");
        }
    }

    /// Visit every promise currently in the list, most recently added first.
    ///
    /// This includes promises that are marked for removal but not collected yet. The list lock is
    /// held for the entire traversal, so `f` must not call back into this registry.
    pub fn for_promise(&self, mut f: impl FnMut(&Promise)) {
        let promises = self.promises.lock();
        for entry in promises.iter() {
            let promise: &Promise = &entry;
            f(promise);
        }
    }

    pub fn snapshot(&self) -> Vec<PromiseSnapshot> {
        let mut out = Vec::new();
        self.for_promise(|promise| out.push(promise.snapshot()));
        out
    }

    /// The number of nodes in the list, including marked but uncollected ones.
    pub fn len(&self) -> usize {
        self.promises.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.lock().is_empty()
    }

    /// Unlink and destroy every promise marked for removal, returning how many were destroyed.
    ///
    /// Nodes are unlinked while holding the list lock, but destroyed after it was released so that
    /// destructors of slot values may freely interact with registries again.
    pub fn collect(&self) -> usize {
        let garbage = {
            let mut promises = self.promises.lock();

            // Drain the list and relink the survivors in their original order. Marked nodes are
            // freed through the handle the list stored when they were linked.
            let mut kept = List::new();
            let mut marked: Vec<NonNull<Promise>> = Vec::new();
            while let Some(ptr) = promises.pop_front() {
                // Safety: unlinked just now, and not freed before the lock is released
                if unsafe { ptr.as_ref() }.is_marked_for_removal() {
                    marked.push(ptr);
                } else {
                    kept.push_back(ptr);
                }
            }
            *promises = kept;

            marked
        };

        let count = garbage.len();
        for ptr in garbage {
            // Safety: the node is unlinked, and marked nodes are unreachable through any handle
            unsafe {
                Promise::deallocate(ptr);
            }
        }

        if count > 0 {
            self.metrics.promises_collected(count);
            tracing::debug!(count, thread = %self.thread, "collected promises");
        }

        count
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        self.collect();

        let remaining = self.promises.lock().len();
        if remaining > 0 {
            tracing::warn!(
                remaining,
                thread = %self.thread,
                "thread registry destroyed with live promises, leaking them"
            );
        }
        debug_assert_eq!(
            remaining, 0,
            "every promise must be marked before its registry is destroyed"
        );

        self.metrics.registry_destroyed();
        tracing::debug!(thread = %self.thread, "destroyed thread registry");
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("thread", &self.thread)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

// Safety: the list (and thereby the promises' links) is only touched while holding the lock,
// everything else in a promise header is atomic or immutable.
unsafe impl Send for ThreadRegistry {}
// Safety: see above
unsafe impl Sync for ThreadRegistry {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::thread;
    use crate::metrics::{Counters, CountersSnapshot};
    use crate::promise::PromiseState;
    use core::panic::Location;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> (Arc<ThreadRegistry>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (ThreadRegistry::make(counters.clone()), counters)
    }

    fn names(registry: &ThreadRegistry) -> Vec<String> {
        let mut out = Vec::new();
        registry.for_promise(|p| out.push(p.name().unwrap_or_default().to_owned()));
        out
    }

    /// A slot value that counts how many instances are alive.
    struct Tracked(Arc<AtomicUsize>);

    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self(live.clone())
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test_log::test]
    fn iteration_is_lifo_and_collect_skips_unmarked() {
        let (registry, _) = registry();

        let h1 = registry.add(Promise::new(Location::caller()).with_name("1"), ());
        let h2 = registry.add(Promise::new(Location::caller()).with_name("2"), ());
        let h3 = registry.add(Promise::new(Location::caller()).with_name("3"), ());

        assert_eq!(names(&registry), ["3", "2", "1"]);

        registry.mark_for_removal(h1);
        // marked promises stay visible until collected
        assert_eq!(names(&registry), ["3", "2", "1"]);

        assert_eq!(registry.collect(), 1);
        assert_eq!(names(&registry), ["3", "2"]);

        assert_eq!(registry.collect(), 0);
        assert_eq!(registry.len(), 2);

        drop((h2, h3));
        assert_eq!(registry.collect(), 2);
        assert!(registry.is_empty());
    }

    #[test_log::test]
    fn marking_the_middle_promise_keeps_neighbour_order() {
        let (registry, _) = registry();

        let h1 = registry.add(Promise::new(Location::caller()).with_name("1"), ());
        let h2 = registry.add(Promise::new(Location::caller()).with_name("2"), ());
        let h3 = registry.add(Promise::new(Location::caller()).with_name("3"), ());

        registry.mark_for_removal(h2);
        assert_eq!(registry.collect(), 1);
        assert_eq!(names(&registry), ["3", "1"]);

        // the relinked neighbours are still collectible from either end
        drop(h3);
        assert_eq!(registry.collect(), 1);
        assert_eq!(names(&registry), ["1"]);

        drop(h1);
        assert_eq!(registry.collect(), 1);
        assert!(registry.is_empty());
    }

    // Frees the node through the list's own pointer, which keeps this test clean under Miri
    // (`cargo +nightly miri test`) with a heap-owning slot.
    #[test_log::test]
    fn collect_frees_heap_owning_slots() {
        let (registry, counters) = registry();

        let keep = registry.add(Promise::new(Location::caller()).with_name("keep"), 1_u64);
        let handle = registry.add(
            Promise::new(Location::caller()).with_name("gone"),
            String::from("slot contents"),
        );
        assert_eq!(handle.slot(), "slot contents");

        handle.mark_for_removal();
        assert_eq!(registry.collect(), 1);
        assert_eq!(names(&registry), ["keep"]);
        assert_eq!(counters.snapshot().promises_existing, 1);

        assert_eq!(*keep.slot(), 1);
        drop(keep);
        assert_eq!(registry.collect(), 1);
        assert_eq!(counters.snapshot().promises_existing, 0);
    }

    #[test_log::test]
    fn marked_promise_reports_deleted_state() {
        let (registry, _) = registry();

        let handle = registry.add(Promise::new(Location::caller()), 0_u32);
        let id = handle.id();
        handle.set_state(PromiseState::Suspended);
        assert_eq!(registry.snapshot()[0].state, PromiseState::Suspended);

        handle.mark_for_removal();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].state, PromiseState::Deleted);
    }

    #[test_log::test]
    fn slot_is_destroyed_by_collect() {
        let live = Arc::new(AtomicUsize::new(0));
        let (registry, _) = registry();

        let mut handle = registry.add(Promise::new(Location::caller()), Some(Tracked::new(&live)));
        assert_eq!(live.load(Ordering::SeqCst), 1);

        // the slot can be emptied early through the handle
        drop(handle.slot_mut().take());
        assert_eq!(live.load(Ordering::SeqCst), 0);

        *handle.slot_mut() = Some(Tracked::new(&live));
        drop(handle);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        registry.collect();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn waiter_is_visible_to_visitors() {
        let (registry, _) = registry();

        let callee = registry.add(Promise::new(Location::caller()).with_name("callee"), ());
        let caller = registry.add(Promise::new(Location::caller()).with_name("caller"), ());
        callee.set_waiter(caller.id());

        let mut waiters = Vec::new();
        registry.for_promise(|p| waiters.push((p.name().map(ToOwned::to_owned), p.waiter())));
        assert_eq!(
            waiters,
            [
                (Some("caller".to_owned()), None),
                (Some("callee".to_owned()), Some(caller.id())),
            ]
        );
    }

    #[test_log::test]
    fn cross_thread_mark() {
        let (registry, counters) = registry();

        let handle = registry.add(Promise::new(Location::caller()), String::from("payload"));
        let id = handle.id();

        thread::spawn(move || {
            assert_eq!(handle.slot(), "payload");
            handle.mark_for_removal();
        })
        .join()
        .unwrap();

        let mut seen = Vec::new();
        registry.for_promise(|p| seen.push((p.id(), p.is_marked_for_removal())));
        assert_eq!(seen, [(id, true)]);
        assert_eq!(counters.snapshot().promises_ready_for_deletion, 1);

        assert_eq!(registry.collect(), 1);
        assert!(registry.is_empty());
    }

    #[test_log::test]
    fn collect_from_foreign_thread() {
        let (registry, _) = registry();

        let handle = registry.add(Promise::new(Location::caller()), ());
        handle.mark_for_removal();

        let remote = registry.clone();
        let collected = thread::spawn(move || remote.collect()).join().unwrap();
        assert_eq!(collected, 1);
        assert!(registry.is_empty());
    }

    #[test_log::test]
    fn add_from_foreign_thread_panics() {
        let (registry, _) = registry();

        let remote = registry.clone();
        let res = thread::spawn(move || {
            let _handle = remote.add(Promise::new(Location::caller()), ());
        })
        .join();

        assert!(res.is_err());
        assert!(registry.is_empty());
    }

    #[test_log::test]
    fn drop_destroys_marked_promises() {
        let live = Arc::new(AtomicUsize::new(0));
        let (registry, counters) = registry();

        for _ in 0..3 {
            let handle = registry.add(Promise::new(Location::caller()), Tracked::new(&live));
            handle.mark_for_removal();
        }
        assert_eq!(live.load(Ordering::SeqCst), 3);

        drop(registry);

        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(
            counters.snapshot(),
            CountersSnapshot {
                promises_total: 3,
                promises_existing: 0,
                promises_ready_for_deletion: 0,
                registries_total: 1,
                registries_existing: 0,
            }
        );
    }

    #[test_log::test]
    fn handles_keep_the_registry_alive() {
        let counters = Arc::new(Counters::default());
        let handle = {
            let registry = ThreadRegistry::make(counters.clone());
            registry.add(Promise::new(Location::caller()), ())
        };

        assert_eq!(counters.snapshot().registries_existing, 1);
        drop(handle);
        assert_eq!(counters.snapshot().registries_existing, 0);
        assert_eq!(counters.snapshot().promises_existing, 0);
    }

    #[test_log::test]
    fn metrics_follow_the_lifecycle() {
        let (registry, counters) = registry();

        let a = registry.add(Promise::new(Location::caller()), ());
        let b = registry.add(Promise::new(Location::caller()), ());

        let snap = counters.snapshot();
        assert_eq!(snap.promises_total, 2);
        assert_eq!(snap.promises_existing, 2);
        assert_eq!(snap.promises_ready_for_deletion, 0);

        a.mark_for_removal();
        assert_eq!(counters.snapshot().promises_ready_for_deletion, 1);

        registry.collect();
        let snap = counters.snapshot();
        assert_eq!(snap.promises_existing, 1);
        assert_eq!(snap.promises_ready_for_deletion, 0);

        drop(b);
        registry.collect();
        assert_eq!(counters.snapshot().promises_existing, 0);
    }

    #[test]
    #[should_panic = "does not belong to this registry"]
    fn mark_with_foreign_handle_panics() {
        let (a, _) = registry();
        let (b, _) = registry();

        let handle = a.add(Promise::new(Location::caller()), ());
        b.mark_for_removal(handle);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::thread;
    use crate::metrics::NoopMetrics;
    use core::panic::Location;

    #[test]
    fn mark_while_iterating() {
        crate::loom::model(|| {
            let registry = ThreadRegistry::make(Arc::new(NoopMetrics));
            let handle = registry.add(Promise::new(Location::caller()), ());

            let t = thread::spawn(move || handle.mark_for_removal());

            let mut seen = 0;
            registry.for_promise(|_| seen += 1);
            assert_eq!(seen, 1);

            t.join().unwrap();
            assert_eq!(registry.collect(), 1);
            assert!(registry.is_empty());
        });
    }
}
