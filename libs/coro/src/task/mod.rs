// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Eagerly started, single-owner tasks.
//!
//! A [`Task`] is created by handing a future to [`Task::new`] (or [`Builder::spawn`]). The future
//! is polled right away on the calling thread, so a body that never suspends has already completed
//! by the time the handle is returned. Every invocation owns a promise in a
//! [`ThreadRegistry`](coro_registry::ThreadRegistry), which makes it visible to introspection
//! until a collection pass reclaims it.
//!
//! There is no scheduler. Whenever a future the task is suspended on wakes the task's [`Waker`],
//! the task is polled on the waking thread. If that thread is already polling a task, the wakeup
//! is queued on a per-thread run queue and the outermost poll runs it before returning, so a long
//! chain of tasks resuming one another never nests on the stack. A wakeup that arrives while the
//! task itself is being polled is remembered and the task is polled again once the current poll
//! returns, so a task's future is never polled by two threads at once and never re-entered.
//!
//! # Observing the result
//!
//! The result of a task is observed by converting the handle into an [`Awaiter`], either
//! explicitly through [`Task::into_awaiter`] or implicitly by `.await`ing the task. The awaiter
//! yields `Result<T, TaskError>`, where the error carries the payload of a panic raised inside the
//! task body.
//!
//! # Abandonment
//!
//! Dropping a task handle (or calling [`Task::reset`]) abandons the invocation: if it is
//! suspended its future is dropped without being polled again, if it is currently being polled on
//! another thread that thread finishes the teardown. A result that was never observed (including a
//! captured panic) is dropped silently when the promise is collected.

mod builder;
mod run_queue;
mod state;
mod yield_now;

use crate::awaiter::Awaiter;
use crate::error::TaskError;
use coro_registry::{Id, PromiseHandle, PromiseState};
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use parking_lot::Mutex;
use run_queue::Runnable;
use state::{AbandonAction, PollAction, State, WakeAction};
use std::sync::Arc;
use std::task::Wake;

pub use builder::Builder;
pub use yield_now::yield_now;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The slot a task's promise carries: empty until the task completes, then the result until an
/// awaiter takes it.
pub(crate) type Slot<T> = Option<Result<T, TaskError>>;

/// An owning handle to an eagerly started task invocation.
///
/// `Task` is move-only and the exclusive owner of its invocation. A handle may be *invalid*: the
/// default value, a handle whose invocation was moved out with [`Task::take`], or one that was
/// [`reset`][Task::reset].
pub struct Task<T> {
    core: Option<Arc<Core<T>>>,
}

/// The shared part of a task: its future, state word, continuation and promise.
pub(crate) struct Core<T> {
    state: State,
    id: Id,
    span: tracing::Span,
    /// Only accessed by whoever holds the `POLLING` bit, or by the party tearing down an abandoned
    /// idle task.
    future: UnsafeCell<Option<BoxFuture<T>>>,
    /// Woken once the task completes.
    continuation: Mutex<Option<Waker>>,
    /// `None` once the promise was marked for removal.
    promise: Mutex<Option<PromiseHandle<Slot<T>>>>,
}

std::thread_local! {
    static CURRENT: Cell<Option<Id>> = const { Cell::new(None) };
}

/// Returns the id of the task currently being polled on this thread, if any.
pub fn try_current_id() -> Option<Id> {
    CURRENT.with(Cell::get)
}

/// Restores the previously current task when dropped.
struct CurrentGuard(Option<Id>);

impl CurrentGuard {
    fn enter(id: Id) -> Self {
        Self(CURRENT.with(|current| current.replace(Some(id))))
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.0));
    }
}

// === impl Task ===

impl<T> Task<T>
where
    T: Send + 'static,
{
    /// Start a new task on the calling thread, registering its promise with the calling thread's
    /// registry. The future is polled once before this returns.
    #[track_caller]
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Builder::new().spawn(future)
    }
}

impl<T> Task<T> {
    /// Returns `true` if this handle owns an invocation.
    pub fn valid(&self) -> bool {
        self.core.is_some()
    }

    /// Abandon the owned invocation, leaving this handle invalid. Does nothing on an invalid
    /// handle.
    pub fn reset(&mut self) {
        if let Some(core) = self.core.take() {
            core.abandon();
        }
    }

    /// Move the invocation out of this handle, leaving it invalid.
    ///
    /// # Panics
    ///
    /// Panics if the handle is already invalid.
    #[must_use]
    #[track_caller]
    pub fn take(&mut self) -> Self {
        let Some(core) = self.core.take() else {
            panic!("cannot move out of an invalid task handle");
        };
        Self { core: Some(core) }
    }

    /// Returns `true` if the invocation ran to completion. Always `false` for an invalid handle.
    pub fn is_ready(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.state.is_complete())
    }

    /// The id of the owned invocation, which is also the id of its promise.
    pub fn id(&self) -> Option<Id> {
        self.core.as_ref().map(|core| core.id)
    }

    /// Convert this handle into an [`Awaiter`] for the invocation's result.
    ///
    /// # Panics
    ///
    /// Panics if the handle is invalid.
    #[track_caller]
    pub fn into_awaiter(mut self) -> Awaiter<T> {
        let Some(core) = self.core.take() else {
            panic!("cannot await an invalid task handle");
        };
        Awaiter::new(core)
    }
}

impl<T> Default for Task<T> {
    fn default() -> Self {
        Self { core: None }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> IntoFuture for Task<T> {
    type Output = Result<T, TaskError>;
    type IntoFuture = Awaiter<T>;

    #[track_caller]
    fn into_future(self) -> Self::IntoFuture {
        self.into_awaiter()
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.core {
            Some(core) => f
                .debug_struct("Task")
                .field("id", &core.id)
                .field("state", &core.state)
                .finish(),
            None => f.write_str("Task(<invalid>)"),
        }
    }
}

// === impl Core ===

impl<T> Core<T> {
    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Record `waker` as the continuation to wake once the task completes.
    ///
    /// Returns `false` without recording anything if the task already completed.
    pub(crate) fn register_continuation(&self, waker: &Waker) -> bool {
        let mut continuation = self.continuation.lock();

        // checked under the lock, the completing thread sets COMPLETE before taking the
        // continuation
        if self.state.is_complete() {
            return false;
        }

        match &mut *continuation {
            Some(prev) if prev.will_wake(waker) => {}
            slot => *slot = Some(waker.clone()),
        }
        true
    }

    pub(crate) fn set_waiter(&self, waiter: Id) {
        if let Some(promise) = &*self.promise.lock() {
            promise.set_waiter(waiter);
        }
    }

    /// Take the result out of the promise slot and mark the promise for removal.
    ///
    /// # Panics
    ///
    /// Panics if the task did not complete yet or the result was already taken.
    #[track_caller]
    pub(crate) fn take_output(&self) -> Result<T, TaskError> {
        assert!(
            self.state.is_complete(),
            "task {} was resumed before it completed",
            self.id
        );

        let Some(mut promise) = self.promise.lock().take() else {
            panic!("result of task {} was already taken", self.id);
        };
        let output = promise.slot_mut().take();
        promise.mark_for_removal();

        let _span = self.span.enter();
        tracing::trace!("result observed");

        let Some(output) = output else {
            unreachable!("completed task {} has an empty slot", self.id);
        };
        output
    }

    /// Give up on the task. See [`AbandonAction`] for who does what.
    pub(crate) fn abandon(&self) {
        let _span = self.span.enter();
        let action = self.state.abandon();
        tracing::trace!(?action, "abandoned");

        match action {
            AbandonAction::Teardown => {
                // Safety: the task is neither polling nor complete, and the ABANDONED bit we just
                // set keeps wakers from starting a new poll
                unsafe {
                    self.drop_future();
                }
                self.finalize();
            }
            AbandonAction::Finalize => self.finalize(),
            AbandonAction::Deferred | AbandonAction::None => {}
        }
    }

    /// Mark the promise for removal, if nobody did so yet.
    fn finalize(&self) {
        let promise = self.promise.lock().take();
        drop(promise);
    }

    fn set_promise_state(&self, state: PromiseState) {
        if let Some(promise) = &*self.promise.lock() {
            promise.set_state(state);
        }
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the future, see the docs on the field.
    unsafe fn drop_future(&self) {
        // Safety: ensured by caller
        let future = unsafe { (*self.future.get()).take() };
        drop(future);
    }
}

impl<T> Core<T>
where
    T: Send + 'static,
{
    pub(super) fn new(
        id: Id,
        span: tracing::Span,
        future: BoxFuture<T>,
        promise: PromiseHandle<Slot<T>>,
    ) -> Self {
        Self {
            state: State::new(),
            id,
            span,
            future: UnsafeCell::new(Some(future)),
            continuation: Mutex::new(None),
            promise: Mutex::new(Some(promise)),
        }
    }

    /// Drive the future for as long as it keeps getting woken during its own polls.
    ///
    /// The caller must hold the `POLLING` bit.
    fn drive(self: &Arc<Self>) {
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        loop {
            // abandoned while waiting on the run queue, or between two polls
            if self.state.is_abandoned() {
                let action = self.state.end_poll(false);
                debug_assert_eq!(action, PollAction::Finalize);
                // Safety: we held the POLLING bit and ABANDONED keeps everyone else out
                unsafe {
                    self.drop_future();
                }
                self.finalize();
                return;
            }

            self.set_promise_state(PromiseState::Running);

            let result = {
                let _current = CurrentGuard::enter(self.id);
                let _span = self.span.enter();
                tracing::trace!("poll");

                // Safety: we hold the POLLING bit
                let future = unsafe { &mut *self.future.get() };
                let Some(future) = future.as_mut() else {
                    unreachable!("polled task {} without a future", self.id);
                };

                std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
            };

            let output = match result {
                Ok(Poll::Pending) => {
                    // must happen before releasing the POLLING bit, another thread may start
                    // polling right after
                    self.set_promise_state(PromiseState::Suspended);

                    match self.state.end_poll(false) {
                        PollAction::Repoll => continue,
                        PollAction::Suspend => {}
                        PollAction::Finalize => {
                            // Safety: we held the POLLING bit and ABANDONED keeps everyone else
                            // out
                            unsafe {
                                self.drop_future();
                            }
                            self.finalize();
                        }
                        PollAction::Complete => unreachable!("incomplete poll completed the task"),
                    }
                    return;
                }
                Ok(Poll::Ready(value)) => Ok(value),
                Err(payload) => {
                    let err = TaskError::panic(self.id, payload);
                    let _span = self.span.enter();
                    tracing::trace!(%err, "task panicked");
                    Err(err)
                }
            };

            self.complete(output);
            return;
        }
    }

    fn complete(&self, output: Result<T, TaskError>) {
        // Safety: we still hold the POLLING bit
        unsafe {
            self.drop_future();
        }

        if let Some(promise) = &mut *self.promise.lock() {
            *promise.slot_mut() = Some(output);
            promise.set_state(PromiseState::Resolved);
        }

        match self.state.end_poll(true) {
            PollAction::Complete => {
                let _span = self.span.enter();
                tracing::trace!("completed");

                let continuation = self.continuation.lock().take();
                if let Some(waker) = continuation {
                    waker.wake();
                }
            }
            PollAction::Finalize => self.finalize(),
            action => unreachable!("completed poll resulted in {action:?}"),
        }
    }
}

impl<T> Runnable for Core<T>
where
    T: Send + 'static,
{
    fn run(self: Arc<Self>) {
        self.drive();
    }
}

impl<T> Wake for Core<T>
where
    T: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.state.wake() == WakeAction::Poll {
            run_queue::schedule(self.clone());
        }
    }
}

impl<T> fmt::Debug for Core<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// Safety: the future is only accessed by the thread holding the POLLING bit (or the abandoning
// thread once no poll can start anymore), everything else is behind locks or atomic.
unsafe impl<T: Send> Sync for Core<T> {}
