// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::TaskError;
use crate::task::{self, Core};
use coro_registry::Id;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::Arc;

/// Owns a task invocation while its result is being waited for.
///
/// Obtained from [`Task::into_awaiter`](crate::Task::into_awaiter) or implicitly by `.await`ing a
/// [`Task`](crate::Task). The awaiter can be driven by hand through [`is_ready`][Self::is_ready],
/// [`suspend`][Self::suspend] and [`resume`][Self::resume], or polled as a [`Future`].
///
/// Dropping an awaiter before its result was taken abandons the task, exactly like dropping the
/// task handle would.
#[must_use = "dropping an awaiter abandons its task"]
pub struct Awaiter<T> {
    core: Option<Arc<Core<T>>>,
    waiter_recorded: bool,
}

impl<T> Awaiter<T> {
    pub(crate) fn new(core: Arc<Core<T>>) -> Self {
        Self {
            core: Some(core),
            waiter_recorded: false,
        }
    }

    /// Returns `true` once the task completed and its result can be taken without suspending.
    pub fn is_ready(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.is_complete())
    }

    /// The id of the awaited task, `None` once its result was taken.
    pub fn id(&self) -> Option<Id> {
        self.core.as_ref().map(|core| core.id())
    }

    /// Record `waker` as the continuation to wake once the task completes.
    ///
    /// Returns `false` if the task already completed, in which case nothing is recorded and the
    /// caller should go on with [`resume`][Self::resume] right away.
    ///
    /// # Panics
    ///
    /// Panics if the result was already taken.
    #[track_caller]
    pub fn suspend(&mut self, waker: &Waker) -> bool {
        self.core().register_continuation(waker)
    }

    /// Take the task's result, a panic raised inside the task body is returned as `Err`.
    ///
    /// # Panics
    ///
    /// Panics if the task did not complete yet.
    #[track_caller]
    pub fn resume(mut self) -> Result<T, TaskError> {
        self.take_output()
    }

    #[track_caller]
    fn core(&self) -> &Arc<Core<T>> {
        let Some(core) = &self.core else {
            panic!("`Awaiter` used after its result was taken");
        };
        core
    }

    #[track_caller]
    fn take_output(&mut self) -> Result<T, TaskError> {
        let output = self.core().take_output();
        self.core = None;
        output
    }

    /// Record the task polling us as the waiter of the awaited task's promise.
    fn record_waiter(&mut self) {
        if self.waiter_recorded {
            return;
        }

        if let Some(current) = task::try_current_id() {
            self.core().set_waiter(current);
            self.waiter_recorded = true;
        }
    }
}

impl<T> Future for Awaiter<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        this.record_waiter();

        if this.suspend(cx.waker()) {
            Poll::Pending
        } else {
            Poll::Ready(this.take_output())
        }
    }
}

impl<T> Drop for Awaiter<T> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.abandon();
        }
    }
}

impl<T> fmt::Debug for Awaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaiter")
            .field("core", &self.core)
            .field("waiter_recorded", &self.waiter_recorded)
            .finish()
    }
}
