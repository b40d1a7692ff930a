// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread trampoline for task polls.
//!
//! The outermost poll on a thread becomes the *driver*: it runs its task, then keeps dequeuing and
//! running tasks woken in the meantime until the queue is empty. A task woken while a driver is
//! active on the same thread is only enqueued. A chain of tasks resuming one another therefore
//! runs in a loop on a single stack frame instead of nesting one poll per link.

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

/// Something the run queue can poll.
pub(super) trait Runnable: Send + Sync {
    fn run(self: Arc<Self>);
}

struct RunQueue {
    driving: Cell<bool>,
    queue: RefCell<VecDeque<Arc<dyn Runnable>>>,
}

std::thread_local! {
    static RUN_QUEUE: RunQueue = const {
        RunQueue {
            driving: Cell::new(false),
            queue: RefCell::new(VecDeque::new()),
        }
    };
}

/// Clears the driving flag when the driver returns or unwinds.
struct DriveGuard<'a>(&'a RunQueue);

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.0.driving.set(false);
    }
}

/// Run `task` right now on this thread.
///
/// Used for the eager first poll, which has to happen before the task handle is returned even if
/// the caller is itself inside a poll. If no driver is active, the caller becomes the driver.
pub(super) fn run_now(task: Arc<dyn Runnable>) {
    RUN_QUEUE.with(|rq| {
        if rq.driving.replace(true) {
            task.run();
            return;
        }

        let _guard = DriveGuard(rq);
        task.run();
        drain(rq);
    });
}

/// Run `task` once the active driver on this thread gets to it, or right now if there is none.
pub(super) fn schedule(task: Arc<dyn Runnable>) {
    RUN_QUEUE.with(|rq| {
        if rq.driving.get() {
            rq.queue.borrow_mut().push_back(task);
            tracing::trace!(queued = rq.queue.borrow().len(), "deferred wakeup to the driver");
        } else {
            run_now(task);
        }
    });
}

fn drain(rq: &RunQueue) {
    let mut ran = 0_usize;
    loop {
        // the borrow must end before running, the task may enqueue more work
        let next = rq.queue.borrow_mut().pop_front();
        let Some(task) = next else { break };
        task.run();
        ran += 1;
    }

    if ran > 0 {
        tracing::trace!(ran, "drained run queue");
    }
}
