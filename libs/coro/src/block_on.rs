// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll, Waker};
use std::sync::Arc;
use std::task::Wake;
use std::thread::{self, Thread};

struct ThreadNotify {
    thread: Thread,
    unparked: AtomicBool,
}

impl Wake for ThreadNotify {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // only unpark if we were the ones to set the flag
        if !self.unparked.swap(true, Ordering::Release) {
            tracing::trace!("unparking thread {:?}...", self.thread);
            self.thread.unpark();
        }
    }
}

/// Drive `future` to completion on the current thread, parking the thread while it is pending.
///
/// This is the way for code outside of any task to wait for a [`Task`](crate::Task):
/// `block_on(task)` converts the task into its awaiter and blocks until the result is available.
pub fn block_on<F: IntoFuture>(future: F) -> F::Output {
    std::thread_local! {
        static CURRENT_THREAD_NOTIFY: Arc<ThreadNotify> = Arc::new(ThreadNotify {
            thread: thread::current(),
            unparked: AtomicBool::new(false),
        });
    }

    let mut future = pin!(future.into_future());

    CURRENT_THREAD_NOTIFY.with(|thread_notify| {
        let waker = Waker::from(thread_notify.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(t) = future.as_mut().poll(&mut cx) {
                return t;
            }

            // Wait for a wakeup.
            while !thread_notify.unparked.swap(false, Ordering::Acquire) {
                // No wakeup occurred. It may occur now, right before parking,
                // but in that case the token made available by `unpark()`
                // is guaranteed to still be available and `park()` is a no-op.
                tracing::trace!("parking current thread ({:?})...", thread_notify.thread);
                thread::park();
            }
        }
    })
}
