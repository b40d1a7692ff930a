// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Task state. The task stores its state in an atomic `usize` with various bitfields for the
/// necessary information. The state has the following layout:
///
/// ```text
/// | 3         3 | 2        2 | 1        1 | 0       0 |
/// | abandoned   | complete   | notified   | polling   |
/// ```
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// If set, some thread is currently polling this task's future.
        pub const POLLING: bool;
        /// If set, the task was woken while being polled and must be polled again.
        pub const NOTIFIED: bool;
        /// If set, the future returned `Poll::Ready` (or panicked) and the result is in the slot.
        pub const COMPLETE: bool;
        /// If set, the owning handle gave up on the task.
        pub const ABANDONED: bool;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeAction {
    /// The waking thread now owns the `POLLING` bit and must poll the task.
    Poll,
    /// Nothing to do, either because the task is being polled (and will be polled again) or
    /// because there is nothing left to poll.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum PollAction {
    /// The task is complete, the continuation must be woken.
    Complete,
    /// The task was woken during the poll, poll it again.
    Repoll,
    /// The task is parked until the next wakeup.
    Suspend,
    /// The task was abandoned during the poll, the poller must tear it down and mark its promise.
    Finalize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum AbandonAction {
    /// The task is idle, the abandoning party must drop the future and mark the promise.
    Teardown,
    /// The task is complete, the abandoning party must mark the promise. The unobserved result
    /// stays in the slot until the node is collected.
    Finalize,
    /// The task is being polled or waits on a run queue to be polled, the poller will finish the
    /// teardown.
    Deferred,
    /// The task was already abandoned.
    None,
}

impl State {
    /// Returns a task's initial state.
    ///
    /// Tasks are started eagerly, so the creating thread holds the `POLLING` bit from the start.
    pub(super) fn new() -> Self {
        let mut initial = Snapshot(0);
        initial.set(Snapshot::POLLING, true);
        Self {
            val: AtomicUsize::new(initial.0),
        }
    }

    pub(super) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    pub(super) fn is_complete(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::COMPLETE)
    }

    pub(super) fn is_abandoned(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::ABANDONED)
    }

    /// Attempt to claim the task for polling in response to a wakeup.
    pub(super) fn wake(&self) -> WakeAction {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETE) || s.get(Snapshot::ABANDONED) {
                return WakeAction::None;
            }

            // the current poller picks this up when it finishes
            if s.get(Snapshot::POLLING) {
                s.set(Snapshot::NOTIFIED, true);
                return WakeAction::None;
            }

            s.set(Snapshot::POLLING, true);
            WakeAction::Poll
        })
    }

    /// Release the `POLLING` bit after a poll. `completed` must be set to true if the future
    /// returned `Poll::Ready` or panicked.
    pub(super) fn end_poll(&self, completed: bool) -> PollAction {
        self.transition(|s| {
            debug_assert!(s.get(Snapshot::POLLING), "ended a poll that never started");

            if completed {
                s.set(Snapshot::POLLING, false)
                    .set(Snapshot::NOTIFIED, false)
                    .set(Snapshot::COMPLETE, true);

                return if s.get(Snapshot::ABANDONED) {
                    PollAction::Finalize
                } else {
                    PollAction::Complete
                };
            }

            if s.get(Snapshot::ABANDONED) {
                s.set(Snapshot::POLLING, false)
                    .set(Snapshot::NOTIFIED, false);
                return PollAction::Finalize;
            }

            if s.get(Snapshot::NOTIFIED) {
                // keep the POLLING bit, we go right back into the future
                s.set(Snapshot::NOTIFIED, false);
                return PollAction::Repoll;
            }

            s.set(Snapshot::POLLING, false);
            PollAction::Suspend
        })
    }

    pub(super) fn abandon(&self) -> AbandonAction {
        self.transition(|s| {
            if s.get(Snapshot::ABANDONED) {
                return AbandonAction::None;
            }

            s.set(Snapshot::ABANDONED, true);

            if s.get(Snapshot::COMPLETE) {
                AbandonAction::Finalize
            } else if s.get(Snapshot::POLLING) {
                AbandonAction::Deferred
            } else {
                AbandonAction::Teardown
            }
        })
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            // Run the transition function.
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            tracing::trace!("State::transition; {current} -> {next}");
            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_polling() {
        let state = State::new();
        let s = state.load(Ordering::Acquire);
        assert!(s.get(Snapshot::POLLING));
        assert!(!s.get(Snapshot::COMPLETE));
    }

    #[test]
    fn wake_during_poll_repolls() {
        let state = State::new();

        assert_eq!(state.wake(), WakeAction::None);
        assert_eq!(state.end_poll(false), PollAction::Repoll);
        assert_eq!(state.end_poll(false), PollAction::Suspend);

        assert_eq!(state.wake(), WakeAction::Poll);
        // a second waker racing with the first one must not poll concurrently
        assert_eq!(state.wake(), WakeAction::None);
        assert_eq!(state.end_poll(true), PollAction::Complete);

        assert!(state.is_complete());
        assert_eq!(state.wake(), WakeAction::None);
    }

    #[test]
    fn abandon_idle_tears_down() {
        let state = State::new();
        assert_eq!(state.end_poll(false), PollAction::Suspend);

        assert_eq!(state.abandon(), AbandonAction::Teardown);
        assert_eq!(state.abandon(), AbandonAction::None);
        // abandoned tasks are never polled again
        assert_eq!(state.wake(), WakeAction::None);
    }

    #[test]
    fn abandon_while_polling_defers_to_poller() {
        let state = State::new();

        assert_eq!(state.abandon(), AbandonAction::Deferred);
        assert_eq!(state.end_poll(false), PollAction::Finalize);

        let state = State::new();
        assert_eq!(state.abandon(), AbandonAction::Deferred);
        assert_eq!(state.end_poll(true), PollAction::Finalize);
        assert!(state.is_complete());
    }

    #[test]
    fn abandon_completed_finalizes() {
        let state = State::new();
        assert_eq!(state.end_poll(true), PollAction::Complete);
        assert_eq!(state.abandon(), AbandonAction::Finalize);
    }
}
