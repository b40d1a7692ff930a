// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Sink for the counters the registries update at their hook points.
///
/// Every method defaults to a no-op so implementations only need to override the hooks they care
/// about. Hooks may be called from any thread, and `promise_marked` in particular is called from
/// whatever thread finished with a promise.
pub trait Metrics: Send + Sync + fmt::Debug {
    /// A promise was linked into a thread registry.
    fn promise_created(&self) {}

    /// A promise was marked for removal.
    fn promise_marked(&self) {}

    /// A collection pass destroyed `count` promises.
    fn promises_collected(&self, count: usize) {
        let _ = count;
    }

    /// A thread registry was created.
    fn registry_created(&self) {}

    /// A thread registry was torn down.
    fn registry_destroyed(&self) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// A [`Metrics`] sink that keeps plain atomic counters.
#[derive(Debug, Default)]
pub struct Counters {
    promises_total: AtomicUsize,
    promises_existing: AtomicUsize,
    promises_ready_for_deletion: AtomicUsize,
    registries_total: AtomicUsize,
    registries_existing: AtomicUsize,
}

/// A point-in-time copy of [`Counters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Promises ever created.
    pub promises_total: usize,
    /// Promises currently allocated, including those waiting for collection.
    pub promises_existing: usize,
    /// Promises marked for removal but not yet collected.
    pub promises_ready_for_deletion: usize,
    /// Thread registries ever created.
    pub registries_total: usize,
    /// Thread registries currently alive.
    pub registries_existing: usize,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            promises_total: self.promises_total.load(Ordering::Acquire),
            promises_existing: self.promises_existing.load(Ordering::Acquire),
            promises_ready_for_deletion: self.promises_ready_for_deletion.load(Ordering::Acquire),
            registries_total: self.registries_total.load(Ordering::Acquire),
            registries_existing: self.registries_existing.load(Ordering::Acquire),
        }
    }
}

impl Metrics for Counters {
    fn promise_created(&self) {
        self.promises_total.fetch_add(1, Ordering::AcqRel);
        self.promises_existing.fetch_add(1, Ordering::AcqRel);
    }

    fn promise_marked(&self) {
        self.promises_ready_for_deletion.fetch_add(1, Ordering::AcqRel);
    }

    fn promises_collected(&self, count: usize) {
        self.promises_existing.fetch_sub(count, Ordering::AcqRel);
        self.promises_ready_for_deletion.fetch_sub(count, Ordering::AcqRel);
    }

    fn registry_created(&self) {
        self.registries_total.fetch_add(1, Ordering::AcqRel);
        self.registries_existing.fetch_add(1, Ordering::AcqRel);
    }

    fn registry_destroyed(&self) {
        self.registries_existing.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Display for CountersSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "promises: {} existing ({} ready for deletion, {} total), registries: {} existing ({} total)",
            self.promises_existing,
            self.promises_ready_for_deletion,
            self.promises_total,
            self.registries_existing,
            self.registries_total,
        )
    }
}
