// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bookkeeping for outstanding task invocations.
//!
//! Every task invocation owns a [`Promise`]: a small header carrying its id, source location,
//! creating thread, lifecycle state and the id of whoever awaits it. Promises live in heap nodes
//! next to a typed result slot and are linked into the [`ThreadRegistry`] of the thread that
//! created them. Registries in turn are tracked by the process-wide [`GlobalRegistry`], so
//! debugging and introspection tools can enumerate every outstanding invocation in the process.
//!
//! Nodes are reclaimed lazily. Dropping a [`PromiseHandle`] merely *marks* its node, which may
//! happen on any thread. The node stays visible to visitors until a collection pass
//! ([`ThreadRegistry::collect`]) unlinks and destroys it.

mod global;
mod loom;
mod metrics;
mod promise;
mod thread_registry;

use std::sync::Arc;

pub use global::{GlobalRegistry, global};
pub use metrics::{Counters, CountersSnapshot, Metrics, NoopMetrics};
pub use promise::{Id, Promise, PromiseHandle, PromiseSnapshot, PromiseState, ThreadInfo};
pub use thread_registry::ThreadRegistry;

crate::loom::thread_local! {
    static CURRENT: Arc<ThreadRegistry> = ThreadRegistry::make(global().metrics());
}

/// Returns the registry of the calling thread, creating it on first use.
///
/// The registry is created with the sink returned by [`GlobalRegistry::metrics`] at that time.
///
/// # Panics
///
/// Panics if called while the calling thread's thread-locals are being torn down.
pub fn current() -> Arc<ThreadRegistry> {
    CURRENT.with(Clone::clone)
}

static_assertions::assert_impl_all!(ThreadRegistry: Send, Sync);
static_assertions::assert_impl_all!(GlobalRegistry: Send, Sync);
static_assertions::assert_impl_all!(Promise: Send, Sync);
static_assertions::assert_impl_all!(PromiseHandle<String>: Send, Sync);
static_assertions::assert_not_impl_any!(PromiseHandle<std::cell::Cell<u8>>: Sync);
static_assertions::assert_not_impl_any!(PromiseHandle<()>: Clone);
