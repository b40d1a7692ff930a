// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Mutex;
use crate::metrics::{Metrics, NoopMetrics};
use crate::promise::{Promise, PromiseSnapshot};
use crate::thread_registry::ThreadRegistry;
use core::fmt;
use std::sync::{Arc, Weak};

crate::loom::lazy_static! {
    static ref GLOBAL: GlobalRegistry = GlobalRegistry::new();
}

/// Returns the process-wide registry of all thread registries.
pub fn global() -> &'static GlobalRegistry {
    &GLOBAL
}

/// The process-wide set of [`ThreadRegistry`]s.
///
/// The global registry only holds weak references, a thread registry lives for as long as its
/// owning thread or any of its promise handles keeps it alive. Dead entries are pruned whenever a
/// new registry is registered.
pub struct GlobalRegistry {
    registries: Mutex<Vec<Weak<ThreadRegistry>>>,
    metrics: Mutex<Arc<dyn Metrics>>,
}

impl GlobalRegistry {
    fn new() -> Self {
        Self {
            registries: Mutex::new(Vec::new()),
            metrics: Mutex::new(Arc::new(NoopMetrics)),
        }
    }

    pub(crate) fn register(&self, registry: &Arc<ThreadRegistry>) {
        let mut registries = self.registries.lock();
        registries.retain(|weak| weak.strong_count() > 0);
        registries.push(Arc::downgrade(registry));
    }

    /// The metrics sink handed to thread registries created through [`crate::current`].
    pub fn metrics(&self) -> Arc<dyn Metrics> {
        self.metrics.lock().clone()
    }

    /// Replace the metrics sink. Registries that already exist keep the sink they were created
    /// with.
    pub fn set_metrics(&self, metrics: Arc<dyn Metrics>) {
        *self.metrics.lock() = metrics;
    }

    /// Visit every live thread registry.
    ///
    /// The set of registries is copied up front, so `f` may create or drop registries without
    /// deadlocking; registries created during the traversal are not visited.
    pub fn for_registry(&self, mut f: impl FnMut(&Arc<ThreadRegistry>)) {
        let registries: Vec<_> = self
            .registries
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for registry in &registries {
            f(registry);
        }
    }

    /// Visit every promise in every live thread registry.
    ///
    /// Promises are grouped by registry, registries are visited in the order they were created and
    /// promises appear most recently added first within each group.
    pub fn for_promise(&self, mut f: impl FnMut(&Promise)) {
        self.for_registry(|registry| registry.for_promise(&mut f));
    }

    pub fn snapshot(&self) -> Vec<PromiseSnapshot> {
        let mut out = Vec::new();
        self.for_promise(|promise| out.push(promise.snapshot()));
        out
    }

    /// Run a collection pass on every live thread registry, returning the total number of
    /// destroyed promises.
    pub fn collect(&self) -> usize {
        let mut count = 0;
        self.for_registry(|registry| count += registry.collect());
        count
    }
}

impl fmt::Debug for GlobalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalRegistry")
            .field("registries", &self.registries.lock().len())
            .field("metrics", &*self.metrics.lock())
            .finish()
    }
}
