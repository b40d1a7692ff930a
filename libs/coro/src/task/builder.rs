// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::{Core, Task, run_queue};
use coro_registry::{Promise, ThreadRegistry};
use core::any::type_name;
use core::panic::Location;
use std::sync::Arc;

/// Configures a task before starting it.
#[derive(Debug, Clone, Default)]
pub struct Builder<'a> {
    name: Option<&'a str>,
    location: Option<&'static Location<'static>>,
    registry: Option<Arc<ThreadRegistry>>,
}

impl<'a> Builder<'a> {
    pub const fn new() -> Self {
        Self {
            name: None,
            location: None,
            registry: None,
        }
    }

    /// Name the task. The name shows up in the task's span and promise.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the source location recorded for the task, defaults to the caller of
    /// [`Builder::spawn`].
    #[must_use]
    pub fn location(mut self, location: &'static Location<'static>) -> Self {
        self.location = Some(location);
        self
    }

    /// Register the task's promise with `registry` instead of the calling thread's
    /// [current](coro_registry::current) registry. The registry must be owned by the thread that
    /// spawns the task.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ThreadRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Start the task, polling `future` once on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if an explicit registry was configured that is owned by a different thread.
    #[track_caller]
    pub fn spawn<F>(self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let loc = self.location.unwrap_or(Location::caller());
        let registry = self.registry.unwrap_or_else(coro_registry::current);

        let mut promise = Promise::new(loc);
        if let Some(name) = self.name {
            promise = promise.with_name(name);
        }
        let id = promise.id();

        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?self.name,
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        let promise = registry.add(promise, None);
        let core = Arc::new(Core::new(id, span, Box::pin(future), promise));

        run_queue::run_now(core.clone());

        Task { core: Some(core) }
    }
}
