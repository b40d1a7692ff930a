// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Eagerly started, single-owner async tasks whose invocations are tracked for introspection.
//!
//! ```
//! use coro::Task;
//!
//! let a = Task::new(async { 12 });
//! let b = Task::new(async move { 2 * a.await.unwrap() });
//!
//! assert!(b.is_ready());
//! assert_eq!(coro::block_on(b).unwrap(), 24);
//!
//! // both promises stay visible to introspection until collected
//! assert_eq!(coro_registry::current().collect(), 2);
//! ```

mod awaiter;
mod block_on;
mod error;
pub mod task;

pub use awaiter::Awaiter;
pub use block_on::block_on;
pub use error::TaskError;
pub use task::{Builder, Task, try_current_id, yield_now};

static_assertions::assert_impl_all!(Task<String>: Send, Sync);
static_assertions::assert_impl_all!(Awaiter<String>: Send, Sync);
static_assertions::assert_impl_all!(TaskError: Send);
static_assertions::assert_not_impl_any!(Task<String>: Clone);
