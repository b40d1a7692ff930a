// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use coro_registry::Id;
use core::any::Any;
use core::fmt;

/// A task body panicked.
///
/// The panic is caught when the task completes and handed out exactly once, by the
/// [`Awaiter`](crate::Awaiter) that observes the task's result. If nothing ever observes it, it is
/// dropped silently together with the task's promise.
pub struct TaskError {
    id: Id,
    payload: Box<dyn Any + Send + 'static>,
}

impl TaskError {
    pub(crate) fn panic(id: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        Self { id, payload }
    }

    /// The id of the task that panicked.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The panic message, if the payload was a string.
    pub fn message(&self) -> Option<&str> {
        payload_as_str(&*self.payload)
    }

    /// Consumes the error, returning the object with which the task panicked.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.payload
    }

    /// Re-raise the original panic on the current thread.
    pub fn resume_unwind(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

fn payload_as_str(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some(s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Some(s.as_str())
    } else {
        None
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "task {} panicked with message {msg:?}", self.id),
            None => write!(f, "task {} panicked", self.id),
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskError({:?}, {:?}, ...)", self.id, self.message())
    }
}

impl core::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Id {
        coro_registry::Promise::new(core::panic::Location::caller()).id()
    }

    #[test]
    fn formats_str_and_string_payloads() {
        let id = id();

        let err = TaskError::panic(id, Box::new("boom"));
        assert_eq!(err.message(), Some("boom"));
        assert_eq!(err.to_string(), format!("task {id} panicked with message \"boom\""));

        let err = TaskError::panic(id, Box::new(String::from("kaboom")));
        assert_eq!(err.message(), Some("kaboom"));

        let err = TaskError::panic(id, Box::new(42_u32));
        assert_eq!(err.message(), None);
        assert_eq!(err.to_string(), format!("task {id} panicked"));
        assert_eq!(*err.into_panic().downcast::<u32>().unwrap(), 42);
    }

    #[test]
    #[should_panic = "re-raised"]
    fn resume_unwind_reraises() {
        TaskError::panic(id(), Box::new("re-raised")).resume_unwind();
    }
}
