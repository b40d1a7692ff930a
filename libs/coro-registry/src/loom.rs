// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::lazy_static;
        pub(crate) use loom::thread;
        pub(crate) use loom::thread_local;
        #[cfg(test)]
        pub(crate) use loom::model;

        pub(crate) mod sync {
            pub(crate) use loom::sync::atomic;

            /// `loom`'s mutex mirrors `std`'s poisoning API, this wraps it so call sites
            /// read the same as with `parking_lot`.
            #[derive(Debug)]
            pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

            impl<T> Mutex<T> {
                pub(crate) fn new(data: T) -> Self {
                    Self(loom::sync::Mutex::new(data))
                }

                #[track_caller]
                pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
                    self.0.lock().expect("mutex poisoned")
                }
            }
        }
    } else {
        pub(crate) use lazy_static::lazy_static;
        pub(crate) use std::thread;
        pub(crate) use std::thread_local;

        pub(crate) mod sync {
            pub(crate) use core::sync::atomic;
            pub(crate) use parking_lot::Mutex;
        }
    }
}
