// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

use std::panic::Location;
use std::sync::{Arc, Barrier};
use std::thread;

use coro_registry::{Counters, Promise, PromiseState, ThreadRegistry, global};
use parking_lot::{Mutex, MutexGuard};

/// Traversals of the global registry temporarily keep every registry alive, serialize the tests
/// so they don't observe each other's registries mid-teardown.
fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock()
}

#[test_log::test]
fn sees_promises_of_other_threads() {
    let _guard = serial();

    let ready = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));

    let t = thread::Builder::new()
        .name("remote".into())
        .spawn({
            let ready = ready.clone();
            let done = done.clone();
            move || {
                let registry = ThreadRegistry::make(Arc::new(Counters::default()));
                let handle =
                    registry.add(Promise::new(Location::caller()).with_name("remote task"), ());
                handle.set_state(PromiseState::Suspended);
                ready.wait();
                done.wait();
                drop(handle);
            }
        })
        .unwrap();

    ready.wait();
    let found: Vec<_> = global()
        .snapshot()
        .into_iter()
        .filter(|p| p.name.as_deref() == Some("remote task"))
        .collect();
    done.wait();
    t.join().unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].state, PromiseState::Suspended);
    assert_eq!(found[0].thread.name(), Some("remote"));
    assert!(!found[0].thread.is_current());
}

#[test_log::test]
fn dead_registries_are_not_visited() {
    let _guard = serial();

    let registry = ThreadRegistry::make(Arc::new(Counters::default()));
    let ptr = Arc::as_ptr(&registry);

    let mut visited = false;
    global().for_registry(|r| visited |= Arc::as_ptr(r) == ptr);
    assert!(visited);

    drop(registry);

    let mut visited = false;
    global().for_registry(|r| visited |= Arc::as_ptr(r) == ptr);
    assert!(!visited);
}

#[test_log::test]
fn promises_are_grouped_by_registry() {
    let _guard = serial();

    let a = ThreadRegistry::make(Arc::new(Counters::default()));
    let b = ThreadRegistry::make(Arc::new(Counters::default()));

    let _a1 = a.add(Promise::new(Location::caller()).with_name("a1"), ());
    let _b1 = b.add(Promise::new(Location::caller()).with_name("b1"), ());
    let _a2 = a.add(Promise::new(Location::caller()).with_name("a2"), ());
    let _b2 = b.add(Promise::new(Location::caller()).with_name("b2"), ());

    let mut names = Vec::new();
    global().for_promise(|p| {
        if let Some(name) = p.name() {
            names.push(name.to_owned());
        }
    });

    // registries are visited in registration order, promises most recent first
    let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
    assert!(pos("a2") < pos("a1"));
    assert!(pos("b2") < pos("b1"));
    assert!(pos("a1") < pos("b2"));
}

#[test_log::test]
fn collect_reaches_every_registry() {
    let _guard = serial();

    let a = ThreadRegistry::make(Arc::new(Counters::default()));
    let b = ThreadRegistry::make(Arc::new(Counters::default()));

    a.add(Promise::new(Location::caller()), ()).mark_for_removal();
    b.add(Promise::new(Location::caller()), ()).mark_for_removal();

    assert_eq!(global().collect(), 2);
    assert!(a.is_empty());
    assert!(b.is_empty());
}

#[test_log::test]
fn current_uses_global_metrics() {
    let _guard = serial();

    let counters = Arc::new(Counters::default());
    global().set_metrics(counters.clone());

    thread::spawn(|| {
        let registry = coro_registry::current();
        assert!(Arc::ptr_eq(&registry, &coro_registry::current()));
        registry
            .add(Promise::new(Location::caller()), ())
            .mark_for_removal();
    })
    .join()
    .unwrap();

    global().set_metrics(Arc::new(coro_registry::NoopMetrics));

    let snap = counters.snapshot();
    assert_eq!(snap.registries_total, 1);
    assert_eq!(snap.registries_existing, 0);
    assert_eq!(snap.promises_total, 1);
    assert_eq!(snap.promises_existing, 0);
}
