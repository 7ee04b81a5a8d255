// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scheduling scenarios.
//!
//! Unless a test says otherwise it runs one core with the timer disabled,
//! which makes the machine fully deterministic.

mod common;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;

use common::UnsafeSyncCell;
use relay::{launch, CondVar, MachineConfig, Mutex, Thread, TimerMode};

#[test]
fn produced_item_is_consumed_exactly_once() {
    let _r = env_logger::try_init();
    let consumed = Arc::new(ArrayQueue::new(4));
    let observed = consumed.clone();

    launch(MachineConfig::default(), move || {
        let shared = Arc::new((
            Mutex::new(),
            CondVar::new(),
            UnsafeSyncCell::new(Vec::<&str>::new()),
        ));

        let producer_shared = shared.clone();
        let producer = Thread::spawn(move || {
            let (mutex, item_ready, items) = &*producer_shared;
            mutex.lock();
            unsafe { (*items.inner.get()).push("x") };
            item_ready.signal();
            mutex.unlock().unwrap();
        });

        let (mutex, item_ready, items) = &*shared;
        mutex.lock();
        while unsafe { (*items.inner.get()).is_empty() } {
            item_ready.wait(mutex).unwrap();
        }
        let item = unsafe { (*items.inner.get()).pop() }.unwrap();
        assert!(unsafe { (*items.inner.get()).is_empty() });
        mutex.unlock().unwrap();

        producer.join();
        let _ = observed.push(item);
    });

    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed.pop(), Some("x"));
}

#[test]
fn joins_complete_in_spawn_order() {
    let _r = env_logger::try_init();
    let finish_order = Arc::new(ArrayQueue::new(3));
    let observed = finish_order.clone();

    launch(MachineConfig::default(), move || {
        let threads: Vec<Thread> = (1..=3)
            .map(|index| {
                let finish_order = observed.clone();
                Thread::spawn(move || {
                    for _ in 0..100 {
                        Thread::yield_now();
                    }
                    let _ = finish_order.push(index);
                })
            })
            .collect();

        for thread in &threads {
            thread.join();
            assert!(thread.is_finished());
        }
    });

    assert_eq!(finish_order.pop(), Some(1));
    assert_eq!(finish_order.pop(), Some(2));
    assert_eq!(finish_order.pop(), Some(3));
}

#[test]
fn contended_mutex_grants_in_arrival_order() {
    let _r = env_logger::try_init();
    let grant_order = Arc::new(ArrayQueue::new(10));
    let observed = grant_order.clone();

    launch(MachineConfig::default(), move || {
        let mutex = Arc::new(Mutex::new());
        mutex.lock();

        let workers: Vec<Thread> = (1..=10)
            .map(|index| {
                let mutex = mutex.clone();
                let grant_order = observed.clone();
                Thread::spawn(move || {
                    mutex.lock();
                    let _ = grant_order.push(index);
                    mutex.unlock().unwrap();
                })
            })
            .collect();

        // One yield lets every worker run into the held mutex, in spawn
        // order; then the hand-off chain takes over.
        Thread::yield_now();
        mutex.unlock().unwrap();
        for worker in &workers {
            worker.join();
        }
    });

    for expected in 1..=10 {
        assert_eq!(grant_order.pop(), Some(expected));
    }
}

#[test]
fn broadcast_wakes_all_waiters_in_fifo_order() {
    let _r = env_logger::try_init();
    let wake_order = Arc::new(ArrayQueue::new(5));
    let observed = wake_order.clone();

    launch(MachineConfig::default(), move || {
        let shared = Arc::new((
            Mutex::new(),
            CondVar::new(),
            AtomicUsize::new(0),
            AtomicBool::new(false),
        ));

        let (mutex, everyone_go, waiting, go) = &*shared;
        mutex.lock();

        let waiters: Vec<Thread> = (1..=5)
            .map(|index| {
                let shared = shared.clone();
                let wake_order = observed.clone();
                Thread::spawn(move || {
                    let (mutex, everyone_go, waiting, go) = &*shared;
                    mutex.lock();
                    waiting.fetch_add(1, Ordering::SeqCst);
                    while !go.load(Ordering::SeqCst) {
                        everyone_go.wait(mutex).unwrap();
                    }
                    let _ = wake_order.push(index);
                    mutex.unlock().unwrap();
                })
            })
            .collect();

        mutex.unlock().unwrap();
        while waiting.load(Ordering::SeqCst) < 5 {
            Thread::yield_now();
        }

        mutex.lock();
        go.store(true, Ordering::SeqCst);
        everyone_go.broadcast();
        mutex.unlock().unwrap();

        for waiter in &waiters {
            waiter.join();
        }
    });

    assert_eq!(wake_order.len(), 5);
    for expected in 1..=5 {
        assert_eq!(wake_order.pop(), Some(expected));
    }
}

/// Spins until all four threads of the parked-core scenario run at once.
///
/// After the yielding phase a thread has no suspension point left, so it is
/// pinned to its host core from the moment it records the host's id; with
/// all four alive and pinned the recorded ids are pairwise distinct.
fn spin_until_all_hosted(
    engaged: &AtomicUsize,
    recorded: &AtomicUsize,
    hosts: &ArrayQueue<thread::ThreadId>,
) {
    engaged.fetch_add(1, Ordering::SeqCst);
    while engaged.load(Ordering::SeqCst) < 4 {
        Thread::yield_now();
    }
    let _ = hosts.push(thread::current().id());
    recorded.fetch_add(1, Ordering::SeqCst);
    while recorded.load(Ordering::SeqCst) < 4 {
        core::hint::spin_loop();
    }
}

#[test]
fn parked_cpus_wake_until_all_run_concurrently() {
    let _r = env_logger::try_init();
    let hosts: Arc<ArrayQueue<thread::ThreadId>> = Arc::new(ArrayQueue::new(4));
    let observed = hosts.clone();
    let config = MachineConfig {
        num_cpus: 4,
        timer: TimerMode::Disabled,
    };

    launch(config, move || {
        let engaged = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::new(AtomicUsize::new(0));

        let spinners: Vec<Thread> = (0..3)
            .map(|_| {
                let engaged = engaged.clone();
                let recorded = recorded.clone();
                let hosts = observed.clone();
                Thread::spawn(move || spin_until_all_hosted(&engaged, &recorded, &hosts))
            })
            .collect();

        spin_until_all_hosted(&engaged, &recorded, &observed);
        for spinner in &spinners {
            spinner.join();
        }
    });

    let mut distinct = HashSet::new();
    while let Some(id) = hosts.pop() {
        distinct.insert(id);
    }
    assert_eq!(distinct.len(), 4, "every core hosted one of the threads");
}

#[test]
fn thousand_finishing_threads_are_reclaimed() {
    let _r = env_logger::try_init();
    let completed = Arc::new(AtomicUsize::new(0));
    let observed = completed.clone();

    launch(MachineConfig::default(), move || {
        let mut threads = Vec::with_capacity(1000);
        for spawned in 0..1000 {
            let completed = observed.clone();
            threads.push(Thread::spawn(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            }));
            // Yielding now and then lets the backlog run and the finished
            // list drain, keeping the peak footprint bounded.
            if spawned % 16 == 15 {
                Thread::yield_now();
            }
        }
        for thread in &threads {
            thread.join();
        }
        for thread in &threads {
            assert!(thread.is_finished());
        }
    });

    assert_eq!(completed.load(Ordering::SeqCst), 1000);
}

#[test]
fn random_preemption_preserves_mutual_exclusion() {
    let _r = env_logger::try_init();
    let total = Arc::new(AtomicUsize::new(0));
    let observed = total.clone();
    let config = MachineConfig {
        num_cpus: 2,
        timer: TimerMode::Random { seed: 0xde5c },
    };

    launch(config, move || {
        let mutex = Arc::new(Mutex::new());
        let tally = Arc::new(UnsafeSyncCell::new(0usize));

        let workers: Vec<Thread> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                let tally = tally.clone();
                Thread::spawn(move || {
                    for _ in 0..100 {
                        mutex.lock();
                        unsafe { *tally.inner.get() += 1 };
                        mutex.unlock().unwrap();
                    }
                })
            })
            .collect();
        for worker in &workers {
            worker.join();
        }
        observed.store(unsafe { *tally.inner.get() }, Ordering::SeqCst);
    });

    assert_eq!(total.load(Ordering::SeqCst), 400);
}

#[test]
fn periodic_preemption_preserves_mutual_exclusion() {
    let _r = env_logger::try_init();
    let total = Arc::new(AtomicUsize::new(0));
    let observed = total.clone();
    let config = MachineConfig {
        num_cpus: 2,
        timer: TimerMode::Periodic,
    };

    launch(config, move || {
        let mutex = Arc::new(Mutex::new());
        let tally = Arc::new(UnsafeSyncCell::new(0usize));

        let workers: Vec<Thread> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                let tally = tally.clone();
                Thread::spawn(move || {
                    for _ in 0..50 {
                        mutex.lock();
                        unsafe { *tally.inner.get() += 1 };
                        mutex.unlock().unwrap();
                        Thread::yield_now();
                    }
                })
            })
            .collect();
        for worker in &workers {
            worker.join();
        }
        observed.store(unsafe { *tally.inner.get() }, Ordering::SeqCst);
    });

    assert_eq!(total.load(Ordering::SeqCst), 200);
}
