// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A counting semaphore built from the mutex and condition variable.

use core::cell::Cell;
use core::fmt;

use crate::condvar::CondVar;
use crate::mutex::Mutex;

/// A counting semaphore: [`Semaphore::down`] takes one unit, blocking while
/// none are available, and [`Semaphore::up`] puts one back.
///
/// A semaphore starting at zero doubles as an event: `down` parks until the
/// event is `up`ed.
pub struct Semaphore {
    mutex: Mutex,
    available: CondVar,
    count: Cell<isize>,
}

// `count` is protected by `mutex`.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Creates a semaphore holding `count` units.
    pub fn new(count: isize) -> Semaphore {
        assert!(count >= 0, "a semaphore cannot start in debt");
        Semaphore {
            mutex: Mutex::new(),
            available: CondVar::new(),
            count: Cell::new(count),
        }
    }

    /// Returns one unit and wakes a blocked [`Semaphore::down`], if any.
    pub fn up(&self) {
        self.mutex.lock();
        self.count.set(self.count.get() + 1);
        self.available.signal();
        self.mutex.unlock().expect("semaphore holds its own mutex");
    }

    /// Takes one unit, blocking until one is available.
    pub fn down(&self) {
        self.mutex.lock();
        while self.count.get() <= 0 {
            self.available
                .wait(&self.mutex)
                .expect("semaphore holds its own mutex");
        }
        self.count.set(self.count.get() - 1);
        self.mutex.unlock().expect("semaphore holds its own mutex");
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Semaphore {{ .. }}")
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::machine::MachineConfig;
    use crate::threads::Thread;

    #[test]
    fn down_blocks_until_up() {
        let _r = env_logger::try_init();
        let checked = Arc::new(AtomicBool::new(false));
        let observed = checked.clone();
        crate::launch(MachineConfig::default(), move || {
            let semaphore = Arc::new(Semaphore::new(0));
            let consumed = Arc::new(AtomicUsize::new(0));

            let consumer_semaphore = semaphore.clone();
            let consumer_count = consumed.clone();
            let consumer = Thread::spawn(move || {
                for _ in 0..5 {
                    consumer_semaphore.down();
                    consumer_count.fetch_add(1, Ordering::SeqCst);
                }
            });

            // The consumer cannot get ahead of the units handed out.
            for produced in 1..=5 {
                Thread::yield_now();
                assert!(consumed.load(Ordering::SeqCst) < produced);
                semaphore.up();
            }
            consumer.join();
            assert_eq!(consumed.load(Ordering::SeqCst), 5);
            observed.store(true, Ordering::SeqCst);
        });
        assert!(checked.load(Ordering::SeqCst));
    }

    #[test]
    fn initial_units_admit_without_blocking() {
        let _r = env_logger::try_init();
        let checked = Arc::new(AtomicBool::new(false));
        let observed = checked.clone();
        crate::launch(MachineConfig::default(), move || {
            let semaphore = Semaphore::new(3);
            semaphore.down();
            semaphore.down();
            semaphore.down();
            semaphore.up();
            semaphore.down();
            observed.store(true, Ordering::SeqCst);
        });
        assert!(checked.load(Ordering::SeqCst));
    }
}
