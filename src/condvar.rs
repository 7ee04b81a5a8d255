// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A Mesa-style condition variable.

use core::cell::RefCell;
use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;

use crate::mutex::Mutex;
use crate::scheduler::{self, Cpu, KernelGuard};
use crate::threads::{Tcb, ThreadStatus};
use crate::Error;

/// A condition variable for threads of this runtime.
///
/// Waiters queue in arrival order and wake in that order. Wakeups follow
/// Mesa semantics: a woken thread re-contends for the mutex instead of
/// receiving it, so the awaited predicate must be re-checked in a loop.
pub struct CondVar {
    waiters: RefCell<VecDeque<Arc<Tcb>>>,
}

// The queue is only read or written inside the kernel section.
unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    pub fn new() -> CondVar {
        CondVar {
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    /// Releases `mutex`, blocks until signaled, then reacquires `mutex`.
    ///
    /// Unlock, enqueue, and block happen under one kernel-section entry, so
    /// no signal between them can be missed. Fails with [`Error::NotOwner`]
    /// (leaving the thread running and the mutex untouched) unless the
    /// calling thread holds `mutex`.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), Error> {
        let _guard = KernelGuard::new();
        let cpu = Cpu::current();
        let current = cpu.current_tcb();

        // Step 1: let go of the mutex; this may hand it to one of its
        // waiters.
        mutex.release()?;

        // Step 2: queue on the condition and give up the cpu.
        trace!("thread {} waits on condvar {:p}", current.id(), self);
        current.set_status(ThreadStatus::Blocked);
        self.waiters.borrow_mut().push_back(current.clone());
        scheduler::get_next_thread(&cpu);

        // Step 3: signaled; contend for the mutex like everybody else.
        mutex.acquire();
        Ok(())
    }

    /// Wakes the longest-waiting thread, if any.
    ///
    /// Ownership of no mutex is transferred; the woken thread queues on the
    /// ready list behind whatever is already there.
    pub fn signal(&self) {
        let _guard = KernelGuard::new();
        let waiter = self.waiters.borrow_mut().pop_front();
        if let Some(waiter) = waiter {
            trace!("condvar {:p} signals thread {}", self, waiter.id());
            Cpu::current().kernel.push_to_queue(waiter);
        }
    }

    /// Wakes every waiting thread, in the order they queued.
    pub fn broadcast(&self) {
        let _guard = KernelGuard::new();
        let waiters = core::mem::take(&mut *self.waiters.borrow_mut());
        if !waiters.is_empty() {
            trace!("condvar {:p} broadcasts to {} threads", self, waiters.len());
        }
        let cpu = Cpu::current();
        for waiter in waiters {
            cpu.kernel.push_to_queue(waiter);
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        CondVar::new()
    }
}

impl fmt::Debug for CondVar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CondVar {{ .. }}")
    }
}

impl Drop for CondVar {
    fn drop(&mut self) {
        assert!(
            self.waiters.borrow().is_empty(),
            "condvar dropped with outstanding waiters"
        );
    }
}
