// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A blocking mutex with strict FIFO ownership hand-off.

use core::cell::RefCell;
use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;

use crate::scheduler::{self, Cpu, KernelGuard};
use crate::threads::{Tcb, ThreadStatus};
use crate::Error;

/// A mutual-exclusion lock for threads of this runtime.
///
/// Contending threads queue in arrival order, and release hands ownership
/// directly to the longest waiter: a thread arriving at [`Mutex::lock`]
/// cannot barge in ahead of one already queued. Share across threads with
/// [`std::sync::Arc`]; not copyable.
pub struct Mutex {
    inner: RefCell<MutexInner>,
}

struct MutexInner {
    free: bool,
    /// Id of the holding thread; `None` while free.
    owner: Option<u32>,
    /// Blocked acquirers, wakeup order.
    waiters: VecDeque<Arc<Tcb>>,
}

// State is only read or written inside the kernel section.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            inner: RefCell::new(MutexInner {
                free: true,
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquires the mutex, blocking while another thread holds it.
    pub fn lock(&self) {
        let _guard = KernelGuard::new();
        self.acquire();
    }

    /// Acquires the mutex only if it is free right now.
    pub fn try_lock(&self) -> bool {
        let _guard = KernelGuard::new();
        let current = Cpu::current().current_tcb();
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.owner != Some(current.id()),
            "thread {} locking a mutex against itself",
            current.id()
        );
        if inner.free {
            inner.free = false;
            inner.owner = Some(current.id());
            true
        } else {
            false
        }
    }

    /// Releases the mutex.
    ///
    /// Fails with [`Error::NotOwner`] unless the calling thread holds it.
    pub fn unlock(&self) -> Result<(), Error> {
        let _guard = KernelGuard::new();
        self.release()
    }

    /// Lock semantics with the kernel section already entered; shared with
    /// condition-variable wait.
    pub(crate) fn acquire(&self) {
        let cpu = Cpu::current();
        let current = cpu.current_tcb();
        let mut inner = self.inner.borrow_mut();
        if inner.free {
            inner.free = false;
            inner.owner = Some(current.id());
            trace!("thread {} acquired mutex {:p}", current.id(), self);
        } else {
            assert!(
                inner.owner != Some(current.id()),
                "thread {} locking a mutex against itself",
                current.id()
            );
            trace!(
                "thread {} waits for mutex {:p} held by {:?}",
                current.id(),
                self,
                inner.owner
            );
            current.set_status(ThreadStatus::Blocked);
            inner.waiters.push_back(current.clone());
            // The borrow must end here: other cores inspect this mutex while
            // the thread sleeps.
            drop(inner);
            scheduler::get_next_thread(&cpu);
            // Release handed the mutex over before waking this thread.
            debug_assert_eq!(self.inner.borrow().owner, Some(current.id()));
        }
    }

    /// Unlock semantics with the kernel section already entered.
    pub(crate) fn release(&self) -> Result<(), Error> {
        let cpu = Cpu::current();
        let current = cpu.current_tcb();
        let mut inner = self.inner.borrow_mut();
        if inner.owner != Some(current.id()) {
            return Err(Error::NotOwner);
        }
        inner.free = true;
        inner.owner = None;
        if let Some(waiter) = inner.waiters.pop_front() {
            assert_eq!(waiter.status(), ThreadStatus::Blocked);
            // Direct hand-off: the waiter owns the mutex from the moment it
            // becomes ready, so no later arrival can slip in between.
            inner.owner = Some(waiter.id());
            inner.free = false;
            drop(inner);
            trace!(
                "mutex {:p} handed from {} to {}",
                self,
                current.id(),
                waiter.id()
            );
            cpu.kernel.push_to_queue(waiter);
        }
        Ok(())
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The queue is owned by the kernel section; do not peek from here.
        write!(f, "Mutex {{ .. }}")
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let inner = self.inner.borrow();
        assert!(inner.waiters.is_empty(), "mutex dropped with waiters");
        assert!(inner.owner.is_none(), "mutex dropped while held");
    }
}
