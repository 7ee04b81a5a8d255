// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread control blocks and the public thread handle.

use core::cell::{Cell, RefCell};
use core::fmt;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::{Arc, Weak};

use log::{error, trace};

use crate::machine::context::Context;
use crate::scheduler::{self, Cpu, KernelGuard, UserGuard};
use crate::stack::ThreadStack;

/// The life-cycle states of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ThreadStatus {
    /// Constructed but never enqueued.
    Fresh,
    /// In the ready queue, waiting for a core.
    Ready,
    /// Loaded on a core right now. At most one thread per core.
    Running,
    /// Parked in a wait or join queue.
    Blocked,
    /// Returned from its entry function; awaiting deferred reclamation.
    Finished,
}

/// Per-thread record: identity, execution stack, saved context, and the
/// queue of threads blocked waiting for this one to finish.
///
/// A live TCB is shared-owned by whoever currently holds it: the ready
/// queue, a core's current slot, a wait or join queue, or the finished list.
pub(crate) struct Tcb {
    id: u32,
    status: Cell<ThreadStatus>,
    stack: ThreadStack,
    context: Context,
    joiners: RefCell<VecDeque<Arc<Tcb>>>,
}

// Interior state is only read or written inside the kernel section (the
// dispatch guard held with interrupts disabled on the mutating core).
unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}

impl Tcb {
    /// Allocates a TCB whose first dispatch runs `entry` on a fresh stack.
    pub(crate) fn new<F>(id: u32, entry: F) -> Arc<Tcb>
    where
        F: FnOnce() + Send + 'static,
    {
        let tcb = Arc::new(Tcb {
            id,
            status: Cell::new(ThreadStatus::Fresh),
            stack: ThreadStack::new(),
            context: Context::empty(),
            joiners: RefCell::new(VecDeque::new()),
        });
        unsafe { tcb.context.initialize(&tcb.stack, entry) };
        tcb
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn status(&self) -> ThreadStatus {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.set(status);
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    fn push_joiner(&self, joiner: Arc<Tcb>) {
        self.joiners.borrow_mut().push_back(joiner);
    }

    fn drain_joiners(&self) -> VecDeque<Arc<Tcb>> {
        core::mem::take(&mut *self.joiners.borrow_mut())
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Thread#{}", self.id)
    }
}

/// A handle to a spawned thread.
///
/// The handle is non-owning: the runtime keeps the thread alive through its
/// queues, and the handle upgrades on demand. Dropping the handle does not
/// affect the thread. Not copyable.
pub struct Thread {
    tcb: Weak<Tcb>,
}

impl Thread {
    /// Creates a thread that runs `f` and enqueues it ready.
    ///
    /// Must be called from a thread of a booted machine; anywhere else there
    /// is no executing core and construction panics.
    pub fn spawn<F>(f: F) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let _guard = KernelGuard::new();
        let cpu = Cpu::current();
        let tcb = Tcb::new(cpu.kernel.allocate_tid(), move || thread_execution(f));
        trace!("spawned thread {}", tcb.id());
        let handle = Thread {
            tcb: Arc::downgrade(&tcb),
        };
        cpu.kernel.push_to_queue(tcb);
        handle
    }

    /// Blocks the calling thread until this thread finishes.
    ///
    /// Joining a thread that already finished, or whose TCB is gone, returns
    /// immediately; join is never an error.
    pub fn join(&self) {
        let _guard = KernelGuard::new();
        if let Some(target) = self.tcb.upgrade() {
            if target.status() != ThreadStatus::Finished {
                let cpu = Cpu::current();
                let current = cpu.current_tcb();
                assert!(
                    !Arc::ptr_eq(&target, &current),
                    "thread {} cannot join itself",
                    current.id()
                );
                trace!("thread {} joins {}", current.id(), target.id());
                current.set_status(ThreadStatus::Blocked);
                target.push_joiner(current);
                scheduler::get_next_thread(&cpu);
            }
        }
    }

    /// Hands the core to the next ready thread, if any.
    ///
    /// With an empty ready queue this is a no-op and the calling thread
    /// continues.
    pub fn yield_now() {
        let _guard = KernelGuard::new();
        let cpu = Cpu::current();
        if let Some(next) = cpu.kernel.pop_ready() {
            let prev = cpu.set_current(next.clone());
            cpu.kernel.push_to_queue(prev.clone());
            next.set_status(ThreadStatus::Running);
            trace!("cpu {}: yield from {} to {}", cpu.cpu_id, prev.id(), next.id());
            unsafe { Context::switch(prev.context(), next.context()) };
            // Resumed, possibly on another core; the stale `cpu` is not used.
            Cpu::current().kernel.clear_finished(&prev);
        }
    }

    /// Whether the thread has finished (or its TCB is already reclaimed).
    pub fn is_finished(&self) -> bool {
        let _guard = KernelGuard::new();
        match self.tcb.upgrade() {
            Some(target) => target.status() == ThreadStatus::Finished,
            None => true,
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.tcb.upgrade() {
            Some(tcb) => write!(f, "{:?}", tcb),
            None => write!(f, "Thread#<reclaimed>"),
        }
    }
}

/// The execution wrapper: every thread context starts here.
///
/// Runs the user entry inside a user section, then retires the thread: wakes
/// its joiners, marks it finished, and dispatches the next thread one-way (a
/// finished context must never be re-entered).
pub(crate) fn thread_execution<F>(f: F) -> !
where
    F: FnOnce() + Send + 'static,
{
    // Entered through the context trampoline with the guard held and
    // interrupts disabled, exactly like any other resumption.
    {
        let _user = UserGuard::new();
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!("thread entry panicked; aborting");
            process::abort();
        }
    }

    let cpu = Cpu::current();
    let current = cpu.current_tcb();
    trace!("thread {} finished", current.id());

    for joiner in current.drain_joiners() {
        cpu.kernel.push_to_queue(joiner);
    }

    current.set_status(ThreadStatus::Finished);
    cpu.kernel.push_finished(current.clone());

    match cpu.kernel.pop_ready() {
        Some(next) => {
            cpu.set_current(next.clone());
            next.set_status(ThreadStatus::Running);
            unsafe { Context::load(next.context()) }
        }
        None => {
            scheduler::suspend_cpu(&cpu);
            unreachable!("a finished thread was dispatched again");
        }
    }
}
