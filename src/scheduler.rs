// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-cpu dispatcher and the global scheduling state.
//!
//! Has the following properties:
//! * One global FIFO ready queue shared by every cpu
//! * A cpu with nothing to run parks on its idle context and is woken by an
//!   IPI when work arrives
//! * A single process-wide critical section (the dispatch guard, held with
//!   interrupts disabled on the executing core) serializes every queue and
//!   status mutation
//! * Context switches happen inside that section; the resumed side releases
//!   it at its own exit point

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::collections::VecDeque;
use std::process;
use std::sync::Arc;

use log::{info, trace};

use crate::machine::{self, context::Context, CoreMain, Machine, MachineConfig};
use crate::threads::{thread_execution, Tcb, Thread, ThreadStatus};

/// The scheduling state shared by all cpus of one machine.
pub(crate) struct Kernel {
    /// The dispatch guard. Spun on with interrupts disabled; both halves
    /// together form the kernel section.
    guard: AtomicBool,
    /// Threads with status `Ready`, dispatch order.
    ready: RefCell<VecDeque<Arc<Tcb>>>,
    /// Parked cpus, wakeup order.
    sleeping: RefCell<VecDeque<Arc<Cpu>>>,
    /// Finished threads awaiting reclamation on somebody else's stack.
    finished: RefCell<Vec<Arc<Tcb>>>,
    next_tid: AtomicU32,
    next_cpu_id: AtomicU32,
}

// The queues are only read or written inside the kernel section.
unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

impl Kernel {
    fn new() -> Arc<Kernel> {
        Arc::new(Kernel {
            guard: AtomicBool::new(false),
            ready: RefCell::new(VecDeque::new()),
            sleeping: RefCell::new(VecDeque::new()),
            finished: RefCell::new(Vec::new()),
            next_tid: AtomicU32::new(0),
            next_cpu_id: AtomicU32::new(0),
        })
    }

    pub(crate) fn guard_acquire(&self) {
        debug_assert!(!machine::interrupts_enabled());
        while self.guard.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    pub(crate) fn guard_release(&self) {
        debug_assert!(!machine::interrupts_enabled());
        self.guard.store(false, Ordering::Release);
    }

    pub(crate) fn allocate_tid(&self) -> u32 {
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    /// Pops the next thread to dispatch.
    pub(crate) fn pop_ready(&self) -> Option<Arc<Tcb>> {
        let next = self.ready.borrow_mut().pop_front();
        if let Some(next) = &next {
            assert_eq!(next.status(), ThreadStatus::Ready);
        }
        next
    }

    /// Marks `tcb` ready, appends it to the ready queue, and wakes a parked
    /// cpu if one exists.
    pub(crate) fn push_to_queue(&self, tcb: Arc<Tcb>) {
        let status = tcb.status();
        assert!(
            matches!(
                status,
                ThreadStatus::Fresh | ThreadStatus::Running | ThreadStatus::Blocked
            ),
            "thread {} cannot become ready from {:?}",
            tcb.id(),
            status
        );
        tcb.set_status(ThreadStatus::Ready);
        trace!("thread {} pushed onto the ready queue", tcb.id());
        self.ready.borrow_mut().push_back(tcb);
        self.fetch_cpu();
    }

    /// Wakes the longest-parked cpu with an IPI, if any is parked.
    fn fetch_cpu(&self) {
        let sleeper = self.sleeping.borrow_mut().pop_front();
        if let Some(cpu) = sleeper {
            trace!("waking cpu {} for new work", cpu.cpu_id);
            cpu.core.interrupt_send();
        }
    }

    pub(crate) fn push_finished(&self, tcb: Arc<Tcb>) {
        debug_assert_eq!(tcb.status(), ThreadStatus::Finished);
        self.finished.borrow_mut().push(tcb);
    }

    /// Drops every reference the kernel still holds to finished threads,
    /// releasing their stacks.
    ///
    /// Callable only once a switch has moved execution off any finished
    /// stack: `current` is the resumed thread, running on its own stack.
    pub(crate) fn clear_finished(&self, current: &Arc<Tcb>) {
        let drained: Vec<Arc<Tcb>> = self.finished.borrow_mut().drain(..).collect();
        if !drained.is_empty() {
            trace!("reclaiming {} finished threads", drained.len());
        }
        for tcb in &drained {
            assert_eq!(tcb.status(), ThreadStatus::Finished);
            debug_assert!(!Arc::ptr_eq(tcb, current));
        }
    }
}

/// RAII kernel section: closes the executing core's interrupt mask, then
/// takes the dispatch guard. Dropping releases in the inverse order.
///
/// A section may contain a context switch. The switched-away thread resumes
/// inside its own suspended section later, possibly on a different core, so
/// the drop re-resolves the executing cpu instead of caching it.
pub(crate) struct KernelGuard;

impl KernelGuard {
    pub(crate) fn new() -> KernelGuard {
        machine::interrupt_disable();
        Cpu::current().kernel.guard_acquire();
        KernelGuard
    }
}

impl Drop for KernelGuard {
    fn drop(&mut self) {
        let cpu = Cpu::current();
        cpu.kernel.guard_release();
        machine::interrupt_enable();
    }
}

/// The inverse bracket, wrapped around user code by the execution wrapper:
/// leaves the kernel section on entry and re-enters it on exit.
pub(crate) struct UserGuard;

impl UserGuard {
    pub(crate) fn new() -> UserGuard {
        Cpu::current().kernel.guard_release();
        machine::interrupt_enable();
        UserGuard
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        machine::interrupt_disable();
        Cpu::current().kernel.guard_acquire();
    }
}

/// A simulated processor from the dispatcher's point of view.
pub(crate) struct Cpu {
    pub(crate) cpu_id: u32,
    pub(crate) core: Arc<machine::Core>,
    pub(crate) kernel: Arc<Kernel>,
    /// The thread whose context is loaded on this cpu; the idle TCB while
    /// the cpu is parked.
    current: RefCell<Option<Arc<Tcb>>>,
    /// Dedicated context running [`idle_loop`].
    idle: Arc<Tcb>,
}

// `current` is only touched inside the kernel section.
unsafe impl Send for Cpu {}
unsafe impl Sync for Cpu {}

thread_local! {
    static CURRENT_CPU: RefCell<Option<Arc<Cpu>>> = const { RefCell::new(None) };
}

impl Cpu {
    /// The cpu hosting the calling thread.
    pub(crate) fn current() -> Arc<Cpu> {
        CURRENT_CPU
            .with(|cpu| cpu.borrow().clone())
            .expect("not running on a booted machine")
    }

    /// The running thread's TCB.
    pub(crate) fn current_tcb(&self) -> Arc<Tcb> {
        self.current
            .borrow()
            .clone()
            .expect("no thread loaded on this cpu")
    }

    /// Replaces the loaded thread, returning the previous one.
    pub(crate) fn set_current(&self, tcb: Arc<Tcb>) -> Arc<Tcb> {
        self.current
            .replace(Some(tcb))
            .expect("no thread loaded on this cpu")
    }

    fn running_idle(&self) -> bool {
        match &*self.current.borrow() {
            Some(current) => Arc::ptr_eq(current, &self.idle),
            None => true,
        }
    }
}

/// The cpu constructor, run by the machine on the core's own OS thread:
/// installs the interrupt handlers, allocates the idle context, seeds the
/// first user thread on the designated cpu, and starts dispatching.
///
/// Never returns to its caller.
fn cpu_main(
    _machine: Arc<Machine>,
    core: Arc<machine::Core>,
    kernel: Arc<Kernel>,
    entry: Option<Box<dyn FnOnce() + Send>>,
) {
    // Cores boot with the interrupt mask closed.
    kernel.guard_acquire();

    let cpu_id = kernel.next_cpu_id.fetch_add(1, Ordering::SeqCst);
    core.install_handler(machine::TIMER, timer_handler);
    core.install_handler(machine::IPI, ipi_handler);

    let idle = Tcb::new(kernel.allocate_tid(), || idle_loop());
    let cpu = Arc::new(Cpu {
        cpu_id,
        core: core.clone(),
        kernel: kernel.clone(),
        current: RefCell::new(None),
        idle,
    });
    CURRENT_CPU.with(|current| *current.borrow_mut() = Some(cpu.clone()));
    info!("cpu {} online (core {})", cpu_id, core.index());

    if let Some(entry) = entry {
        let first = Tcb::new(kernel.allocate_tid(), move || thread_execution(entry));
        kernel.push_to_queue(first);
    }

    begin_process(&cpu);
}

/// First dispatch on a freshly constructed cpu: loads a ready thread
/// one-way, or parks the core on its idle context.
fn begin_process(cpu: &Arc<Cpu>) -> ! {
    if let Some(next) = cpu.kernel.pop_ready() {
        let prev = cpu.current.replace(Some(next.clone()));
        debug_assert!(prev.is_none());
        next.set_status(ThreadStatus::Running);
        trace!("cpu {}: boot dispatch of thread {}", cpu.cpu_id, next.id());
        unsafe { Context::load(next.context()) }
    }
    suspend_cpu(cpu);
    unreachable!("a cpu with no loaded thread resumed from suspend");
}

/// Hands the cpu off after the current thread blocked (and was enqueued on
/// whatever it waits for): dispatches the next ready thread or parks.
///
/// Returns when the blocked thread is resumed, possibly on a different cpu.
pub(crate) fn get_next_thread(cpu: &Arc<Cpu>) {
    debug_assert!(!machine::interrupts_enabled());
    match cpu.kernel.pop_ready() {
        Some(next) => {
            let prev = cpu.set_current(next.clone());
            assert_eq!(prev.status(), ThreadStatus::Blocked);
            next.set_status(ThreadStatus::Running);
            trace!(
                "cpu {}: dispatching {} over blocked {}",
                cpu.cpu_id,
                next.id(),
                prev.id()
            );
            unsafe { Context::switch(prev.context(), next.context()) };
            // Resumed; `cpu` may be stale, so re-resolve before touching state.
            Cpu::current().kernel.clear_finished(&prev);
        }
        None => suspend_cpu(cpu),
    }
}

/// Moves the cpu onto its idle context. With a loaded thread this saves it
/// and switches, returning when that thread is later resumed; on a bare boot
/// it loads the idle context one-way.
pub(crate) fn suspend_cpu(cpu: &Arc<Cpu>) {
    debug_assert!(!machine::interrupts_enabled());
    let prev = cpu.current.replace(Some(cpu.idle.clone()));
    match prev {
        Some(prev) => {
            debug_assert!(
                !Arc::ptr_eq(&prev, &cpu.idle),
                "idle context tried to suspend itself"
            );
            trace!("cpu {}: nothing to run, suspending", cpu.cpu_id);
            unsafe { Context::switch(prev.context(), cpu.idle.context()) };
        }
        None => {
            trace!("cpu {}: booted with nothing to run, suspending", cpu.cpu_id);
            unsafe { Context::load(cpu.idle.context()) }
        }
    }
}

/// Body of every cpu's idle context: advertise the cpu as sleeping, leave
/// the kernel section, and park until an IPI hands over new work.
fn idle_loop() -> ! {
    // Entered from `suspend_cpu` with the guard held.
    let cpu = Cpu::current();
    loop {
        debug_assert!(!machine::interrupts_enabled());
        debug_assert!(cpu.running_idle());
        cpu.kernel.sleeping.borrow_mut().push_back(cpu.clone());
        cpu.kernel.guard_release();
        machine::interrupt_enable_suspend();
        // The IPI handler ran, possibly dispatching threads for a long while
        // before the cpu went idle again. It returns holding the guard.
    }
}

/// `ivt[TIMER]`: preempts the running user thread with a yield. The idle
/// context is never preempted.
fn timer_handler() {
    {
        let _guard = KernelGuard::new();
        if Cpu::current().running_idle() {
            return;
        }
    }
    Thread::yield_now();
}

/// `ivt[IPI]`: runs when a parked core wakes. Picks up the front of the
/// ready queue, or returns on a spurious wake.
///
/// Deliberately leaves the guard held on return; the idle loop releases it
/// when it re-advertises the cpu as sleeping.
fn ipi_handler() {
    machine::interrupt_disable();
    let cpu = Cpu::current();
    cpu.kernel.guard_acquire();
    if let Some(next) = cpu.kernel.pop_ready() {
        let prev = cpu.set_current(next.clone());
        debug_assert!(
            Arc::ptr_eq(&prev, &cpu.idle),
            "IPI dispatched on a busy cpu"
        );
        next.set_status(ThreadStatus::Running);
        trace!("cpu {}: woken to run thread {}", cpu.cpu_id, next.id());
        unsafe { Context::switch(prev.context(), next.context()) };
        // Somebody suspended back into the idle context; fall through to the
        // idle loop with the guard held.
    }
}

/// Boots a machine with `config.num_cpus` simulated cpus, runs `entry` as
/// the first user thread, and returns once the machine is quiescent: every
/// thread ran to completion (or parked forever on a queue nothing will
/// signal) and every cpu is idle.
pub fn launch<F>(config: MachineConfig, entry: F)
where
    F: FnOnce() + Send + 'static,
{
    let kernel = Kernel::new();
    let mut entry = Some(Box::new(entry) as Box<dyn FnOnce() + Send>);
    let mains: Vec<CoreMain> = (0..config.num_cpus)
        .map(|index| {
            let kernel = kernel.clone();
            let entry = if index == 0 { entry.take() } else { None };
            Box::new(move |machine: Arc<Machine>, core: Arc<machine::Core>| {
                cpu_main(machine, core, kernel, entry)
            }) as CoreMain
        })
        .collect();
    Machine::start(config, mains);
}

/// The whole-process variant of [`launch`]: boots the machine and exits the
/// process once it quiesces. Never returns on success.
pub fn boot<F>(config: MachineConfig, entry: F) -> !
where
    F: FnOnce() + Send + 'static,
{
    launch(config, entry);
    process::exit(0);
}
