// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The simulated machine: a fixed set of CPU cores, each backed by one OS
//! thread, with per-core interrupt masking, cross-core interrupt delivery,
//! and the context primitives the dispatcher switches with.
//!
//! Interrupts are virtual. A vector posted to a core becomes pending and is
//! dispatched through the core's vector table when that core next opens its
//! interrupt mask ([`interrupt_enable`]) or parks itself
//! ([`interrupt_enable_suspend`]). A parked core ignores timer vectors and
//! wakes only for an IPI. Every core starts with its mask closed.

pub(crate) mod context;

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{info, trace};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[cfg(not(target_arch = "x86_64"))]
compile_error!("the context-switch trampolines are implemented for x86_64 only");

/// Vector number of the preemption timer.
pub(crate) const TIMER: usize = 0;
/// Vector number of inter-processor interrupts.
pub(crate) const IPI: usize = 1;

const NUM_VECTORS: usize = IPI + 1;

const fn vector_mask(vector: usize) -> u32 {
    1 << vector
}

/// An entry in a core's interrupt vector table.
pub(crate) type InterruptHandler = fn();

/// The function a core OS thread runs for its whole lifetime.
pub(crate) type CoreMain = Box<dyn FnOnce(Arc<Machine>, Arc<Core>) + Send + 'static>;

/// How timer interrupts are generated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerMode {
    /// No timer interrupts; threads run until they block, yield, or finish.
    Disabled,
    /// A wall-clock tick posted to every core every millisecond.
    Periodic,
    /// Pseudo-random ticks drawn per core from a seeded generator. Repeatable
    /// for a fixed seed when only one core is running.
    Random {
        /// Seed for the per-core generators.
        seed: u64,
    },
}

/// Boot-time machine parameters.
#[derive(Clone, Copy, Debug)]
pub struct MachineConfig {
    /// Number of simulated cores; at least 1.
    pub num_cpus: usize,
    /// Timer interrupt generation.
    pub timer: TimerMode,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            num_cpus: 1,
            timer: TimerMode::Disabled,
        }
    }
}

/// One simulated core.
///
/// The vector table, mask, and timer source belong to the core's own OS
/// thread; only `pending` is written cross-core.
pub(crate) struct Core {
    index: usize,
    machine: Weak<Machine>,
    ivt: [Cell<Option<InterruptHandler>>; NUM_VECTORS],
    enabled: Cell<bool>,
    pending: AtomicU32,
    rng: RefCell<Option<SmallRng>>,
    os_thread: Cell<Option<thread::ThreadId>>,
}

// `ivt`, `enabled`, `rng`, and `os_thread` are only touched from the OS
// thread that hosts the core; `pending` is atomic.
unsafe impl Send for Core {}
unsafe impl Sync for Core {}

impl Core {
    fn new(index: usize, timer: TimerMode, machine: Weak<Machine>) -> Core {
        let rng = match timer {
            TimerMode::Random { seed } => {
                Some(SmallRng::seed_from_u64(seed.wrapping_add(index as u64)))
            }
            _ => None,
        };
        Core {
            index,
            machine,
            ivt: [Cell::new(None), Cell::new(None)],
            enabled: Cell::new(false),
            pending: AtomicU32::new(0),
            rng: RefCell::new(rng),
            os_thread: Cell::new(None),
        }
    }

    /// Index of this core within the machine.
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Installs `handler` for `vector`. Called once per vector during core
    /// construction, before the mask first opens.
    pub(crate) fn install_handler(&self, vector: usize, handler: InterruptHandler) {
        self.assert_owned();
        self.ivt[vector].set(Some(handler));
    }

    /// Sends an inter-processor interrupt to this core, waking it if parked.
    ///
    /// Unlike the other interrupt operations this targets a *remote* core.
    pub(crate) fn interrupt_send(&self) {
        let machine = self.machine();
        trace!("posting an IPI to core {}", self.index);
        self.pending.fetch_or(vector_mask(IPI), Ordering::SeqCst);
        // Taking the machine lock orders the flag with the parked core's
        // predicate check, so the notification cannot be lost.
        let _inner = machine.inner.lock().unwrap();
        machine.wake.notify_all();
    }

    /// Marks `vector` pending without waking the core.
    fn post(&self, vector: usize) {
        self.pending.fetch_or(vector_mask(vector), Ordering::SeqCst);
    }

    fn take(&self, vector: usize) -> bool {
        let mask = vector_mask(vector);
        self.pending.fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    fn handler(&self, vector: usize) -> InterruptHandler {
        self.ivt[vector].get().expect("interrupt vector not installed")
    }

    fn machine(&self) -> Arc<Machine> {
        self.machine.upgrade().expect("machine outlives its cores")
    }

    /// In the random timer mode, rolls the per-core generator and posts a
    /// timer vector on a hit.
    fn maybe_inject_timer(&self) {
        let mut rng = self.rng.borrow_mut();
        if let Some(rng) = rng.as_mut() {
            if rng.gen_ratio(1, 8) {
                self.post(TIMER);
            }
        }
    }

    fn assert_owned(&self) {
        debug_assert_eq!(
            Some(thread::current().id()),
            self.os_thread.get(),
            "core {} touched from a foreign OS thread",
            self.index
        );
    }
}

thread_local! {
    static CURRENT_CORE: RefCell<Option<Arc<Core>>> = const { RefCell::new(None) };
}

/// The core executing the caller.
pub(crate) fn current_core() -> Arc<Core> {
    CURRENT_CORE
        .with(|core| core.borrow().clone())
        .expect("not executing on a machine core")
}

/// Whether the executing core's interrupt mask is open. For assertions.
pub(crate) fn interrupts_enabled() -> bool {
    current_core().enabled.get()
}

/// Closes the executing core's interrupt mask.
pub(crate) fn interrupt_disable() {
    let core = current_core();
    core.assert_owned();
    core.enabled.set(false);
}

/// Opens the executing core's interrupt mask and dispatches pending vectors.
pub(crate) fn interrupt_enable() {
    {
        let core = current_core();
        core.assert_owned();
        core.maybe_inject_timer();
        core.enabled.set(true);
    }
    // A handler below may switch contexts and this frame then resumes on
    // whichever core next runs the suspended thread, so the executing core is
    // re-read every round.
    loop {
        let handler = {
            let core = current_core();
            if !core.enabled.get() {
                return;
            }
            match (0..NUM_VECTORS).find(|&vector| core.take(vector)) {
                Some(vector) => {
                    trace!("core {} takes interrupt vector {}", core.index, vector);
                    core.handler(vector)
                }
                None => return,
            }
        };
        handler();
    }
}

/// Atomically opens the interrupt mask and parks the executing core until an
/// inter-processor interrupt arrives, then dispatches it.
///
/// Timer vectors are discarded while the core is parked. Returns with
/// whatever mask state the IPI handler left behind (the dispatcher's handler
/// closes it).
pub(crate) fn interrupt_enable_suspend() {
    let core = current_core();
    core.assert_owned();
    let machine = core.machine();
    let handler = core.handler(IPI);

    {
        let mut inner = machine.inner.lock().unwrap();
        core.enabled.set(true);
        core.take(TIMER);
        inner.parked += 1;
        trace!("core {} parked ({} total)", core.index, inner.parked);
        if machine.is_quiescent(&inner) {
            machine.quiescent.notify_all();
        }
        while core.pending.load(Ordering::SeqCst) & vector_mask(IPI) == 0 {
            inner = machine.wake.wait(inner).unwrap();
        }
        core.take(IPI);
        core.take(TIMER);
        inner.parked -= 1;
        trace!("core {} woken by an IPI", core.index);
    }
    handler();
}

struct MachineInner {
    /// Cores currently blocked inside [`interrupt_enable_suspend`].
    parked: usize,
}

/// A booted machine. Lives for the rest of the process: core OS threads are
/// never joined, and a quiesced machine's cores stay parked.
pub(crate) struct Machine {
    cores: Vec<Arc<Core>>,
    inner: Mutex<MachineInner>,
    /// Parked cores wait here for an IPI.
    wake: Condvar,
    /// The booting thread waits here for quiescence.
    quiescent: Condvar,
    halted: AtomicBool,
}

impl Machine {
    /// Boots a machine: starts one OS thread per core, runs `mains[i]` on
    /// core `i`, and blocks until the machine is quiescent (every core
    /// parked with no IPI in flight, meaning no thread can ever run again).
    pub(crate) fn start(config: MachineConfig, mains: Vec<CoreMain>) {
        assert!(config.num_cpus >= 1, "a machine needs at least one core");
        assert_eq!(mains.len(), config.num_cpus);

        let machine = Arc::new_cyclic(|weak: &Weak<Machine>| Machine {
            cores: (0..config.num_cpus)
                .map(|index| Arc::new(Core::new(index, config.timer, weak.clone())))
                .collect(),
            inner: Mutex::new(MachineInner { parked: 0 }),
            wake: Condvar::new(),
            quiescent: Condvar::new(),
            halted: AtomicBool::new(false),
        });

        info!(
            "starting a machine with {} cores, timer {:?}",
            config.num_cpus, config.timer
        );

        for (index, main) in mains.into_iter().enumerate() {
            let machine = machine.clone();
            let core = machine.cores[index].clone();
            // Core threads are never joined; a quiesced machine's cores stay
            // parked until the process exits.
            let _ = thread::Builder::new()
                .name(format!("core-{}", index))
                .spawn(move || {
                    core.os_thread.set(Some(thread::current().id()));
                    CURRENT_CORE.with(|current| *current.borrow_mut() = Some(core.clone()));
                    main(machine, core);
                })
                .expect("could not start a core thread");
        }

        if matches!(config.timer, TimerMode::Periodic) {
            Machine::start_ticker(machine.clone());
        }

        let mut inner = machine.inner.lock().unwrap();
        while !machine.is_quiescent(&inner) {
            inner = machine.quiescent.wait(inner).unwrap();
        }
        machine.halted.store(true, Ordering::SeqCst);
        info!("machine quiescent, all {} cores parked", config.num_cpus);
    }

    fn start_ticker(machine: Arc<Machine>) {
        let _ = thread::Builder::new()
            .name("timer".into())
            .spawn(move || {
                while !machine.halted.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                    for core in &machine.cores {
                        core.post(TIMER);
                    }
                }
            })
            .expect("could not start the timer thread");
    }

    fn is_quiescent(&self, inner: &MachineInner) -> bool {
        inner.parked == self.cores.len()
            && self
                .cores
                .iter()
                .all(|core| core.pending.load(Ordering::SeqCst) & vector_mask(IPI) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked_main() -> CoreMain {
        Box::new(|_machine, core: Arc<Core>| {
            core.install_handler(IPI, interrupt_disable);
            loop {
                interrupt_enable_suspend();
            }
        })
    }

    #[test]
    fn machine_quiesces_once_all_cores_park() {
        let _r = env_logger::try_init();
        let config = MachineConfig {
            num_cpus: 3,
            timer: TimerMode::Disabled,
        };
        // Returning at all is the assertion: `start` blocks until every core
        // has parked with no wakeup in flight.
        Machine::start(config, (0..3).map(|_| parked_main()).collect());
    }

    #[test]
    #[should_panic(expected = "at least one core")]
    fn zero_cores_is_rejected() {
        let config = MachineConfig {
            num_cpus: 0,
            timer: TimerMode::Disabled,
        };
        Machine::start(config, Vec::new());
    }
}
