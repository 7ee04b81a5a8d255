// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! relay: user-level threads multiplexed onto a fixed set of simulated CPU
//! cores.
//!
//! Has the following properties:
//! * Round-robin dispatch from one global FIFO ready queue shared by all cores
//! * Preemption driven by timer interrupts; cooperative yield in between
//! * Cores with nothing to run park and are woken by an inter-processor
//!   interrupt when work arrives
//! * Blocking join, a mutex with strict FIFO hand-off, Mesa-style condition
//!   variables, and counting semaphores
//!
//! A machine is deterministic with one core and the timer disabled:
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use relay::{launch, MachineConfig, Thread};
//!
//! let total = Arc::new(AtomicUsize::new(0));
//! let in_machine = total.clone();
//! launch(MachineConfig::default(), move || {
//!     let worker_total = in_machine.clone();
//!     let worker = Thread::spawn(move || {
//!         worker_total.fetch_add(1, Ordering::SeqCst);
//!     });
//!     worker.join();
//!     in_machine.fetch_add(1, Ordering::SeqCst);
//! });
//! assert_eq!(total.load(Ordering::SeqCst), 2);
//! ```

use core::fmt;

mod condvar;
mod machine;
mod mutex;
mod scheduler;
mod semaphore;
mod stack;
mod threads;

pub use crate::condvar::CondVar;
pub use crate::machine::{MachineConfig, TimerMode};
pub use crate::mutex::Mutex;
pub use crate::scheduler::{boot, launch};
pub use crate::semaphore::Semaphore;
pub use crate::stack::STACK_SIZE_BYTES;
pub use crate::threads::Thread;

/// Errors surfaced to applications.
///
/// Everything else that can go wrong (queue or status invariants broken,
/// thread construction off a machine) is a programmer error and aborts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The calling thread does not hold the mutex.
    NotOwner,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotOwner => write!(f, "calling thread does not hold the mutex"),
        }
    }
}

impl std::error::Error for Error {}
