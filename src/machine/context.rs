// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Saved execution contexts and the switch/load trampolines.
//!
//! A [`Context`] is a single saved stack pointer; everything else a resumption
//! needs (callee-saved registers, return address) lives in a frame on the
//! context's own stack. Switching therefore is: push the callee-saved set,
//! store `rsp`, install the target's `rsp`, pop, `ret`.

use core::arch::naked_asm;
use core::cell::Cell;
use std::process;

use crate::stack::{ThreadStack, STACK_ALIGNMENT};

/// A context that can be suspended with [`Context::switch`] and resumed by a
/// later switch or [`Context::load`].
///
/// The stack pointer is the only stored state. It is written by the core that
/// suspends the context and read by the core that resumes it; the global
/// dispatch guard orders those two accesses.
#[derive(Debug)]
pub(crate) struct Context {
    sp: Cell<usize>,
}

impl Context {
    /// An empty context; a target for the first save on this stack.
    pub(crate) fn empty() -> Context {
        Context { sp: Cell::new(0) }
    }

    /// Builds an initial switch frame on `stack` so that the first resumption
    /// of this context runs `f`.
    ///
    /// `f` must never return; a context has nowhere to return to.
    pub(crate) unsafe fn initialize<F>(&self, stack: &ThreadStack, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let top = stack.base() as usize & !(STACK_ALIGNMENT - 1);
        let frame = (top - core::mem::size_of::<SwitchFrame<F>>()) as *mut SwitchFrame<F>;

        unsafe {
            let frame = &mut *frame;
            frame._r15 = 0;
            frame._r14 = 0;
            frame._r13 = 0;
            frame._r12 = 0;
            frame._rbx = 0;
            frame._rbp = 0;
            frame.ret_addr = context_begin::<F> as usize;
            frame.entry = Box::into_raw(Box::new(f));
            frame.stack_root = 0;
            self.sp.set(frame as *mut SwitchFrame<F> as usize);
        }
    }

    /// Suspends the running context into `save` and resumes `load`.
    ///
    /// Returns when some core switches back into `save`, possibly a different
    /// core than the one that suspended it. The caller must hold the dispatch
    /// guard with interrupts disabled across the call; the resumed side
    /// releases it.
    pub(crate) unsafe fn switch(save: &Context, load: &Context) {
        unsafe { switch_stacks(save.sp.as_ptr(), load.sp.get()) }
    }

    /// Resumes `load`, discarding the running context.
    pub(crate) unsafe fn load(load: &Context) -> ! {
        unsafe { load_stack(load.sp.get()) }
    }
}

/// The stack image [`Context::initialize`] plants: what [`switch_stacks`]
/// expects to pop, then the entry chain for [`context_begin`].
///
/// Field order mirrors pop order; `r15` sits at the lowest address.
#[repr(C)]
struct SwitchFrame<F: FnOnce() + Send> {
    _r15: usize,
    _r14: usize,
    _r13: usize,
    _r12: usize,
    _rbx: usize,
    _rbp: usize,
    ret_addr: usize,
    entry: *mut F,
    stack_root: usize,
}

/// Saves the callee-saved register set and `rsp` into `*save_slot`, then
/// resumes whatever `next_sp` points at.
///
/// `rflags` needs no slot: every path into this function runs with interrupts
/// logically disabled and no flags live across the call boundary.
#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(_save_slot: *mut usize, _next_sp: usize) {
    // RDI: where to store the suspended stack pointer.
    // RSI: stack pointer to resume.
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// One-way variant of [`switch_stacks`]: the running context is abandoned.
#[unsafe(naked)]
unsafe extern "C" fn load_stack(_next_sp: usize) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// The very first instructions of a fresh context: the `ret` in
/// [`switch_stacks`] lands here with `rsp` pointing at the boxed entry
/// function.
#[unsafe(naked)]
unsafe extern "C" fn context_begin<F: FnOnce() + Send>() -> ! {
    naked_asm!(
        "pop rdi",
        "jmp {}",
        sym context_main::<F>
    );
}

extern "C" fn context_main<F: FnOnce() + Send>(f: *mut F) -> ! {
    let f = unsafe { Box::from_raw(f) };
    f();
    // Entry functions dispatch another context or park the core; falling off
    // the end would return into a frame that does not exist.
    process::abort();
}
