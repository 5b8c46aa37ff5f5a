// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// The registers the unwinder works from: one point in the call stack.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct MachineContext {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
}

impl MachineContext {
    pub const fn new(pc: usize, sp: usize, fp: usize) -> Self {
        Self { pc, sp, fp }
    }

    /// Extracts the interrupted registers from the third argument of an
    /// `SA_SIGINFO` signal handler.
    ///
    /// # Safety
    /// `ucontext` must be null or point to the `ucontext_t` the kernel passed
    /// to the running handler.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Option<Self> {
        // SAFETY: the caller vouches for the pointer.
        let uc = unsafe { ucontext.as_ref()? };
        let gregs = &uc.uc_mcontext.gregs;
        Some(Self {
            pc: gregs[libc::REG_RIP as usize] as usize,
            sp: gregs[libc::REG_RSP as usize] as usize,
            fp: gregs[libc::REG_RBP as usize] as usize,
        })
    }

    /// # Safety
    /// `ucontext` must be null or point to the `ucontext_t` the kernel passed
    /// to the running handler.
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    pub unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Option<Self> {
        // SAFETY: the caller vouches for the pointer.
        let uc = unsafe { ucontext.as_ref()? };
        let mcontext = &uc.uc_mcontext;
        Some(Self {
            pc: mcontext.pc as usize,
            sp: mcontext.sp as usize,
            // x29 is the frame pointer.
            fp: mcontext.regs[29] as usize,
        })
    }

    /// Register extraction is only implemented for Linux on x86_64 and
    /// aarch64.
    ///
    /// # Safety
    /// Always safe; the pointer is not read.
    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    pub unsafe fn from_ucontext(_ucontext: *const libc::ucontext_t) -> Option<Self> {
        None
    }
}
