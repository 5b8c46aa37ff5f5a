// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The bridge from a sampling signal handler to the sampler.
//!
//! A signal handler receives nothing but the interrupted registers, so it
//! finds the thread's sampler and [ExecutionContext] through a thread-local
//! slot. This is the only ambient state in the crate; everything below
//! [handle_sample_signal] receives its context explicitly.
//!
//! Installing the handler and arming the timer are left to the caller.

use crate::cct::{MetricDelta, MetricId};
use crate::context::MachineContext;
use crate::logical::LogicalUnwinder;
use crate::sampler::{BlockReason, ExecutionContext, SampleOutcome, Sampler};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{compiler_fence, AtomicPtr};

type SampleFn = unsafe fn(*const (), &ExecutionContext, MachineContext, MetricId, MetricDelta) -> SampleOutcome;

struct Installed {
    sampler: *const (),
    context: *const ExecutionContext,
    sample: SampleFn,
}

thread_local! {
    // A signal may land in the middle of an install, so the slot is a
    // single pointer: either null or a `Box::into_raw` owned by a live
    // Installation. Const-initialized and without a destructor, so reading
    // it from a signal handler never allocates or registers anything.
    static CURRENT: AtomicPtr<Installed> = const { AtomicPtr::new(ptr::null_mut()) };
}

/// Keeps the calling thread's slot pointing at a sampler and context until
/// dropped. Not `Send`: it must be dropped on the thread that created it.
pub struct Installation<'a> {
    installed: *mut Installed,
    previous: *mut Installed,
    _borrow: PhantomData<(&'a (), *const ())>,
}

impl Drop for Installation<'_> {
    fn drop(&mut self) {
        CURRENT.with(|slot| {
            // Only the innermost installation restores its predecessor. One
            // dropped out of order clears the slot, so nothing left on it can
            // point at a freed predecessor.
            if slot
                .compare_exchange(self.installed, self.previous, Release, Relaxed)
                .is_err()
            {
                slot.store(ptr::null_mut(), Release);
            }
        });
        compiler_fence(SeqCst);
        // SAFETY: created by `Box::into_raw` in `install` and no longer
        // reachable from the slot.
        drop(unsafe { Box::from_raw(self.installed) });
    }
}

/// Makes `sampler` and `context` the targets of [handle_sample_signal] on
/// the calling thread.
pub fn install<'a, L: LogicalUnwinder>(
    sampler: &'a Sampler<L>,
    context: &'a ExecutionContext,
) -> Installation<'a> {
    let installed = Box::into_raw(Box::new(Installed {
        sampler: (sampler as *const Sampler<L>).cast(),
        context,
        sample: sample_erased::<L>,
    }));
    compiler_fence(SeqCst);
    let previous = CURRENT.with(|slot| slot.swap(installed, Release));
    Installation {
        installed,
        previous,
        _borrow: PhantomData,
    }
}

/// Is a sampler installed on the calling thread?
pub fn is_installed() -> bool {
    CURRENT.with(|slot| !slot.load(Acquire).is_null())
}

/// # Safety
/// `sampler` must point to a live `Sampler<L>`.
unsafe fn sample_erased<L: LogicalUnwinder>(
    sampler: *const (),
    context: &ExecutionContext,
    registers: MachineContext,
    metric: MetricId,
    delta: MetricDelta,
) -> SampleOutcome {
    // SAFETY: installed from a `&Sampler<L>` that the installation borrows.
    let sampler = unsafe { &*sampler.cast::<Sampler<L>>() };
    sampler.on_sample(context, registers, metric, delta)
}

/// Takes a sample of the calling thread at the registers in `ucontext`.
/// Meant to be called from an `SA_SIGINFO` handler with its third argument.
///
/// # Safety
/// `ucontext` must be null or the `ucontext_t` the kernel passed to the
/// running handler.
pub unsafe fn handle_sample_signal(
    ucontext: *const libc::ucontext_t,
    metric: MetricId,
    delta: impl Into<MetricDelta>,
) -> SampleOutcome {
    // SAFETY: forwarded to the caller.
    match unsafe { MachineContext::from_ucontext(ucontext) } {
        Some(registers) => sample_current_thread(registers, metric, delta),
        None => SampleOutcome::Blocked(BlockReason::NoContext),
    }
}

/// Takes a sample of the calling thread at `registers` using whatever is
/// installed on it.
pub fn sample_current_thread(
    registers: MachineContext,
    metric: MetricId,
    delta: impl Into<MetricDelta>,
) -> SampleOutcome {
    let installed = CURRENT.try_with(|slot| slot.load(Acquire)).unwrap_or(ptr::null_mut());
    // SAFETY: a non-null slot is owned by a live Installation, which also
    // borrows both pointees.
    let Some(installed) = (unsafe { installed.as_ref() }) else {
        return SampleOutcome::Blocked(BlockReason::NoContext);
    };
    // SAFETY: as above.
    unsafe {
        (installed.sample)(
            installed.sampler,
            &*installed.context,
            registers,
            metric,
            delta.into(),
        )
    }
}
