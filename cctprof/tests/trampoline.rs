// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Samples dispatched through the thread-local trampoline, including from a
//! real signal handler.

mod common;

use cctprof::trampoline::{install, is_installed, sample_current_thread};
use cctprof::{BlockReason, MachineContext, MetricKind, SampleOutcome};
use common::*;

#[test]
fn nothing_installed() {
    let registry = cctprof::MetricRegistry::new();
    let samples = registry.register("samples", MetricKind::Count).unwrap();
    assert!(!is_installed());
    assert_eq!(
        SampleOutcome::Blocked(BlockReason::NoContext),
        sample_current_thread(MachineContext::new(0, 0, 0), samples, 1u64)
    );
}

#[test]
fn installation_is_scoped() {
    let sampler = sampler(&[]);
    let samples = sampler.register_metric("samples", MetricKind::Count).unwrap();
    let ctx = sampler.on_replay_start().unwrap();
    {
        let _installed = install(&sampler, &ctx);
        assert!(is_installed());
        // Reaches the sampler, which has no live stack for a replay context.
        assert_eq!(
            SampleOutcome::Blocked(BlockReason::NoContext),
            sample_current_thread(MachineContext::new(at(BAR, 0x10), 0, 0), samples, 1u64)
        );
        assert_eq!(1, sampler.counters().total());
        assert_eq!(1, sampler.counters().blocked());
    }
    assert!(!is_installed());
}

#[test]
fn nested_installations_restore_the_outer_one() {
    let outer = sampler(&[]);
    let inner = sampler(&[]);
    let outer_samples = outer.register_metric("samples", MetricKind::Count).unwrap();
    let inner_samples = inner.register_metric("samples", MetricKind::Count).unwrap();
    let outer_ctx = outer.on_replay_start().unwrap();
    let inner_ctx = inner.on_replay_start().unwrap();
    let registers = MachineContext::new(at(BAR, 0x10), 0, 0);

    let _outer = install(&outer, &outer_ctx);
    {
        let _inner = install(&inner, &inner_ctx);
        sample_current_thread(registers, inner_samples, 1u64);
        assert_eq!(1, inner.counters().total());
        assert_eq!(0, outer.counters().total());
    }
    assert!(is_installed());
    sample_current_thread(registers, outer_samples, 1u64);
    assert_eq!(1, outer.counters().total());
    assert_eq!(1, inner.counters().total());
}

#[test]
fn installations_dropped_out_of_order_leave_nothing_installed() {
    let first = sampler(&[]);
    let second = sampler(&[]);
    let samples = second.register_metric("samples", MetricKind::Count).unwrap();
    let first_ctx = first.on_replay_start().unwrap();
    let second_ctx = second.on_replay_start().unwrap();

    let outer = install(&first, &first_ctx);
    let inner = install(&second, &second_ctx);
    drop(outer);
    assert!(!is_installed());
    drop(inner);
    assert!(!is_installed());
    assert_eq!(
        SampleOutcome::Blocked(BlockReason::NoContext),
        sample_current_thread(MachineContext::new(at(BAR, 0x10), 0, 0), samples, 1u64)
    );
    assert_eq!(0, first.counters().total());
    assert_eq!(0, second.counters().total());
}

#[cfg(target_os = "linux")]
mod live {
    use super::*;
    use cctprof::UnwindError;
    use std::hint::black_box;

    #[test]
    fn unwinds_through_the_live_stack() {
        let sampler = sampler(&[]);
        let samples = sampler.register_metric("samples", MetricKind::Count).unwrap();
        let ctx = sampler.on_thread_start().unwrap();
        let bounds = ctx.stack_bounds().unwrap();

        // A fake call chain laid out in this frame, which is on the stack.
        let words = black_box([at(FOO, 0x20), at(MAIN, 0x30), 0, 0]);
        let sp = words.as_ptr() as usize;
        assert!(bounds.contains_sp(sp));

        let _installed = install(&sampler, &ctx);
        let outcome = sample_current_thread(MachineContext::new(at(BAR, 0x10), sp, 0), samples, 1u64);
        black_box(&words);
        assert_eq!(
            SampleOutcome::Inserted {
                depth: 3,
                trolled: false
            },
            outcome
        );
        let expected = frames(&sampler, &[at(BAR, 0x10), at(FOO, 0x20), at(MAIN, 0x30)]);
        let tree = ctx.tree();
        assert!(tree.find_path(tree.root(), &expected).is_some());
    }

    #[test]
    fn stack_pointer_outside_the_thread_stack() {
        let sampler = sampler(&[]);
        let samples = sampler.register_metric("samples", MetricKind::Count).unwrap();
        let ctx = sampler.on_thread_start().unwrap();
        let _installed = install(&sampler, &ctx);
        assert_eq!(
            SampleOutcome::Dropped(UnwindError::StackBoundsViolation),
            sample_current_thread(MachineContext::new(at(BAR, 0x10), 0x10, 0), samples, 1u64)
        );
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod signal {
    use super::*;
    use cctprof::trampoline::handle_sample_signal;
    use cctprof::MetricId;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::OnceLock;

    static METRIC: OnceLock<MetricId> = OnceLock::new();
    static OUTCOME: AtomicU8 = AtomicU8::new(0);

    const INSERTED: u8 = 1;
    const DROPPED: u8 = 2;
    const BLOCKED: u8 = 3;

    extern "C" fn on_sigprof(_: libc::c_int, _: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
        let Some(metric) = METRIC.get() else {
            return;
        };
        // SAFETY: the kernel's ucontext for this handler invocation.
        let outcome = unsafe { handle_sample_signal(ucontext.cast(), *metric, 1u64) };
        OUTCOME.store(
            match outcome {
                SampleOutcome::Inserted { .. } => INSERTED,
                SampleOutcome::Dropped(_) => DROPPED,
                SampleOutcome::Blocked(_) => BLOCKED,
            },
            Ordering::SeqCst,
        );
    }

    #[test]
    fn sample_from_a_signal_handler() {
        let sampler = sampler(&[]);
        let samples = sampler.register_metric("samples", MetricKind::Count).unwrap();
        METRIC.set(samples).unwrap();
        let ctx = sampler.on_thread_start().unwrap();
        let _installed = install(&sampler, &ctx);

        // SAFETY: plain sigaction setup with a handler that only touches
        // atomics and the trampoline.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_sigprof as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(0, libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()));
            assert_eq!(0, libc::raise(libc::SIGPROF));
        }

        // The interrupted code is not in any analyzed module, so the sample
        // is either trolled into the fixture module by chance or dropped.
        let outcome = OUTCOME.load(Ordering::SeqCst);
        assert!(outcome == INSERTED || outcome == DROPPED, "outcome {outcome}");
        assert_eq!(1, sampler.counters().total());
        assert_eq!(
            1,
            sampler.counters().inserted() + sampler.counters().dropped_total()
        );
        assert_eq!(1, ctx.samples());
    }
}
