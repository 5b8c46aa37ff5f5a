// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics written from inside the sampling path: plain atomic counters
//! and a fixed-size ring of recent failures. Neither allocates nor locks.

use crate::error::UnwindError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize};

#[derive(Debug, Default)]
pub struct SampleCounters {
    total: AtomicU64,
    inserted: AtomicU64,
    blocked: AtomicU64,
    trolled: AtomicU64,
    partial: AtomicU64,
    dropped: [AtomicU64; UnwindError::ALL.len()],
    max_depth: AtomicUsize,
}

impl SampleCounters {
    pub(crate) fn on_total(&self) {
        self.total.fetch_add(1, Relaxed);
    }

    pub(crate) fn on_inserted(&self, depth: usize) {
        self.inserted.fetch_add(1, Relaxed);
        self.max_depth.fetch_max(depth, Relaxed);
    }

    pub(crate) fn on_blocked(&self) {
        self.blocked.fetch_add(1, Relaxed);
    }

    pub(crate) fn on_trolled(&self) {
        self.trolled.fetch_add(1, Relaxed);
    }

    pub(crate) fn on_partial(&self) {
        self.partial.fetch_add(1, Relaxed);
    }

    pub(crate) fn on_dropped(&self, reason: UnwindError) {
        self.dropped[reason.index()].fetch_add(1, Relaxed);
    }

    pub fn dropped(&self, reason: UnwindError) -> u64 {
        self.dropped[reason.index()].load(Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.iter().map(|c| c.load(Relaxed)).sum()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Relaxed)
    }

    pub fn inserted(&self) -> u64 {
        self.inserted.load(Relaxed)
    }

    pub fn blocked(&self) -> u64 {
        self.blocked.load(Relaxed)
    }

    pub fn trolled(&self) -> u64 {
        self.trolled.load(Relaxed)
    }

    pub fn partial(&self) -> u64 {
        self.partial.load(Relaxed)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Relaxed)
    }

    pub fn dropped_counts(&self) -> DroppedCounts {
        DroppedCounts {
            troll_exhausted: self.dropped(UnwindError::TrollExhausted),
            stack_bounds: self.dropped(UnwindError::StackBoundsViolation),
            iteration_bound: self.dropped(UnwindError::IterationBoundExceeded),
            allocation: self.dropped(UnwindError::AllocationFailure),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DroppedCounts {
    pub troll_exhausted: u64,
    pub stack_bounds: u64,
    pub iteration_bound: u64,
    pub allocation: u64,
}

impl DroppedCounts {
    pub fn total(&self) -> u64 {
        self.troll_exhausted + self.stack_bounds + self.iteration_bound + self.allocation
    }
}

/// The end-of-run report.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub total: u64,
    pub inserted: u64,
    pub blocked: u64,
    pub trolled: u64,
    pub partial: u64,
    pub dropped: DroppedCounts,
    pub max_depth: usize,
    pub nodes: usize,
    pub arena_used_bytes: usize,
    pub arena_exhausted: bool,
}

impl SampleSummary {
    /// Share of attempted samples that made it into the tree.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.inserted + self.dropped.total();
        if attempted == 0 {
            return 1.0;
        }
        self.inserted as f64 / attempted as f64
    }
}

/// A failed unwind as remembered by the [DropLog].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DropRecord {
    pub reason: UnwindError,
    /// Program counter the cursor was at when it gave up.
    pub pc: usize,
}

const DROP_LOG_SLOTS: usize = 64;
const EMPTY: u8 = u8::MAX;

/// The most recent failures, overwritten in a ring. Entries written
/// concurrently with a drain may be torn; the log is a debugging aid only.
#[derive(Debug)]
pub struct DropLog {
    next: AtomicUsize,
    reasons: [AtomicU8; DROP_LOG_SLOTS],
    pcs: [AtomicUsize; DROP_LOG_SLOTS],
}

impl Default for DropLog {
    fn default() -> Self {
        Self {
            next: AtomicUsize::new(0),
            reasons: [const { AtomicU8::new(EMPTY) }; DROP_LOG_SLOTS],
            pcs: [const { AtomicUsize::new(0) }; DROP_LOG_SLOTS],
        }
    }
}

impl DropLog {
    pub fn capacity(&self) -> usize {
        DROP_LOG_SLOTS
    }

    pub(crate) fn push(&self, reason: UnwindError, pc: usize) {
        let slot = self.next.fetch_add(1, Relaxed) % DROP_LOG_SLOTS;
        self.pcs[slot].store(pc, Relaxed);
        self.reasons[slot].store(reason.index() as u8, Relaxed);
    }

    /// Failures ever logged, including overwritten ones.
    pub fn logged(&self) -> usize {
        self.next.load(Relaxed)
    }

    /// The retained records, oldest first.
    pub fn records(&self) -> Vec<DropRecord> {
        let next = self.next.load(Relaxed);
        let retained = next.min(DROP_LOG_SLOTS);
        (next - retained..next)
            .filter_map(|i| {
                let slot = i % DROP_LOG_SLOTS;
                let reason = UnwindError::from_index(self.reasons[slot].load(Relaxed) as usize)?;
                Some(DropRecord {
                    reason,
                    pc: self.pcs[slot].load(Relaxed),
                })
            })
            .collect()
    }
}
