// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Why an unwind could not complete. Each of these drops the sample; none
/// of them reaches the profiled program.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, thiserror::Error, Serialize, Deserialize)]
pub enum UnwindError {
    #[error("no plausible return address within the trolling window")]
    TrollExhausted,
    #[error("candidate stack pointer left the thread's stack")]
    StackBoundsViolation,
    #[error("unwind did not reach the fence within the step bound")]
    IterationBoundExceeded,
    #[error("arena exhausted while recording the backtrace")]
    AllocationFailure,
}

impl UnwindError {
    pub const ALL: [UnwindError; 4] = [
        UnwindError::TrollExhausted,
        UnwindError::StackBoundsViolation,
        UnwindError::IterationBoundExceeded,
        UnwindError::AllocationFailure,
    ];

    pub(crate) const fn index(self) -> usize {
        match self {
            UnwindError::TrollExhausted => 0,
            UnwindError::StackBoundsViolation => 1,
            UnwindError::IterationBoundExceeded => 2,
            UnwindError::AllocationFailure => 3,
        }
    }

    pub(crate) const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(UnwindError::TrollExhausted),
            1 => Some(UnwindError::StackBoundsViolation),
            2 => Some(UnwindError::IterationBoundExceeded),
            3 => Some(UnwindError::AllocationFailure),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CctError {
    #[error("cct: out of memory")]
    OutOfMemory,
    #[error("cct: metric {0} is not registered")]
    UnknownMetric(usize),
}

impl From<cctprof_alloc::AllocError> for CctError {
    fn from(_: cctprof_alloc::AllocError) -> Self {
        CctError::OutOfMemory
    }
}

impl From<CctError> for UnwindError {
    fn from(_: CctError) -> Self {
        UnwindError::AllocationFailure
    }
}

impl From<cctprof_alloc::TryReserveError> for UnwindError {
    fn from(_: cctprof_alloc::TryReserveError) -> Self {
        UnwindError::AllocationFailure
    }
}

/// Problems with recipes or modules handed to the recipe database.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RecipeError {
    #[error("empty recipe range {low:#x}..{high:#x} in module {module}")]
    EmptyRange {
        module: String,
        low: usize,
        high: usize,
    },
    #[error("recipe range {low:#x}..{high:#x} overlaps its neighbour in module {module}")]
    Overlap {
        module: String,
        low: usize,
        high: usize,
    },
    #[error("recipe range {low:#x}..{high:#x} lies outside module {module}")]
    OutsideModule {
        module: String,
        low: usize,
        high: usize,
    },
    #[error("module {first} overlaps module {second}")]
    ModuleOverlap { first: String, second: String },
    #[error("module {0} is not loaded")]
    UnknownModule(u32),
}
