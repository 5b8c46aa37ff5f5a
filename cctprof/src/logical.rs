// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hooks for a language runtime to attach logical frames (interpreted
//! functions, for instance) to the physical frames the unwinder finds.
//!
//! The provider is chosen when the sampler is built and called through a
//! static trait bound; nothing is resolved dynamically while sampling.

use crate::context::MachineContext;
use crate::frame::{Association, LogicalId};

/// All methods run inside the sampling signal handler. They must not
/// allocate, lock, or block.
pub trait LogicalUnwinder: Send + Sync {
    /// Does this provider know the code at `pc`?
    fn is_my_code(&self, pc: usize) -> bool;

    /// Notes a physical frame the provider claimed and reports how it maps
    /// onto the provider's logical frames.
    fn step_physical_note(&self, frame: &MachineContext) -> Association;

    /// The logical frame that the physical frame just noted stands for, if
    /// any.
    fn step_logical_note(&self, frame: &MachineContext) -> Option<LogicalId>;
}

/// Records physical frames only.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoLogicalUnwinder;

impl LogicalUnwinder for NoLogicalUnwinder {
    #[inline]
    fn is_my_code(&self, _pc: usize) -> bool {
        false
    }

    fn step_physical_note(&self, _frame: &MachineContext) -> Association {
        Association::NONE
    }

    fn step_logical_note(&self, _frame: &MachineContext) -> Option<LogicalId> {
        None
    }
}
