// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unwind recipes: how to find a caller's state from a callee's registers
//! at a given range of code addresses.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Size of a machine word on the stack.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Which register the return address is found relative to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RaMode {
    /// The return address sits at `sp + sp_ra_offset`; the caller's stack
    /// pointer is the slot just past it.
    SpRelative,
    /// The return address sits at `fp + fp_ra_offset` and the caller's frame
    /// pointer was saved at `fp + fp_fp_offset`.
    FpRelative,
    /// A conventional frame. Stack-pointer math is used unless the frame
    /// pointer already points into the stack above `sp`, in which case the
    /// frame-pointer offsets apply.
    StandardFrame,
}

/// Describes, for one contiguous address range, how to step out of a frame.
/// Offsets are in bytes and signed; the pointer math applying them is
/// unsigned and wrapping-checked.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UnwindRecipe {
    pub mode: RaMode,
    pub sp_ra_offset: isize,
    /// Where the caller's frame pointer was saved relative to `sp`, if the
    /// code at this range has saved it at all.
    pub sp_fp_offset: Option<isize>,
    pub fp_ra_offset: isize,
    pub fp_fp_offset: isize,
}

impl UnwindRecipe {
    /// The return address is on top of the stack (call site, or leaf code
    /// that has not pushed anything).
    pub const fn at_call() -> Self {
        Self::sp_relative(0, None)
    }

    pub const fn sp_relative(sp_ra_offset: isize, sp_fp_offset: Option<isize>) -> Self {
        Self {
            mode: RaMode::SpRelative,
            sp_ra_offset,
            sp_fp_offset,
            fp_ra_offset: WORD as isize,
            fp_fp_offset: 0,
        }
    }

    pub const fn fp_relative(fp_ra_offset: isize, fp_fp_offset: isize) -> Self {
        Self {
            mode: RaMode::FpRelative,
            sp_ra_offset: 0,
            sp_fp_offset: None,
            fp_ra_offset,
            fp_fp_offset,
        }
    }

    /// `push fp; mov fp, sp` style frame: saved fp at `[fp]`, return address
    /// one word above it.
    pub const fn standard_frame(sp_ra_offset: isize) -> Self {
        Self {
            mode: RaMode::StandardFrame,
            sp_ra_offset,
            sp_fp_offset: None,
            fp_ra_offset: WORD as isize,
            fp_fp_offset: 0,
        }
    }
}

/// A recipe together with the half-open address range it covers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecipeInterval {
    pub range: Range<usize>,
    pub recipe: UnwindRecipe,
}

impl RecipeInterval {
    pub fn new(range: Range<usize>, recipe: UnwindRecipe) -> Self {
        Self { range, recipe }
    }
}

/// What the binary-analysis collaborator provides for one loaded module:
/// its load address and the recipes for its code, with ranges relative to
/// the load base.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecipes {
    pub name: String,
    pub base: usize,
    pub size: usize,
    pub intervals: Vec<RecipeInterval>,
}

impl ModuleRecipes {
    pub fn new(name: impl Into<String>, base: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            base,
            size,
            intervals: Vec::new(),
        }
    }

    pub fn with_interval(mut self, range: Range<usize>, recipe: UnwindRecipe) -> Self {
        self.intervals.push(RecipeInterval::new(range, recipe));
        self
    }

    /// Absolute address range the module occupies.
    pub fn address_range(&self) -> Range<usize> {
        self.base..self.base.saturating_add(self.size)
    }
}
