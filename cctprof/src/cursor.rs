// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The frame-by-frame stack walker.
//!
//! A cursor starts at the interrupted registers and moves outward one frame
//! at a time. Each move reports the frame it left, so the caller records
//! frames innermost first. The stack pointer strictly increases with every
//! move and every move counts against the step bound, so a walk always
//! ends, whatever the stack contains.

use crate::context::MachineContext;
use crate::error::UnwindError;
use crate::fence::Fence;
use crate::interval::RecipeIndex;
use crate::memory::StackMemory;
use crate::recipe::{RaMode, UnwindRecipe, WORD};
use crate::troll::troll;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CursorState {
    Init,
    Stepping,
    Trolling,
    Done,
    Failed(UnwindError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepResult {
    /// Moved to the caller. Carries the registers of the frame left behind.
    Stepped(MachineContext),
    /// The program counter is inside the fence; the walk is complete.
    Done,
    /// The caller could not be found with a recipe; trolling comes next.
    Trolling,
    Failed(UnwindError),
}

/// Limits applied to one walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UnwindLimits {
    pub max_steps: usize,
    pub troll_max_words: usize,
}

impl Default for UnwindLimits {
    fn default() -> Self {
        Self {
            max_steps: 4096,
            troll_max_words: 16384,
        }
    }
}

pub struct UnwindCursor<'a, M: StackMemory + ?Sized> {
    index: &'a RecipeIndex,
    fence: &'a Fence,
    stack: &'a M,
    limits: UnwindLimits,
    context: MachineContext,
    recipe: Option<UnwindRecipe>,
    state: CursorState,
    steps: usize,
    trolls: usize,
}

impl<'a, M: StackMemory + ?Sized> UnwindCursor<'a, M> {
    /// Positions a cursor at `context`. It starts out `Stepping` when a
    /// recipe covers the program counter (or it is already in the fence),
    /// `Trolling` otherwise, and `Failed` if the stack pointer is not on the
    /// thread's stack at all.
    pub fn init(
        index: &'a RecipeIndex,
        fence: &'a Fence,
        stack: &'a M,
        limits: UnwindLimits,
        context: MachineContext,
    ) -> Self {
        let mut cursor = Self {
            index,
            fence,
            stack,
            limits,
            context,
            recipe: None,
            state: CursorState::Init,
            steps: 0,
            trolls: 0,
        };
        cursor.state = if !stack.bounds().contains_sp(context.sp) {
            CursorState::Failed(UnwindError::StackBoundsViolation)
        } else {
            cursor.recipe = index.lookup(context.pc).copied();
            if cursor.recipe.is_some() || fence.contains(context.pc) {
                CursorState::Stepping
            } else {
                CursorState::Trolling
            }
        };
        cursor
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Registers of the frame the cursor is on.
    pub fn context(&self) -> MachineContext {
        self.context
    }

    pub fn recipe(&self) -> Option<&UnwindRecipe> {
        self.recipe.as_ref()
    }

    /// Moves attempted so far, steps and trolls together.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// How many times trolling found a frame.
    pub fn trolls(&self) -> usize {
        self.trolls
    }

    /// Advances the cursor by one move in whatever way its state calls for.
    pub fn advance(&mut self) -> StepResult {
        match self.state {
            CursorState::Init | CursorState::Stepping => self.step(),
            CursorState::Trolling => self.troll(),
            CursorState::Done => StepResult::Done,
            CursorState::Failed(e) => StepResult::Failed(e),
        }
    }

    /// Applies the current recipe to find the caller.
    pub fn step(&mut self) -> StepResult {
        if self.state != CursorState::Stepping {
            return self.advance_other();
        }
        if self.fence.contains(self.context.pc) {
            self.state = CursorState::Done;
            return StepResult::Done;
        }
        if let Err(e) = self.count_step() {
            return self.fail(e);
        }
        let Some(recipe) = self.recipe else {
            self.state = CursorState::Trolling;
            return StepResult::Trolling;
        };

        let candidate = match self.caller(&recipe) {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                self.state = CursorState::Trolling;
                return StepResult::Trolling;
            }
            Err(e) => return self.fail(e),
        };

        match self.index.lookup(candidate.pc) {
            Some(found) => {
                let left = self.move_to(candidate, Some(*found));
                StepResult::Stepped(left)
            }
            None if self.fence.contains(candidate.pc) => {
                let left = self.move_to(candidate, None);
                StepResult::Stepped(left)
            }
            None => {
                self.state = CursorState::Trolling;
                StepResult::Trolling
            }
        }
    }

    /// Searches the stack above the current frame for a return address and
    /// resumes stepping from there, keeping the frame pointer.
    pub fn troll(&mut self) -> StepResult {
        if self.state != CursorState::Trolling {
            return self.advance_other();
        }
        if let Err(e) = self.count_step() {
            return self.fail(e);
        }
        match troll(self.index, self.stack, self.context.sp, self.limits.troll_max_words) {
            Some(hit) => {
                self.trolls += 1;
                let caller = MachineContext::new(hit.pc, hit.caller_sp(), self.context.fp);
                let left = self.move_to(caller, Some(hit.recipe));
                StepResult::Stepped(left)
            }
            None => self.fail(UnwindError::TrollExhausted),
        }
    }

    fn advance_other(&mut self) -> StepResult {
        match self.state {
            CursorState::Stepping | CursorState::Trolling => self.advance(),
            CursorState::Init => {
                self.state = CursorState::Stepping;
                self.step()
            }
            CursorState::Done => StepResult::Done,
            CursorState::Failed(e) => StepResult::Failed(e),
        }
    }

    fn count_step(&mut self) -> Result<(), UnwindError> {
        if self.steps >= self.limits.max_steps {
            return Err(UnwindError::IterationBoundExceeded);
        }
        self.steps += 1;
        Ok(())
    }

    fn fail(&mut self, e: UnwindError) -> StepResult {
        self.state = CursorState::Failed(e);
        StepResult::Failed(e)
    }

    fn move_to(&mut self, caller: MachineContext, recipe: Option<UnwindRecipe>) -> MachineContext {
        let left = std::mem::replace(&mut self.context, caller);
        self.recipe = recipe;
        self.state = CursorState::Stepping;
        left
    }

    /// Computes the caller's registers from `recipe`. `Ok(None)` means the
    /// recipe does not apply to the state at hand (unreadable frame pointer,
    /// no progress) and trolling should take over.
    fn caller(&self, recipe: &UnwindRecipe) -> Result<Option<MachineContext>, UnwindError> {
        let MachineContext { sp, fp, .. } = self.context;
        let bounds = self.stack.bounds();
        let fp_set_up = fp >= sp && bounds.contains_sp(fp);

        let candidate = match recipe.mode {
            RaMode::SpRelative => Some(self.sp_caller(recipe)?),
            RaMode::FpRelative => self.fp_caller(recipe),
            RaMode::StandardFrame if fp_set_up => match self.fp_caller(recipe) {
                Some(candidate) => Some(candidate),
                None => Some(self.sp_caller(recipe)?),
            },
            RaMode::StandardFrame => Some(self.sp_caller(recipe)?),
        };
        let Some(mut candidate) = candidate else {
            return Ok(None);
        };

        // A saved frame pointer below the current stack pointer cannot
        // belong to a caller. Keep the old one when it still looks valid.
        if candidate.fp < sp && fp > sp && bounds.contains_sp(fp) {
            candidate.fp = fp;
        }

        if !bounds.contains_sp(candidate.sp) {
            return Err(UnwindError::StackBoundsViolation);
        }
        if candidate.sp <= sp {
            return Ok(None);
        }
        Ok(Some(candidate))
    }

    fn sp_caller(&self, recipe: &UnwindRecipe) -> Result<MachineContext, UnwindError> {
        let MachineContext { sp, fp, .. } = self.context;
        let slot = sp
            .checked_add_signed(recipe.sp_ra_offset)
            .ok_or(UnwindError::StackBoundsViolation)?;
        let pc = self
            .stack
            .read_word(slot)
            .ok_or(UnwindError::StackBoundsViolation)?;
        let saved_fp = recipe
            .sp_fp_offset
            .and_then(|offset| sp.checked_add_signed(offset))
            .and_then(|addr| self.stack.read_word(addr))
            .unwrap_or(fp);
        Ok(MachineContext::new(pc, slot + WORD, saved_fp))
    }

    fn fp_caller(&self, recipe: &UnwindRecipe) -> Option<MachineContext> {
        let MachineContext { sp, fp, .. } = self.context;
        if fp < sp {
            return None;
        }
        let slot = fp.checked_add_signed(recipe.fp_ra_offset)?;
        let pc = self.stack.read_word(slot)?;
        let saved_fp = self.stack.read_word(fp.checked_add_signed(recipe.fp_fp_offset)?)?;
        Some(MachineContext::new(pc, slot + WORD, saved_fp))
    }
}
