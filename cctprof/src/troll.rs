// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recovery when no recipe covers the code being unwound: search the raw
//! stack for something that looks like a return address.
//!
//! The search is imprecise on purpose. It can skip frames or pick up a
//! stale return address left in a dead slot, but it lets the unwind reach
//! the fence instead of giving up on the whole sample.

use crate::interval::RecipeIndex;
use crate::memory::StackMemory;
use crate::recipe::{UnwindRecipe, WORD};

/// A stack slot holding a plausible return address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrollHit {
    pub slot: usize,
    pub pc: usize,
    pub recipe: UnwindRecipe,
}

impl TrollHit {
    /// The caller's stack pointer: one past the return-address slot.
    pub fn caller_sp(&self) -> usize {
        self.slot + WORD
    }
}

/// Scans up to `max_words` words upward from `sp`. A word is accepted when
/// it lies in a loaded module and the index has a recipe for it. The scan
/// stops early at the bottom of the stack.
pub fn troll<M: StackMemory + ?Sized>(
    index: &RecipeIndex,
    stack: &M,
    sp: usize,
    max_words: usize,
) -> Option<TrollHit> {
    let bounds = stack.bounds();
    let mut slot = sp.checked_next_multiple_of(WORD)?.max(bounds.low.next_multiple_of(WORD));
    for _ in 0..max_words {
        if !bounds.contains_word(slot) {
            return None;
        }
        if let Some(pc) = stack.read_word(slot) {
            if index.in_code(pc) {
                if let Some(recipe) = index.lookup(pc) {
                    return Some(TrollHit {
                        slot,
                        pc,
                        recipe: *recipe,
                    });
                }
            }
        }
        slot = slot.checked_add(WORD)?;
    }
    None
}
