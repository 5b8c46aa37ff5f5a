// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One immutable snapshot of the interval database: every recipe of every
//! loaded module, relocated to absolute addresses and sorted, plus the
//! module table used to normalize addresses.
//!
//! The structure is read-only once built, so lookups need no
//! synchronization and never allocate. A sorted array with binary search
//! gives the same logarithmic lookup as a balanced tree with better
//! locality, and rebuilds happen only on module load/unload.

use crate::error::RecipeError;
use crate::frame::{ModuleId, NormalizedIp};
use crate::recipe::{ModuleRecipes, UnwindRecipe};
use std::ops::Range;

/// A recipe relocated to absolute addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexedInterval {
    pub low: usize,
    pub high: usize,
    pub module: ModuleId,
    pub recipe: UnwindRecipe,
}

impl IndexedInterval {
    pub fn contains(&self, pc: usize) -> bool {
        self.low <= pc && pc < self.high
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadModule {
    pub id: ModuleId,
    pub name: String,
    pub base: usize,
    pub size: usize,
}

impl LoadModule {
    pub fn range(&self) -> Range<usize> {
        self.base..self.base.saturating_add(self.size)
    }

    pub fn contains(&self, pc: usize) -> bool {
        self.range().contains(&pc)
    }
}

#[derive(Debug, Default)]
pub struct RecipeIndex {
    intervals: Vec<IndexedInterval>,
    modules: Vec<LoadModule>,
    generation: u64,
}

impl RecipeIndex {
    /// Relocates and indexes the recipes of `modules`. Ranges must be
    /// non-empty, must stay inside their module, and must not overlap.
    pub fn build<'a, I>(modules: I, generation: u64) -> Result<Self, RecipeError>
    where
        I: IntoIterator<Item = (ModuleId, &'a ModuleRecipes)>,
    {
        let mut table = Vec::new();
        let mut intervals = Vec::new();
        for (id, module) in modules {
            let module_range = module.address_range();
            for interval in &module.intervals {
                let low = module.base.saturating_add(interval.range.start);
                let high = module.base.saturating_add(interval.range.end);
                if low >= high {
                    return Err(RecipeError::EmptyRange {
                        module: module.name.clone(),
                        low,
                        high,
                    });
                }
                if low < module_range.start || high > module_range.end {
                    return Err(RecipeError::OutsideModule {
                        module: module.name.clone(),
                        low,
                        high,
                    });
                }
                intervals.push(IndexedInterval {
                    low,
                    high,
                    module: id,
                    recipe: interval.recipe,
                });
            }
            table.push(LoadModule {
                id,
                name: module.name.clone(),
                base: module.base,
                size: module.size,
            });
        }

        table.sort_unstable_by_key(|m| m.base);
        for pair in table.windows(2) {
            if pair[0].range().end > pair[1].base {
                return Err(RecipeError::ModuleOverlap {
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                });
            }
        }

        intervals.sort_unstable_by_key(|i| i.low);
        for pair in intervals.windows(2) {
            if pair[0].high > pair[1].low {
                let module = table
                    .iter()
                    .find(|m| m.id == pair[1].module)
                    .map(|m| m.name.clone())
                    .unwrap_or_default();
                return Err(RecipeError::Overlap {
                    module,
                    low: pair[1].low,
                    high: pair[1].high,
                });
            }
        }

        Ok(Self {
            intervals,
            modules: table,
            generation,
        })
    }

    /// The interval whose `[low, high)` contains `pc`: the greatest `low`
    /// not above `pc`, provided `pc` is below that interval's `high`.
    #[inline]
    pub fn lookup_interval(&self, pc: usize) -> Option<&IndexedInterval> {
        let idx = self.intervals.partition_point(|i| i.low <= pc);
        let candidate = self.intervals.get(idx.checked_sub(1)?)?;
        candidate.contains(pc).then_some(candidate)
    }

    #[inline]
    pub fn lookup(&self, pc: usize) -> Option<&UnwindRecipe> {
        self.lookup_interval(pc).map(|i| &i.recipe)
    }

    /// Looks up a module-relative address.
    pub fn lookup_normalized(&self, ip: NormalizedIp) -> Option<&UnwindRecipe> {
        let module = self.modules.iter().find(|m| m.id == ip.module)?;
        if ip.offset >= module.size {
            return None;
        }
        self.lookup(module.base.checked_add(ip.offset)?)
    }

    pub fn module_containing(&self, pc: usize) -> Option<&LoadModule> {
        let idx = self.modules.partition_point(|m| m.base <= pc);
        let candidate = self.modules.get(idx.checked_sub(1)?)?;
        candidate.contains(pc).then_some(candidate)
    }

    /// Does `pc` lie inside some loaded module?
    #[inline]
    pub fn in_code(&self, pc: usize) -> bool {
        self.module_containing(pc).is_some()
    }

    pub fn normalize(&self, pc: usize) -> NormalizedIp {
        match self.module_containing(pc) {
            Some(module) => NormalizedIp::new(module.id, pc - module.base),
            None => NormalizedIp::unknown(pc),
        }
    }

    pub fn modules(&self) -> &[LoadModule] {
        &self.modules
    }

    pub fn intervals(&self) -> &[IndexedInterval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
