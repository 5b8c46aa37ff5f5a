// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The published interval database.
//!
//! Readers run inside signal handlers, so they may not take any lock that
//! ordinary code could be holding. Rebuilds construct a complete new
//! [RecipeIndex] off to the side, publish it with a single atomic pointer
//! swap, and then wait for every reader that might still see the old
//! snapshot before freeing it. A reader therefore always sees either the old
//! or the new index in full, and never blocks.
//!
//! Readers are counted in one of two slots chosen by the current epoch. A
//! writer flips the epoch after swapping the pointer and then waits only for
//! the slot of the previous epoch, so a steady stream of new readers cannot
//! starve it.

use crate::error::RecipeError;
use crate::frame::ModuleId;
use crate::interval::RecipeIndex;
use crate::recipe::ModuleRecipes;
use parking_lot::Mutex;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};
use tracing::{debug, info};

pub struct RecipeDatabase {
    // Always a pointer from `Box::into_raw`, never null.
    current: AtomicPtr<RecipeIndex>,
    epoch: AtomicUsize,
    readers: [AtomicUsize; 2],
    generation: AtomicU64,
    // Only writers take this; the sampling path never does.
    modules: Mutex<ModuleList>,
}

#[derive(Default)]
struct ModuleList {
    next_id: u32,
    modules: Vec<(ModuleId, ModuleRecipes)>,
}

impl ModuleList {
    fn assign_id(&mut self) -> ModuleId {
        // Id 0 is reserved for addresses outside every module.
        self.next_id += 1;
        ModuleId(self.next_id)
    }
}

/// Keeps the snapshot it was created from alive. Hold it for the whole
/// unwind so every recipe reference stays valid.
pub struct LookupGuard<'a> {
    slot: &'a AtomicUsize,
    index: &'a RecipeIndex,
}

impl Deref for LookupGuard<'_> {
    type Target = RecipeIndex;

    fn deref(&self) -> &Self::Target {
        self.index
    }
}

impl Drop for LookupGuard<'_> {
    fn drop(&mut self) {
        self.slot.fetch_sub(1, SeqCst);
    }
}

impl Default for RecipeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipeDatabase {
    pub fn new() -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Box::default())),
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            generation: AtomicU64::new(0),
            modules: Mutex::new(ModuleList::default()),
        }
    }

    /// Pins the current snapshot. Never blocks and never allocates; it only
    /// retries if a writer flips the epoch between two of its loads.
    #[inline]
    pub fn read(&self) -> LookupGuard<'_> {
        let slot = loop {
            let epoch = self.epoch.load(SeqCst);
            let slot = &self.readers[epoch & 1];
            slot.fetch_add(1, SeqCst);
            // Registered in the slot the writer will wait on.
            if self.epoch.load(SeqCst) == epoch {
                break slot;
            }
            slot.fetch_sub(1, SeqCst);
        };
        let ptr = self.current.load(SeqCst);
        // SAFETY: `current` always holds a live boxed index, and it cannot be
        // freed while our slot counts us.
        let index = unsafe { &*ptr };
        LookupGuard { slot, index }
    }

    /// Number of snapshots published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(SeqCst)
    }

    /// Registers a newly loaded module and republishes the index.
    pub fn load_module(&self, recipes: ModuleRecipes) -> Result<ModuleId, RecipeError> {
        let mut list = self.modules.lock();
        let id = list.assign_id();
        info!(module = %recipes.name, base = recipes.base, size = recipes.size, intervals = recipes.intervals.len(), "module loaded");
        list.modules.push((id, recipes));
        if let Err(e) = self.publish(&list) {
            list.modules.pop();
            return Err(e);
        }
        Ok(id)
    }

    /// Drops a module's recipes and republishes the index.
    pub fn unload_module(&self, id: ModuleId) -> Result<(), RecipeError> {
        let mut list = self.modules.lock();
        let position = list
            .modules
            .iter()
            .position(|(m, _)| *m == id)
            .ok_or(RecipeError::UnknownModule(id.0))?;
        let (_, removed) = list.modules.remove(position);
        info!(module = %removed.name, "module unloaded");
        // Removing a module cannot introduce overlaps, so this cannot fail
        // for data reasons; restore the module if it somehow does.
        if let Err(e) = self.publish(&list) {
            list.modules.insert(position, (id, removed));
            return Err(e);
        }
        Ok(())
    }

    /// Replaces the whole module set, e.g. after re-reading the process's
    /// mappings. Returns the ids assigned, in input order.
    pub fn rebuild(&self, modules: Vec<ModuleRecipes>) -> Result<Vec<ModuleId>, RecipeError> {
        let mut list = self.modules.lock();
        let mut fresh = ModuleList {
            next_id: list.next_id,
            modules: Vec::with_capacity(modules.len()),
        };
        for module in modules {
            let id = fresh.assign_id();
            fresh.modules.push((id, module));
        }
        self.publish(&fresh)?;
        let ids = fresh.modules.iter().map(|(id, _)| *id).collect();
        *list = fresh;
        Ok(ids)
    }

    fn publish(&self, list: &ModuleList) -> Result<(), RecipeError> {
        let generation = self.generation.load(SeqCst) + 1;
        let index = RecipeIndex::build(list.modules.iter().map(|(id, m)| (*id, m)), generation)?;
        debug!(generation, modules = index.modules().len(), intervals = index.len(), "publishing recipe index");

        let old = self.current.swap(Box::into_raw(Box::new(index)), SeqCst);
        self.generation.store(generation, SeqCst);

        // Anyone who can still see `old` registered under the previous
        // epoch. Readers arriving after the flip load the new pointer.
        let previous = self.epoch.fetch_add(1, SeqCst);
        let slot = &self.readers[previous & 1];
        while slot.load(SeqCst) != 0 {
            std::thread::yield_now();
        }
        // SAFETY: `old` came from Box::into_raw and no reader can reach it.
        drop(unsafe { Box::from_raw(old) });
        Ok(())
    }
}

impl Drop for RecipeDatabase {
    fn drop(&mut self) {
        let ptr = self.current.swap(ptr::null_mut(), SeqCst);
        if !ptr.is_null() {
            // SAFETY: from Box::into_raw; &mut self means no guards remain.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

// SAFETY: the raw pointer is only dereferenced under the reader protocol.
unsafe impl Send for RecipeDatabase {}
unsafe impl Sync for RecipeDatabase {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::UnwindRecipe;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn module(name: &str, base: usize) -> ModuleRecipes {
        ModuleRecipes::new(name, base, 0x100).with_interval(0..0x100, UnwindRecipe::at_call())
    }

    #[test]
    fn load_and_unload() {
        let db = RecipeDatabase::new();
        assert!(db.read().lookup(0x1000).is_none());

        let a = db.load_module(module("a", 0x1000)).unwrap();
        let b = db.load_module(module("b", 0x2000)).unwrap();
        assert_ne!(a, b);
        assert_eq!(2, db.generation());
        assert!(db.read().lookup(0x1010).is_some());
        assert!(db.read().lookup(0x2010).is_some());

        db.unload_module(a).unwrap();
        assert!(db.read().lookup(0x1010).is_none());
        assert!(db.read().lookup(0x2010).is_some());
        assert_eq!(Err(RecipeError::UnknownModule(a.0)), db.unload_module(a));
    }

    #[test]
    fn failed_load_keeps_previous_snapshot() {
        let db = RecipeDatabase::new();
        db.load_module(module("a", 0x1000)).unwrap();
        let generation = db.generation();
        assert!(db.load_module(module("clash", 0x1080)).is_err());
        assert_eq!(generation, db.generation());
        assert_eq!(1, db.read().modules().len());
    }

    #[test]
    fn rebuild_replaces_everything() {
        let db = RecipeDatabase::new();
        let old = db.load_module(module("a", 0x1000)).unwrap();
        let ids = db.rebuild(vec![module("b", 0x5000), module("c", 0x6000)]).unwrap();
        assert_eq!(2, ids.len());
        assert!(!ids.contains(&old));
        let index = db.read();
        assert!(index.lookup(0x1010).is_none());
        assert_eq!(ids[0], index.normalize(0x5010).module);
    }

    #[test]
    fn readers_see_whole_snapshots_during_rebuilds() {
        let db = Arc::new(RecipeDatabase::new());
        db.rebuild(vec![module("a", 0x1000), module("b", 0x2000)]).unwrap();
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    while !stop.load(SeqCst) {
                        let index = db.read();
                        // Snapshots alternate between {a, b} and {a, b, c}:
                        // a and b are always there together.
                        assert!(index.lookup(0x1010).is_some());
                        assert!(index.lookup(0x2010).is_some());
                        assert!(index.modules().len() >= 2);
                    }
                });
            }
            for i in 0..200 {
                let mut modules = vec![module("a", 0x1000), module("b", 0x2000)];
                if i % 2 == 0 {
                    modules.push(module("c", 0x3000));
                }
                db.rebuild(modules).unwrap();
            }
            stop.store(true, SeqCst);
        });
        assert_eq!(201, db.generation());
    }
}
