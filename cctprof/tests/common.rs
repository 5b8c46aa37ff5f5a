// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A small synthetic program to unwind: one module holding `main`, `foo`,
//! `bar` and a recursive `rec`, with `main` acting as the fence.

#![allow(dead_code)]

use cctprof::{
    Fence, Frame, MachineContext, ModuleRecipes, ProfilerConfiguration, RecipeDatabase, Sampler,
    SyntheticStack, TreeMode, UnwindRecipe,
};
use std::ops::Range;
use std::sync::Arc;

pub const BASE: usize = 0x40_0000;
pub const MAIN: Range<usize> = BASE..BASE + 0x100;
pub const FOO: Range<usize> = BASE + 0x100..BASE + 0x200;
pub const BAR: Range<usize> = BASE + 0x200..BASE + 0x300;
pub const REC: Range<usize> = BASE + 0x300..BASE + 0x400;
pub const MODULE_SIZE: usize = 0x1000;

/// Where the fixture stacks are laid out.
pub const STACK_LOW: usize = 0x7fff_0000;

/// A return address `offset` bytes into `function`.
pub fn at(function: Range<usize>, offset: usize) -> usize {
    function.start + offset
}

/// The module with every function analyzed except those in `skip`. All
/// recipes say the return address is on top of the stack.
pub fn module(skip: &[Range<usize>]) -> ModuleRecipes {
    [MAIN, FOO, BAR, REC]
        .into_iter()
        .filter(|f| !skip.contains(f))
        .fold(ModuleRecipes::new("app", BASE, MODULE_SIZE), |m, f| {
            m.with_interval(f.start - BASE..f.end - BASE, UnwindRecipe::at_call())
        })
}

pub fn database(skip: &[Range<usize>]) -> Arc<RecipeDatabase> {
    let database = RecipeDatabase::new();
    database.load_module(module(skip)).unwrap();
    Arc::new(database)
}

pub fn fence() -> Fence {
    Fence::new().with_range(MAIN)
}

pub fn config(tree_mode: TreeMode, record_partial_unwinds: bool) -> ProfilerConfiguration {
    ProfilerConfiguration::new(
        32,
        4096,
        64,
        4 << 20,
        tree_mode,
        record_partial_unwinds,
        "debug".to_owned(),
    )
    .unwrap()
}

pub fn sampler(skip: &[Range<usize>]) -> Sampler {
    Sampler::new(config(TreeMode::Shared, false), database(skip), fence()).unwrap()
}

/// `bar` interrupted with the return addresses `words` above it, innermost
/// first.
pub fn bar_stack(words: Vec<usize>) -> (SyntheticStack, MachineContext) {
    let stack = SyntheticStack::from_words(STACK_LOW, words);
    let context = MachineContext::new(at(BAR, 0x10), STACK_LOW, 0);
    (stack, context)
}

/// main calls foo calls bar.
pub fn main_foo_bar() -> (SyntheticStack, MachineContext) {
    bar_stack(vec![at(FOO, 0x20), at(MAIN, 0x30), 0])
}

/// The frames the sampler is expected to record for `pcs`, innermost first.
pub fn frames(sampler: &Sampler, pcs: &[usize]) -> Vec<Frame> {
    let index = sampler.database().read();
    pcs.iter().map(|pc| Frame::physical(index.normalize(*pc))).collect()
}
