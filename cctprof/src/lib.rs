// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A statistical call-path profiler core.
//!
//! On every sample the interrupted thread's stack is unwound frame by frame
//! using unwind recipes indexed by address ([database]), falling back to a
//! bounded scan of the raw stack ([troll]) when no recipe applies. The
//! resulting backtrace is merged into a calling context tree ([cct]) that is
//! shared between threads and safe to extend from signal handlers.
//!
//! The usual setup is:
//!  1. load module recipes into a [RecipeDatabase],
//!  2. build a [Sampler] with a [Fence] and a [ProfilerConfiguration],
//!  3. call [Sampler::on_thread_start] on every monitored thread and
//!     [trampoline::install] the context,
//!  4. call [trampoline::handle_sample_signal] from the signal handler,
//!  5. call [Sampler::finish] and read the trees.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cct;
pub mod config;
pub mod context;
pub mod counters;
pub mod cursor;
pub mod database;
pub mod error;
pub mod fence;
pub mod frame;
pub mod frame_buffer;
pub mod guard;
pub mod interval;
pub mod log;
pub mod logical;
pub mod memory;
pub mod recipe;
pub mod sampler;
pub mod trampoline;
pub mod troll;

pub use cct::{Cct, CctNode, CctSnapshot, MetricDelta, MetricId, MetricKind, MetricRegistry, MetricValue};
pub use config::{ProfilerConfiguration, TreeMode};
pub use context::MachineContext;
pub use counters::{DropRecord, DroppedCounts, SampleSummary};
pub use cursor::{CursorState, StepResult, UnwindCursor, UnwindLimits};
pub use database::RecipeDatabase;
pub use error::{CctError, RecipeError, UnwindError};
pub use fence::Fence;
pub use frame::{Association, Frame, FrameKey, FrameKind, LogicalId, ModuleId, NormalizedIp};
pub use frame_buffer::{FrameBuffer, WriteCursor};
pub use interval::RecipeIndex;
pub use logical::{LogicalUnwinder, NoLogicalUnwinder};
pub use memory::{LiveStack, StackBounds, StackMemory, SyntheticStack};
pub use recipe::{ModuleRecipes, RaMode, RecipeInterval, UnwindRecipe, WORD};
pub use sampler::{BlockReason, ExecutionContext, SampleOutcome, Sampler};
