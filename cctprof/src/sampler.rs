// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-sample driver.
//!
//! [Sampler::on_sample] runs inside the sampling signal handler: it resets
//! the thread's frame buffer, walks the stack with an [UnwindCursor], and
//! inserts the finished backtrace into the thread's calling context tree.
//! When the walk fails the sample is abandoned right there: the buffer is
//! discarded, the reason is counted, and control returns to the handler as
//! if the sample never happened. Nothing on this path allocates from the
//! heap, takes a lock, or logs.

use crate::cct::{self, Cct, CctNode, MetricDelta, MetricId, MetricKind, MetricRegistry};
use crate::config::{ProfilerConfiguration, TreeMode};
use crate::context::MachineContext;
use crate::counters::{DropLog, SampleCounters, SampleSummary};
use crate::cursor::{StepResult, UnwindCursor};
use crate::database::RecipeDatabase;
use crate::error::UnwindError;
use crate::fence::Fence;
use crate::frame::{Frame, FrameKind};
use crate::frame_buffer::FrameBuffer;
use crate::guard::SampleGuard;
use crate::interval::RecipeIndex;
use crate::logical::{LogicalUnwinder, NoLogicalUnwinder};
use crate::memory::{LiveStack, StackBounds, StackMemory};
use cctprof_alloc::SharedArena;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a sample was ignored without attempting an unwind.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    Disabled,
    /// A sample was already in progress on this thread.
    Reentered,
    /// The arena ran out earlier; sampling stays off for the rest of the run.
    ArenaExhausted,
    UnknownMetric,
    /// The thread has no execution context, or the signal carried no usable
    /// register state.
    NoContext,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SampleOutcome {
    Inserted {
        depth: usize,
        /// Trolling was needed at least once.
        trolled: bool,
    },
    Dropped(UnwindError),
    Blocked(BlockReason),
}

impl SampleOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, SampleOutcome::Inserted { .. })
    }
}

/// Everything the profiler keeps for one monitored thread. Created by
/// [Sampler::on_thread_start], used by every sample taken on that thread,
/// and handed back to [Sampler::on_thread_stop].
pub struct ExecutionContext {
    tree: Arc<Cct>,
    live_stack: Option<LiveStack>,
    in_sample: AtomicBool,
    last_leaf: AtomicPtr<CctNode>,
    samples: AtomicU64,
    // Only touched while `in_sample` is held.
    scratch: UnsafeCell<FrameBuffer>,
}

// SAFETY: the frame buffer is only reached through the `in_sample` guard,
// and `last_leaf` points into `tree`, which the context keeps alive.
unsafe impl Send for ExecutionContext {}

impl ExecutionContext {
    pub fn tree(&self) -> &Arc<Cct> {
        &self.tree
    }

    pub fn stack_bounds(&self) -> Option<StackBounds> {
        self.live_stack.as_ref().map(StackMemory::bounds)
    }

    /// The node the most recent successful sample ended on. A later insert
    /// can start from here instead of the root.
    pub fn last_leaf(&self) -> Option<&CctNode> {
        // SAFETY: leaves belong to `self.tree`, which outlives this borrow.
        unsafe { self.last_leaf.load(Acquire).as_ref() }
    }

    /// Samples delivered to this context, blocked ones included.
    pub fn samples(&self) -> u64 {
        self.samples.load(Relaxed)
    }

    /// Runs `f` on the frame buffer unless a sample is in progress. After a
    /// successful sample it holds that sample's backtrace.
    pub fn inspect<R>(&self, f: impl FnOnce(&FrameBuffer) -> R) -> Option<R> {
        let _guard = SampleGuard::new(&self.in_sample).ok()?;
        // SAFETY: the guard gives us exclusive access.
        Some(f(unsafe { &*self.scratch.get() }))
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("stack", &self.stack_bounds())
            .field("samples", &self.samples())
            .finish()
    }
}

pub struct Sampler<L: LogicalUnwinder = NoLogicalUnwinder> {
    config: ProfilerConfiguration,
    database: Arc<RecipeDatabase>,
    fence: Fence,
    arena: SharedArena,
    metrics: Arc<MetricRegistry>,
    shared_tree: Option<Arc<Cct>>,
    thread_trees: Mutex<Vec<Arc<Cct>>>,
    logical: L,
    counters: SampleCounters,
    drop_log: DropLog,
    enabled: AtomicBool,
    arena_exhausted: AtomicBool,
}

impl Sampler<NoLogicalUnwinder> {
    pub fn new(
        config: ProfilerConfiguration,
        database: Arc<RecipeDatabase>,
        fence: Fence,
    ) -> anyhow::Result<Self> {
        Self::with_logical_unwinder(config, database, fence, NoLogicalUnwinder)
    }
}

impl<L: LogicalUnwinder> Sampler<L> {
    /// Reserves the arena and, in shared mode, creates the process tree.
    /// Sampling starts enabled.
    pub fn with_logical_unwinder(
        config: ProfilerConfiguration,
        database: Arc<RecipeDatabase>,
        fence: Fence,
        logical: L,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!fence.is_empty(), "a fence must be supplied before sampling");
        let arena = SharedArena::with_capacity(config.arena_bytes())
            .map_err(|_| anyhow::anyhow!("cannot reserve a {} byte arena", config.arena_bytes()))?;
        let metrics = Arc::new(MetricRegistry::new());
        let shared_tree = match config.tree_mode() {
            TreeMode::Shared => Some(Arc::new(Cct::new(arena.clone(), metrics.clone())?)),
            TreeMode::PerThread => None,
        };
        info!(
            arena_bytes = arena.reserved_bytes(),
            tree_mode = ?config.tree_mode(),
            fence_ranges = fence.ranges().len(),
            "sampler ready"
        );
        Ok(Self {
            config,
            database,
            fence,
            arena,
            metrics,
            shared_tree,
            thread_trees: Mutex::new(Vec::new()),
            logical,
            counters: SampleCounters::default(),
            drop_log: DropLog::default(),
            enabled: AtomicBool::new(true),
            arena_exhausted: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ProfilerConfiguration {
        &self.config
    }

    pub fn database(&self) -> &Arc<RecipeDatabase> {
        &self.database
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    pub fn counters(&self) -> &SampleCounters {
        &self.counters
    }

    pub fn drop_log(&self) -> &DropLog {
        &self.drop_log
    }

    pub fn logical_unwinder(&self) -> &L {
        &self.logical
    }

    pub fn register_metric(&self, name: &str, kind: MetricKind) -> anyhow::Result<MetricId> {
        let id = self.metrics.register(name, kind)?;
        debug!(name, ?kind, index = id.index(), "metric registered");
        Ok(id)
    }

    pub fn enable(&self) {
        self.enabled.store(true, SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    pub fn is_arena_exhausted(&self) -> bool {
        self.arena_exhausted.load(Relaxed)
    }

    /// Every tree samples have been recorded into.
    pub fn trees(&self) -> Vec<Arc<Cct>> {
        match &self.shared_tree {
            Some(tree) => vec![tree.clone()],
            None => self.thread_trees.lock().clone(),
        }
    }

    /// Sets up the calling thread, reading its stack region from the thread
    /// library.
    pub fn on_thread_start(&self) -> anyhow::Result<ExecutionContext> {
        let bounds = LiveStack::current_thread_bounds()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the stack of the current thread"))?;
        // SAFETY: the calling thread's own stack is mapped for its lifetime.
        self.start_context(Some(unsafe { LiveStack::new(bounds) }))
    }

    /// Sets up a thread whose stack region is known to the caller.
    ///
    /// # Safety
    /// Every word in `bounds` must stay readable for as long as samples are
    /// taken with the returned context.
    pub unsafe fn on_thread_start_with_stack(
        &self,
        bounds: StackBounds,
    ) -> anyhow::Result<ExecutionContext> {
        // SAFETY: forwarded to the caller.
        self.start_context(Some(unsafe { LiveStack::new(bounds) }))
    }

    /// A context with no live stack, for replaying captured stacks through
    /// [Sampler::on_sample_with].
    pub fn on_replay_start(&self) -> anyhow::Result<ExecutionContext> {
        self.start_context(None)
    }

    fn start_context(&self, live_stack: Option<LiveStack>) -> anyhow::Result<ExecutionContext> {
        let tree = match &self.shared_tree {
            Some(tree) => tree.clone(),
            None => {
                let tree = Arc::new(Cct::new(self.arena.clone(), self.metrics.clone())?);
                self.thread_trees.lock().push(tree.clone());
                tree
            }
        };
        let buffer = FrameBuffer::with_capacity_in(self.config.frame_buffer_capacity(), self.arena.clone())?;
        debug!(stack = ?live_stack.map(|s| s.bounds()), "thread started");
        Ok(ExecutionContext {
            tree,
            live_stack,
            in_sample: AtomicBool::new(false),
            last_leaf: AtomicPtr::new(ptr::null_mut()),
            samples: AtomicU64::new(0),
            scratch: UnsafeCell::new(buffer),
        })
    }

    pub fn on_thread_stop(&self, context: ExecutionContext) {
        debug!(
            samples = context.samples(),
            nodes = context.tree.node_count(),
            "thread stopped"
        );
    }

    /// Samples the thread's own stack at `context`.
    pub fn on_sample(
        &self,
        ctx: &ExecutionContext,
        context: MachineContext,
        metric: MetricId,
        delta: impl Into<MetricDelta>,
    ) -> SampleOutcome {
        match ctx.live_stack {
            Some(stack) => self.on_sample_with(ctx, &stack, context, metric, delta),
            None => {
                self.counters.on_total();
                self.counters.on_blocked();
                SampleOutcome::Blocked(BlockReason::NoContext)
            }
        }
    }

    /// Samples with stack words read through `stack`.
    pub fn on_sample_with<M: StackMemory + ?Sized>(
        &self,
        ctx: &ExecutionContext,
        stack: &M,
        context: MachineContext,
        metric: MetricId,
        delta: impl Into<MetricDelta>,
    ) -> SampleOutcome {
        self.counters.on_total();
        ctx.samples.fetch_add(1, Relaxed);
        if let Some(reason) = self.blocked(metric) {
            self.counters.on_blocked();
            return SampleOutcome::Blocked(reason);
        }
        let Ok(_guard) = SampleGuard::new(&ctx.in_sample) else {
            self.counters.on_blocked();
            return SampleOutcome::Blocked(BlockReason::Reentered);
        };
        // SAFETY: `_guard` gives this call exclusive use of the buffer.
        let buffer = unsafe { &mut *ctx.scratch.get() };
        buffer.reset();

        let index = self.database.read();
        let mut cursor = UnwindCursor::init(&index, &self.fence, stack, self.config.unwind_limits(), context);
        let unwound = self.unwind(&mut cursor, &index, buffer);
        if cursor.trolls() > 0 {
            self.counters.on_trolled();
        }
        if let Err(reason) = unwound {
            return self.abort(ctx, buffer, &index, cursor.context(), reason, metric, delta.into());
        }

        match ctx.tree.record(buffer.frames(), metric, delta) {
            Ok(leaf) => {
                ctx.last_leaf.store(ptr::from_ref(leaf).cast_mut(), Release);
                self.counters.on_inserted(buffer.len());
                SampleOutcome::Inserted {
                    depth: buffer.len(),
                    trolled: cursor.trolls() > 0,
                }
            }
            Err(_) => self.drop_sample(buffer, UnwindError::AllocationFailure, cursor.context().pc),
        }
    }

    fn blocked(&self, metric: MetricId) -> Option<BlockReason> {
        if !self.enabled.load(Relaxed) {
            Some(BlockReason::Disabled)
        } else if self.arena_exhausted.load(Relaxed) {
            Some(BlockReason::ArenaExhausted)
        } else if !self.metrics.is_registered(metric) {
            Some(BlockReason::UnknownMetric)
        } else {
            None
        }
    }

    /// Drives the cursor to the fence, appending each frame it leaves and
    /// finally the fence frame itself.
    fn unwind<M: StackMemory + ?Sized>(
        &self,
        cursor: &mut UnwindCursor<'_, M>,
        index: &RecipeIndex,
        buffer: &mut FrameBuffer,
    ) -> Result<(), UnwindError> {
        loop {
            match cursor.advance() {
                StepResult::Stepped(left) => {
                    buffer.append(self.frame_for(index, &left))?;
                }
                StepResult::Trolling => {}
                StepResult::Done => {
                    buffer.append(self.frame_for(index, &cursor.context()))?;
                    return Ok(());
                }
                StepResult::Failed(reason) => return Err(reason),
            }
        }
    }

    fn frame_for(&self, index: &RecipeIndex, at: &MachineContext) -> Frame {
        let ip = index.normalize(at.pc);
        if !self.logical.is_my_code(at.pc) {
            return Frame::physical(ip);
        }
        let assoc = self.logical.step_physical_note(at);
        let logical = self.logical.step_logical_note(at);
        Frame {
            ip,
            kind: if logical.is_some() {
                FrameKind::Logical
            } else {
                FrameKind::Physical
            },
            assoc,
            logical,
        }
    }

    /// The recovery point for a failed unwind.
    #[allow(clippy::too_many_arguments)]
    fn abort(
        &self,
        ctx: &ExecutionContext,
        buffer: &mut FrameBuffer,
        index: &RecipeIndex,
        at: MachineContext,
        reason: UnwindError,
        metric: MetricId,
        delta: MetricDelta,
    ) -> SampleOutcome {
        if self.config.record_partial_unwinds() && reason != UnwindError::AllocationFailure {
            let kept = buffer
                .append(self.frame_for(index, &at))
                .map_err(|_| ())
                .and_then(|_| ctx.tree.record_partial(buffer.frames(), metric, delta).map_err(|_| ()));
            match kept {
                Ok(_) => self.counters.on_partial(),
                Err(()) => self.arena_ran_out(),
            }
        }
        self.drop_sample(buffer, reason, at.pc)
    }

    fn drop_sample(&self, buffer: &mut FrameBuffer, reason: UnwindError, pc: usize) -> SampleOutcome {
        buffer.reset();
        if reason == UnwindError::AllocationFailure {
            self.arena_ran_out();
        }
        self.counters.on_dropped(reason);
        self.drop_log.push(reason, pc);
        SampleOutcome::Dropped(reason)
    }

    /// A refused allocation only stops sampling once the arena cannot fit
    /// another tree node. A deep sample whose buffer could not grow is just
    /// dropped.
    fn arena_ran_out(&self) {
        if !self.arena.has_capacity_for(cct::growth_unit()) {
            self.arena_exhausted.store(true, Relaxed);
        }
    }

    /// Stops sampling, reports what happened during the run, and returns
    /// the same figures.
    pub fn finish(&self) -> SampleSummary {
        self.disable();
        let trees = self.trees();
        let summary = SampleSummary {
            total: self.counters.total(),
            inserted: self.counters.inserted(),
            blocked: self.counters.blocked(),
            trolled: self.counters.trolled(),
            partial: self.counters.partial(),
            dropped: self.counters.dropped_counts(),
            max_depth: self.counters.max_depth(),
            nodes: trees.iter().map(|t| t.node_count()).sum(),
            arena_used_bytes: self.arena.used_bytes(),
            arena_exhausted: self.is_arena_exhausted(),
        };
        for record in self.drop_log.records() {
            debug!(reason = %record.reason, pc = %format!("{:#x}", record.pc), "dropped sample");
        }
        if summary.arena_exhausted {
            warn!(
                reserved = self.arena.reserved_bytes(),
                "arena exhausted, sampling was stopped early"
            );
        }
        info!(
            total = summary.total,
            inserted = summary.inserted,
            dropped = summary.dropped.total(),
            troll_exhausted = summary.dropped.troll_exhausted,
            stack_bounds = summary.dropped.stack_bounds,
            iteration_bound = summary.dropped.iteration_bound,
            allocation = summary.dropped.allocation,
            blocked = summary.blocked,
            trolled = summary.trolled,
            max_depth = summary.max_depth,
            nodes = summary.nodes,
            "profiling run finished"
        );
        summary
    }
}

impl<L: LogicalUnwinder> fmt::Debug for Sampler<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .field("counters", &self.counters)
            .finish()
    }
}
