// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The calling context tree.
//!
//! Backtraces are merged by common prefix: inserting one walks down from a
//! starting node, outermost frame first, finding or creating the child for
//! each frame, and accumulates the metric delta at the node it ends on.
//!
//! Children are published with a compare-and-swap on the parent's list
//! head. A thread that loses the race rescans the entries added in the
//! meantime and adopts the winner's node if it has the same key, so there is
//! never more than one child per key under a parent. All nodes come from
//! the tree's [SharedArena] and are never freed before the tree itself.

mod metrics;
mod node;
mod snapshot;

pub use metrics::{MetricDelta, MetricId, MetricKind, MetricRegistry, MetricValue, MAX_METRICS};
pub use node::{CctNode, Children};
pub use snapshot::{CctSnapshot, SnapshotMetric, SnapshotNode};

use crate::error::CctError;
use crate::frame::{Association, Frame, FrameKey};
use cctprof_alloc::SharedArena;
use std::alloc::Layout;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Smallest arena a profiler will accept: room for the roots, a few
/// hundred nodes and the per-thread frame buffers.
pub const MIN_ARENA_BYTES: usize = 64 * 1024;

/// The most a single new child can take from the arena: the node and the
/// first chunk of its metrics. An arena that cannot fit this can no longer
/// grow any tree.
pub(crate) fn growth_unit() -> Layout {
    Layout::new::<CctNode>()
        .extend(Layout::new::<metrics::MetricChunk>())
        .map_or(Layout::new::<CctNode>(), |(unit, _)| unit.pad_to_align())
}

pub struct Cct {
    arena: SharedArena,
    metrics: Arc<MetricRegistry>,
    root: NonNull<CctNode>,
    partial_root: NonNull<CctNode>,
    nodes: AtomicUsize,
}

// SAFETY: nodes are only mutated through atomics; see CctNode.
unsafe impl Send for Cct {}
unsafe impl Sync for Cct {}

impl Cct {
    /// Creates an empty tree whose nodes will be carved out of `arena`.
    pub fn new(arena: SharedArena, metrics: Arc<MetricRegistry>) -> Result<Self, CctError> {
        let root = arena.alloc_value(CctNode::new(FrameKey::default(), None, Association::NONE))?;
        let partial_root = arena.alloc_value(CctNode::new(FrameKey::default(), None, Association::NONE))?;
        Ok(Self {
            arena,
            metrics,
            root,
            partial_root,
            nodes: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &CctNode {
        // SAFETY: allocated in `new`, lives as long as the arena we hold.
        unsafe { self.root.as_ref() }
    }

    /// Root of the backtraces that could not be completed.
    pub fn partial_root(&self) -> &CctNode {
        // SAFETY: as for `root`.
        unsafe { self.partial_root.as_ref() }
    }

    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    /// Nodes created so far, roots excluded.
    pub fn node_count(&self) -> usize {
        self.nodes.load(Relaxed)
    }

    /// Inserts a backtrace under the main root.
    pub fn record(
        &self,
        frames: &[Frame],
        metric: MetricId,
        delta: impl Into<MetricDelta>,
    ) -> Result<&CctNode, CctError> {
        self.insert_path(self.root(), frames, metric, delta)
    }

    /// Inserts a backtrace under the partial-unwind root.
    pub fn record_partial(
        &self,
        frames: &[Frame],
        metric: MetricId,
        delta: impl Into<MetricDelta>,
    ) -> Result<&CctNode, CctError> {
        self.insert_path(self.partial_root(), frames, metric, delta)
    }

    /// Walks from `start` along `frames` (innermost first, so they are
    /// visited in reverse), creating missing nodes, then adds `delta` to
    /// `metric` at the node reached. `start` must be a node of this tree.
    ///
    /// Safe to call from a signal handler: memory comes from the arena and
    /// nothing blocks. On failure the nodes created so far stay in the tree
    /// without any metric.
    pub fn insert_path<'a>(
        &'a self,
        start: &'a CctNode,
        frames: &[Frame],
        metric: MetricId,
        delta: impl Into<MetricDelta>,
    ) -> Result<&'a CctNode, CctError> {
        if !self.metrics.is_registered(metric) {
            return Err(CctError::UnknownMetric(metric.index()));
        }
        let mut spare = None;
        let mut node = start;
        for frame in frames.iter().rev() {
            node = self.find_or_insert_child(node, frame, &mut spare)?;
        }
        node.metrics.accumulate(metric, delta.into(), &self.arena)?;
        Ok(node)
    }

    fn find_or_insert_child<'a>(
        &'a self,
        parent: &'a CctNode,
        frame: &Frame,
        spare: &mut Option<NonNull<CctNode>>,
    ) -> Result<&'a CctNode, CctError> {
        let key = frame.key();
        let mut stop = ptr::null_mut();
        loop {
            let head = parent.first_child_ptr();
            // Only the entries pushed since the previous scan are new.
            if let Some(existing) = parent.scan(head, stop, &key) {
                existing.merge_association(frame.assoc);
                return Ok(existing);
            }

            let fresh = match spare.take() {
                Some(fresh) => {
                    // SAFETY: left over from a lost race and never published,
                    // so we are its only user.
                    unsafe { fresh.as_ptr().write(CctNode::new(key, Some(parent), frame.assoc)) };
                    fresh
                }
                None => self.arena.alloc_value(CctNode::new(key, Some(parent), frame.assoc))?,
            };
            // SAFETY: `fresh` is unpublished until this link succeeds.
            if unsafe { parent.try_link_child(fresh.as_ptr(), head) } {
                self.nodes.fetch_add(1, Relaxed);
                // SAFETY: published and never freed while the tree lives.
                return Ok(unsafe { fresh.as_ref() });
            }
            *spare = Some(fresh);
            stop = head;
        }
    }

    /// Looks up the node for `frames` below `start` without creating
    /// anything.
    pub fn find_path<'a>(&'a self, start: &'a CctNode, frames: &[Frame]) -> Option<&'a CctNode> {
        frames
            .iter()
            .rev()
            .try_fold(start, |node, frame| node.child(&frame.key()))
    }

    /// Visits the main root and every node below it, parents before
    /// children.
    pub fn walk<'a>(&'a self, visit: impl FnMut(&'a CctNode)) {
        Self::walk_from(self.root(), visit)
    }

    pub fn walk_from<'a>(start: &'a CctNode, mut visit: impl FnMut(&'a CctNode)) {
        let mut pending = vec![start];
        while let Some(node) = pending.pop() {
            visit(node);
            pending.extend(node.children());
        }
    }

    pub fn snapshot(&self) -> CctSnapshot {
        CctSnapshot::capture(self)
    }
}

impl fmt::Debug for Cct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cct")
            .field("nodes", &self.node_count())
            .field("arena_used", &self.arena.used_bytes())
            .finish()
    }
}
