// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::metrics::{MetricId, MetricSlots, MetricValue};
use crate::frame::{Association, FrameKey};
use std::fmt;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicPtr, AtomicU8};

/// One calling context: the path of frames from the root down to here.
///
/// Nodes live in the tree's arena and are never freed or moved while the
/// tree exists. A node's key, parent and depth are fixed when it is
/// published; its children list only grows, and its association bits and
/// metrics change only through atomic operations.
pub struct CctNode {
    key: FrameKey,
    parent: *const CctNode,
    depth: u32,
    association: AtomicU8,
    // Singly linked list of children, newest first. A node's
    // `next_sibling` is written before the node is published and never
    // changes afterwards.
    first_child: AtomicPtr<CctNode>,
    next_sibling: AtomicPtr<CctNode>,
    pub(super) metrics: MetricSlots,
}

// SAFETY: all mutable state is atomic, and the raw pointers only refer to
// arena nodes that outlive every reference handed out.
unsafe impl Send for CctNode {}
unsafe impl Sync for CctNode {}

impl CctNode {
    pub(super) fn new(key: FrameKey, parent: Option<&CctNode>, association: Association) -> Self {
        Self {
            key,
            parent: parent.map_or(ptr::null(), |p| p as *const CctNode),
            depth: parent.map_or(0, |p| p.depth + 1),
            association: AtomicU8::new(association.bits()),
            first_child: AtomicPtr::new(ptr::null_mut()),
            next_sibling: AtomicPtr::new(ptr::null_mut()),
            metrics: MetricSlots::new(),
        }
    }

    pub fn key(&self) -> FrameKey {
        self.key
    }

    pub fn parent(&self) -> Option<&CctNode> {
        // SAFETY: parents outlive their children.
        unsafe { self.parent.as_ref() }
    }

    /// Distance from the root; the root itself is at depth 0.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_null()
    }

    pub fn association(&self) -> Association {
        Association::from_bits(self.association.load(Relaxed))
    }

    /// Applies [Association::merged_with] for a frame tagged `incoming`.
    pub(super) fn merge_association(&self, incoming: Association) {
        let _ = self.association.fetch_update(AcqRel, Acquire, |bits| {
            let current = Association::from_bits(bits);
            let merged = current.merged_with(incoming);
            (merged != current).then_some(merged.bits())
        });
    }

    pub fn metric(&self, metric: MetricId) -> MetricValue {
        self.metrics.value(metric)
    }

    /// Children in no particular order.
    pub fn children(&self) -> Children<'_> {
        Children {
            next: self.first_child.load(Acquire),
            _node: self,
        }
    }

    pub fn child(&self, key: &FrameKey) -> Option<&CctNode> {
        self.children().find(|c| c.key == *key)
    }

    /// Keys from the outermost frame down to this node, roots excluded.
    pub fn path(&self) -> Vec<FrameKey> {
        let mut keys = Vec::with_capacity(self.depth as usize);
        let mut node = self;
        while let Some(parent) = node.parent() {
            keys.push(node.key);
            node = parent;
        }
        keys.reverse();
        keys
    }

    /// The child with `key`, scanning the list from `head` up to (but not
    /// including) `stop`.
    pub(super) fn scan(&self, head: *mut CctNode, stop: *mut CctNode, key: &FrameKey) -> Option<&CctNode> {
        let mut cursor = head;
        while cursor != stop && !cursor.is_null() {
            // SAFETY: published nodes are valid for the life of the tree.
            let node = unsafe { &*cursor };
            if node.key == *key {
                return Some(node);
            }
            cursor = node.next_sibling.load(Acquire);
        }
        None
    }

    pub(super) fn first_child_ptr(&self) -> *mut CctNode {
        self.first_child.load(Acquire)
    }

    /// Links the unpublished node `child` in front of `expected`. Fails if
    /// another thread changed the list head first.
    ///
    /// # Safety
    /// `child` must be a valid node that no other thread can see yet.
    pub(super) unsafe fn try_link_child(&self, child: *mut CctNode, expected: *mut CctNode) -> bool {
        // SAFETY: unpublished, so we are its only user.
        unsafe { (*child).next_sibling.store(expected, Relaxed) };
        self.first_child
            .compare_exchange(expected, child, AcqRel, Acquire)
            .is_ok()
    }
}

impl fmt::Debug for CctNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CctNode")
            .field("key", &self.key)
            .field("depth", &self.depth)
            .field("association", &self.association())
            .finish()
    }
}

pub struct Children<'a> {
    next: *mut CctNode,
    _node: &'a CctNode,
}

impl<'a> Iterator for Children<'a> {
    type Item = &'a CctNode;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: published nodes are valid for the life of the tree, which
        // the borrowed parent witnesses.
        let node = unsafe { self.next.as_ref()? };
        self.next = node.next_sibling.load(Acquire);
        Some(node)
    }
}
