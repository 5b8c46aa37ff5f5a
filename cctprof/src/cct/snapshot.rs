// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Cct, CctNode, MetricId, MetricValue};
use crate::frame::{Association, FrameKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A point-in-time copy of a tree, detached from the arena, for writers of
/// profile formats. Nodes are listed parents first; ids index `nodes`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CctSnapshot {
    pub metrics: Vec<SnapshotMetric>,
    pub root: usize,
    pub partial_root: usize,
    pub nodes: Vec<SnapshotNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetric {
    pub name: String,
    pub id: MetricId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: usize,
    pub parent: Option<usize>,
    pub key: FrameKey,
    pub association: Association,
    /// Non-zero metric values, by metric index.
    pub metrics: Vec<(usize, MetricValue)>,
}

/// Numbers `node` after everything already in `nodes`. Parents are visited
/// before their children, so the parent's number is always known.
fn add(
    nodes: &mut Vec<SnapshotNode>,
    numbering: &mut HashMap<*const CctNode, usize>,
    metric_ids: &[MetricId],
    node: &CctNode,
) {
    let id = nodes.len();
    numbering.insert(node as *const CctNode, id);
    let parent = node
        .parent()
        .and_then(|p| numbering.get(&(p as *const CctNode)).copied());
    let metrics = metric_ids
        .iter()
        .map(|m| (m.index(), node.metric(*m)))
        .filter(|(_, v)| !v.is_zero())
        .collect();
    nodes.push(SnapshotNode {
        id,
        parent,
        key: node.key(),
        association: node.association(),
        metrics,
    });
}

impl CctSnapshot {
    pub(super) fn capture(cct: &Cct) -> Self {
        let registered = cct.metrics().metrics();
        let ids: Vec<MetricId> = registered.iter().map(|(_, id)| *id).collect();
        let mut nodes = Vec::with_capacity(cct.node_count() + 2);
        let mut numbering: HashMap<*const CctNode, usize> = HashMap::new();

        Cct::walk_from(cct.root(), |node| add(&mut nodes, &mut numbering, &ids, node));
        let partial_root = nodes.len();
        Cct::walk_from(cct.partial_root(), |node| {
            add(&mut nodes, &mut numbering, &ids, node)
        });

        Self {
            metrics: registered
                .into_iter()
                .map(|(name, id)| SnapshotMetric { name, id })
                .collect(),
            root: 0,
            partial_root,
            nodes,
        }
    }

    /// Total of a count metric over all nodes.
    pub fn total(&self, metric: MetricId) -> u64 {
        self.nodes
            .iter()
            .flat_map(|n| n.metrics.iter())
            .filter(|(index, _)| *index == metric.index())
            .map(|(_, value)| match value {
                MetricValue::Count(v) | MetricValue::Max(v) => *v,
                MetricValue::Real(v) => *v as u64,
            })
            .sum()
    }

    pub fn children(&self, id: usize) -> impl Iterator<Item = &SnapshotNode> {
        self.nodes.iter().filter(move |n| n.parent == Some(id))
    }
}
