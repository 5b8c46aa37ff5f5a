// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric registration and per-node metric storage.
//!
//! A node's values live in a chain of fixed-size chunks allocated from the
//! arena the first time a metric in that chunk is touched. Chunks are
//! appended with a CAS and never removed, and every value is a single
//! atomic word, so concurrent samples landing on the same node never lose
//! an update.

use crate::error::CctError;
use cctprof_alloc::SharedArena;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};

/// Upper bound on the number of metrics one profile can register.
pub const MAX_METRICS: usize = 64;

pub(crate) const CHUNK_LEN: usize = 8;

/// How deltas for a metric are combined.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Sum of unsigned integers: sample counts, bytes.
    Count,
    /// Sum of floating point values: seconds, joules.
    Real,
    /// Largest value seen.
    Max,
}

/// Handle to a registered metric. Carries its kind so accumulation needs no
/// lookup while sampling, and the registry it came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MetricId {
    index: u16,
    kind: MetricKind,
    registry: u32,
}

impl MetricId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn kind(self) -> MetricKind {
        self.kind
    }
}

/// One increment, interpreted according to the metric's kind.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetricDelta {
    Int(u64),
    Real(f64),
}

impl MetricDelta {
    fn as_u64(self) -> u64 {
        match self {
            MetricDelta::Int(v) => v,
            MetricDelta::Real(v) if v > 0.0 => v as u64,
            MetricDelta::Real(_) => 0,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            MetricDelta::Int(v) => v as f64,
            MetricDelta::Real(v) => v,
        }
    }
}

impl From<u64> for MetricDelta {
    fn from(value: u64) -> Self {
        MetricDelta::Int(value)
    }
}

impl From<f64> for MetricDelta {
    fn from(value: f64) -> Self {
        MetricDelta::Real(value)
    }
}

/// An accumulated value read back from a node.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Count(u64),
    Real(f64),
    Max(u64),
}

impl MetricValue {
    fn from_bits(kind: MetricKind, bits: u64) -> Self {
        match kind {
            MetricKind::Count => MetricValue::Count(bits),
            MetricKind::Real => MetricValue::Real(f64::from_bits(bits)),
            MetricKind::Max => MetricValue::Max(bits),
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            MetricValue::Count(v) | MetricValue::Max(v) => v == 0,
            MetricValue::Real(v) => v == 0.0,
        }
    }
}

static NEXT_REGISTRY: AtomicU32 = AtomicU32::new(1);

/// The process-wide list of metrics. Registration is rare and takes a lock;
/// checking whether an id is registered is a single atomic load.
#[derive(Debug)]
pub struct MetricRegistry {
    tag: u32,
    registered: AtomicUsize,
    names: Mutex<Vec<(String, MetricKind)>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self {
            tag: NEXT_REGISTRY.fetch_add(1, Relaxed),
            registered: AtomicUsize::new(0),
            names: Mutex::new(Vec::new()),
        }
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(&self, index: usize, kind: MetricKind) -> MetricId {
        MetricId {
            index: index as u16,
            kind,
            registry: self.tag,
        }
    }

    /// Registers `name`, or returns the existing id if it is already known
    /// with the same kind.
    pub fn register(&self, name: &str, kind: MetricKind) -> anyhow::Result<MetricId> {
        let mut names = self.names.lock();
        if let Some(index) = names.iter().position(|(n, _)| n == name) {
            let existing = names[index].1;
            anyhow::ensure!(
                existing == kind,
                "metric {name} is already registered as {existing:?}"
            );
            return Ok(self.id(index, kind));
        }
        anyhow::ensure!(names.len() < MAX_METRICS, "at most {MAX_METRICS} metrics can be registered");
        let id = self.id(names.len(), kind);
        names.push((name.to_owned(), kind));
        self.registered.store(names.len(), Relaxed);
        Ok(id)
    }

    #[inline]
    pub fn is_registered(&self, id: MetricId) -> bool {
        id.registry == self.tag && id.index() < self.registered.load(Relaxed)
    }

    pub fn len(&self) -> usize {
        self.registered.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, name: &str) -> Option<MetricId> {
        let names = self.names.lock();
        let index = names.iter().position(|(n, _)| n == name)?;
        Some(self.id(index, names[index].1))
    }

    /// Every registered metric with its name, in registration order.
    pub fn metrics(&self) -> Vec<(String, MetricId)> {
        self.names
            .lock()
            .iter()
            .enumerate()
            .map(|(index, (name, kind))| (name.clone(), self.id(index, *kind)))
            .collect()
    }
}

pub(crate) struct MetricChunk {
    values: [AtomicU64; CHUNK_LEN],
    next: AtomicPtr<MetricChunk>,
}

impl MetricChunk {
    const fn empty() -> Self {
        Self {
            values: [const { AtomicU64::new(0) }; CHUNK_LEN],
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// The head of a node's chunk chain.
pub(crate) struct MetricSlots {
    head: AtomicPtr<MetricChunk>,
}

impl MetricSlots {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The cell for `index`, allocating missing chunks from `arena`.
    fn cell(&self, index: usize, arena: &SharedArena) -> Result<&AtomicU64, CctError> {
        let mut link = &self.head;
        let mut spare: Option<*mut MetricChunk> = None;
        for _ in 0..index / CHUNK_LEN {
            link = &self.chunk_at(link, arena, &mut spare)?.next;
        }
        let chunk = self.chunk_at(link, arena, &mut spare)?;
        Ok(&chunk.values[index % CHUNK_LEN])
    }

    fn chunk_at<'a>(
        &'a self,
        link: &'a AtomicPtr<MetricChunk>,
        arena: &SharedArena,
        spare: &mut Option<*mut MetricChunk>,
    ) -> Result<&'a MetricChunk, CctError> {
        let mut chunk = link.load(Acquire);
        if chunk.is_null() {
            let fresh = match spare.take() {
                Some(fresh) => fresh,
                None => arena.alloc_value(MetricChunk::empty())?.as_ptr(),
            };
            match link.compare_exchange(ptr::null_mut(), fresh, AcqRel, Acquire) {
                Ok(_) => chunk = fresh,
                Err(winner) => {
                    // Never published, still zeroed; keep it for the next link.
                    *spare = Some(fresh);
                    chunk = winner;
                }
            }
        }
        // SAFETY: chunks are arena allocations that live as long as the tree
        // and are never unlinked.
        Ok(unsafe { &*chunk })
    }

    fn peek(&self, index: usize) -> Option<&AtomicU64> {
        let mut chunk = self.head.load(Acquire);
        for _ in 0..index / CHUNK_LEN {
            if chunk.is_null() {
                return None;
            }
            // SAFETY: see chunk_at.
            chunk = unsafe { &*chunk }.next.load(Acquire);
        }
        // SAFETY: see chunk_at.
        unsafe { chunk.as_ref() }.map(|c| &c.values[index % CHUNK_LEN])
    }

    pub(crate) fn accumulate(
        &self,
        metric: MetricId,
        delta: MetricDelta,
        arena: &SharedArena,
    ) -> Result<(), CctError> {
        let cell = self.cell(metric.index(), arena)?;
        match metric.kind {
            MetricKind::Count => {
                cell.fetch_add(delta.as_u64(), Relaxed);
            }
            MetricKind::Max => {
                cell.fetch_max(delta.as_u64(), Relaxed);
            }
            MetricKind::Real => {
                let add = delta.as_f64();
                // There is no atomic float add; retry until no one raced us.
                let _ = cell.fetch_update(Relaxed, Relaxed, |bits| {
                    Some((f64::from_bits(bits) + add).to_bits())
                });
            }
        }
        Ok(())
    }

    pub(crate) fn value(&self, metric: MetricId) -> MetricValue {
        let bits = self.peek(metric.index()).map_or(0, |cell| cell.load(Relaxed));
        MetricValue::from_bits(metric.kind, bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration() {
        let registry = MetricRegistry::new();
        let samples = registry.register("samples", MetricKind::Count).unwrap();
        let seconds = registry.register("seconds", MetricKind::Real).unwrap();
        assert_eq!(0, samples.index());
        assert_eq!(1, seconds.index());
        assert_eq!(samples, registry.register("samples", MetricKind::Count).unwrap());
        assert!(registry.register("samples", MetricKind::Max).is_err());
        assert_eq!(Some(seconds), registry.lookup("seconds"));
        assert_eq!(2, registry.len());
        assert!(registry.is_registered(seconds));

        let foreign = MetricId {
            index: 5,
            ..samples
        };
        assert!(!registry.is_registered(foreign));
    }

    #[test]
    fn ids_from_another_registry_are_not_registered() {
        let registry = MetricRegistry::new();
        let samples = registry.register("samples", MetricKind::Count).unwrap();
        registry.register("seconds", MetricKind::Real).unwrap();

        let other = MetricRegistry::new();
        let bytes = other.register("bytes", MetricKind::Count).unwrap();
        let joules = other.register("joules", MetricKind::Real).unwrap();
        assert_eq!(samples.index(), bytes.index());
        assert_ne!(samples, bytes);
        assert!(!registry.is_registered(bytes));
        assert!(!registry.is_registered(joules));
        assert!(other.is_registered(joules));
    }

    #[test]
    fn registry_is_bounded() {
        let registry = MetricRegistry::new();
        for i in 0..MAX_METRICS {
            registry.register(&format!("m{i}"), MetricKind::Count).unwrap();
        }
        assert!(registry.register("one-too-many", MetricKind::Count).is_err());
    }

    #[test]
    fn combiners() {
        let arena = SharedArena::with_capacity(1 << 16).unwrap();
        let registry = MetricRegistry::new();
        let count = registry.register("count", MetricKind::Count).unwrap();
        let real = registry.register("real", MetricKind::Real).unwrap();
        let max = registry.register("max", MetricKind::Max).unwrap();
        let slots = MetricSlots::new();

        assert_eq!(MetricValue::Count(0), slots.value(count));
        for v in [3u64, 9, 4] {
            slots.accumulate(count, v.into(), &arena).unwrap();
            slots.accumulate(max, v.into(), &arena).unwrap();
        }
        slots.accumulate(real, 0.25.into(), &arena).unwrap();
        slots.accumulate(real, 1.5.into(), &arena).unwrap();

        assert_eq!(MetricValue::Count(16), slots.value(count));
        assert_eq!(MetricValue::Max(9), slots.value(max));
        assert_eq!(MetricValue::Real(1.75), slots.value(real));
    }

    #[test]
    fn far_metric_allocates_intermediate_chunks() {
        let arena = SharedArena::with_capacity(1 << 16).unwrap();
        let registry = MetricRegistry::new();
        let ids: Vec<_> = (0..20)
            .map(|i| registry.register(&format!("m{i}"), MetricKind::Count).unwrap())
            .collect();
        let slots = MetricSlots::new();
        slots.accumulate(ids[19], 7u64.into(), &arena).unwrap();
        assert_eq!(MetricValue::Count(7), slots.value(ids[19]));
        assert_eq!(MetricValue::Count(0), slots.value(ids[3]));
        assert!(slots.peek(16).is_some());
        assert!(slots.peek(24).is_none());
    }

    #[test]
    fn concurrent_counts_are_not_lost() {
        let arena = SharedArena::with_capacity(1 << 16).unwrap();
        let registry = MetricRegistry::new();
        let ids: Vec<_> = (0..12)
            .map(|i| registry.register(&format!("m{i}"), MetricKind::Count).unwrap())
            .collect();
        let slots = MetricSlots::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        for id in &ids {
                            slots.accumulate(*id, 1u64.into(), &arena).unwrap();
                        }
                    }
                });
            }
        });
        for id in &ids {
            assert_eq!(MetricValue::Count(4000), slots.value(*id));
        }
    }
}
