// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ops::Range;

/// The address ranges of the outermost legitimate frames: the process entry
/// point and any thread-entry trampolines. Unwinding stops successfully once
/// the program counter lands in one of them.
///
/// Built before sampling starts and never modified afterwards.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Fence {
    ranges: Vec<Range<usize>>,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range: Range<usize>) -> Self {
        self.add(range);
        self
    }

    /// Adds a half-open range. Empty ranges are ignored.
    pub fn add(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let at = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(at, range);
    }

    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        // Fences are a handful of ranges, possibly overlapping; scan the
        // ones starting at or below pc.
        let end = self.ranges.partition_point(|r| r.start <= pc);
        self.ranges[..end].iter().any(|r| pc < r.end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }
}
