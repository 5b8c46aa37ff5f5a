// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-thread scratch array holding the backtrace of the sample in
//! flight, innermost frame first.

use crate::error::UnwindError;
use crate::frame::Frame;
use cctprof_alloc::vec::ArenaVec;
use cctprof_alloc::SharedArena;

/// Position of the next write. It is an offset rather than an address, so it
/// stays meaningful after the backing store has been reallocated.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteCursor {
    pub position: usize,
    /// The append that produced this cursor had to grow the buffer.
    pub grew: bool,
}

pub struct FrameBuffer {
    frames: ArenaVec<Frame, SharedArena>,
    growths: usize,
}

impl FrameBuffer {
    /// Reserves room for `capacity` frames in `arena`.
    pub fn with_capacity_in(capacity: usize, arena: SharedArena) -> Result<Self, UnwindError> {
        Ok(Self {
            frames: ArenaVec::try_with_capacity_in(capacity, arena)?,
            growths: 0,
        })
    }

    /// Empties the buffer, keeping its capacity.
    #[inline]
    pub fn reset(&mut self) {
        self.frames.clear();
    }

    /// Stores `frame` after the frames already captured. A full buffer
    /// doubles first; if that fails the frame is not stored and the sample
    /// has to be dropped.
    pub fn append(&mut self, frame: Frame) -> Result<WriteCursor, UnwindError> {
        let capacity = self.frames.capacity();
        self.frames.try_push(frame)?;
        let grew = self.frames.capacity() != capacity;
        if grew {
            self.growths += 1;
        }
        Ok(WriteCursor {
            position: self.frames.len(),
            grew,
        })
    }

    pub fn cursor(&self) -> WriteCursor {
        WriteCursor {
            position: self.frames.len(),
            grew: false,
        }
    }

    /// Captured frames, innermost first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// How many times the buffer has grown over its lifetime.
    pub fn growth_count(&self) -> usize {
        self.growths
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("growths", &self.growths)
            .finish()
    }
}
