// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Access to the words of a thread's stack.
//!
//! Every read the unwinder makes goes through [StackMemory], which refuses
//! addresses outside the thread's stack region. Corrupt register state can
//! therefore produce a wrong frame, but never a fault inside the sample.

use crate::recipe::WORD;

/// The half-open address range `[low, high)` of a thread's stack. The stack
/// grows down, so callers' frames live at higher addresses than callees'.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StackBounds {
    pub low: usize,
    pub high: usize,
}

impl StackBounds {
    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Can a whole word be read at `addr`?
    #[inline]
    pub fn contains_word(&self, addr: usize) -> bool {
        addr >= self.low && addr.checked_add(WORD).is_some_and(|end| end <= self.high)
    }

    /// Is `addr` a plausible stack pointer (the bottom `high` included)?
    #[inline]
    pub fn contains_sp(&self, addr: usize) -> bool {
        addr >= self.low && addr <= self.high
    }
}

pub trait StackMemory {
    fn bounds(&self) -> StackBounds;

    /// Reads the aligned word at `addr`, or `None` if it is misaligned or
    /// not inside [StackMemory::bounds].
    fn read_word(&self, addr: usize) -> Option<usize>;
}

/// The real stack of the current thread.
#[derive(Copy, Clone, Debug)]
pub struct LiveStack {
    bounds: StackBounds,
}

impl LiveStack {
    /// # Safety
    /// Every word inside `bounds` must be mapped and readable for as long as
    /// this value is used, which holds for the stack of the thread the
    /// sample runs on.
    pub const unsafe fn new(bounds: StackBounds) -> Self {
        Self { bounds }
    }

    /// Queries the calling thread's stack region from the thread library.
    #[cfg(target_os = "linux")]
    pub fn current_thread_bounds() -> Option<StackBounds> {
        use std::mem::MaybeUninit;
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        // SAFETY: pthread_getattr_np initializes attr on success, and we
        // destroy it on every path after that.
        unsafe {
            if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
                return None;
            }
            let mut addr = std::ptr::null_mut();
            let mut size = 0;
            let rc = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return None;
            }
            let low = addr as usize;
            Some(StackBounds::new(low, low.checked_add(size)?))
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn current_thread_bounds() -> Option<StackBounds> {
        None
    }
}

impl StackMemory for LiveStack {
    fn bounds(&self) -> StackBounds {
        self.bounds
    }

    #[inline]
    fn read_word(&self, addr: usize) -> Option<usize> {
        if addr % WORD != 0 || !self.bounds.contains_word(addr) {
            return None;
        }
        // SAFETY: aligned and within the readable region promised in `new`.
        Some(unsafe { std::ptr::read_volatile(addr as *const usize) })
    }
}

/// A stack image held in ordinary memory, laid out at a chosen address.
/// Used to replay captured stacks and to build unwinding fixtures.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyntheticStack {
    low: usize,
    words: Vec<usize>,
}

impl SyntheticStack {
    /// A zero-filled stack of `len` words starting at `low`.
    pub fn new(low: usize, len: usize) -> Self {
        debug_assert_eq!(0, low % WORD);
        Self {
            low,
            words: vec![0; len],
        }
    }

    pub fn from_words(low: usize, words: Vec<usize>) -> Self {
        debug_assert_eq!(0, low % WORD);
        Self { low, words }
    }

    /// Address of the word with index `idx`.
    pub fn addr(&self, idx: usize) -> usize {
        self.low + idx * WORD
    }

    /// Stores `value` at `addr`; returns false if `addr` is not a slot.
    pub fn write(&mut self, addr: usize, value: usize) -> bool {
        match self.index_of(addr) {
            Some(idx) => {
                self.words[idx] = value;
                true
            }
            None => false,
        }
    }

    pub fn words(&self) -> &[usize] {
        &self.words
    }

    fn index_of(&self, addr: usize) -> Option<usize> {
        if addr < self.low || (addr - self.low) % WORD != 0 {
            return None;
        }
        let idx = (addr - self.low) / WORD;
        (idx < self.words.len()).then_some(idx)
    }
}

impl StackMemory for SyntheticStack {
    fn bounds(&self) -> StackBounds {
        StackBounds::new(self.low, self.low + self.words.len() * WORD)
    }

    fn read_word(&self, addr: usize) -> Option<usize> {
        self.index_of(addr).map(|idx| self.words[idx])
    }
}
