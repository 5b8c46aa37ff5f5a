// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use crate::utils::align_up;
use crate::{AllocError, Allocator, VirtualAllocator};
use alloc::sync::Arc;
use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

/// [SharedArena] is a lock-free bump allocator over one region of pages that
/// is reserved when the arena is created. Deallocating does nothing; the
/// whole region is unmapped when the last handle is dropped. Destructors of
/// objects placed in the arena are never run.
///
/// Allocation is a compare-and-swap on the bump offset, so it is safe to call
/// from a signal handler and from many threads at once. It never asks the
/// operating system for more memory: once the region is used up, allocations
/// fail and [SharedArena::failed_allocations] starts counting.
///
/// Cloning is cheap and yields another handle to the same region.
#[derive(Clone)]
pub struct SharedArena {
    region: Arc<Region>,
}

struct Region {
    base: NonNull<u8>,
    layout: Layout,
    used: AtomicUsize,
    failures: AtomicUsize,
}

// SAFETY: the region's memory is only handed out through the atomic bump
// offset, so no two allocations overlap, and the bookkeeping is atomic.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: passing back the original mapping with its layout.
        unsafe { VirtualAllocator.deallocate(self.base, self.layout) };
    }
}

impl SharedArena {
    /// Reserves at least `bytes` of zeroed memory, rounded up to whole pages.
    pub fn with_capacity(bytes: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(bytes, 64).map_err(|_| AllocError)?;
        let mapping = VirtualAllocator.allocate_zeroed(layout)?;
        // Use the over-allocation, it is already mapped.
        let layout = Layout::from_size_align(mapping.len(), layout.align()).map_err(|_| AllocError)?;
        Ok(Self {
            region: Arc::new(Region {
                base: mapping.cast(),
                layout,
                used: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }),
        })
    }

    /// Number of bytes handed out so far, including alignment padding.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.region.used.load(Ordering::Relaxed)
    }

    /// Size of the reserved region.
    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.region.layout.size()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.reserved_bytes() - self.used_bytes()
    }

    /// How many allocations were refused because the region was used up.
    pub fn failed_allocations(&self) -> usize {
        self.region.failures.load(Ordering::Relaxed)
    }

    /// True once any allocation has been refused for lack of space.
    pub fn is_exhausted(&self) -> bool {
        self.failed_allocations() > 0
    }

    /// Whether `layout` would fit right now. Another thread may take the
    /// space before the caller allocates.
    pub fn has_capacity_for(&self, layout: Layout) -> bool {
        self.end_offset(self.used_bytes(), layout).is_some()
    }

    /// Do two handles refer to the same region?
    pub fn same_region(&self, other: &SharedArena) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Moves `value` into the arena. Its destructor will never run.
    pub fn alloc_value<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
        let ptr = self.allocate(Layout::new::<T>())?.cast::<T>();
        // SAFETY: freshly allocated, correctly sized and aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    fn base_addr(&self) -> usize {
        self.region.base.as_ptr() as usize
    }

    /// Start and end offsets for `layout` placed after `used` bytes.
    fn end_offset(&self, used: usize, layout: Layout) -> Option<(usize, usize)> {
        let base = self.base_addr();
        // Align the absolute address; the region itself is only 64-aligned.
        let start = align_up(base.checked_add(used)?, layout.align())? - base;
        let end = start.checked_add(layout.size())?;
        (end <= self.reserved_bytes()).then_some((start, end))
    }

    #[cold]
    fn refuse(&self) -> AllocError {
        self.region.failures.fetch_add(1, Ordering::Relaxed);
        AllocError
    }
}

unsafe impl Allocator for SharedArena {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }
        let used = &self.region.used;
        let mut current = used.load(Ordering::Relaxed);
        loop {
            let Some((start, end)) = self.end_offset(current, layout) else {
                return Err(self.refuse());
            };
            match used.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    // SAFETY: start..end lies within the region.
                    let thin = unsafe { self.region.base.as_ptr().add(start) };
                    let wide = ptr::slice_from_raw_parts_mut(thin, layout.size());
                    // SAFETY: derived from the non-null region base.
                    return Ok(unsafe { NonNull::new_unchecked(wide) });
                }
                Err(observed) => current = observed,
            }
        }
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // Memory is reclaimed all at once when the region is dropped.
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        // If this block is the most recent allocation, extend it in place.
        let offset = ptr.as_ptr() as usize - self.base_addr();
        let old_end = offset + old_layout.size();
        let new_end = offset.checked_add(new_layout.size()).ok_or(AllocError)?;
        if ptr.as_ptr().align_offset(new_layout.align()) == 0
            && new_end <= self.reserved_bytes()
            && self
                .region
                .used
                .compare_exchange(old_end, new_end, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()));
        }

        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: both blocks are valid for old_layout.size() bytes and the
        // new block was just carved out, so they cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.cast::<u8>().as_ptr(),
                old_layout.size(),
            )
        };
        Ok(new_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::*;
    use bolero::TypeGenerator;

    #[test]
    fn fuzz() {
        const MAX_SIZE: usize = 1 << 20;

        let align_bits = 0..=12;
        let size = 0..=MAX_SIZE;
        let idx = usize::produce();
        let val = u8::produce();
        let allocs = Vec::<(usize, u32, usize, u8)>::produce()
            .with()
            .values((size, align_bits, idx, val));
        bolero::check!()
            .with_generator(allocs)
            .for_each(|allocs| {
                let arena = SharedArena::with_capacity(MAX_SIZE).unwrap();
                for (size, align_bits, idx, val) in allocs {
                    fuzzer_inner_loop(&arena, *size, *align_bits, *idx, *val, MAX_SIZE)
                }
            })
    }

    #[test]
    fn test_basics() -> Result<(), AllocError> {
        let arena = SharedArena::with_capacity(64)?;
        // Rounded up to at least a page.
        assert!(arena.reserved_bytes() >= 64);
        let layout = Layout::new::<[u8; 8]>();
        let first = arena.allocate(layout)?;
        let second = arena.allocate(layout)?;
        assert_eq!(8, first.len());
        let distance = unsafe {
            (second.as_ptr() as *mut u8).offset_from(first.as_ptr() as *mut u8)
        };
        assert_eq!(8, distance);
        assert_eq!(16, arena.used_bytes());
        Ok(())
    }

    #[test]
    fn test_exhaustion_is_counted() -> Result<(), AllocError> {
        let arena = SharedArena::with_capacity(1)?;
        let remaining = arena.remaining_capacity();
        let all = Layout::array::<u8>(remaining).unwrap();
        assert!(arena.has_capacity_for(all));
        arena.allocate(all)?;
        assert!(!arena.is_exhausted());
        assert!(!arena.has_capacity_for(Layout::new::<u8>()));
        _ = arena.allocate(Layout::new::<u8>()).unwrap_err();
        _ = arena.allocate(Layout::new::<u64>()).unwrap_err();
        assert_eq!(2, arena.failed_allocations());
        assert!(arena.is_exhausted());
        Ok(())
    }

    #[test]
    fn test_alignment() -> Result<(), AllocError> {
        let arena = SharedArena::with_capacity(4096)?;
        let byte = arena.allocate(Layout::new::<u8>())?;
        let word = arena.allocate(Layout::new::<u64>())?;
        let line = arena.allocate(Layout::from_size_align(8, 64).unwrap())?;
        assert_eq!(0, (byte.as_ptr() as *mut u8).align_offset(1));
        assert_eq!(0, (word.as_ptr() as *mut u8).align_offset(8));
        assert_eq!(0, (line.as_ptr() as *mut u8).align_offset(64));
        Ok(())
    }

    #[test]
    fn test_grow_in_place_and_moved() -> Result<(), AllocError> {
        let arena = SharedArena::with_capacity(4096)?;
        let small = Layout::array::<u64>(4).unwrap();
        let large = Layout::array::<u64>(8).unwrap();

        let first = arena.allocate(small)?;
        unsafe { first.cast::<u64>().as_ptr().write(7) };
        let grown = unsafe { arena.grow(first.cast(), small, large)? };
        // Last allocation: extended without moving.
        assert_eq!(first.cast::<u8>(), grown.cast::<u8>());

        let _blocker = arena.allocate(Layout::new::<u64>())?;
        let moved = unsafe { arena.grow(grown.cast(), large, Layout::array::<u64>(16).unwrap())? };
        assert_ne!(grown.cast::<u8>(), moved.cast::<u8>());
        assert_eq!(7, unsafe { moved.cast::<u64>().as_ptr().read() });
        Ok(())
    }

    #[test]
    fn test_concurrent_allocations_do_not_overlap() {
        let arena = SharedArena::with_capacity(1 << 20).unwrap();
        let layout = Layout::new::<u64>();
        let mut addrs: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let arena = arena.clone();
                    s.spawn(move || {
                        (0..1000)
                            .map(|_| arena.allocate(layout).unwrap().cast::<u8>().as_ptr() as usize)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(4000, addrs.len());
        assert_eq!(4000 * 8, arena.used_bytes());
    }

    #[test]
    fn test_alloc_value() -> Result<(), AllocError> {
        let arena = SharedArena::with_capacity(4096)?;
        let ptr = arena.alloc_value([1u32, 2, 3])?;
        assert_eq!([1, 2, 3], unsafe { ptr.as_ptr().read() });
        assert!(arena.same_region(&arena.clone()));
        Ok(())
    }
}
