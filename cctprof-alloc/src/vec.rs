// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Allocator, TryReserveError};
use core::alloc::{Layout, LayoutError};
use core::{cmp, fmt, mem, ops, ptr, slice};

/// A growable array for [Copy] types, in the spirit of [alloc::vec::Vec],
/// with the differences that matter inside a signal handler:
///  1. It never panics and never aborts on allocation failure. Every method
///     that may need memory returns a [TryReserveError] instead.
///  2. Growth is geometric: when full, the capacity doubles (or jumps to the
///     requested size if that is larger). Existing elements keep their
///     indices; only the backing storage moves. Hold indices, not pointers,
///     across a push.
///  3. Capacity never shrinks. [ArenaVec::clear] is O(1) and keeps the
///     storage for reuse.
///  4. Only [Copy] types are stored, so no destructors have to be run when
///     elements are overwritten or the storage is released.
pub struct ArenaVec<T: Copy, A: Allocator> {
    ptr: ptr::NonNull<T>,
    len: usize,
    capacity: usize,
    alloc: A,
}

impl<T: Copy + fmt::Debug, A: Allocator> fmt::Debug for ArenaVec<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

unsafe impl<T: Send + Copy, A: Allocator + Send> Send for ArenaVec<T, A> {}

impl<T: Copy, A: Allocator> ArenaVec<T, A> {
    const IS_SIZED: bool = mem::size_of::<T>() != 0;

    /// Creates an empty vec which does not allocate until the first push.
    #[inline]
    pub const fn new_in(alloc: A) -> Self {
        // Zero-sized types are not supported.
        const { assert!(Self::IS_SIZED) };
        Self {
            ptr: ptr::NonNull::dangling(),
            len: 0,
            capacity: 0,
            alloc,
        }
    }

    /// Creates a vec with room for exactly `capacity` elements.
    pub fn try_with_capacity_in(capacity: usize, alloc: A) -> Result<Self, TryReserveError> {
        let mut vec = Self::new_in(alloc);
        if capacity > 0 {
            vec.try_grow_to(capacity)?;
        }
        Ok(vec)
    }

    /// Appends `value`, doubling the capacity first if the vec is full.
    ///
    /// # Errors
    /// If the capacity overflows or the allocator refuses, the vec is left
    /// untouched and an error is returned.
    #[inline]
    pub fn try_push(&mut self, value: T) -> Result<(), TryReserveError> {
        self.try_reserve(1)?;
        // SAFETY: reserved above.
        unsafe { self.push_within_capacity(value) };
        Ok(())
    }

    /// Appends `value` without checking the capacity.
    ///
    /// # Safety
    /// There must be spare capacity for one more element.
    #[inline]
    pub unsafe fn push_within_capacity(&mut self, value: T) {
        debug_assert!(self.len < self.capacity);
        // SAFETY: the caller guarantees len < capacity.
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
    }

    /// Appends `value` only if it fits in the current capacity.
    ///
    /// # Errors
    /// If the vec is full, the value is handed back.
    #[inline]
    pub fn try_push_within_capacity(&mut self, value: T) -> Result<(), T> {
        if self.needs_to_grow(1) {
            Err(value)
        } else {
            // SAFETY: checked above.
            unsafe { self.push_within_capacity(value) };
            Ok(())
        }
    }

    /// Makes sure at least `additional` more elements fit.
    #[inline]
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        if self.needs_to_grow(additional) {
            let required = self
                .len
                .checked_add(additional)
                .ok_or(TryReserveError::CapacityOverflow)?;
            // Doubling cannot overflow: capacity * size_of::<T>() <= isize::MAX.
            let doubled = self.capacity * 2;
            self.try_grow_to(cmp::max(doubled, required))?;
        }
        Ok(())
    }

    /// Appends all of `values`, growing once if needed. On error nothing is
    /// appended.
    pub fn try_extend_from_slice(&mut self, values: &[T]) -> Result<(), TryReserveError> {
        self.try_reserve(values.len())?;
        // SAFETY: reserved above; the new elements land in spare capacity,
        // which cannot alias `values`.
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.ptr.as_ptr().add(self.len), values.len())
        };
        self.len += values.len();
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forgets all elements. The capacity is kept.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Keeps the first `len` elements; does nothing if `len >= self.len()`.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.len = cmp::min(self.len, len);
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    #[inline(always)]
    fn needs_to_grow(&self, additional: usize) -> bool {
        additional > self.capacity.wrapping_sub(self.len)
    }

    fn current_memory(&self) -> Option<(ptr::NonNull<u8>, Layout)> {
        if self.capacity > 0 {
            // SAFETY: this layout was already allocated successfully.
            let layout = unsafe { Layout::array::<T>(self.capacity).unwrap_unchecked() };
            Some((self.ptr.cast(), layout))
        } else {
            None
        }
    }

    #[cold]
    #[inline(never)]
    fn try_grow_to(&mut self, capacity: usize) -> Result<(), TryReserveError> {
        debug_assert!(capacity > self.capacity);
        let new_layout = Layout::array::<T>(capacity);
        let memory = finish_grow(new_layout, self.current_memory(), &self.alloc)?;
        self.ptr = memory.cast::<T>();
        // Exactly what was asked for, so growth stays a predictable doubling
        // even when the allocator hands out a little more.
        self.capacity = capacity;
        Ok(())
    }
}

#[inline(always)]
fn alloc_guard(alloc_size: usize) -> Result<(), TryReserveError> {
    if usize::BITS < 64 && alloc_size > isize::MAX as usize {
        Err(TryReserveError::CapacityOverflow)
    } else {
        Ok(())
    }
}

fn finish_grow<A: Allocator>(
    new_layout: Result<Layout, LayoutError>,
    current_memory: Option<(ptr::NonNull<u8>, Layout)>,
    alloc: &A,
) -> Result<ptr::NonNull<[u8]>, TryReserveError> {
    let new_layout = new_layout.map_err(|_| TryReserveError::CapacityOverflow)?;
    alloc_guard(new_layout.size())?;
    let memory = match current_memory {
        // SAFETY: old_layout describes the live block, and new_layout is
        // larger with the same alignment.
        Some((ptr, old_layout)) => unsafe { alloc.grow(ptr, old_layout, new_layout) },
        None => alloc.allocate(new_layout),
    };
    memory.map_err(|_| TryReserveError::AllocError)
}

impl<T: Copy, A: Allocator> Drop for ArenaVec<T, A> {
    fn drop(&mut self) {
        if let Some((ptr, layout)) = self.current_memory() {
            // SAFETY: the block was allocated by this allocator with this layout.
            unsafe { self.alloc.deallocate(ptr, layout) };
        }
    }
}

impl<T: Copy, A: Allocator> ops::Deref for ArenaVec<T, A> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the first len elements are initialized; for capacity 0 the
        // dangling pointer is valid for a zero-length slice.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy, A: Allocator> ops::DerefMut for ArenaVec<T, A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: as for Deref, and we hold the only reference.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedArena;
    use allocator_api2::alloc::Global;

    #[test]
    fn test_push_within_capacity() {
        let mut vec = ArenaVec::try_with_capacity_in(4, Global).unwrap();
        for i in 0..4 {
            vec.try_push_within_capacity(i).unwrap();
        }
        assert_eq!(Err(4), vec.try_push_within_capacity(4));
        assert_eq!(&[0, 1, 2, 3], &vec[..]);
    }

    #[test]
    fn test_doubling() {
        let mut vec = ArenaVec::try_with_capacity_in(3, Global).unwrap();
        let mut seen = vec![vec.capacity()];
        for i in 0..25usize {
            vec.try_push(i).unwrap();
            if *seen.last().unwrap() != vec.capacity() {
                seen.push(vec.capacity());
            }
        }
        assert_eq!(vec![3, 6, 12, 24, 48], seen);
        assert!(vec.iter().copied().eq(0..25));
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut vec = ArenaVec::new_in(Global);
        vec.try_extend_from_slice(&[1u8, 2, 3]).unwrap();
        let capacity = vec.capacity();
        vec.clear();
        vec.clear();
        assert!(vec.is_empty());
        assert_eq!(capacity, vec.capacity());
        vec.try_push(9).unwrap();
        assert_eq!(&[9], &vec[..]);
    }

    #[test]
    fn test_growth_in_arena_preserves_contents() {
        let arena = SharedArena::with_capacity(1 << 16).unwrap();
        let mut vec = ArenaVec::try_with_capacity_in(2, arena.clone()).unwrap();
        // Interleave another allocation so growth has to move the block.
        let _other = arena.alloc_value(0u64).unwrap();
        for i in 0..100u64 {
            vec.try_push(i * 3).unwrap();
        }
        assert!(vec.iter().copied().eq((0..100).map(|i| i * 3)));
    }

    #[test]
    fn test_arena_exhaustion_is_an_error() {
        let arena = SharedArena::with_capacity(1).unwrap();
        let too_many = arena.reserved_bytes() / mem::size_of::<u64>() + 1;
        let mut vec = ArenaVec::<u64, _>::new_in(arena.clone());
        assert_eq!(Err(TryReserveError::AllocError), vec.try_reserve(too_many));
        assert!(vec.is_empty());
        assert_eq!(0, vec.capacity());
        assert!(arena.is_exhausted());
    }

    #[test]
    fn test_capacity_overflow() {
        let mut vec = ArenaVec::<u64, _>::new_in(Global);
        assert_eq!(
            Err(TryReserveError::CapacityOverflow),
            vec.try_reserve(usize::MAX)
        );
    }
}
