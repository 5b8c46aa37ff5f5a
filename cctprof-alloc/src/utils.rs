// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Rounds `offset` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(offset: usize, align: usize) -> Option<usize> {
    match offset.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// Exercises a single allocation: checks alignment and size, writes and
/// reads back a byte, then hands the memory back.
#[cfg(test)]
pub(crate) fn fuzzer_inner_loop<A: crate::Allocator>(
    allocator: &A,
    size: usize,
    align_bits: u32,
    idx: usize,
    val: u8,
    max_size: usize,
) {
    use core::alloc::Layout;
    let idx = if size > 0 { idx % size } else { 0 };
    let Some(align) = 1usize.checked_shl(align_bits) else {
        return;
    };
    let Ok(layout) = Layout::from_size_align(size, align) else {
        return;
    };
    if layout.pad_to_align().size() > max_size {
        return;
    }

    if let Ok(mut ptr) = allocator.allocate(layout) {
        assert_eq!(0, ptr.cast::<u8>().as_ptr().align_offset(align));
        let obj = unsafe { ptr.as_mut() };
        assert!(obj.len() >= size);
        if size > 0 {
            obj[idx] = val;
            assert_eq!(obj[idx], val);
        }
        unsafe { allocator.deallocate(ptr.cast(), layout) };
    }
}
