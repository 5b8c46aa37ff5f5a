// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{AllocError, Allocator};
use core::alloc::Layout;
use core::ptr;

/// Maps whole pages of anonymous memory for each allocation. The arena uses
/// it once, at startup, to reserve the region it bump-allocates from; it is
/// never called from a signal handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualAllocator;

/// Returns the system page size, which is always a power of two.
pub fn page_size() -> Result<usize, AllocError> {
    // SAFETY: calling sysconf with a valid name.
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    // On some platforms this is unsigned, on others signed.
    #[allow(unused_comparisons)]
    if result <= 0 {
        return Err(AllocError);
    }
    let size = result as usize;
    if size.is_power_of_two() {
        Ok(size)
    } else {
        Err(AllocError)
    }
}

/// Rounds `num` up to a multiple of `pow2`, never returning zero.
#[inline]
pub(crate) fn round_up_pow2(num: usize, pow2: usize) -> Option<usize> {
    debug_assert!(pow2.is_power_of_two());
    let bytes = num.max(pow2);
    // With a single bit set, `pow2 - 1` masks the remainder.
    match bytes & (pow2 - 1) {
        0 => Some(bytes),
        remainder => bytes.checked_add(pow2 - remainder),
    }
}

fn mapping_size(layout: Layout) -> Result<usize, AllocError> {
    if layout.size() == 0 {
        return Err(AllocError);
    }
    let page_size = page_size()?;
    if layout.align() > page_size {
        return Err(AllocError);
    }
    round_up_pow2(layout.size(), page_size).ok_or(AllocError)
}

unsafe impl Allocator for VirtualAllocator {
    fn allocate(&self, layout: Layout) -> Result<ptr::NonNull<[u8]>, AllocError> {
        self.allocate_zeroed(layout)
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<ptr::NonNull<[u8]>, AllocError> {
        let size = mapping_size(layout)?;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        // SAFETY: a fresh anonymous mapping with no fixed address.
        let result = unsafe { libc::mmap(ptr::null_mut(), size, prot, flags, -1, 0) };
        if result == libc::MAP_FAILED {
            return Err(AllocError);
        }
        // Anonymous mappings are zero-filled, which allocate_zeroed relies on.
        let addr = ptr::NonNull::new(result.cast::<u8>()).ok_or(AllocError)?;
        Ok(ptr::NonNull::slice_from_raw_parts(addr, size))
    }

    unsafe fn deallocate(&self, ptr: ptr::NonNull<u8>, layout: Layout) {
        // The layout was accepted by allocate, so this cannot fail unless the
        // caller broke the Allocator contract.
        if let Ok(size) = mapping_size(layout) {
            // SAFETY: ptr/size describe a mapping made by allocate_zeroed.
            _ = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
        }
    }
}
