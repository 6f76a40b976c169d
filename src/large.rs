//! The large-block path: allocations bigger than a heritage's
//! `max_block` go straight to the OS instead of through the slab machine.
//!
//! Each mapping is prefixed with its own total length so `large_free`
//! can recover exactly what to pass back to
//! [`crate::os::PlatformHooks::unmap_large`] from the pointer alone,
//! mirroring how `malloc` implementations that fall back to `mmap` for
//! big requests keep a tiny header just ahead of the pointer they hand
//! out.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::os::PlatformHooks;
use crate::util::align_up;

/// Alignment guaranteed to every large allocation, matching the minimum
/// alignment the slab path already guarantees.
const LARGE_ALIGN: usize = crate::config::MIN_ALIGN;

#[repr(C)]
struct LargeHeader {
    mapping_len: usize,
}

fn header_span() -> usize {
    align_up(size_of::<LargeHeader>(), LARGE_ALIGN)
}

/// Maps a region big enough for `len` usable bytes plus the header, and
/// returns a pointer to the usable region.
pub fn large_alloc<H: PlatformHooks>(hooks: &H, len: usize) -> Option<NonNull<u8>> {
    let span = header_span();
    let mapping_len = span.checked_add(len)?;
    let base = hooks.map_large(mapping_len)?;
    unsafe {
        (base.as_ptr() as *mut LargeHeader).write(LargeHeader { mapping_len });
    }
    let usable = unsafe { base.as_ptr().add(span) };
    NonNull::new(usable)
}

/// Unmaps a region previously returned by [`large_alloc`].
///
/// # Safety
/// `ptr` must be a pointer previously returned by `large_alloc` on this
/// same `hooks`, not already freed, and with no outstanding references.
pub unsafe fn large_free<H: PlatformHooks>(hooks: &H, ptr: NonNull<u8>) {
    let span = header_span();
    let base = ptr.as_ptr().sub(span);
    let header = &*(base as *const LargeHeader);
    let mapping_len = header.mapping_len;
    hooks.unmap_large(NonNull::new_unchecked(base), mapping_len);
}

/// The number of usable bytes at `ptr`, as requested in the `len` passed
/// to the [`large_alloc`] call that produced it. Used by `realloc` to
/// decide whether a large-to-large resize can be satisfied in place.
///
/// # Safety
/// Same requirements as [`large_free`].
pub unsafe fn usable_len(ptr: NonNull<u8>) -> usize {
    let span = header_span();
    let base = ptr.as_ptr().sub(span);
    let header = &*(base as *const LargeHeader);
    header.mapping_len - span
}

/// True if `ptr` could have come from [`large_alloc`] rather than the
/// slab heap — i.e. it falls outside the arena's managed range. Used by
/// the facade to route `free`/`realloc` without a type tag.
pub fn looks_large<H: PlatformHooks>(arena: &crate::slab::SlabArena<H>, ptr: NonNull<u8>) -> bool {
    !arena.is_in_heap(ptr)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::os::SystemHooks;

    #[test]
    fn roundtrip_preserves_contents() {
        let hooks = SystemHooks;
        let ptr = large_alloc(&hooks, 64 * 1024).unwrap();
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0x42, 64 * 1024);
            let slice = core::slice::from_raw_parts(ptr.as_ptr(), 64 * 1024);
            assert!(slice.iter().all(|&b| b == 0x42));
            large_free(&hooks, ptr);
        }
    }

    #[test]
    fn header_is_ahead_of_usable_pointer() {
        let hooks = SystemHooks;
        let ptr = large_alloc(&hooks, 4096).unwrap();
        let span = header_span();
        let base = unsafe { ptr.as_ptr().sub(span) };
        let header = unsafe { &*(base as *const LargeHeader) };
        assert_eq!(header.mapping_len, span + 4096);
        unsafe { large_free(&hooks, ptr) };
    }
}
