//! The `malloc`-compatible surface: a process-wide [`Nalloc`] instance
//! behind a set of free functions matching libc's allocation family,
//! plus a [`GlobalAlloc`] impl so this crate can be installed as
//! `#[global_allocator]`. Only compiled with the `std` feature, since it
//! needs [`os::SystemHooks`] and thread-exit reclaim.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use crate::config::Config;
use crate::large;
use crate::os::SystemHooks;
use crate::Nalloc;

lazy_static::lazy_static! {
    static ref GLOBAL: Nalloc<SystemHooks> = Nalloc::new(SystemHooks, Config::default());
}

/// The process-wide allocator instance backing every function below.
pub fn global() -> &'static Nalloc<SystemHooks> {
    &GLOBAL
}

std::thread_local! {
    static EXIT_GUARD: ThreadExitGuard = ThreadExitGuard;
}

/// Exists purely so its `Drop` fires on thread exit, at which point it
/// hands every slab the exiting thread still owned back to
/// [`global`]'s pools. Armed on every facade entry point; the `with`
/// call is a cheap no-op on every call after the first for a given
/// thread.
struct ThreadExitGuard;

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        global().reclaim_current_thread();
    }
}

fn arm_exit_guard() {
    EXIT_GUARD.with(|_| {});
}

fn this_thread() -> usize {
    global().hooks().current_thread_id().get()
}

/// `malloc(size)`. Returns null on exhaustion, matching libc (no panic,
/// no `Result`).
pub fn nalloc_malloc(size: usize) -> *mut u8 {
    arm_exit_guard();
    if size == 0 {
        return ptr::null_mut();
    }
    let g = global();
    let out = if size > g.config().max_block {
        let out = large::large_alloc(g.hooks(), size);
        if let Some(p) = out {
            g.track_alloc(unsafe { large::usable_len(p) });
        }
        out
    } else {
        g.heritage_for(size).and_then(|h| g.allocate(h, this_thread()))
    };
    out.map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// `free(ptr)`. A null `ptr` is a no-op, matching libc.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by
/// [`nalloc_malloc`]/[`nalloc_calloc`]/[`nalloc_realloc`] and not yet
/// freed.
pub unsafe fn nalloc_free(ptr: *mut u8) {
    let block = match NonNull::new(ptr) {
        Some(b) => b,
        None => return,
    };
    arm_exit_guard();
    let g = global();
    if large::looks_large(g.arena(), block) {
        g.track_free(large::usable_len(block));
        large::large_free(g.hooks(), block);
    } else if let Some(heritage) = g.heritage_of(block) {
        g.free(heritage, this_thread(), block);
    }
}

/// `calloc(nmemb, size)`: zero-initialized allocation of `nmemb * size`
/// bytes. Returns null (without allocating) on multiplication overflow.
pub fn nalloc_calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let out = nalloc_malloc(total);
    if !out.is_null() {
        unsafe { ptr::write_bytes(out, 0, total) };
    }
    out
}

/// `realloc(ptr, new_size)`. A null `ptr` behaves as `malloc`; a
/// `new_size` of zero behaves as `free` and returns null.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this module's
/// allocation functions and not yet freed.
pub unsafe fn nalloc_realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    let block = match NonNull::new(ptr) {
        Some(b) => b,
        None => return nalloc_malloc(new_size),
    };
    if new_size == 0 {
        nalloc_free(ptr);
        return ptr::null_mut();
    }

    let g = global();
    let old_size = if large::looks_large(g.arena(), block) {
        large::usable_len(block)
    } else {
        g.heritage_of(block).map_or(0, |h| h.block_size())
    };
    if new_size <= old_size {
        return ptr;
    }

    let new_block = nalloc_malloc(new_size);
    if new_block.is_null() {
        return ptr::null_mut();
    }
    ptr::copy_nonoverlapping(ptr, new_block, old_size.min(new_size));
    nalloc_free(ptr);
    new_block
}

/// `posix_memalign(memptr, align, size)`: like [`nalloc_malloc`] but
/// requires `align` to be a supported power of two. Returns 0 on
/// success (writing the allocated pointer through `memptr`) or a
/// nonzero libc-style error code. Alignments above [`config::MIN_ALIGN`]
/// are satisfied by routing to a power-of-two-sized slab heritage at
/// least `align` bytes wide; an `align` (or `size`) that would need a
/// block bigger than `config().max_block` isn't supported and fails
/// with `ENOMEM` rather than falling back to the large path, which only
/// guarantees `MIN_ALIGN`.
///
/// # Safety
/// `memptr` must be a valid, aligned pointer to a `*mut u8`.
pub unsafe fn nalloc_posix_memalign(memptr: *mut *mut u8, align: usize, size: usize) -> i32 {
    const EINVAL: i32 = 22;
    const ENOMEM: i32 = 12;

    if !crate::util::is_power_of_two(align) || align % core::mem::size_of::<usize>() != 0 {
        return EINVAL;
    }

    arm_exit_guard();
    if align <= crate::config::MIN_ALIGN {
        // Every slab-carved block is already aligned to `MIN_ALIGN`.
        let out = nalloc_malloc(size.max(1));
        if out.is_null() {
            return ENOMEM;
        }
        *memptr = out;
        return 0;
    }

    let g = global();
    let needed = size.max(1).max(align);
    if needed > g.config().max_block {
        // spec: alignments that would require a size bigger than the
        // largest slab-path block aren't supported.
        return ENOMEM;
    }

    // A power-of-two block size divides the (power-of-two) slab size
    // it's carved from, so any block from such a heritage inherits the
    // slab's own alignment and therefore `align`'s too, since `align` is
    // itself a power of two no bigger than the chosen block size.
    match g.heritage_for_pow2(needed) {
        Some(h) => match g.allocate(h, this_thread()) {
            Some(p) => {
                debug_assert_eq!(p.as_ptr() as usize % align, 0);
                *memptr = p.as_ptr();
                0
            }
            None => ENOMEM,
        },
        None => ENOMEM,
    }
}

/// `smalloc(size)`: like [`nalloc_malloc`], for callers that already
/// know they'll pair the allocation with [`nalloc_sfree`].
pub fn nalloc_smalloc(size: usize) -> *mut u8 {
    nalloc_malloc(size)
}

/// `sfree(ptr, size)`: frees a block allocated by [`nalloc_smalloc`]
/// with the same `size`, skipping the metadata lookup [`nalloc_free`]
/// needs to recover it.
///
/// # Safety
/// `ptr` must have come from `nalloc_smalloc(size)` (the same `size`)
/// and not yet be freed.
pub unsafe fn nalloc_sfree(ptr: *mut u8, size: usize) {
    let block = match NonNull::new(ptr) {
        Some(b) => b,
        None => return,
    };
    arm_exit_guard();
    let g = global();
    if size > g.config().max_block {
        g.track_free(large::usable_len(block));
        large::large_free(g.hooks(), block);
    } else if let Some(heritage) = g.heritage_for(size) {
        g.free(heritage, this_thread(), block);
    }
}

/// Installs this crate as `#[global_allocator]`:
/// ```ignore
/// #[global_allocator]
/// static ALLOC: nalloc::facade::System = nalloc::facade::System;
/// ```
pub struct System;

unsafe impl GlobalAlloc for System {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= crate::config::MIN_ALIGN {
            nalloc_malloc(layout.size())
        } else {
            let mut out = ptr::null_mut();
            if nalloc_posix_memalign(&mut out, layout.align(), layout.size()) == 0 {
                out
            } else {
                ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        nalloc_free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= crate::config::MIN_ALIGN {
            nalloc_realloc(ptr, new_size)
        } else {
            let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
            let new_ptr = self.alloc(new_layout);
            if !new_ptr.is_null() {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
            new_ptr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_roundtrip() {
        let p = nalloc_malloc(128);
        assert!(!p.is_null());
        unsafe {
            ptr::write_bytes(p, 0xAB, 128);
            nalloc_free(p);
        }
    }

    #[test]
    fn calloc_zeroes_memory() {
        let p = nalloc_calloc(16, 8);
        assert!(!p.is_null());
        unsafe {
            let slice = core::slice::from_raw_parts(p, 128);
            assert!(slice.iter().all(|&b| b == 0));
            nalloc_free(p);
        }
    }

    #[test]
    fn realloc_grows_and_preserves_prefix() {
        unsafe {
            let p = nalloc_malloc(32);
            ptr::write_bytes(p, 0x7, 32);
            let grown = nalloc_realloc(p, 512);
            assert!(!grown.is_null());
            let slice = core::slice::from_raw_parts(grown, 32);
            assert!(slice.iter().all(|&b| b == 0x7));
            nalloc_free(grown);
        }
    }

    #[test]
    fn realloc_to_zero_frees() {
        unsafe {
            let p = nalloc_malloc(64);
            let out = nalloc_realloc(p, 0);
            assert!(out.is_null());
        }
    }

    #[test]
    fn large_allocation_roundtrips() {
        unsafe {
            let p = nalloc_malloc(1 << 20);
            assert!(!p.is_null());
            ptr::write_bytes(p, 0x11, 1 << 20);
            nalloc_free(p);
        }
    }

    #[test]
    fn posix_memalign_honors_alignment() {
        unsafe {
            let mut out = ptr::null_mut();
            let rc = nalloc_posix_memalign(&mut out, 64, 256);
            assert_eq!(rc, 0);
            assert_eq!(out as usize % 64, 0);
            nalloc_free(out);
        }
    }

    #[test]
    fn smalloc_sfree_roundtrip() {
        unsafe {
            let p = nalloc_smalloc(48);
            assert!(!p.is_null());
            nalloc_sfree(p, 48);
        }
    }
}
