//! The OS-level page-mapping primitive and thread-identity hooks the
//! allocator core treats as external collaborators: reserving and
//! committing address space, and per-thread storage of the calling
//! thread's identity. This module defines the trait boundary
//! ([`PlatformHooks`]) and, under the `std` feature, a concrete
//! `libc`-backed implementation, so the hot paths never care how memory
//! shows up, only that it does.

use core::num::NonZeroUsize;
use core::ptr::NonNull;

/// Everything the allocator core needs from its host environment.
///
/// Implementations must return memory that is zero-initialized, readable,
/// and writable, and (for `reserve_heap`) naturally aligned to
/// `slab_size`.
pub trait PlatformHooks: Send + Sync {
    /// Reserve a `slab_size`-aligned virtual address range big enough for
    /// `max_slabs` slabs, without necessarily committing physical memory
    /// for all of it up front. Returns `None` if the reservation itself
    /// fails (distinct from ordinary allocation exhaustion, which shows
    /// up later as `commit_batch` returning `None`).
    fn reserve_heap(&self, max_slabs: usize, slab_size: usize) -> Option<NonNull<u8>>;

    /// Make the `batch` slabs starting at `base + slab_index * slab_size`
    /// readable and writable. The memory must read as zero on first
    /// touch. Returns `None` on OS exhaustion.
    ///
    /// # Safety
    /// `base` must be a pointer previously returned by `reserve_heap` on
    /// `self`, and `[slab_index, slab_index + batch)` must lie within the
    /// `max_slabs` passed to that call.
    unsafe fn commit_batch(
        &self,
        base: NonNull<u8>,
        slab_index: usize,
        batch: usize,
        slab_size: usize,
    ) -> Option<()>;

    /// Map a page-aligned region of at least `len` bytes for the
    /// large-block path. Independent of the slab heap.
    fn map_large(&self, len: usize) -> Option<NonNull<u8>>;

    /// Unmap a region returned by `map_large`.
    ///
    /// # Safety
    /// `ptr`/`len` must be exactly the values returned by / passed to the
    /// corresponding `map_large` call, and no outstanding references to
    /// the region may exist.
    unsafe fn unmap_large(&self, ptr: NonNull<u8>, len: usize);

    /// A stable, non-zero identity for the calling thread. Two calls from
    /// the same thread must return the same value; two live threads must
    /// never observe the same value.
    fn current_thread_id(&self) -> NonZeroUsize;
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use core::sync::atomic::{AtomicUsize, Ordering};
        use std::cell::Cell;

        /// Assigns each thread a small dense id the first time it's
        /// observed, instead of hashing `std::thread::Thread::id()`
        /// (which isn't guaranteed dense or even `Copy`-stable across
        /// platforms). Dense ids keep the thread-local heritage caches
        /// cheap to index.
        static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

        std::thread_local! {
            static THIS_THREAD_ID: Cell<usize> = Cell::new(0);
        }

        fn thread_id() -> NonZeroUsize {
            THIS_THREAD_ID.with(|cell| {
                let cur = cell.get();
                if cur != 0 {
                    return NonZeroUsize::new(cur).unwrap();
                }
                let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
                cell.set(id);
                NonZeroUsize::new(id).unwrap()
            })
        }

        /// The default, `libc`-backed [`PlatformHooks`] used when the
        /// `std` feature is enabled. Reserves the whole slab heap as one
        /// `PROT_NONE` range up front and commits it page range by page
        /// range via `mprotect`, so every slab the arena ever hands out
        /// shares one fixed `heap_base` for the life of the process.
        pub struct SystemHooks;

        impl PlatformHooks for SystemHooks {
            fn reserve_heap(&self, max_slabs: usize, slab_size: usize) -> Option<NonNull<u8>> {
                let len = max_slabs.checked_mul(slab_size)?;
                unsafe {
                    let ptr = libc::mmap(
                        core::ptr::null_mut(),
                        len,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    );
                    if ptr == libc::MAP_FAILED {
                        return None;
                    }
                    // Anonymous mmap with no alignment hint is only
                    // page-aligned; round up within the reservation so
                    // the returned base is slab-aligned. Over-reserving
                    // by one slab_size guarantees a fit (see `new` in
                    // `slab.rs`, which accounts for this by reserving
                    // `max_slabs + 1` slabs worth of space).
                    let addr = ptr as usize;
                    let aligned = crate::util::align_up(addr, slab_size);
                    NonNull::new(aligned as *mut u8)
                }
            }

            unsafe fn commit_batch(
                &self,
                base: NonNull<u8>,
                slab_index: usize,
                batch: usize,
                slab_size: usize,
            ) -> Option<()> {
                let offset = slab_index.checked_mul(slab_size)?;
                let len = batch.checked_mul(slab_size)?;
                let addr = base.as_ptr().add(offset);
                let rc = libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_WRITE);
                if rc != 0 {
                    return None;
                }
                Some(())
            }

            fn map_large(&self, len: usize) -> Option<NonNull<u8>> {
                unsafe {
                    let ptr = libc::mmap(
                        core::ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    );
                    if ptr == libc::MAP_FAILED {
                        None
                    } else {
                        NonNull::new(ptr as *mut u8)
                    }
                }
            }

            unsafe fn unmap_large(&self, ptr: NonNull<u8>, len: usize) {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
            }

            fn current_thread_id(&self) -> NonZeroUsize {
                thread_id()
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_commit_roundtrip() {
        let hooks = SystemHooks;
        let slab_size = 4096;
        let max_slabs = 16;
        let base = hooks.reserve_heap(max_slabs + 1, slab_size).unwrap();
        assert!(crate::util::is_aligned(base.as_ptr() as usize, slab_size));
        unsafe {
            hooks.commit_batch(base, 0, 4, slab_size).unwrap();
            let slice = core::slice::from_raw_parts(base.as_ptr(), slab_size * 4);
            assert!(slice.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn thread_ids_are_unique_and_stable() {
        let a = thread_id();
        let b = thread_id();
        assert_eq!(a, b);
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(a, other);
    }
}
