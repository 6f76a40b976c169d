//! A lockfree, slab-based allocator with a type-stable reference
//! protocol.
//!
//! Memory is carved out of fixed-size *slabs* drawn from one reserved
//! address range. Each slab is bound to a *heritage* — a block size plus
//! a caching policy — for as long as some thread owns it or some linref
//! keeps its type pinned; slabs move between a global clean pool, a
//! heritage's dirty pool, and exactly one owning thread's private cache
//! as allocation pressure and thread lifetimes come and go. See the
//! [`stack`], [`slab`], [`heritage`], [`lifecycle`], and [`engine`]
//! modules for the mechanics, and [`facade`] for the `malloc`-compatible
//! surface built on top of them.
//!
//! `no_std` by default; enable the `std` feature (on by default at the
//! crate level, off when depended on with `default-features = false`)
//! for the `libc`-backed [`os::SystemHooks`], the automatic thread-exit
//! reclaim, and the global [`facade`] functions. Without it, an embedder
//! supplies its own [`os::PlatformHooks`] and drives a [`Nalloc`]
//! instance directly.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc as core_alloc;

pub mod config;
pub mod debug_magic;
pub mod engine;
pub mod error;
pub mod heritage;
pub mod large;
pub mod lifecycle;
pub mod linref;
pub mod os;
pub mod slab;
pub mod stack;
pub mod util;

#[cfg(feature = "std")]
pub mod facade;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use config::Config;
use engine::ThreadHeritageState;
use heritage::{Heritage, PolyHeritages};
use os::PlatformHooks;
use slab::SlabArena;

/// A point-in-time snapshot of [`Nalloc::stats`]: not part of the core
/// allocation contract (spec.md's Non-goals explicitly exclude
/// profiling), but required to make spec.md §8's "bytes-used counter
/// has difference zero at the end of any closed account scope"
/// property checkable at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Sum of `heritage.block_size()` and large-allocation usable
    /// lengths for every block currently outstanding (allocated but not
    /// yet freed) through this instance, across every thread.
    pub bytes_in_use: usize,
    /// Number of slabs this instance has ever committed from the OS
    /// (never decreases: the default configuration never unmaps a
    /// slab, per spec.md §3).
    pub slabs_committed: usize,
}

/// One allocator instance: an arena of slabs, the fixed polymorphic
/// heritage table, and every live thread's per-heritage cache.
///
/// Generic over [`PlatformHooks`] so the same allocation logic runs
/// under the `std`-backed [`os::SystemHooks`] or a host-supplied
/// implementation (e.g. a kernel or WASM embedding with its own page
/// source).
pub struct Nalloc<H: PlatformHooks> {
    arena: SlabArena<H>,
    poly: &'static PolyHeritages,
    poly_len: usize,
    next_heritage_id: AtomicUsize,
    caches: thread_local::ThreadLocal<core::cell::RefCell<core_alloc::vec::Vec<Option<ThreadHeritageState>>>>,
    live_bytes: AtomicUsize,
}

impl<H: PlatformHooks> Nalloc<H> {
    pub fn new(hooks: H, config: Config) -> Nalloc<H> {
        let poly: &'static PolyHeritages =
            core_alloc::boxed::Box::leak(core_alloc::boxed::Box::new(PolyHeritages::new(&config)));
        let poly_len = poly.iter().count();
        Nalloc {
            arena: SlabArena::new(hooks, config),
            poly,
            poly_len,
            next_heritage_id: AtomicUsize::new(0),
            caches: thread_local::ThreadLocal::new(),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// A snapshot of this instance's outstanding-bytes and committed-slab
    /// counters. See [`Stats`].
    pub fn stats(&self) -> Stats {
        Stats {
            bytes_in_use: self.live_bytes.load(Ordering::Acquire),
            slabs_committed: self.arena.slabs_committed(),
        }
    }

    /// Accrues `bytes` to [`Stats::bytes_in_use`]. Exposed so
    /// [`facade`]'s large-block path (which bypasses `Nalloc::allocate`)
    /// can keep the same counter accurate; the slab path calls this
    /// itself from [`Nalloc::allocate`]/[`Nalloc::free`].
    pub fn track_alloc(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Inverse of [`Nalloc::track_alloc`].
    pub fn track_free(&self, bytes: usize) {
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn config(&self) -> &Config {
        self.arena.config()
    }

    pub fn hooks(&self) -> &H {
        self.arena.hooks()
    }

    /// The smallest-fitting polymorphic heritage for `size`, or `None` if
    /// it exceeds every registered size class (the caller should fall
    /// back to [`large`]).
    pub fn heritage_for(&self, size: usize) -> Option<&'static Heritage> {
        self.poly.for_size(size)
    }

    /// Like [`Nalloc::heritage_for`], but restricted to heritages whose
    /// block size is a power of two — the only ones that can guarantee
    /// an alignment stricter than [`config::MIN_ALIGN`]. Backs
    /// [`facade::nalloc_posix_memalign`]-style bounded-alignment
    /// requests.
    pub fn heritage_for_pow2(&self, size: usize) -> Option<&'static Heritage> {
        self.poly.for_size_pow2(size)
    }

    /// Allocates `size` bytes through the slab path. Callers above
    /// `config().max_block` should use [`large::large_alloc`] instead;
    /// [`facade::nalloc_malloc`] makes that choice for you.
    pub fn allocate(&self, heritage: &'static Heritage, thread_id: usize) -> Option<NonNull<u8>> {
        let state = self.cache_for(heritage);
        let block = engine::allocate(state, heritage, &self.arena, thread_id)?;
        self.track_alloc(heritage.block_size());
        Some(block)
    }

    /// Frees a pointer previously returned by [`Nalloc::allocate`] for
    /// the same heritage.
    pub fn free(&self, heritage: &'static Heritage, thread_id: usize, block: NonNull<u8>) {
        let state = self.cache_for(heritage);
        engine::free(state, heritage, &self.arena, thread_id, block);
        self.track_free(heritage.block_size());
    }

    pub fn arena(&self) -> &SlabArena<H> {
        &self.arena
    }

    /// Looks up the heritage currently bound to the slab backing `ptr`,
    /// if any — used by the facade to route a bare pointer to `free`
    /// without the caller repeating its size.
    pub fn heritage_of(&self, ptr: NonNull<u8>) -> Option<&'static Heritage> {
        let meta = self.arena.meta_of(ptr)?;
        // SAFETY: `heritage` is only ever set to point at one of this
        // instance's own `'static`-leaked `poly` heritages.
        meta.heritage().map(|p| unsafe { &*(p.as_ptr() as *const Heritage) })
    }

    fn cache_for(&self, heritage: &Heritage) -> &ThreadHeritageState {
        let dense_id = heritage.dense_id(&self.next_heritage_id);
        debug_assert!(dense_id < self.poly_len, "heritage not registered with this instance");
        let cell = self
            .caches
            .get_or(|| core::cell::RefCell::new((0..self.poly_len).map(|_| None).collect()));
        {
            let mut vec = cell.borrow_mut();
            if vec[dense_id].is_none() {
                vec[dense_id] = Some(ThreadHeritageState::new());
            }
        }
        // SAFETY: `cell`'s `Vec` is allocated once above at a fixed
        // length (`poly_len`) and never grows or shrinks afterward, and
        // an occupied slot is never replaced — only ever filled in once,
        // above. So the address of `vec[dense_id]`'s payload is stable
        // for the rest of `self`'s life, even though we don't hold the
        // `Ref` guard across this function's return.
        let vec_ptr = cell.as_ptr();
        unsafe { (*vec_ptr)[dense_id].as_ref().unwrap() }
    }

    /// Releases every slab the calling thread's caches still own back to
    /// their pools. Called automatically on thread exit by the `std`
    /// global facade; embedders managing their own threads without that
    /// facade should call this just before a thread that has touched
    /// this `Nalloc` exits.
    pub fn reclaim_current_thread(&self) {
        if let Some(cell) = self.caches.get() {
            let mut vec = cell.borrow_mut();
            for slot in vec.iter_mut() {
                if let Some(state) = slot.take() {
                    engine::reclaim_all(&self.arena, state);
                }
            }
        }
    }
}

// SAFETY: every field is `Send + Sync` in its own right (`SlabArena`,
// the leaked `&'static PolyHeritages`, the atomic counter, and
// `ThreadLocal`, which is `Sync` for any `T: Send` payload — and
// `ThreadHeritageState` is `Send` by its own unsafe impl).
unsafe impl<H: PlatformHooks> Sync for Nalloc<H> {}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::os::SystemHooks;

    fn new_alloc(max_slabs: usize) -> Nalloc<SystemHooks> {
        Nalloc::new(SystemHooks, Config::new(4096, 1024, max_slabs))
    }

    #[test]
    fn stats_tracks_paired_alloc_and_free_to_zero() {
        let alloc = new_alloc(32);
        let h = alloc.heritage_for(64).unwrap();
        let before = alloc.stats();

        let a = alloc.allocate(h, 1).unwrap();
        let b = alloc.allocate(h, 1).unwrap();
        let mid = alloc.stats();
        assert_eq!(mid.bytes_in_use, before.bytes_in_use + 2 * h.block_size());

        alloc.free(h, 1, a);
        alloc.free(h, 1, b);
        let after = alloc.stats();
        assert_eq!(after.bytes_in_use, before.bytes_in_use);
        assert!(after.slabs_committed >= before.slabs_committed);
    }

    #[test]
    fn stats_slabs_committed_grows_monotonically_with_demand() {
        let alloc = new_alloc(64);
        let h = alloc.heritage_for(64).unwrap();
        let start = alloc.stats().slabs_committed;

        // Exhaust the first slab's full capacity to force a second batch.
        let max_blocks = h.max_blocks(alloc.config().slab_size);
        let mut blocks = core_alloc::vec::Vec::new();
        for _ in 0..(max_blocks + 1) {
            blocks.push(alloc.allocate(h, 1).unwrap());
        }
        assert!(alloc.stats().slabs_committed > start);

        for b in blocks {
            alloc.free(h, 1, b);
        }
    }
}
