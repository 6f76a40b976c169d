//! Slab metadata records and the arena that owns them.
//!
//! A slab's metadata is *out-of-band*: the slab's own bytes are entirely
//! available for blocks, and the per-slab bookkeeping lives in a
//! separate, fixed-size array indexed by `(slab_address - heap_base) /
//! slab_size`. This is what lets `slab_of(ptr)` be constant-time and
//! allocation-free, at the cost of reserving the array up front: it's a
//! `Box<[SlabMeta]>` sized from [`crate::config::Config::max_slabs`] at
//! startup rather than a fixed-size array, since Rust has no portable
//! way to reserve an address range at a fixed link-time address.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use portable_atomic::AtomicU128;

use crate::config::Config;
use crate::heritage::Heritage;
use crate::os::PlatformHooks;
use crate::stack::{Link, LockFreeStack, SingleThreadStack};
use crate::util::{align_up, log2_pow2};

/// `(type, refcount)`, updated only by double-word CAS.
/// `type_id` is the address of the slab's current
/// [`crate::heritage::TypeDescriptor`], or 0 if the slab has never been
/// typed (clean).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TypeRefs {
    pub type_id: usize,
    pub refs: u32,
}

impl TypeRefs {
    pub const NONE: TypeRefs = TypeRefs { type_id: 0, refs: 0 };

    const fn pack(self) -> u128 {
        ((self.type_id as u128) << 64) | self.refs as u128
    }

    const fn unpack(bits: u128) -> TypeRefs {
        TypeRefs {
            type_id: (bits >> 64) as usize,
            refs: bits as u32,
        }
    }
}

/// Atomic double-word `(type, refcount)` cell.
pub struct AtomicTypeRefs(AtomicU128);

impl AtomicTypeRefs {
    pub const fn new(v: TypeRefs) -> AtomicTypeRefs {
        AtomicTypeRefs(AtomicU128::new(v.pack()))
    }

    pub fn load(&self) -> TypeRefs {
        TypeRefs::unpack(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, v: TypeRefs) {
        self.0.store(v.pack(), Ordering::Release);
    }

    /// Returns `Ok(())` if `(type, refs)` changed from `old` to `new` in
    /// one atomic step, `Err(observed)` otherwise.
    pub fn compare_exchange(&self, old: TypeRefs, new: TypeRefs) -> Result<(), TypeRefs> {
        self.0
            .compare_exchange(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TypeRefs::unpack)
    }
}

/// Per-slab state. Lives in the arena's fixed metadata array, never
/// moves, and is addressed purely by index.
///
/// `#[repr(C)]` with `pool_link` first so a node pointer popped off a
/// pool (`clean`/`dirty_pool`) can be reinterpreted straight back into a
/// `&SlabMeta` without chasing an index (see `lifecycle::link_to_meta`).
#[repr(C)]
pub struct SlabMeta {
    /// Membership in exactly one of: the global clean pool, a heritage's
    /// dirty pool, or a heritage's hot-slab batch-push list. Never more
    /// than one at a time.
    pub(crate) pool_link: Link,
    /// Count of blocks at the slab's high end never handed out this
    /// incarnation. Mutated only by the current owner.
    contig_cursor: AtomicUsize,
    /// Owner-only free list. Safety: accessed through
    /// `SlabMeta::private_free_mut`, which documents the single-owner
    /// discipline that makes the `UnsafeCell`-free non-atomic access
    /// sound.
    private_free: core::cell::UnsafeCell<SingleThreadStack>,
    /// Lockfree free list pushed to by foreign (non-owner) threads.
    wayward_free: LockFreeStack,
    /// 0 = unowned; otherwise the owning thread's id.
    owner: AtomicUsize,
    /// The heritage this slab is currently bound to, or null. Only read
    /// by the owner and by the thread performing a release; not a
    /// contended fast-path field.
    heritage: AtomicPtr<Heritage>,
    /// `(type, refcount)`.
    type_refs: AtomicTypeRefs,
    /// Block size for the current incarnation; 0 if clean. Cached here
    /// (rather than dereferenced through `heritage`) so foreign frees can
    /// classify "slab just went entirely wayward" without chasing a
    /// pointer that a concurrent acquire/retype could be replacing.
    block_size: AtomicUsize,
    /// Nonzero while this slab is disowned-but-not-yet-drained: the
    /// owner exited (or otherwise released) while blocks it handed out
    /// were still outstanding, so the slab can't go to a pool yet
    /// (§4.5's "thread exits while foreign frees are still in flight").
    /// Holds the `wayward_free` size that exactly accounts for every
    /// outstanding block; the foreign free that observes the stack
    /// reach that size performs the deferred pool transition. Zero means
    /// no deferral is in progress.
    pending_drain: AtomicUsize,
}

unsafe impl Sync for SlabMeta {}

impl SlabMeta {
    const fn new() -> SlabMeta {
        SlabMeta {
            pool_link: Link::new(),
            contig_cursor: AtomicUsize::new(0),
            private_free: core::cell::UnsafeCell::new(SingleThreadStack::new()),
            wayward_free: LockFreeStack::new(),
            owner: AtomicUsize::new(0),
            heritage: AtomicPtr::new(core::ptr::null_mut()),
            type_refs: AtomicTypeRefs::new(TypeRefs::NONE),
            block_size: AtomicUsize::new(0),
            pending_drain: AtomicUsize::new(0),
        }
    }

    pub fn type_refs(&self) -> &AtomicTypeRefs {
        &self.type_refs
    }

    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, id: usize) {
        self.owner.store(id, Ordering::Release);
    }

    pub fn is_owned_by(&self, id: usize) -> bool {
        id != 0 && self.owner() == id
    }

    pub fn heritage(&self) -> Option<NonNull<Heritage>> {
        NonNull::new(self.heritage.load(Ordering::Acquire))
    }

    pub fn set_heritage(&self, h: Option<NonNull<Heritage>>) {
        self.heritage
            .store(h.map_or(core::ptr::null_mut(), |p| p.as_ptr()), Ordering::Release);
    }

    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn set_block_size(&self, size: usize) {
        self.block_size.store(size, Ordering::Release);
    }

    pub fn contig_cursor(&self) -> usize {
        self.contig_cursor.load(Ordering::Acquire)
    }

    pub fn set_contig_cursor(&self, v: usize) {
        self.contig_cursor.store(v, Ordering::Release);
    }

    /// Peels one block off the contiguous tail, if any remain.
    /// Owner-only.
    pub fn peel_contig(&self) -> Option<usize> {
        let cur = self.contig_cursor.load(Ordering::Relaxed);
        if cur == 0 {
            return None;
        }
        self.contig_cursor.store(cur - 1, Ordering::Relaxed);
        Some(cur - 1)
    }

    /// Reverses a peel: a freed block that happens to sit exactly at the
    /// contig tail is folded back in rather than pushed onto
    /// `private_free`.
    pub fn unpeel_contig(&self) {
        let cur = self.contig_cursor.load(Ordering::Relaxed);
        self.contig_cursor.store(cur + 1, Ordering::Relaxed);
    }

    pub fn wayward_free(&self) -> &LockFreeStack {
        &self.wayward_free
    }

    /// # Safety
    /// Caller must be the slab's current owner (or hold equivalent
    /// exclusive access during acquire/retype, before publishing
    /// ownership).
    pub unsafe fn private_free(&self) -> &mut SingleThreadStack {
        &mut *self.private_free.get()
    }

    /// Number of blocks immediately available without going through
    /// `wayward_free`: private list plus untouched contiguous tail.
    ///
    /// # Safety
    /// Same as [`SlabMeta::private_free`].
    pub unsafe fn local_free_count(&self) -> usize {
        self.private_free().size() + self.contig_cursor()
    }

    /// Wayward-free size that would mean every block this slab ever
    /// handed out is now accounted for, or 0 if no disown is pending
    /// drain. Set by [`crate::lifecycle::release_or_defer`], cleared by
    /// the foreign free that completes the drain.
    pub fn pending_drain(&self) -> usize {
        self.pending_drain.load(Ordering::Acquire)
    }

    pub fn set_pending_drain(&self, v: usize) {
        self.pending_drain.store(v, Ordering::Release);
    }

    pub fn max_blocks(&self, slab_size: usize) -> usize {
        let bs = self.block_size();
        if bs == 0 {
            0
        } else {
            slab_size / bs
        }
    }
}

/// Owns the slab metadata array, the reserved virtual address range, and
/// the global clean-slab pool.
pub struct SlabArena<H: PlatformHooks> {
    hooks: H,
    config: Config,
    heap_base: NonNull<u8>,
    metas: alloc_box::Box<[SlabMeta]>,
    next_uncommitted: AtomicUsize,
    clean: LockFreeStack,
}

// Small shim so this module doesn't need to declare `extern crate alloc`
// at the crate root just for one `Box<[T]>`; kept in its own module to
// make the no_std/std split explicit at a glance.
mod alloc_box {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            pub use std::boxed::Box;
            pub use std::vec::Vec;
        } else {
            extern crate alloc;
            pub use self::alloc::boxed::Box;
            pub use self::alloc::vec::Vec;
        }
    }
}

unsafe impl<H: PlatformHooks> Sync for SlabArena<H> {}
unsafe impl<H: PlatformHooks> Send for SlabArena<H> {}

impl<H: PlatformHooks> SlabArena<H> {
    pub fn new(hooks: H, config: Config) -> SlabArena<H> {
        config.validate();
        // Reserve one extra slab's worth of address space: an anonymous
        // mapping is only page-aligned, so the usable, slab-aligned base
        // inside it may start up to `slab_size - page_size` bytes in.
        let heap_base = hooks
            .reserve_heap(config.max_slabs + 1, config.slab_size)
            .expect("failed to reserve nalloc heap address range");
        debug_assert!(crate::util::is_aligned(heap_base.as_ptr() as usize, config.slab_size));

        let metas: alloc_box::Box<[SlabMeta]> = (0..config.max_slabs)
            .map(|_| SlabMeta::new())
            .collect::<alloc_box::Vec<_>>()
            .into_boxed_slice();

        SlabArena {
            hooks,
            config,
            heap_base,
            metas,
            next_uncommitted: AtomicUsize::new(0),
            clean: LockFreeStack::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn clean_pool(&self) -> &LockFreeStack {
        &self.clean
    }

    pub fn slab_size(&self) -> usize {
        self.config.slab_size
    }

    /// Number of slabs ever successfully committed from the OS so far.
    /// Monotonically nondecreasing: the default configuration never
    /// unmaps a slab once committed (spec.md §3).
    pub fn slabs_committed(&self) -> usize {
        self.next_uncommitted.load(Ordering::Acquire)
    }

    fn meta_ptr_to_index(&self, meta: &SlabMeta) -> usize {
        let base = self.metas.as_ptr() as usize;
        (meta as *const SlabMeta as usize - base) / core::mem::size_of::<SlabMeta>()
    }

    pub fn meta(&self, index: usize) -> &SlabMeta {
        &self.metas[index]
    }

    pub fn slab_base(&self, index: usize) -> NonNull<u8> {
        let addr = self.heap_base.as_ptr() as usize + index * self.config.slab_size;
        NonNull::new(addr as *mut u8).unwrap()
    }

    /// `slab_of(b)`: masks a block pointer down to slab alignment and
    /// looks up the metadata record by index. Returns `None` if `ptr`
    /// falls outside the managed heap range.
    pub fn meta_of(&self, ptr: NonNull<u8>) -> Option<&SlabMeta> {
        let addr = ptr.as_ptr() as usize;
        let base = self.heap_base.as_ptr() as usize;
        let extent = self.config.max_slabs * self.config.slab_size;
        if addr < base || addr >= base + extent {
            return None;
        }
        let index = (addr - base) >> log2_pow2(self.config.slab_size);
        Some(&self.metas[index])
    }

    /// Returns the metadata record's own index, recovered from its
    /// address within the fixed array (used to locate a slab's backing
    /// bytes from a `&SlabMeta` reference alone).
    pub fn index_of(&self, meta: &SlabMeta) -> usize {
        self.meta_ptr_to_index(meta)
    }

    pub fn is_in_heap(&self, ptr: NonNull<u8>) -> bool {
        self.meta_of(ptr).is_some()
    }

    /// Requests `batch` fresh, never-before-used slabs from the OS
    /// mapping primitive, pushes all but the first onto the global clean
    /// pool, and returns the first. Returns `None` on OS exhaustion or
    /// heap-capacity exhaustion.
    pub fn new_batch(&self, batch: usize) -> Option<&SlabMeta> {
        let start = self.next_uncommitted.fetch_add(batch, Ordering::AcqRel);
        if start + batch > self.config.max_slabs {
            // Give back what we reserved but can't use; a later caller
            // with a smaller batch might still fit.
            self.next_uncommitted.fetch_sub(batch, Ordering::AcqRel);
            return None;
        }
        let committed = unsafe {
            self.hooks
                .commit_batch(self.heap_base, start, batch, self.config.slab_size)
        };
        if committed.is_none() {
            // OS exhaustion: give back the index range so it doesn't sit
            // forever unusable (spec.md §8: "no state mutation leaks").
            self.next_uncommitted.fetch_sub(batch, Ordering::AcqRel);
            return None;
        }
        let first = &self.metas[start];
        for i in (start + 1)..(start + batch) {
            let meta = &self.metas[i];
            let link = NonNull::from(&meta.pool_link);
            unsafe { self.clean.push(link) };
        }
        Some(first)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::os::SystemHooks;

    fn arena() -> SlabArena<SystemHooks> {
        let config = Config::new(4096, 1024, 64);
        SlabArena::new(SystemHooks, config)
    }

    #[test]
    fn out_of_range_pointer_is_rejected() {
        let a = arena();
        let bogus = NonNull::new(align_up(1, 4096) as *mut u8).unwrap();
        assert!(a.meta_of(bogus).is_none());
    }

    #[test]
    fn new_batch_seeds_clean_pool() {
        let a = arena();
        let first = a.new_batch(4).unwrap();
        assert_eq!(a.clean_pool().size(), 3);
        assert_eq!(a.index_of(first), 0);

        let base = a.slab_base(0);
        assert!(a.is_in_heap(base));
        let meta = a.meta_of(base).unwrap();
        assert!(core::ptr::eq(meta, first));
    }

    #[test]
    fn slab_index_roundtrips_through_addresses() {
        let a = arena();
        a.new_batch(8).unwrap();
        for i in 0..8 {
            let base = a.slab_base(i);
            let meta = a.meta_of(base).unwrap();
            assert_eq!(a.index_of(meta), i);
            let mid = NonNull::new((base.as_ptr() as usize + 37) as *mut u8).unwrap();
            assert!(core::ptr::eq(a.meta_of(mid).unwrap(), meta));
        }
    }
}
