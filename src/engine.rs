//! The allocate/free hot path and the per-thread heritage cache that
//! makes it lock-free in the common case.

use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

use crate::debug_magic;
use crate::heritage::Heritage;
use crate::lifecycle;
use crate::os::PlatformHooks;
use crate::slab::{SlabArena, SlabMeta};
use crate::stack::Link;

cfg_if::cfg_if! {
    if #[cfg(feature = "trace-log")] {
        macro_rules! trace_engine { ($($t:tt)*) => { log::trace!($($t)*) }; }
    } else {
        macro_rules! trace_engine { ($($t:tt)*) => {}; }
    }
}

mod alloc_vec {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            pub use std::vec::Vec;
        } else {
            extern crate alloc;
            pub use self::alloc::vec::Vec;
        }
    }
}

/// One thread's working set for one [`Heritage`]: the slab currently
/// being carved from, plus up to `heritage.cap` fully-empty owned slabs
/// kept warm instead of round-tripping through the dirty pool on every
/// alloc/free cycle.
///
/// Not `Sync`: lives behind `thread_local!`/[`ThreadLocal`], touched by
/// exactly one thread.
pub struct ThreadHeritageState {
    active: Cell<Option<NonNull<SlabMeta>>>,
    spares: RefCell<alloc_vec::Vec<NonNull<SlabMeta>>>,
}

impl ThreadHeritageState {
    pub fn new() -> ThreadHeritageState {
        ThreadHeritageState {
            active: Cell::new(None),
            spares: RefCell::new(alloc_vec::Vec::new()),
        }
    }
}

impl Default for ThreadHeritageState {
    fn default() -> ThreadHeritageState {
        ThreadHeritageState::new()
    }
}

// SAFETY: only ever reached through a `ThreadLocal<ThreadHeritageState>`
// (std) or an equivalent single-thread-owned slot (no_std), so no two
// threads ever call through the same instance concurrently. The `Sync`
// bound exists only to satisfy `thread_local::ThreadLocal<T>: T: Send`'s
// transitive requirements; this crate never shares a `&ThreadHeritageState`
// across threads.
unsafe impl Send for ThreadHeritageState {}
unsafe impl Sync for ThreadHeritageState {}

/// `allocate(H)`: the hot path. Tries, in order: the active slab's
/// private free list, its untouched contiguous tail, a drain of blocks
/// foreign threads freed back while we were using it, and finally
/// acquiring a replacement slab.
pub fn allocate<H: PlatformHooks>(
    state: &ThreadHeritageState,
    heritage: &'static Heritage,
    arena: &SlabArena<H>,
    thread_id: usize,
) -> Option<NonNull<u8>> {
    loop {
        let meta = match active_meta(state) {
            Some(meta) => meta,
            None => {
                let meta = next_slab(state, heritage, arena, thread_id)?;
                state.active.set(Some(NonNull::from(meta)));
                meta
            }
        };

        // SAFETY: `meta` is this thread's active slab, so it is owned
        // exclusively by this thread (see `ThreadHeritageState`'s
        // single-owner contract).
        if let Some(link) = unsafe { meta.private_free() }.pop() {
            return Some(block_of_link(link));
        }
        if let Some(index) = meta.peel_contig() {
            let block = unsafe { arena.slab_base(arena.index_of(meta)).as_ptr().add(index * meta.block_size()) };
            let ptr = NonNull::new(block).unwrap();
            unsafe { debug_magic::assert_fresh(ptr.as_ptr(), meta.block_size()) };
            return Some(ptr);
        }

        // Locally exhausted: fold in whatever foreign frees landed on
        // `wayward_free` while we were carving. `pop_all_or_incr` keeps
        // this race-free against a foreign free that arrives in the gap
        // between our emptiness check and a disown: a losing producer
        // sees the bumped generation and retries instead of assuming its
        // push landed on a slab we'd already given up on.
        let (head, count) = meta.wayward_free().pop_all_or_incr(1);
        if count > 0 {
            lifecycle::drain_wayward_chain(head, unsafe { meta.private_free() });
            continue;
        }

        // Truly exhausted: private free list, contig tail, and wayward
        // are all empty, so every block this slab can ever hand out is
        // outstanding right now. It must not go back to a pool: the
        // clean/dirty LIFO would hand this same fully-outstanding slab
        // straight back to the next `acquire` (same type: re-exhausted
        // and released forever, a livelock; different type: retyped and
        // reinitialized over blocks callers still hold live pointers
        // into). Disown it the same way thread exit does instead, and
        // let whichever free eventually returns its last outstanding
        // block (this thread's own later frees included — `is_owned_by`
        // reads `owner` as 0 once disowned, so they take the wayward
        // path too) drive it back through a pool via `finalize_drained`.
        state.active.set(None);
        lifecycle::release_or_defer(arena, meta);
        trace_engine!("nalloc: slab {:p} exhausted, deferring until outstanding blocks return", meta);
    }
}

/// `free(H, b)`: owner frees go back onto the private list (or
/// reverse-peel the contiguous tail); foreign frees go onto the slab's
/// wayward list for its owner to discover later.
pub fn free<H: PlatformHooks>(
    state: &ThreadHeritageState,
    heritage: &'static Heritage,
    arena: &SlabArena<H>,
    thread_id: usize,
    block: NonNull<u8>,
) {
    let meta = arena.meta_of(block).expect("freed pointer outside managed heap");
    unsafe { debug_magic::poison_on_free(block.as_ptr(), meta.block_size()) };

    if meta.is_owned_by(thread_id) {
        if let Some(index) = contig_tail_index(arena, meta, block) {
            debug_assert_eq!(index, meta.contig_cursor());
            meta.unpeel_contig();
        } else {
            // SAFETY: owner-exclusive access, as above.
            unsafe { meta.private_free().push(block.cast::<Link>()) };
        }

        let max_blocks = meta.max_blocks(arena.slab_size());
        let fully_free = unsafe { meta.local_free_count() } == max_blocks && meta.wayward_free().is_empty();
        let is_active = state.active.get() == Some(NonNull::from(meta));
        if fully_free && !is_active {
            reclaim_empty(state, heritage, arena, meta);
        }
    } else {
        // Foreign free: push onto the wayward list under the owner's
        // nose. Safe without knowing who the owner is, or even whether
        // there still is one (see `lifecycle::acquire`'s wayward drain
        // on reacquire for the no-owner case).
        let new_size = unsafe { meta.wayward_free().push(block.cast::<Link>()) };
        trace_engine!("nalloc: foreign free to slab {:p}", meta);

        // If the slab was disowned mid-flight (`lifecycle::release_or_defer`,
        // at thread exit) with blocks still outstanding, this may be the
        // free that returns the last one. `pending_drain` is nonzero only
        // while such a deferral is active.
        let needed = meta.pending_drain();
        if needed != 0 && new_size == needed {
            lifecycle::finalize_drained(arena, meta, new_size);
        }
    }
}

fn active_meta(state: &ThreadHeritageState) -> Option<&SlabMeta> {
    // SAFETY: `active`, when set, always points at a `SlabMeta` living in
    // the arena's metadata array, which never moves or is freed for the
    // process's lifetime.
    state.active.get().map(|p| unsafe { p.as_ref() })
}

fn next_slab<'a, H: PlatformHooks>(
    state: &ThreadHeritageState,
    heritage: &'static Heritage,
    arena: &'a SlabArena<H>,
    thread_id: usize,
) -> Option<&'a SlabMeta> {
    if let Some(meta) = state.spares.borrow_mut().pop() {
        // SAFETY: only ever pushed here from a slab this thread still
        // owns (see `reclaim_empty`); never reaches any shared pool.
        return Some(unsafe { meta.as_ref() });
    }
    lifecycle::acquire(heritage, arena, thread_id)
}

/// Releases every slab a thread's cache still owns — its active slab and
/// any cached spares — back to the arena's clean pool or the relevant
/// heritage's dirty pool. Consumes `state` since there's nothing left
/// for it to track afterward.
pub fn reclaim_all<H: PlatformHooks>(arena: &SlabArena<H>, state: ThreadHeritageState) {
    if let Some(active) = state.active.take() {
        // The active slab may still have blocks outstanding (handed out
        // to code that hasn't freed them yet) — `release_or_defer`
        // leaves it disowned-but-unpooled until they all come back,
        // rather than letting it be retyped out from under a late free.
        // SAFETY: valid for the arena's lifetime; see `active_meta`.
        lifecycle::release_or_defer(arena, unsafe { active.as_ref() });
    }
    for meta in state.spares.into_inner() {
        // Spares are only ever cached fully-free (see `reclaim_empty`),
        // and a fully-free slab can never receive another foreign free
        // (nothing still holds a live pointer into it), so plain
        // `release` is always correct here.
        // SAFETY: same as above; these were always owned, never shared.
        lifecycle::release(arena, unsafe { meta.as_ref() });
    }
}

fn reclaim_empty<H: PlatformHooks>(
    state: &ThreadHeritageState,
    heritage: &Heritage,
    arena: &SlabArena<H>,
    meta: &SlabMeta,
) {
    let mut spares = state.spares.borrow_mut();
    if spares.len() < heritage.cap {
        spares.push(NonNull::from(meta));
        trace_engine!("nalloc: slab {:p} cached as spare ({}/{})", meta, spares.len(), heritage.cap);
    } else {
        drop(spares);
        lifecycle::release(arena, meta);
        trace_engine!("nalloc: slab {:p} disowned, spare cache at cap", meta);
    }
}

fn block_of_link(link: NonNull<Link>) -> NonNull<u8> {
    link.cast()
}

/// Returns `Some(index)` if `block` is exactly the block that sits right
/// above the slab's current contiguous tail, i.e. freeing it can be
/// expressed as `unpeel_contig` (folding the free of the most-recently-
/// carved block back into the untouched tail) instead of a private-list
/// push.
fn contig_tail_index<H: PlatformHooks>(arena: &SlabArena<H>, meta: &SlabMeta, block: NonNull<u8>) -> Option<usize> {
    let base = arena.slab_base(arena.index_of(meta)).as_ptr() as usize;
    let block_size = meta.block_size();
    let offset = block.as_ptr() as usize - base;
    if offset % block_size != 0 {
        return None;
    }
    let index = offset / block_size;
    if index == meta.contig_cursor() {
        Some(index)
    } else {
        None
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::heritage::PolyHeritages;
    use crate::os::SystemHooks;

    fn setup() -> (SlabArena<SystemHooks>, &'static PolyHeritages) {
        let config = Config::new(4096, 256, 64);
        let arena = SlabArena::new(SystemHooks, config);
        let table = alloc_box_leak(PolyHeritages::new(&config));
        (arena, table)
    }

    fn alloc_box_leak(table: PolyHeritages) -> &'static PolyHeritages {
        std::boxed::Box::leak(std::boxed::Box::new(table))
    }

    #[test]
    fn allocate_then_free_reuses_block() {
        let (arena, table) = setup();
        let heritage = table.for_size(64).unwrap();
        let state = ThreadHeritageState::new();
        let a = allocate(&state, heritage, &arena, 1).unwrap();
        free(&state, heritage, &arena, 1, a);
        let b = allocate(&state, heritage, &arena, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_allocations_do_not_alias() {
        let (arena, table) = setup();
        let heritage = table.for_size(64).unwrap();
        let state = ThreadHeritageState::new();
        let a = allocate(&state, heritage, &arena, 1).unwrap();
        let b = allocate(&state, heritage, &arena, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn thread_exit_defers_reclaim_until_outstanding_blocks_return() {
        let (arena, table) = setup();
        let heritage = table.for_size(64).unwrap();
        let owner_state = ThreadHeritageState::new();

        // The dying thread hands out a couple of blocks that outlive it
        // (e.g. published to a long-lived consumer) before exiting.
        let a = allocate(&owner_state, heritage, &arena, 1).unwrap();
        let b = allocate(&owner_state, heritage, &arena, 1).unwrap();
        let meta = arena.meta_of(a).unwrap();

        // The acquire behind that first `allocate` already seeded the
        // arena's clean pool with `alloc_batch - 1` untouched spares;
        // everything below compares against that baseline rather than
        // assuming the pool starts at exactly zero.
        let clean_base = arena.clean_pool().size();
        let dirty_base = heritage.dirty_pool.size();

        // Thread exit: the active slab isn't fully free (two blocks are
        // still out), so it must be deferred rather than handed to a
        // pool where a concurrent acquire could retype it.
        reclaim_all(&arena, owner_state);
        assert_eq!(meta.owner(), 0);
        assert!(meta.pending_drain() > 0);
        assert_eq!(arena.clean_pool().size(), clean_base);
        assert_eq!(heritage.dirty_pool.size(), dirty_base);

        // A long-lived thread frees the first block: still not drained
        // (one more outstanding), so still not pooled.
        let foreign_state = ThreadHeritageState::new();
        free(&foreign_state, heritage, &arena, 2, a);
        assert_eq!(arena.clean_pool().size(), clean_base);
        assert_eq!(heritage.dirty_pool.size(), dirty_base);

        // Freeing the last outstanding block completes the drain and
        // the slab is finally handed to a pool.
        free(&foreign_state, heritage, &arena, 2, b);
        assert_eq!(meta.pending_drain(), 0);
        assert_eq!(
            arena.clean_pool().size() + heritage.dirty_pool.size(),
            clean_base + dirty_base + 1
        );
    }

    #[test]
    fn exhausted_active_slab_defers_instead_of_retyping() {
        let (arena, table) = setup();
        let heritage = table.for_size(64).unwrap();
        let state = ThreadHeritageState::new();

        // Hand out every block the active slab can carve, with none
        // freed back, so the next allocate finds it truly exhausted.
        let max_blocks = heritage.max_blocks(arena.slab_size());
        let mut blocks = std::vec::Vec::new();
        for _ in 0..max_blocks {
            blocks.push(allocate(&state, heritage, &arena, 1).unwrap());
        }
        let meta = arena.meta_of(blocks[0]).unwrap();

        // One more allocation must move past the exhausted slab by
        // disowning it (not releasing it to a pool where it could be
        // popped back out still full, or retyped by another size class).
        let next = allocate(&state, heritage, &arena, 1).unwrap();
        assert_eq!(meta.owner(), 0);
        assert_eq!(meta.pending_drain(), max_blocks);
        assert_ne!(
            arena.meta_of(next).unwrap() as *const SlabMeta,
            meta as *const SlabMeta
        );

        // Every outstanding block eventually comes back; the last one
        // completes the deferred drain.
        for b in blocks {
            free(&state, heritage, &arena, 1, b);
        }
        assert_eq!(meta.pending_drain(), 0);

        free(&state, heritage, &arena, 1, next);
    }

    #[test]
    fn retype_clears_stale_private_free_nodes() {
        let (arena, table) = setup();
        let small = table.for_size(64).unwrap();
        let big = table.for_size(128).unwrap();
        let state = ThreadHeritageState::new();

        let max_blocks = small.max_blocks(arena.slab_size());
        let mut blocks = std::vec::Vec::new();
        for _ in 0..max_blocks {
            blocks.push(allocate(&state, small, &arena, 1).unwrap());
        }
        let meta = arena.meta_of(blocks[0]).unwrap();

        // Simulate this slab having been swapped out as the thread's
        // active slab (e.g. by the exhaustion path) without going
        // through a full disown, so the frees below take the
        // `reclaim_empty` cap-cache route instead of a no-op (`is_active`
        // would otherwise suppress it).
        state.active.set(None);

        // Free every block in allocation order (not reverse order) so
        // most of them land on `private_free` instead of unwinding the
        // contiguous tail — only the very last free matches the tail.
        for b in blocks {
            free(&state, small, &arena, 1, b);
        }
        assert_eq!(unsafe { meta.local_free_count() }, max_blocks);
        assert!(
            unsafe { meta.private_free() }.size() > 0,
            "test setup should leave nodes on private_free"
        );
        // Fully free, cached as a spare (cap defaults to 2) rather than
        // released yet.
        assert_eq!(meta.owner(), 1);

        // Thread exit releases the cached spare straight to a pool.
        reclaim_all(&arena, state);
        assert_eq!(meta.owner(), 0);

        // Reacquire under a different size class. The stale
        // `private_free` chain must not survive into the new incarnation
        // — its nodes point at bytes the retype below is about to
        // reinitialize as 128-byte blocks.
        let retyped = lifecycle::acquire(big, &arena, 2).unwrap();
        assert_eq!(retyped as *const SlabMeta, meta as *const SlabMeta);
        assert_eq!(unsafe { retyped.private_free() }.size(), 0);
        assert_eq!(retyped.contig_cursor(), big.max_blocks(arena.slab_size()));
        assert_eq!(unsafe { retyped.local_free_count() }, big.max_blocks(arena.slab_size()));
    }

    #[test]
    fn foreign_free_is_recovered_by_owner() {
        let (arena, table) = setup();
        let heritage = table.for_size(64).unwrap();
        let owner_state = ThreadHeritageState::new();
        let a = allocate(&owner_state, heritage, &arena, 1).unwrap();

        // Simulate a foreign thread (id 2) freeing a block it borrowed.
        let foreign_state = ThreadHeritageState::new();
        free(&foreign_state, heritage, &arena, 2, a);

        let meta = arena.meta_of(a).unwrap();
        assert_eq!(meta.wayward_free().size(), 1);

        // The owner's next allocate should drain it back in once the
        // contiguous tail it started from runs out.
        let max_blocks = meta.max_blocks(arena.slab_size());
        for _ in 0..max_blocks {
            allocate(&owner_state, heritage, &arena, 1).unwrap();
        }
        assert_eq!(meta.wayward_free().size(), 0);
    }
}
