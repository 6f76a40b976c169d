//! Slab lifecycle: clean → owned → (dirty | clean).

use core::ptr::NonNull;

use crate::heritage::Heritage;
use crate::os::PlatformHooks;
use crate::slab::{SlabArena, SlabMeta, TypeRefs};
use crate::stack::Chain;

cfg_if::cfg_if! {
    if #[cfg(feature = "trace-log")] {
        macro_rules! trace_slab { ($($t:tt)*) => { log::trace!($($t)*) }; }
    } else {
        macro_rules! trace_slab { ($($t:tt)*) => {}; }
    }
}

/// `need_slab(H)`: pulls a slab from `heritage.dirty_pool`, else the
/// arena's clean pool, else mmaps a fresh batch, and establishes
/// `owner`/`heritage`/`type_refs`/`contig_cursor` for the calling
/// thread. Returns `None` only on OS exhaustion.
pub fn acquire<'a, H: PlatformHooks>(
    heritage: &'static Heritage,
    arena: &'a SlabArena<H>,
    thread_id: usize,
) -> Option<&'a SlabMeta> {
    let meta = pop_dirty(heritage, arena)
        .or_else(|| pop_clean(arena))
        .or_else(|| arena.new_batch(heritage.alloc_batch))?;

    debug_assert_eq!(meta.owner(), 0, "acquired a slab some other thread still owns");

    let type_id = heritage.ty.id();
    let cur = meta.type_refs().load();
    if cur.type_id != type_id {
        // Clean slab, or dirty-popped under a stale assumption: nothing
        // legitimate can be outstanding under the old type once a slab
        // reaches here with a mismatched type, because only
        // `heritage.dirty_pool` (which is per-type) can hand back a slab
        // whose type still matches. A type mismatch therefore only ever
        // happens for a freshly minted or freshly cleaned slab, where
        // `cur.refs == 0`.
        debug_assert_eq!(cur.refs, 0);
        // A clean slab's `private_free` is already empty, but a
        // just-released, same-type-mismatched dirty/clean slab can still
        // carry nodes from its previous incarnation's free list — pure
        // bookkeeping in `SlabMeta`, not inside the blocks themselves, so
        // nothing above has cleared it yet. Drop them before resetting
        // `contig_cursor` and reinitializing every block below, or
        // `local_free_count` would overcount and a later pop would chase
        // a chain into freshly reinitialized (not freelist) bytes.
        unsafe { meta.private_free() }.clear();
        meta.set_block_size(heritage.block_size());
        let max_blocks = heritage.max_blocks(arena.slab_size());
        meta.set_contig_cursor(max_blocks);
        meta.type_refs().store(TypeRefs {
            type_id,
            refs: 1,
        });
        if let Some(init) = heritage.ty.init {
            run_initializer(arena, meta, init, max_blocks);
        } else {
            crate::debug_magic::fill_slab(arena, meta, max_blocks);
        }
    } else {
        // Same type: the slab's private/wayward free lists and contig
        // cursor (usually 0 here) are whatever the previous owner left
        // behind. `refs` may already be >0 from outstanding linrefs; the
        // new owner's slot is added on top rather than clobbering them,
        // so the invariant refcount >= owned + outstanding linrefs stays
        // true across a reacquire.
        loop {
            let cur = meta.type_refs().load();
            let bumped = TypeRefs {
                type_id: cur.type_id,
                refs: cur.refs + 1,
            };
            if meta.type_refs().compare_exchange(cur, bumped).is_ok() {
                break;
            }
        }

        // A prior owner may have released this slab back to the dirty
        // pool while foreign frees were still landing in
        // `wayward_free` (outstanding linrefs keep that legal). Fold
        // them into the private list now so the new owner sees them as
        // ordinary free blocks rather than having to discover them on
        // its own first exhaustion.
        let (head, count) = meta.wayward_free().pop_all(1);
        if count > 0 {
            // SAFETY: sole owner from this point on; publishing `owner`
            // below happens after this drain, so no concurrent reader
            // can observe `private_free` mid-drain.
            drain_wayward_chain(head, unsafe { meta.private_free() });
        }
    }

    meta.set_heritage(Some(NonNull::from(heritage)));
    meta.set_owner(thread_id);
    trace_slab!("nalloc: slab {:p} acquired by thread {}", meta, thread_id);
    Some(meta)
}

fn pop_dirty<'a, H: PlatformHooks>(heritage: &Heritage, arena: &'a SlabArena<H>) -> Option<&'a SlabMeta> {
    let link = heritage.dirty_pool.pop()?;
    Some(link_to_meta(arena, link))
}

fn pop_clean<'a, H: PlatformHooks>(arena: &'a SlabArena<H>) -> Option<&'a SlabMeta> {
    let link = arena.clean_pool().pop()?;
    Some(link_to_meta(arena, link))
}

fn link_to_meta<'a, H: PlatformHooks>(_arena: &'a SlabArena<H>, link: NonNull<crate::stack::Link>) -> &'a SlabMeta {
    // `SlabMeta` is `#[repr(C)]` with `pool_link` as its first field, so a
    // node pointer recovered from a pool pop is exactly the metadata
    // record's address.
    unsafe { &*(link.as_ptr() as *const SlabMeta) }
}

fn run_initializer<H: PlatformHooks>(
    arena: &SlabArena<H>,
    meta: &SlabMeta,
    init: fn(*mut u8),
    max_blocks: usize,
) {
    let base = arena.slab_base(arena.index_of(meta)).as_ptr();
    let block_size = meta.block_size();
    for i in 0..max_blocks {
        let block = unsafe { base.add(i * block_size) };
        init(block);
    }
}

/// `slab_ref_down`, shared by `release` and `linref_down`: decrements
/// `refcount` via CAS loop and reports whether this call was the one
/// that drove it to zero.
pub fn ref_down(meta: &SlabMeta) -> bool {
    loop {
        let cur = meta.type_refs().load();
        debug_assert!(cur.refs > 0, "refcount underflow");
        let new = TypeRefs {
            type_id: cur.type_id,
            refs: cur.refs - 1,
        };
        if meta.type_refs().compare_exchange(cur, new).is_ok() {
            return new.refs == 0;
        }
    }
}

/// `release` by owner: clears `owner`, decrements refcount, and moves
/// the slab to the clean pool (refcount hit zero) or its heritage's
/// dirty pool (refcount still nonzero, e.g. from outstanding linrefs).
///
/// Callers must know the slab is already fully free (every block it
/// ever handed out has been freed) — true for a voluntary cap-release
/// and for a cached fully-empty spare, but NOT necessarily true for a
/// thread's active slab at thread exit. Use
/// [`release_or_defer`] there instead.
pub fn release<H: PlatformHooks>(arena: &SlabArena<H>, meta: &SlabMeta) {
    meta.set_owner(0);
    finalize(arena, meta);
}

/// Thread death's release of a possibly-not-fully-free active slab
/// (§4.5: "the owning thread exits while foreign frees are still in
/// flight"). If the slab is already fully free, behaves like
/// [`release`]. Otherwise clears `owner` but leaves the slab's refcount
/// and pool membership untouched — it is not pushed to any pool, so it
/// can't be raced by a concurrent `acquire` — and records how many
/// wayward frees would complete the drain. The foreign free that
/// eventually observes `wayward_free` reach that count performs the
/// deferred pool transition (see `engine::free`'s foreign-free branch
/// and [`finalize_drained`]). This is the fix for the leaking behavior
/// spec.md §9's Open Questions explicitly rule out: the slab's bytes
/// stay reserved to its outstanding blocks until every one is actually
/// returned, instead of being eagerly retyped out from under whichever
/// foreign thread still holds a live pointer into it.
pub fn release_or_defer<H: PlatformHooks>(arena: &SlabArena<H>, meta: &SlabMeta) {
    let max_blocks = meta.max_blocks(arena.slab_size());
    // SAFETY: caller is still this slab's owner; `owner` is cleared
    // below, after this read.
    let frozen_local = unsafe { meta.local_free_count() };
    let needed = max_blocks.saturating_sub(frozen_local);
    if needed == 0 {
        release(arena, meta);
        return;
    }
    meta.set_pending_drain(needed);
    meta.set_owner(0);
    trace_slab!(
        "nalloc: slab {:p} disowned with blocks outstanding, deferring reclaim ({} pending)",
        meta,
        needed
    );
}

/// Shared terminal step of `release`/`release_or_defer`/`finalize_drained`:
/// decrement refcount and move the slab to the clean pool (refcount hit
/// zero) or its heritage's dirty pool. Callers must have already cleared
/// `owner` and established that the slab is fully free.
fn finalize<H: PlatformHooks>(arena: &SlabArena<H>, meta: &SlabMeta) {
    let heritage = meta
        .heritage()
        // SAFETY: set by `acquire` and only cleared by this function
        // after the decision below is made, so it's still valid here.
        .map(|p| unsafe { p.as_ref() });
    let went_to_zero = ref_down(meta);
    if went_to_zero {
        meta.set_heritage(None);
        let link = NonNull::from(&meta.pool_link);
        unsafe { arena.clean_pool().push(link) };
        trace_slab!("nalloc: slab {:p} released to clean pool", meta);
    } else if let Some(heritage) = heritage {
        let link = NonNull::from(&meta.pool_link);
        unsafe { heritage.dirty_pool.push(link) };
        trace_slab!("nalloc: slab {:p} released to dirty pool", meta);
    } else {
        debug_assert!(false, "released slab with nonzero refcount but no heritage");
    }
}

/// Completes a disown deferred by [`release_or_defer`]: called by a
/// foreign free that just pushed the block which brought `wayward_free`
/// up to the slab's recorded `pending_drain` target. Races against any
/// other foreign free observing the same target (impossible in
/// practice, since each outstanding block is freed at most once, but
/// guarded anyway): only the caller that wins `pop_all_iff`'s
/// generation-and-size check actually finalizes.
pub fn finalize_drained<H: PlatformHooks>(arena: &SlabArena<H>, meta: &SlabMeta, observed_size: usize) {
    let gen = meta.wayward_free().generation();
    let new_gen = gen.wrapping_add(1);
    if let Some((head, _)) = meta
        .wayward_free()
        .pop_all_iff(new_gen, gen, observed_size as u32)
    {
        meta.set_pending_drain(0);
        // SAFETY: `owner` is 0 (cleared by `release_or_defer` before
        // this could ever run) and the slab was never pushed to a pool,
        // so `acquire` can't be concurrently touching `private_free`.
        drain_wayward_chain(head, unsafe { meta.private_free() });
        finalize(arena, meta);
        trace_slab!("nalloc: slab {:p} finished deferred drain, finalized", meta);
    }
}

/// Walks a chain of wayward-freed blocks detached by `pop_all`/
/// `pop_all_or_incr`, moving every node onto `dst` (the owner's private
/// free list). Shared by `engine::allocate`'s wayward-steal step.
pub fn drain_wayward_chain(
    head: Option<NonNull<crate::stack::Link>>,
    dst: &mut crate::stack::SingleThreadStack,
) {
    for node in Chain::new(head) {
        unsafe { dst.push(node) };
    }
}
