//! Type-stable references: `linref_up`/`linref_down`.
//!
//! A linref lets code hold a pointer into a block across a period where
//! it doesn't itself own an allocation there, while still guaranteeing
//! the block's *type* can't change underneath it — the slab's refcount
//! (shared with the owner's occupancy count, see [`crate::slab::TypeRefs`])
//! won't reach zero, so `acquire`/retype can't touch it, while the type
//! identity (`type_id`) stays pinned to whatever it was when the linref
//! was taken.

use core::ptr::NonNull;

use crate::error::NallocError;
use crate::lifecycle;
use crate::os::PlatformHooks;
use crate::slab::{SlabArena, TypeRefs};

/// Takes out a linref on the slab backing `block`, verifying the slab's
/// live type still matches `expected_type_id`. Fails with `WrongType` if
/// the slab has since been retyped.
///
/// On success, the slab's refcount is incremented; the caller must
/// eventually call [`linref_down`] exactly once to release it.
pub fn linref_up<H: PlatformHooks>(
    arena: &SlabArena<H>,
    block: NonNull<u8>,
    expected_type_id: usize,
) -> Result<(), NallocError> {
    let meta = arena.meta_of(block).ok_or(NallocError::OutOfRange)?;
    loop {
        let cur = meta.type_refs().load();
        if cur.type_id != expected_type_id || cur.refs == 0 {
            return Err(NallocError::WrongType);
        }
        let bumped = TypeRefs {
            type_id: cur.type_id,
            refs: cur.refs + 1,
        };
        if meta.type_refs().compare_exchange(cur, bumped).is_ok() {
            return Ok(());
        }
    }
}

/// Releases a linref taken by [`linref_up`]. May drive the refcount to
/// zero if the owner already released the slab back while this linref
/// was outstanding.
///
/// Unlike `lifecycle::ref_down`'s other two callers (`release` and
/// `finalize_drained`), this function never itself moves the slab to a
/// pool when the count reaches zero. A linref's own decrement can only
/// ever be the one to reach zero after the owner's single occupancy
/// slot has already been removed — `type_refs.refs` can't drop below 1
/// while a slab is still owned, since occupancy always holds its own
/// slot — and removing that slot is exactly what `lifecycle::release`/
/// `release_or_defer` do, and they already placed the slab on its
/// heritage's dirty pool at that point (the refcount was still
/// nonzero then, due to this very linref). Pushing it onto the clean
/// pool again here, on top of that, would link the same `pool_link`
/// node into two stacks at once. The slab is left exactly where the
/// owner's release put it — fully reusable by the next same-type
/// `acquire`, which doesn't care whether a dirty slab's refcount is
/// already zero or still positive when it bumps it.
pub fn linref_down<H: PlatformHooks>(arena: &SlabArena<H>, block: NonNull<u8>) {
    let meta = match arena.meta_of(block) {
        Some(meta) => meta,
        None => {
            debug_assert!(false, "linref_down on an out-of-range pointer");
            return;
        }
    };
    lifecycle::ref_down(meta);
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::heritage::PolyHeritages;
    use crate::os::SystemHooks;
    use std::boxed::Box;

    fn setup() -> (SlabArena<SystemHooks>, &'static PolyHeritages) {
        let config = Config::new(4096, 256, 16);
        let arena = SlabArena::new(SystemHooks, config);
        let table = Box::leak(Box::new(PolyHeritages::new(&config)));
        (arena, table)
    }

    #[test]
    fn linref_up_succeeds_for_live_type_and_rejects_mismatch() {
        let (arena, table) = setup();
        let heritage = table.for_size(64).unwrap();
        let meta = lifecycle::acquire(heritage, &arena, 1).unwrap();
        let block = arena.slab_base(arena.index_of(meta));
        let type_id = meta.type_refs().load().type_id;

        assert!(linref_up(&arena, block, type_id).is_ok());
        linref_down(&arena, block);

        assert_eq!(linref_up(&arena, block, type_id.wrapping_add(8)), Err(NallocError::WrongType));
    }

    #[test]
    fn linref_down_leaves_slab_on_dirty_pool_when_owner_released_first() {
        let (arena, table) = setup();
        let heritage = table.for_size(64).unwrap();
        let meta = lifecycle::acquire(heritage, &arena, 1).unwrap();
        let block = arena.slab_base(arena.index_of(meta));
        let type_id = meta.type_refs().load().type_id;
        let clean_base = arena.clean_pool().size();
        let dirty_base = heritage.dirty_pool.size();

        linref_up(&arena, block, type_id).unwrap();
        lifecycle::release(&arena, meta);
        // The owner's contribution is gone but the linref keeps refs at
        // 1, so `release` parked the slab on the heritage's dirty pool,
        // not the clean pool.
        assert_eq!(arena.clean_pool().size(), clean_base);
        assert_eq!(heritage.dirty_pool.size(), dirty_base + 1);

        linref_down(&arena, block);
        // The refcount now reads zero, but the slab is already resident
        // on the dirty pool from the `release` above; `linref_down`
        // must not also link it onto the clean pool.
        assert_eq!(arena.clean_pool().size(), clean_base);
        assert_eq!(heritage.dirty_pool.size(), dirty_base + 1);

        // It's still reusable: a fresh acquire under the same heritage
        // pops it straight off the dirty pool and bumps refs back up.
        let meta2 = lifecycle::acquire(heritage, &arena, 2).unwrap();
        assert!(core::ptr::eq(meta, meta2));
        assert_eq!(heritage.dirty_pool.size(), dirty_base);
    }
}
