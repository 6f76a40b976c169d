//! Magic-fill sanity checking, gated behind the `debug-magic` feature. An
//! optional debugging aid, not part of the core invariants — with the
//! feature off every function here compiles away to nothing.

use crate::os::PlatformHooks;
use crate::slab::{SlabArena, SlabMeta};

/// Byte pattern written across a freshly typed slab's blocks before any
/// initializer runs, so a read of never-allocated memory shows up
/// distinctly from a read of freed memory (`FREED_FILL`) or live data.
pub const FRESH_FILL: u8 = 0xAC;

/// Byte pattern a block is overwritten with by [`poison_on_free`] when a
/// block returns to a free list.
pub const FREED_FILL: u8 = 0xFE;

#[cfg(feature = "debug-magic")]
pub fn fill_slab<H: PlatformHooks>(arena: &SlabArena<H>, meta: &SlabMeta, max_blocks: usize) {
    let base = arena.slab_base(arena.index_of(meta)).as_ptr();
    let block_size = meta.block_size();
    let len = max_blocks * block_size;
    unsafe {
        core::ptr::write_bytes(base, FRESH_FILL, len);
    }
}

#[cfg(not(feature = "debug-magic"))]
pub fn fill_slab<H: PlatformHooks>(_arena: &SlabArena<H>, _meta: &SlabMeta, _max_blocks: usize) {}

/// Overwrites a block about to join a free list with [`FREED_FILL`], and
/// (on the next allocation) [`check_not_freed_fill`] catches the block
/// handed back out without having been through the intended path.
///
/// # Safety
/// `block` must point at `size` live, exclusively-owned bytes.
#[cfg(feature = "debug-magic")]
pub unsafe fn poison_on_free(block: *mut u8, size: usize) {
    // Leave the first word alone: the intrusive free-list link occupies
    // it until the block is popped back off. Only the tail is poisoned.
    if size > core::mem::size_of::<usize>() {
        let tail = block.add(core::mem::size_of::<usize>());
        core::ptr::write_bytes(tail, FREED_FILL, size - core::mem::size_of::<usize>());
    }
}

#[cfg(not(feature = "debug-magic"))]
pub unsafe fn poison_on_free(_block: *mut u8, _size: usize) {}

/// Debug-asserts that a block about to be handed out by a cold path (the
/// contiguous carve, not a reused free node) still carries the fresh
/// fill beyond its first word — catching an initializer or consumer that
/// wrote into a block before it was ever allocated.
#[cfg(feature = "debug-magic")]
pub unsafe fn assert_fresh(block: *const u8, size: usize) {
    if size > core::mem::size_of::<usize>() {
        let tail = block.add(core::mem::size_of::<usize>());
        let slice = core::slice::from_raw_parts(tail, size - core::mem::size_of::<usize>());
        debug_assert!(slice.iter().all(|&b| b == FRESH_FILL));
    }
}

#[cfg(not(feature = "debug-magic"))]
pub unsafe fn assert_fresh(_block: *const u8, _size: usize) {}
