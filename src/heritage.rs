//! Type descriptors and heritages.
//!
//! A [`TypeDescriptor`] binds a block size to an optional one-time
//! initializer; a [`Heritage`] wraps a type with the cache policy
//! (`cap`, `alloc_batch`) and the shared dirty-slab pool that recycles
//! slabs previously used at this size. The polymorphic heritage table
//! backing the `malloc`-compatible facade is built here too, as an
//! ordinary runtime-built table rather than a fixed array of statics.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{Config, MIN_BLOCK, POLY_SIZE_CLASSES};
use crate::stack::LockFreeStack;
use crate::util::is_power_of_two;

/// A type `T`: a size, an optional one-time initializer, and a name used
/// only for diagnostics.
pub struct TypeDescriptor {
    pub size: usize,
    pub name: &'static str,
    /// Invoked exactly once per `(slab, block, type-assignment)`, on
    /// first handout of that block under this type. `None` means blocks
    /// are handed out uninitialized, as with the polymorphic `malloc`
    /// types.
    pub init: Option<fn(*mut u8)>,
}

impl TypeDescriptor {
    pub const fn new(size: usize, name: &'static str) -> TypeDescriptor {
        TypeDescriptor {
            size,
            name,
            init: None,
        }
    }

    pub const fn with_init(mut self, init: fn(*mut u8)) -> TypeDescriptor {
        self.init = Some(init);
        self
    }

    /// A stable identity for this type, used as `type_refs.type_id`. Two
    /// `&'static TypeDescriptor`s are the same type iff their addresses
    /// are equal.
    pub fn id(&'static self) -> usize {
        self as *const TypeDescriptor as usize
    }
}

/// A cache of lineages bound to one [`TypeDescriptor`].
///
/// Thread-local heritages are used by exactly one thread; shared ones may
/// be allocated from by any thread. Both share the same per-slab
/// protocol — the difference only affects which cache backs a thread's
/// active/spare slabs in `engine`, which is why this struct itself
/// carries no locality-specific fields.
pub struct Heritage {
    pub ty: &'static TypeDescriptor,
    /// Maximum number of fully-empty slabs an owner may cache locally
    /// before eagerly disowning one.
    pub cap: usize,
    /// Slabs requested at once from the OS on exhaustion.
    pub alloc_batch: usize,
    /// Shared lockfree stack of dirty slabs (slabs currently typed to
    /// this heritage, not owned by any live thread).
    pub dirty_pool: LockFreeStack,
    id_slot: AtomicUsize,
}

impl Heritage {
    pub const fn new(ty: &'static TypeDescriptor, cap: usize, alloc_batch: usize) -> Heritage {
        Heritage {
            ty,
            cap,
            alloc_batch,
            dirty_pool: LockFreeStack::new(),
            id_slot: AtomicUsize::new(0),
        }
    }

    pub fn block_size(&self) -> usize {
        self.ty.size
    }

    pub fn max_blocks(&self, slab_size: usize) -> usize {
        slab_size / self.ty.size
    }

    /// A small dense id for this heritage, assigned on first use, so the
    /// per-thread cache in `engine` can index a flat array instead of a
    /// hash map keyed on `&'static Heritage`.
    pub fn dense_id(&self, next: &AtomicUsize) -> usize {
        let cur = self.id_slot.load(Ordering::Acquire);
        if cur != 0 {
            return cur - 1;
        }
        let assigned = next.fetch_add(1, Ordering::Relaxed) + 1;
        match self
            .id_slot
            .compare_exchange(0, assigned, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => assigned - 1,
            Err(other) => other - 1,
        }
    }
}

/// The fixed polymorphic type table backing the `malloc`-compatible
/// facade: `{16, 32, 48, 64, 80, 96, 112, 128, 192, 256, 384, 512, 1024,
/// MAX_BLOCK}`, no initializer, `alloc_batch = 8`, `cap = 2`.
pub struct PolyHeritages {
    types: alloc_vec::Vec<TypeDescriptor>,
    heritages: alloc_vec::Vec<Heritage>,
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

impl PolyHeritages {
    /// Builds the polymorphic table for `config`. `max_block` is
    /// appended as its own size class if it isn't already covered by
    /// [`POLY_SIZE_CLASSES`]'s largest entry, so a shrunk or enlarged
    /// `Config::max_block` is always representable.
    pub fn new(config: &Config) -> PolyHeritages {
        let mut sizes: alloc_vec::Vec<usize> = POLY_SIZE_CLASSES
            .iter()
            .copied()
            .filter(|&s| s <= config.max_block)
            .collect();
        if sizes.last().copied() != Some(config.max_block) {
            sizes.push(config.max_block);
        }
        if sizes.is_empty() {
            sizes.push(config.max_block.max(MIN_BLOCK));
        }

        let types: alloc_vec::Vec<TypeDescriptor> = sizes
            .iter()
            .map(|&size| TypeDescriptor::new(size, "poly"))
            .collect();

        // SAFETY: `types`'s heap buffer is allocated once above by
        // `collect` and never reallocated afterward (we only ever read
        // it from here on), so pointers into it stay valid for as long
        // as this `PolyHeritages` — and thus `types` — is alive. The
        // `'static` lifetime is a lie callers can't observe: every
        // `&Heritage` handed out borrows from `&self`, which can't
        // outlive the `Vec` it points into.
        let types_ptr = types.as_ptr();
        let heritages: alloc_vec::Vec<Heritage> = (0..types.len())
            .map(|i| {
                let ty: &'static TypeDescriptor = unsafe { &*types_ptr.add(i) };
                Heritage::new(ty, config.cap, config.alloc_batch)
            })
            .collect();

        PolyHeritages { types, heritages }
    }

    /// Returns the smallest-fitting heritage for `size`.
    pub fn for_size(&self, size: usize) -> Option<&Heritage> {
        self.heritages.iter().find(|h| h.block_size() >= size)
    }

    /// Returns the smallest-fitting heritage for `size` among those whose
    /// block size is itself a power of two. A power-of-two block size
    /// always divides the (power-of-two) slab size it's carved from, so
    /// every block handed out under such a heritage inherits the slab's
    /// own alignment — unlike the general size classes (`48`, `96`, ...),
    /// which only guarantee `MIN_ALIGN`. Backs bounded-alignment requests
    /// (`posix_memalign` et al.).
    pub fn for_size_pow2(&self, size: usize) -> Option<&Heritage> {
        self.heritages
            .iter()
            .filter(|h| is_power_of_two(h.block_size()))
            .find(|h| h.block_size() >= size)
    }

    pub fn max_block(&self) -> usize {
        self.types.last().map_or(0, |t| t.size)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Heritage> {
        self.heritages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poly_table_covers_default_max_block() {
        let config = Config::default();
        let table = PolyHeritages::new(&config);
        assert_eq!(table.max_block(), config.max_block);
        assert_eq!(table.for_size(1).unwrap().block_size(), 16);
        assert_eq!(table.for_size(17).unwrap().block_size(), 32);
        assert_eq!(table.for_size(1024).unwrap().block_size(), 1024);
        assert!(table.for_size(1025).is_none());
    }

    #[test]
    fn poly_table_honors_custom_max_block() {
        let config = Config::new(4096, 2048, 16);
        let table = PolyHeritages::new(&config);
        assert_eq!(table.max_block(), 2048);
        assert_eq!(table.for_size(2048).unwrap().block_size(), 2048);
    }

    #[test]
    fn for_size_pow2_skips_non_power_of_two_classes() {
        let config = Config::default();
        let table = PolyHeritages::new(&config);
        // `for_size` would return the 48-byte class for 40; `for_size_pow2`
        // must skip it (48 isn't a power of two) and land on 64.
        assert_eq!(table.for_size(40).unwrap().block_size(), 48);
        assert_eq!(table.for_size_pow2(40).unwrap().block_size(), 64);
        assert_eq!(table.for_size_pow2(1024).unwrap().block_size(), 1024);
        assert!(table.for_size_pow2(1025).is_none());
    }
}
