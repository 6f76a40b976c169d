//! Tunables.
//!
//! `cap` and `alloc_batch` have no one obviously-correct constant across
//! workloads, so rather than hardwire a single pair of numbers this
//! module exposes them on [`Config`] for embedders to tune.

use crate::util::is_power_of_two;

/// Minimum block size and alignment: every block is at least this big
/// and aligned to it.
pub const MIN_BLOCK: usize = 16;
pub const MIN_ALIGN: usize = 16;

/// The polymorphic size classes used by the `malloc`-compatible facade.
/// Smallest-fitting lookup is performed over this table.
pub const POLY_SIZE_CLASSES: &[usize] = &[
    16, 32, 48, 64, 80, 96, 112, 128, 192, 256, 384, 512, 1024,
];

/// Runtime configuration for a [`crate::Nalloc`] instance.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Size in bytes of one slab. Must be a power of two. Default: 4 KiB,
    /// the typical host page size.
    pub slab_size: usize,
    /// Largest single-slab-fast-path block size; requests above this go
    /// through the large-block OS-mapped path.
    pub max_block: usize,
    /// Number of slabs reserved for the metadata array and virtual
    /// address range at startup. Bounds the total heap this `Nalloc`
    /// instance can ever hand out.
    pub max_slabs: usize,
    /// Default cache cap (`H.cap`) for polymorphic heritages: the maximum
    /// number of fully-empty slabs an owner may hold locally before
    /// eagerly disowning one.
    pub cap: usize,
    /// Default `alloc_batch` for polymorphic heritages: slabs requested
    /// at once from the OS on exhaustion.
    pub alloc_batch: usize,
}

impl Config {
    /// A `const fn` builder so statically-configured instances don't pay
    /// for runtime validation; [`Config::validate`] should still be
    /// called once at startup for configs assembled from untrusted input.
    pub const fn new(slab_size: usize, max_block: usize, max_slabs: usize) -> Config {
        Config {
            slab_size,
            max_block,
            max_slabs,
            cap: 2,
            alloc_batch: 8,
        }
    }

    pub const fn with_cap(mut self, cap: usize) -> Config {
        self.cap = cap;
        self
    }

    pub const fn with_alloc_batch(mut self, alloc_batch: usize) -> Config {
        self.alloc_batch = alloc_batch;
        self
    }

    pub fn validate(&self) {
        assert!(is_power_of_two(self.slab_size), "slab_size must be a power of two");
        assert!(self.slab_size >= 4096, "slab_size smaller than a page isn't supported");
        assert!(self.max_block < self.slab_size, "max_block must fit inside one slab");
        assert!(self.max_slabs > 0, "max_slabs must be nonzero");
        assert!(self.alloc_batch > 1, "alloc_batch must request more than one slab at a time");
    }
}

impl Default for Config {
    /// 4 KiB slabs, 64 KiB of address space reserved for the metadata
    /// array (16384 slabs == 64 MiB of manageable heap at the default
    /// slab size), `MAX_BLOCK` derived from the polymorphic table's
    /// largest entry below one slab.
    fn default() -> Config {
        Config::new(4096, 1024, 1 << 14)
    }
}
