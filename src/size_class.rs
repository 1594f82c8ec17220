//! The size-class table.
//!
//! Requests are rounded up onto a small set of size classes grouped
//! log-linearly: after a single tiny class, every doubling of size is split
//! into [`NGROUP`] evenly spaced classes. That keeps the table small while
//! bounding internal waste to `1 / NGROUP` of the request.
//!
//! ```text
//! 8 | 16 32 48 64 | 80 96 112 128 | 160 192 224 256 | 320 384 448 512 | ...
//! ```
//!
//! Classes below `PAGE << LG_NGROUP` are *small*: they are carved out of
//! slabs by the bins. Everything above is *large* and is served as a whole
//! extent by the page allocator.

use spin::Lazy;

/// Log2 of the allocator's page size.
pub const LG_PAGE: u32 = 12;
/// The allocator's page size. All extents are multiples of this.
pub const PAGE: usize = 1 << LG_PAGE;
/// Minimum alignment guaranteed for any request above the tiny classes.
pub const LG_QUANTUM: u32 = 4;
pub const QUANTUM: usize = 1 << LG_QUANTUM;
pub const LG_TINY_MIN: u32 = 3;
pub const LG_NGROUP: u32 = 2;
pub const NGROUP: usize = 1 << LG_NGROUP;
pub const CACHELINE: usize = 64;
/// The initial growth step for retained address space.
pub const HUGEPAGE: usize = 2 << 20;

/// Sizes up to this bound go through the lookup table.
const LG_MAX_LOOKUP: u32 = 12;
const PTR_BITS: u32 = usize::BITS;

/// Maximum number of regions in any slab: the smallest class packed into
/// a single page.
pub const SLAB_MAXREGS: usize = PAGE >> LG_TINY_MIN;

/// One entry of the size-class table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    pub index: usize,
    pub lg_base: u32,
    pub lg_delta: u32,
    pub ndelta: usize,
    pub size: usize,
    /// Whether `size` is a multiple of the page size.
    pub psz: bool,
    /// Whether this class is served from slabs.
    pub bin: bool,
    /// Pages per slab, zero for large classes.
    pub slab_pages: usize,
}

/// Slab geometry for one small size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinInfo {
    pub reg_size: usize,
    pub slab_size: usize,
    pub nregs: usize,
}

pub struct SizeClasses {
    classes: Vec<SizeClass>,
    /// Indexed by `(size + 7) >> LG_TINY_MIN`.
    lookup: Vec<u8>,
    /// The page-multiple classes, ascending.
    psizes: Vec<usize>,
    bins: Vec<BinInfo>,
    ntiny: usize,
    lg_tiny_max: u32,
    lookup_max: usize,
    small_max: usize,
    large_min: usize,
    large_max: usize,
}

/// Number of pages in a slab for a class: the smallest page multiple that
/// holds a whole number of regions.
fn slab_pages(reg_size: usize) -> usize {
    let mut pages = 1;
    while (pages * PAGE) % reg_size != 0 {
        pages += 1;
    }
    pages
}

fn lg_floor(x: usize) -> u32 {
    debug_assert!(x != 0);
    PTR_BITS - 1 - x.leading_zeros()
}

fn lg_ceil(x: usize) -> u32 {
    if x <= 1 {
        0
    } else {
        lg_floor(x - 1) + 1
    }
}

impl SizeClasses {
    fn make_class(index: usize, lg_base: u32, lg_delta: u32, ndelta: usize) -> SizeClass {
        let size = (1usize << lg_base) + (ndelta << lg_delta);
        let bin = size < (PAGE << LG_NGROUP);
        SizeClass {
            index,
            lg_base,
            lg_delta,
            ndelta,
            size,
            psz: size % PAGE == 0,
            bin,
            slab_pages: if bin { slab_pages(size) } else { 0 },
        }
    }

    /// Build the table for the compile-time page and quantum parameters.
    pub fn compute() -> Self {
        let mut classes = Vec::new();
        let mut lg_base = LG_TINY_MIN;
        let mut lg_delta = lg_base;
        let mut ndelta = 0usize;
        let mut ntiny = 0;
        let mut lg_tiny_max = LG_TINY_MIN;

        // Tiny classes: powers of two below the quantum.
        while lg_base < LG_QUANTUM {
            classes.push(Self::make_class(classes.len(), lg_base, lg_delta, ndelta));
            ntiny += 1;
            lg_tiny_max = lg_base;
            lg_delta = lg_base;
            lg_base += 1;
        }

        // The first quantum-spaced group; with tiny classes present its first
        // member is encoded as (lg_base - 1) + one delta.
        if ntiny != 0 {
            lg_base -= 1;
            ndelta = 1;
            classes.push(Self::make_class(classes.len(), lg_base, lg_delta, ndelta));
            lg_base += 1;
            lg_delta += 1;
        }
        while ndelta < NGROUP {
            classes.push(Self::make_class(classes.len(), lg_base, lg_delta, ndelta));
            ndelta += 1;
        }

        lg_base += LG_NGROUP;
        while lg_base < PTR_BITS - 1 {
            let limit = if lg_base == PTR_BITS - 2 {
                NGROUP - 1
            } else {
                NGROUP
            };
            for ndelta in 1..=limit {
                classes.push(Self::make_class(classes.len(), lg_base, lg_delta, ndelta));
            }
            lg_base += 1;
            lg_delta += 1;
        }

        debug_assert!(classes.len() < u8::MAX as usize);

        let lookup_max = 1usize << LG_MAX_LOOKUP;
        let mut lookup = Vec::with_capacity((lookup_max >> LG_TINY_MIN) + 1);
        let mut index = 0;
        for slot in 0..=(lookup_max >> LG_TINY_MIN) {
            let size = slot << LG_TINY_MIN;
            while classes[index].size < size {
                index += 1;
            }
            lookup.push(index as u8);
        }

        let psizes = classes
            .iter()
            .filter(|c| c.psz)
            .map(|c| c.size)
            .collect();

        let bins: Vec<BinInfo> = classes
            .iter()
            .filter(|c| c.bin)
            .map(|c| BinInfo {
                reg_size: c.size,
                slab_size: c.slab_pages * PAGE,
                nregs: c.slab_pages * PAGE / c.size,
            })
            .collect();

        let small_max = bins.last().map(|b| b.reg_size).unwrap_or(0);
        let large_min = classes[bins.len()].size;
        let large_max = classes.last().map(|c| c.size).unwrap_or(0);

        SizeClasses {
            classes,
            lookup,
            psizes,
            bins,
            ntiny,
            lg_tiny_max,
            lookup_max,
            small_max,
            large_min,
            large_max,
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn nbins(&self) -> usize {
        self.bins.len()
    }

    pub fn small_max(&self) -> usize {
        self.small_max
    }

    pub fn large_min(&self) -> usize {
        self.large_min
    }

    pub fn large_max(&self) -> usize {
        self.large_max
    }

    pub fn class(&self, index: usize) -> &SizeClass {
        &self.classes[index]
    }

    pub fn bin_info(&self, index: usize) -> Option<&BinInfo> {
        self.bins.get(index)
    }

    /// Map a request size to its class index, or `None` if the request is
    /// larger than the largest class.
    #[inline]
    pub fn size_to_index(&self, size: usize) -> Option<usize> {
        if size <= self.lookup_max {
            let slot = (size + (1 << LG_TINY_MIN) - 1) >> LG_TINY_MIN;
            return Some(self.lookup[slot] as usize);
        }
        self.size_to_index_compute(size)
    }

    /// The bit-scan form of [`size_to_index`](Self::size_to_index), valid
    /// for every size. No division.
    pub fn size_to_index_compute(&self, size: usize) -> Option<usize> {
        if size > self.large_max {
            return None;
        }
        if size == 0 {
            return Some(0);
        }
        if self.ntiny != 0 && size <= (1 << self.lg_tiny_max) {
            let lg_ceil = lg_ceil(size);
            return Some(lg_ceil.saturating_sub(LG_TINY_MIN) as usize);
        }

        let x = lg_floor((size << 1) - 1);
        let shift = if x < LG_NGROUP + LG_QUANTUM {
            0
        } else {
            x - (LG_NGROUP + LG_QUANTUM)
        };
        let grp = (shift as usize) << LG_NGROUP;
        let lg_delta = if x < LG_NGROUP + LG_QUANTUM + 1 {
            LG_QUANTUM
        } else {
            x - LG_NGROUP - 1
        };
        let delta_inverse_mask = usize::MAX << lg_delta;
        let within = (((size - 1) & delta_inverse_mask) >> lg_delta) & (NGROUP - 1);

        Some(self.ntiny + grp + within)
    }

    #[inline]
    pub fn index_to_size(&self, index: usize) -> usize {
        self.classes[index].size
    }

    /// Round `size` up to its class size.
    pub fn usable_size(&self, size: usize) -> Option<usize> {
        self.size_to_index(size).map(|i| self.index_to_size(i))
    }

    /// Usable size for a request of `size` bytes aligned to `align` (a power
    /// of two). `None` if the request cannot be satisfied.
    pub fn aligned_usable_size(&self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        if size <= self.small_max && align <= PAGE {
            let rounded = size.checked_add(align - 1)? & !(align - 1);
            let usable = self.usable_size(rounded)?;
            if usable < self.large_min {
                return Some(usable);
            }
        }

        if align > self.large_max {
            return None;
        }
        let usable = if size <= self.large_min {
            self.large_min
        } else {
            self.usable_size(size)?
        };
        // Room for the worst-case leading pad must not overflow.
        usable.checked_add(page_ceiling(align)? - PAGE)?;
        Some(usable)
    }

    /// Number of page-size classes.
    pub fn npsizes(&self) -> usize {
        self.psizes.len()
    }

    pub fn psz_size(&self, pind: usize) -> usize {
        self.psizes[pind]
    }

    /// Index of the smallest page class `>= size`; `npsizes()` if none.
    pub fn psz_ceil_index(&self, size: usize) -> usize {
        self.psizes.partition_point(|&p| p < size)
    }

    /// Index of the largest page class `<= size`. `size` must be at least
    /// one page.
    pub fn psz_floor_index(&self, size: usize) -> usize {
        debug_assert!(size >= PAGE);
        self.psizes.partition_point(|&p| p <= size) - 1
    }
}

/// Round `value` up to the nearest multiple of `increment`.
pub fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// Round up to a whole number of pages, `None` on overflow.
#[inline]
pub fn page_ceiling(value: usize) -> Option<usize> {
    Some(value.checked_add(PAGE - 1)? & !(PAGE - 1))
}

static SIZE_CLASSES: Lazy<SizeClasses> = Lazy::new(SizeClasses::compute);

/// The process-wide size-class table. It is a pure function of the
/// compile-time constants above.
pub fn classes() -> &'static SizeClasses {
    &SIZE_CLASSES
}

/// Class index for a request of `size` bytes.
#[inline]
pub fn size_to_index(size: usize) -> Option<usize> {
    classes().size_to_index(size)
}

/// Byte size of class `index`.
#[inline]
pub fn index_to_size(index: usize) -> usize {
    classes().index_to_size(index)
}
