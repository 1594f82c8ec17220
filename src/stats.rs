//! Statistics snapshots and the invariant report.
//!
//! [`Allocator::stats`](crate::Allocator::stats) and
//! [`Allocator::validate`](crate::Allocator::validate) return these. Counters
//! are read without stopping the allocator, so a snapshot taken under load
//! is only approximately consistent.

pub use crate::base::BaseStats;

/// Purge activity for one tier of one arena.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PurgeStats {
    /// Purge passes that released at least one page.
    pub npurge: u64,
    /// Extents handed to a purge hook.
    pub nmadvise: u64,
    /// Pages purged.
    pub purged: u64,
}

/// Page counts for one arena's page allocator.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PageStats {
    pub active_pages: usize,
    pub dirty_pages: usize,
    pub muzzy_pages: usize,
    pub retained_pages: usize,
    /// Bytes of address space mapped by this arena.
    pub mapped: usize,
    pub dirty_purge: PurgeStats,
    pub muzzy_purge: PurgeStats,
}

/// Utilization of one bin.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BinStats {
    pub class: usize,
    pub reg_size: usize,
    pub nregs: usize,
    /// Slabs currently owned by the bin.
    pub slabs: usize,
    pub full_slabs: usize,
    /// Regions currently allocated.
    pub curregs: usize,
    pub nmalloc: u64,
    pub ndalloc: u64,
    /// Batched refills and drains.
    pub nfills: u64,
    pub nflushes: u64,
}

impl BinStats {
    /// Fraction of the bin's regions in use.
    pub fn utilization(&self) -> f64 {
        let total = self.slabs * self.nregs;
        if total == 0 {
            0.0
        } else {
            self.curregs as f64 / total as f64
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArenaStats {
    pub index: usize,
    /// Threads bound to the arena.
    pub nthreads: usize,
    pub pages: PageStats,
    /// Bins with at least one allocation ever, by class.
    pub bins: Vec<BinStats>,
    /// Bytes in live large allocations, by usable size.
    pub large_allocated: usize,
    pub large_nmalloc: u64,
    pub large_ndalloc: u64,
}

/// Descriptor bookkeeping across all arenas.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct DescriptorStats {
    /// Descriptors ever created.
    pub created: usize,
    /// Descriptors describing live extents.
    pub in_use: usize,
    /// Descriptors waiting in the shared cache or an arena's fast cache.
    pub cached: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    /// Initialized arenas only.
    pub arenas: Vec<ArenaStats>,
    pub base: BaseStats,
    pub descriptors: DescriptorStats,
}

impl Stats {
    pub fn active_pages(&self) -> usize {
        self.arenas.iter().map(|a| a.pages.active_pages).sum()
    }

    pub fn dirty_pages(&self) -> usize {
        self.arenas.iter().map(|a| a.pages.dirty_pages).sum()
    }

    pub fn muzzy_pages(&self) -> usize {
        self.arenas.iter().map(|a| a.pages.muzzy_pages).sum()
    }

    pub fn retained_pages(&self) -> usize {
        self.arenas.iter().map(|a| a.pages.retained_pages).sum()
    }

    pub fn mapped(&self) -> usize {
        self.arenas.iter().map(|a| a.pages.mapped).sum()
    }

    /// Regions allocated across all bins of all arenas.
    pub fn small_regions(&self) -> usize {
        self.arenas
            .iter()
            .flat_map(|a| a.bins.iter())
            .map(|b| b.curregs)
            .sum()
    }
}

/// Validity contains a count of every broken invariant found by
/// [`Allocator::validate`](crate::Allocator::validate).
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Extent set entries that disagree with their descriptor, or a set whose
    /// page count is not the sum of its members.
    pub set_mismatches: usize,
    /// Extents whose first or last page does not resolve to them in the
    /// address map.
    pub map_mismatches: usize,
    /// Slabs in the wrong bin collection (in both the non-full heap and the
    /// full set, or a full current slab), or bitmaps that disagree with their
    /// free count.
    pub bin_mismatches: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all counts are 0
    pub fn is_valid(&self) -> bool {
        self.set_mismatches == 0 && self.map_mismatches == 0 && self.bin_mismatches == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn totals_sum_over_arenas() {
        let arena = |index, active, dirty| ArenaStats {
            index,
            pages: PageStats {
                active_pages: active,
                dirty_pages: dirty,
                ..PageStats::default()
            },
            bins: vec![BinStats {
                curregs: 3,
                slabs: 1,
                nregs: 4,
                ..BinStats::default()
            }],
            ..ArenaStats::default()
        };
        let stats = Stats {
            arenas: vec![arena(0, 10, 1), arena(1, 5, 2)],
            ..Stats::default()
        };
        assert_eq!(stats.active_pages(), 15);
        assert_eq!(stats.dirty_pages(), 3);
        assert_eq!(stats.small_regions(), 6);
        assert_eq!(stats.arenas[0].bins[0].utilization(), 0.75);
    }

    #[test]
    fn validity_is_all_zero() {
        assert!(Validity::default().is_valid());
        let broken = Validity {
            map_mismatches: 1,
            ..Validity::default()
        };
        assert!(!bool::from(broken));
    }
}
