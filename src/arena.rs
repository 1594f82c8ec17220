//! Arenas: independent allocators sharing only the registry's metadata.
//!
//! Each arena owns one [`Bin`] per small size class and a [`PageAllocator`].
//! Small requests go to the bin for their class, large requests straight to
//! the page allocator. Every deallocation ticks the arena's decay counter;
//! every `decay_ticks` ticks both decay engines get a chance to purge.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::allocators::Registry;
use crate::bin::Bin;
use crate::error::AllocError;
use crate::pages::{PageAllocator, PurgeState};
use crate::rtree::LeafEntry;
use crate::size_class::{classes, CACHELINE, PAGE};
use crate::stats::{ArenaStats, Validity};
use crate::sync::Mutex;
use crate::witness::LockRank;

#[derive(Default)]
struct LargeCounters {
    allocated: AtomicUsize,
    nmalloc: AtomicU64,
    ndalloc: AtomicU64,
}

pub struct Arena {
    index: usize,
    bins: Box<[Bin]>,
    pages: PageAllocator,
    large: LargeCounters,
    ticker: AtomicU32,
    prng: Mutex<SmallRng>,
    nthreads: AtomicUsize,
}

impl Arena {
    pub fn new(reg: &Registry, index: usize) -> Self {
        let seed = reg.uid() ^ (index as u64).rotate_left(17);
        let bins = (0..classes().nbins()).filter_map(Bin::new).collect();
        log::debug!("created arena {}", index);
        Arena {
            index,
            bins,
            pages: PageAllocator::new(index as u16, &reg.config, reg.now(), seed),
            large: LargeCounters::default(),
            ticker: AtomicU32::new(0),
            prng: Mutex::new(LockRank::Prng, SmallRng::seed_from_u64(seed)),
            nthreads: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn bin(&self, class: usize) -> Result<&Bin, AllocError> {
        self.bins
            .get(class)
            .ok_or(AllocError::InvalidSizeClass(class))
    }

    pub fn nthreads(&self) -> &AtomicUsize {
        &self.nthreads
    }

    /// Allocate a region of small class `class`.
    pub fn alloc_small(
        &self,
        reg: &Registry,
        class: usize,
        zero: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        let bin = self.bin(class)?;
        let ptr = bin.alloc(reg, &self.pages)?;
        if zero {
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, bin.info().reg_size) };
        }
        Ok(ptr)
    }

    /// Allocate `usable` bytes (a large class size) aligned to `align`.
    pub fn alloc_large(
        &self,
        reg: &Registry,
        usable: usize,
        align: usize,
        zero: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        let sc = classes();
        let szind = sc
            .size_to_index(usable)
            .ok_or(AllocError::OutOfMemory)?;
        debug_assert_eq!(sc.index_to_size(szind), usable);

        let oblivious = reg.config.cache_oblivious && align < PAGE;
        let size = if oblivious {
            usable.checked_add(PAGE).ok_or(AllocError::OutOfMemory)?
        } else {
            usable
        };
        let id = self
            .pages
            .alloc(reg, size, align.max(PAGE), zero, Some(szind), false)?;
        let addr = reg.extents.snapshot(id).addr;

        let offset = if oblivious {
            // Any multiple of the alignment (at least a cache line) within the
            // extra page.
            let unit = align.max(CACHELINE);
            let slots = PAGE / unit;
            self.prng.lock().gen_range(0..slots) * unit
        } else {
            0
        };

        self.large.allocated.fetch_add(usable, Ordering::Relaxed);
        self.large.nmalloc.fetch_add(1, Ordering::Relaxed);
        // Page allocations are never at address zero.
        Ok(unsafe { NonNull::new_unchecked((addr + offset) as *mut u8) })
    }

    /// Resize the large allocation the address map resolved to `entry` to
    /// `usable` bytes without moving it.
    pub fn resize_large(
        &self,
        reg: &Registry,
        entry: LeafEntry,
        usable: usize,
    ) -> Result<(), AllocError> {
        debug_assert!(!entry.slab);
        let sc = classes();
        let old = sc.index_to_size(entry.szind.unwrap_or_default());
        let szind = sc.size_to_index(usable).ok_or(AllocError::OutOfMemory)?;
        // Any cache-oblivious slack stays at the end of the extent.
        let size = reg.extents.snapshot(entry.id).size - old + usable;
        if usable > old {
            self.pages.expand(reg, entry.id, size, szind)?;
            self.large.allocated.fetch_add(usable - old, Ordering::Relaxed);
        } else if usable < old {
            self.pages.shrink(reg, entry.id, size, szind)?;
            self.large.allocated.fetch_sub(old - usable, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Free `ptr`, which the address map resolved to `entry`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this arena.
    pub unsafe fn dalloc(&self, reg: &Registry, ptr: NonNull<u8>, entry: LeafEntry) {
        debug_assert_eq!(entry.arena as usize, self.index);
        let szind = entry.szind.unwrap_or_default();
        if entry.slab {
            self.bins[szind].free(reg, &self.pages, ptr, entry.id);
        } else {
            self.large
                .allocated
                .fetch_sub(classes().index_to_size(szind), Ordering::Relaxed);
            self.large.ndalloc.fetch_add(1, Ordering::Relaxed);
            self.pages.dalloc(reg, entry.id);
        }
        self.tick(reg, 1);
    }

    /// Count `n` deallocations, and run decay each time the count crosses a
    /// multiple of `decay_ticks`.
    pub fn tick(&self, reg: &Registry, n: u32) {
        let every = reg.config.decay_ticks;
        let before = self.ticker.fetch_add(n, Ordering::Relaxed);
        if before / every != before.wrapping_add(n) / every {
            self.decay(reg);
        }
    }

    /// Give both decay engines a chance to purge. Returns pages purged.
    pub fn decay(&self, reg: &Registry) -> usize {
        self.pages.decay(reg, PurgeState::Dirty) + self.pages.decay(reg, PurgeState::Muzzy)
    }

    /// Purge every dirty and muzzy page.
    pub fn purge(&self, reg: &Registry) -> usize {
        self.pages.purge_all(reg)
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            index: self.index,
            nthreads: self.nthreads.load(Ordering::Relaxed),
            pages: self.pages.stats(),
            bins: self
                .bins
                .iter()
                .map(Bin::stats)
                .filter(|b| b.nmalloc != 0)
                .collect(),
            large_allocated: self.large.allocated.load(Ordering::Relaxed),
            large_nmalloc: self.large.nmalloc.load(Ordering::Relaxed),
            large_ndalloc: self.large.ndalloc.load(Ordering::Relaxed),
        }
    }

    pub fn validate(&self, reg: &Registry, validity: &mut Validity) {
        for bin in self.bins.iter() {
            bin.validate(reg, validity);
        }
        self.pages.validate(reg, validity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use test_log::test;

    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::decay::DecayTime;
    use crate::extent::ExtentState;
    use crate::hooks::ToyVm;

    fn registry(config: Config) -> Registry {
        Registry::new(
            Box::new(Arc::new(ToyVm::default())),
            Config {
                narenas: 1,
                ..config
            },
            Box::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    fn valid(reg: &Registry, arena: &Arena) {
        let mut validity = Validity::default();
        arena.validate(reg, &mut validity);
        assert!(validity.is_valid(), "{:?}", validity);
    }

    #[test]
    fn small_and_large_round_trip() {
        let reg = registry(Config::default());
        let arena = Arena::new(&reg, 0);
        let small = arena.alloc_small(&reg, 5, true).unwrap();
        let large = arena.alloc_large(&reg, 5 * PAGE, 8, true).unwrap();

        let se = reg.emap.lookup(small.as_ptr() as usize).unwrap();
        assert!(se.slab);
        assert_eq!(se.szind, Some(5));
        let le = reg.emap.lookup(large.as_ptr() as usize).unwrap();
        assert!(!le.slab);
        assert_eq!(classes().index_to_size(le.szind.unwrap()), 5 * PAGE);
        assert_eq!(le.arena, 0);
        assert_eq!(arena.stats().large_allocated, 5 * PAGE);
        valid(&reg, &arena);

        unsafe {
            arena.dalloc(&reg, small, se);
            arena.dalloc(&reg, large, le);
        }
        let stats = arena.stats();
        assert_eq!(stats.large_allocated, 0);
        assert_eq!((stats.large_nmalloc, stats.large_ndalloc), (1, 1));
        assert_eq!(stats.pages.active_pages, 0);
        valid(&reg, &arena);
    }

    #[test]
    fn cache_oblivious_offsets() {
        let reg = registry(Config::default());
        let arena = Arena::new(&reg, 0);
        let mut offsets = std::collections::HashSet::new();
        let mut ptrs = Vec::new();
        for _ in 0..32 {
            let p = arena.alloc_large(&reg, 4 * PAGE, 64, false).unwrap();
            let offset = p.as_ptr() as usize % PAGE;
            assert_eq!(offset % 64, 0);
            offsets.insert(offset);
            ptrs.push(p);
        }
        assert!(offsets.len() > 1);
        for p in ptrs {
            let id = reg.emap.lookup(p.as_ptr() as usize).unwrap().id;
            let extent = reg.extents.snapshot(id);
            assert_eq!(extent.size, 5 * PAGE);
            assert_eq!(extent.state, ExtentState::Active);
        }

        let reg = registry(Config {
            cache_oblivious: false,
            ..Config::default()
        });
        let arena = Arena::new(&reg, 0);
        let p = arena.alloc_large(&reg, 4 * PAGE, 64, false).unwrap();
        assert_eq!(p.as_ptr() as usize % PAGE, 0);
        // Page-aligned requests never get an offset.
        let reg = registry(Config::default());
        let arena = Arena::new(&reg, 0);
        let p = arena.alloc_large(&reg, 4 * PAGE, 4 * PAGE, false).unwrap();
        assert_eq!(p.as_ptr() as usize % (4 * PAGE), 0);
    }

    #[test]
    fn deallocations_tick_decay() {
        let reg = registry(Config {
            dirty_decay: DecayTime::Millis(1),
            decay_ticks: 4,
            ..Config::default()
        });
        let arena = Arena::new(&reg, 0);
        let ptrs: Vec<_> = (0..4)
            .map(|_| arena.alloc_large(&reg, 4 * PAGE, PAGE, false).unwrap())
            .collect();
        for p in &ptrs[..3] {
            let entry = reg.emap.lookup(p.as_ptr() as usize).unwrap();
            unsafe { arena.dalloc(&reg, *p, entry) };
        }
        assert_eq!(arena.stats().pages.dirty_pages, 12);
        let entry = reg.emap.lookup(ptrs[3].as_ptr() as usize).unwrap();
        unsafe { arena.dalloc(&reg, ptrs[3], entry) };
        // The clock has not moved, so the fourth tick purges nothing.
        assert_eq!(arena.stats().pages.dirty_pages, 16);
        assert_eq!(arena.purge(&reg), 16);
        assert_eq!(arena.stats().pages.dirty_pages, 0);
        valid(&reg, &arena);
    }

    #[test]
    fn unknown_class() {
        let reg = registry(Config::default());
        let arena = Arena::new(&reg, 0);
        let nbins = classes().nbins();
        assert_eq!(
            arena.alloc_small(&reg, nbins, false),
            Err(AllocError::InvalidSizeClass(nbins))
        );
    }
}
