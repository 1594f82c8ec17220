//! Bins: small-object allocation out of slabs.
//!
//! A slab is an active extent carved into equal regions of one size class,
//! with a bitmap of allocated regions kept in its descriptor. Each bin owns
//! the slabs of one class in one arena:
//!
//! - `current`: the slab allocations are served from. It always has at least
//!   one free region.
//! - `nonfull`: other slabs with free regions, by address.
//! - `full`: slabs with no free regions, by address.
//!
//! The lowest-addressed slab with room is preferred, which keeps live objects
//! packed towards low addresses and lets high slabs drain and be returned to
//! the page allocator.

use core::ptr::NonNull;
use std::collections::BTreeMap;

use crate::allocators::Registry;
use crate::bitmap::SlabBitmap;
use crate::error::AllocError;
use crate::extent::{ExtentId, ExtentState};
use crate::pages::PageAllocator;
use crate::size_class::{classes, BinInfo, PAGE};
use crate::stats::{BinStats, Validity};
use crate::sync::Mutex;
use crate::witness::LockRank;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slab {
    addr: usize,
    id: ExtentId,
}

#[derive(Default)]
struct BinState {
    current: Option<Slab>,
    nonfull: BTreeMap<usize, ExtentId>,
    full: BTreeMap<usize, ExtentId>,
    nslabs: usize,
    curregs: usize,
    nmalloc: u64,
    ndalloc: u64,
    nfills: u64,
    nflushes: u64,
}

pub struct Bin {
    class: usize,
    info: BinInfo,
    state: Mutex<BinState>,
}

impl Bin {
    /// A bin for small class `class`, or `None` if `class` is not a small
    /// class.
    pub fn new(class: usize) -> Option<Self> {
        let info = *classes().bin_info(class)?;
        Some(Bin {
            class,
            info,
            state: Mutex::new(LockRank::Bin, BinState::default()),
        })
    }

    pub fn class(&self) -> usize {
        self.class
    }

    pub fn info(&self) -> &BinInfo {
        &self.info
    }

    /// Allocate one region.
    pub fn alloc(&self, reg: &Registry, pages: &PageAllocator) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        let ptr = self.alloc_locked(reg, pages, &mut state)?;
        state.nmalloc += 1;
        Ok(ptr)
    }

    /// Allocate up to `count` regions under one lock, appending them to
    /// `out`. Fails only if not even one region could be allocated.
    pub fn refill(
        &self,
        reg: &Registry,
        pages: &PageAllocator,
        count: usize,
        out: &mut Vec<NonNull<u8>>,
    ) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        let before = out.len();
        for _ in 0..count {
            match self.alloc_locked(reg, pages, &mut state) {
                Ok(ptr) => out.push(ptr),
                Err(e) if out.len() == before => return Err(e),
                Err(e) => {
                    log::debug!("class {} refill stopped early: {}", self.class, e);
                    break;
                }
            }
        }
        state.nmalloc += (out.len() - before) as u64;
        state.nfills += 1;
        Ok(())
    }

    fn alloc_locked(
        &self,
        reg: &Registry,
        pages: &PageAllocator,
        state: &mut BinState,
    ) -> Result<NonNull<u8>, AllocError> {
        loop {
            let slab = match state.current {
                Some(slab) => slab,
                None => match state.nonfull.pop_first() {
                    Some((addr, id)) => Slab { addr, id },
                    None => self.new_slab(reg, pages, state)?,
                },
            };

            let mut region = None;
            let extent = reg.extents.update(slab.id, |e| {
                region = e.bitmap.claim();
                if region.is_some() {
                    e.nfree -= 1;
                }
            });

            match region {
                Some(region) => {
                    state.current = if extent.nfree == 0 {
                        state.full.insert(slab.addr, slab.id);
                        None
                    } else {
                        Some(slab)
                    };
                    state.curregs += 1;
                    let addr = slab.addr + region * self.info.reg_size;
                    // Slab addresses are never null.
                    return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
                }
                None => {
                    debug_assert!(false, "slab {:#x} had no free region", slab.addr);
                    state.full.insert(slab.addr, slab.id);
                    state.current = None;
                }
            }
        }
    }

    fn new_slab(
        &self,
        reg: &Registry,
        pages: &PageAllocator,
        state: &mut BinState,
    ) -> Result<Slab, AllocError> {
        let info = self.info;
        let id = pages.alloc(reg, info.slab_size, PAGE, false, Some(self.class), true)?;
        let extent = reg.extents.update(id, |e| {
            e.bitmap = SlabBitmap::new(info.nregs);
            e.nfree = info.nregs;
        });
        state.nslabs += 1;
        Ok(Slab {
            addr: extent.addr,
            id,
        })
    }

    /// Free one region of slab `id`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live region of this bin's class in slab `id`.
    pub unsafe fn free(&self, reg: &Registry, pages: &PageAllocator, ptr: NonNull<u8>, id: ExtentId) {
        let empty = {
            let mut state = self.state.lock();
            state.ndalloc += 1;
            self.free_locked(reg, &mut state, ptr, id)
        };
        if let Some(id) = empty {
            pages.dalloc(reg, id);
        }
    }

    /// Free a batch of regions under one lock.
    ///
    /// # Safety
    ///
    /// As for [`free`](Self::free), for every pair.
    pub unsafe fn drain(
        &self,
        reg: &Registry,
        pages: &PageAllocator,
        regions: &[(NonNull<u8>, ExtentId)],
    ) {
        let mut empty = Vec::new();
        {
            let mut state = self.state.lock();
            for &(ptr, id) in regions {
                empty.extend(self.free_locked(reg, &mut state, ptr, id));
            }
            state.ndalloc += regions.len() as u64;
            state.nflushes += 1;
        }
        for id in empty {
            pages.dalloc(reg, id);
        }
    }

    /// Clear the region's bit. Returns the slab if it is now empty and has
    /// left the bin.
    fn free_locked(
        &self,
        reg: &Registry,
        state: &mut BinState,
        ptr: NonNull<u8>,
        id: ExtentId,
    ) -> Option<ExtentId> {
        let info = self.info;
        let extent = reg.extents.update(id, |e| {
            debug_assert!(e.slab && e.szind == Some(self.class));
            let offset = ptr.as_ptr() as usize - e.addr;
            debug_assert_eq!(offset % info.reg_size, 0, "pointer inside a region");
            e.bitmap.unset(offset / info.reg_size);
            e.nfree += 1;
        });
        state.curregs -= 1;
        let slab = Slab {
            addr: extent.addr,
            id,
        };

        if extent.nfree == info.nregs {
            if state.current == Some(slab) {
                state.current = None;
            } else if state.nonfull.remove(&slab.addr).is_none() {
                state.full.remove(&slab.addr);
            }
            state.nslabs -= 1;
            return Some(id);
        }

        if extent.nfree == 1 {
            // It was full.
            state.full.remove(&slab.addr);
            match state.current {
                None => state.current = Some(slab),
                Some(current) if slab.addr < current.addr => {
                    state.nonfull.insert(current.addr, current.id);
                    state.current = Some(slab);
                }
                Some(_) => {
                    state.nonfull.insert(slab.addr, id);
                }
            }
        }
        None
    }

    pub fn stats(&self) -> BinStats {
        let state = self.state.lock();
        BinStats {
            class: self.class,
            reg_size: self.info.reg_size,
            nregs: self.info.nregs,
            slabs: state.nslabs,
            full_slabs: state.full.len(),
            curregs: state.curregs,
            nmalloc: state.nmalloc,
            ndalloc: state.ndalloc,
            nfills: state.nfills,
            nflushes: state.nflushes,
        }
    }

    /// Check slab placement, bitmaps and counters.
    pub fn validate(&self, reg: &Registry, validity: &mut Validity) {
        let state = self.state.lock();
        let nregs = self.info.nregs;

        let mut slabs = Vec::new();
        if let Some(current) = state.current {
            slabs.push((current, Place::Current));
            if state.nonfull.contains_key(&current.addr) || state.full.contains_key(&current.addr) {
                validity.bin_mismatches += 1;
            }
        }
        for (&addr, &id) in &state.nonfull {
            slabs.push((Slab { addr, id }, Place::NonFull));
            if state.full.contains_key(&addr) {
                validity.bin_mismatches += 1;
            }
        }
        for (&addr, &id) in &state.full {
            slabs.push((Slab { addr, id }, Place::Full));
        }

        let mut curregs = 0;
        for &(slab, place) in &slabs {
            let extent = reg.extents.snapshot(slab.id);
            curregs += nregs - extent.nfree;
            let placed = match place {
                Place::Current => extent.nfree > 0,
                Place::NonFull => extent.nfree > 0 && extent.nfree < nregs,
                Place::Full => extent.nfree == 0,
            };
            if !placed
                || extent.addr != slab.addr
                || extent.state != ExtentState::Active
                || !extent.slab
                || extent.szind != Some(self.class)
                || extent.bitmap.count_set(nregs) != nregs - extent.nfree
            {
                validity.bin_mismatches += 1;
            }
            if reg.emap.lookup(slab.addr).map(|e| e.id) != Some(slab.id) {
                validity.map_mismatches += 1;
            }
        }

        if slabs.len() != state.nslabs || curregs != state.curregs {
            validity.bin_mismatches += 1;
        }
    }
}

#[derive(Clone, Copy)]
enum Place {
    Current,
    NonFull,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Arc;

    use test_log::test;

    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::decay::DecayTime;
    use crate::hooks::ToyVm;

    struct Fixture {
        reg: Registry,
        pages: PageAllocator,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config {
                narenas: 1,
                dirty_decay: DecayTime::Never,
                ..Config::default()
            };
            let reg = Registry::new(
                Box::new(Arc::new(ToyVm::default())),
                config,
                Box::new(ManualClock::new(0)),
            )
            .unwrap();
            let pages = PageAllocator::new(0, &reg.config, 0, 1);
            Fixture { reg, pages }
        }

        fn valid(&self, bin: &Bin) {
            let mut validity = Validity::default();
            bin.validate(&self.reg, &mut validity);
            self.pages.validate(&self.reg, &mut validity);
            assert!(validity.is_valid(), "{:?}", validity);
        }

        fn id_of(&self, ptr: NonNull<u8>) -> ExtentId {
            self.reg.emap.lookup(ptr.as_ptr() as usize).unwrap().id
        }
    }

    #[test]
    fn fills_lowest_slab_first() {
        let f = Fixture::new();
        let bin = Bin::new(0).unwrap();
        let nregs = bin.info().nregs;
        let reg_size = bin.info().reg_size;

        let ptrs: Vec<_> = (0..nregs + 1)
            .map(|_| bin.alloc(&f.reg, &f.pages).unwrap())
            .collect();
        let first = ptrs[0].as_ptr() as usize;
        for (i, p) in ptrs[..nregs].iter().enumerate() {
            assert_eq!(p.as_ptr() as usize, first + i * reg_size);
        }
        let stats = bin.stats();
        assert_eq!(stats.slabs, 2);
        assert_eq!(stats.full_slabs, 1);
        assert_eq!(stats.curregs, nregs + 1);
        f.valid(&bin);

        // Freeing from the full, lower slab makes it current again.
        let hole = ptrs[7];
        unsafe { bin.free(&f.reg, &f.pages, hole, f.id_of(hole)) };
        assert_eq!(bin.stats().full_slabs, 0);
        assert_eq!(bin.alloc(&f.reg, &f.pages).unwrap(), hole);
        f.valid(&bin);
    }

    #[test]
    fn empty_slabs_return_to_the_page_allocator() {
        let f = Fixture::new();
        let class = 3;
        let bin = Bin::new(class).unwrap();
        let nregs = bin.info().nregs;
        let ptrs: Vec<_> = (0..3 * nregs)
            .map(|_| bin.alloc(&f.reg, &f.pages).unwrap())
            .collect();
        assert_eq!(ptrs.iter().collect::<HashSet<_>>().len(), ptrs.len());
        let slab_pages = bin.info().slab_size / PAGE;
        assert_eq!(f.pages.stats().active_pages, 3 * slab_pages);

        for &p in &ptrs[nregs..] {
            unsafe { bin.free(&f.reg, &f.pages, p, f.id_of(p)) };
        }
        assert_eq!(bin.stats().slabs, 1);
        assert_eq!(f.pages.stats().active_pages, slab_pages);
        assert_eq!(f.pages.stats().dirty_pages, 2 * slab_pages);
        f.valid(&bin);

        for &p in &ptrs[..nregs] {
            unsafe { bin.free(&f.reg, &f.pages, p, f.id_of(p)) };
        }
        let stats = bin.stats();
        assert_eq!(stats.slabs, 0);
        assert_eq!(stats.curregs, 0);
        assert_eq!(stats.nmalloc, stats.ndalloc);
        assert_eq!(f.pages.stats().active_pages, 0);
        f.valid(&bin);
    }

    #[test]
    fn refill_and_drain_batches() {
        let f = Fixture::new();
        let bin = Bin::new(10).unwrap();
        let mut out = Vec::new();
        bin.refill(&f.reg, &f.pages, 100, &mut out).unwrap();
        assert_eq!(out.len(), 100);
        let stats = bin.stats();
        assert_eq!((stats.nfills, stats.nmalloc, stats.curregs), (1, 100, 100));
        f.valid(&bin);

        let batch: Vec<_> = out.iter().map(|&p| (p, f.id_of(p))).collect();
        unsafe { bin.drain(&f.reg, &f.pages, &batch) };
        let stats = bin.stats();
        assert_eq!((stats.nflushes, stats.ndalloc, stats.curregs), (1, 100, 0));
        assert_eq!(stats.slabs, 0);
        f.valid(&bin);
    }

    #[test]
    fn regions_do_not_overlap() {
        let f = Fixture::new();
        let bin = Bin::new(20).unwrap();
        let size = bin.info().reg_size;
        let ptrs: Vec<_> = (0..50)
            .map(|_| bin.alloc(&f.reg, &f.pages).unwrap())
            .collect();
        for (i, p) in ptrs.iter().enumerate() {
            unsafe { core::ptr::write_bytes(p.as_ptr(), i as u8, size) };
        }
        for (i, p) in ptrs.iter().enumerate() {
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn no_bins_for_large_classes() {
        assert!(Bin::new(classes().nbins()).is_none());
        assert!(Bin::new(classes().nbins() - 1).is_some());
    }
}
