//! The page allocator: extents of whole pages for one arena.
//!
//! Free extents live in three tiers:
//!
//! - **dirty**: freed, contents intact, still backed by memory;
//! - **muzzy**: lazily purged, the OS may reclaim the pages at any time;
//! - **retained**: decommitted or force-purged, only the address range is
//!   kept.
//!
//! Requests are served from the first tier that has a fit, in that order,
//! and only then by mapping new address space. Pages flow from dirty to muzzy
//! to retained as the decay engines allow.
//!
//! Lock order within one arena: grow, then one tier at a time. Decay locks
//! are never held while a tier is purged.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{debug, trace, warn};

use crate::allocators::Registry;
use crate::config::Config;
use crate::decay::{Decay, DecayTime};
use crate::error::{AllocError, HookError};
use crate::extent::{Extent, ExtentId, ExtentState};
use crate::extent_cache::FastCache;
use crate::extent_set::ExtentSet;
use crate::size_class::{classes, HUGEPAGE, PAGE};
use crate::stats::{PageStats, PurgeStats, Validity};
use crate::sync::Mutex;
use crate::witness::LockRank;

/// The two tiers that decay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PurgeState {
    Dirty,
    Muzzy,
}

struct Tier {
    set: Mutex<ExtentSet>,
    npages: AtomicUsize,
}

impl Tier {
    fn new(state: ExtentState, delay_coalesce: bool) -> Self {
        Tier {
            set: Mutex::new(LockRank::Extents, ExtentSet::new(state, delay_coalesce)),
            npages: AtomicUsize::new(0),
        }
    }

    /// Run `f` on the locked set, keeping the lock-free page count current.
    fn with<R>(&self, f: impl FnOnce(&mut ExtentSet) -> R) -> R {
        let mut set = self.set.lock();
        let result = f(&mut set);
        self.npages.store(set.npages(), Ordering::Relaxed);
        result
    }

    fn npages(&self) -> usize {
        self.npages.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PurgeCounters {
    npurge: AtomicU64,
    nmadvise: AtomicU64,
    purged: AtomicU64,
}

impl PurgeCounters {
    fn snapshot(&self) -> PurgeStats {
        PurgeStats {
            npurge: self.npurge.load(Ordering::Relaxed),
            nmadvise: self.nmadvise.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

/// Growth of retained address space, in page-size class indices.
struct Grow {
    next: usize,
    limit: usize,
}

pub struct PageAllocator {
    arena: u16,
    dirty: Tier,
    muzzy: Tier,
    retained: Tier,
    grow: Mutex<Grow>,
    decay_dirty: Mutex<Decay>,
    decay_muzzy: Mutex<Decay>,
    fast: FastCache,
    lg_max_active_fit: u32,
    dirty_counters: PurgeCounters,
    muzzy_counters: PurgeCounters,
    active_pages: AtomicUsize,
    mapped: AtomicUsize,
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Running out of address space is an ordinary out-of-memory condition.
fn map_failed(e: HookError) -> AllocError {
    match e {
        HookError::Exhausted => AllocError::OutOfMemory,
        e => AllocError::Hook(e),
    }
}

impl PageAllocator {
    pub fn new(arena: u16, config: &Config, now: u64, seed: u64) -> Self {
        let sc = classes();
        let limit = sc.psz_floor_index(config.retain_grow_limit.max(PAGE));
        let next = sc.psz_ceil_index(HUGEPAGE).min(limit);
        PageAllocator {
            arena,
            dirty: Tier::new(ExtentState::Dirty, true),
            muzzy: Tier::new(ExtentState::Muzzy, false),
            retained: Tier::new(ExtentState::Retained, false),
            grow: Mutex::new(LockRank::ExtentGrow, Grow { next, limit }),
            decay_dirty: Mutex::new(
                LockRank::Decay,
                Decay::new(config.dirty_decay, config.decay_kernel, now, seed),
            ),
            decay_muzzy: Mutex::new(
                LockRank::Decay,
                Decay::new(
                    config.muzzy_decay,
                    config.decay_kernel,
                    now,
                    seed.rotate_left(32),
                ),
            ),
            fast: FastCache::new(config.fast_cache_depth),
            lg_max_active_fit: config.lg_max_active_fit,
            dirty_counters: PurgeCounters::default(),
            muzzy_counters: PurgeCounters::default(),
            active_pages: AtomicUsize::new(0),
            mapped: AtomicUsize::new(0),
        }
    }

    fn tier(&self, state: PurgeState) -> &Tier {
        match state {
            PurgeState::Dirty => &self.dirty,
            PurgeState::Muzzy => &self.muzzy,
        }
    }

    fn decay_lock(&self, state: PurgeState) -> &Mutex<Decay> {
        match state {
            PurgeState::Dirty => &self.decay_dirty,
            PurgeState::Muzzy => &self.decay_muzzy,
        }
    }

    fn counters(&self, state: PurgeState) -> &PurgeCounters {
        match state {
            PurgeState::Dirty => &self.dirty_counters,
            PurgeState::Muzzy => &self.muzzy_counters,
        }
    }

    fn new_descriptor(&self, reg: &Registry) -> Result<ExtentId, AllocError> {
        match self.fast.get() {
            Some(id) => Ok(id),
            None => reg
                .descriptors
                .get(&reg.extents, &reg.base, reg.hooks()),
        }
    }

    fn release_descriptor(&self, reg: &Registry, id: ExtentId) {
        self.fast.put(&reg.descriptors, id);
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate an extent of `size` bytes (a page multiple) at `align`, and
    /// mark it active for size class `szind`.
    pub fn alloc(
        &self,
        reg: &Registry,
        size: usize,
        align: usize,
        zero: bool,
        szind: Option<usize>,
        slab: bool,
    ) -> Result<ExtentId, AllocError> {
        debug_assert!(size >= PAGE && size % PAGE == 0);
        let align = align.max(PAGE);

        let id = match self.recycle(reg, &self.dirty, size, align)? {
            Some(id) => id,
            None => match self.recycle(reg, &self.muzzy, size, align)? {
                Some(id) => id,
                None => self.alloc_retained(reg, size, align)?,
            },
        };

        let mut was_zeroed = false;
        let extent = reg.extents.update(id, |e| {
            was_zeroed = e.zeroed;
            e.zeroed = false;
            e.state = ExtentState::Active;
            e.szind = szind;
            e.slab = slab;
        });
        reg.emap.remap(id, &extent);
        if zero && !was_zeroed {
            unsafe { core::ptr::write_bytes(extent.addr as *mut u8, 0, extent.size) };
        }
        self.active_pages
            .fetch_add(extent.size / PAGE, Ordering::Relaxed);
        Ok(id)
    }

    /// Take a fit out of `tier`, split it down to the request and commit it.
    fn recycle(
        &self,
        reg: &Registry,
        tier: &Tier,
        size: usize,
        align: usize,
    ) -> Result<Option<ExtentId>, AllocError> {
        let cap = if core::ptr::eq(tier, &self.dirty) {
            Some(self.lg_max_active_fit)
        } else {
            None
        };
        let found = tier.with(|set| set.take_fit(size, align, cap));
        let (id, addr, esize) = match found {
            Some(found) => found,
            None => return Ok(None),
        };
        let id = self.split_to_fit(reg, tier, id, addr, esize, size, align)?;
        self.commit(reg, tier, id)?;
        Ok(Some(id))
    }

    /// Cut `[addr, addr + esize)` down to an aligned `size` bytes, returning
    /// the leading and trailing remainders to `tier`. On failure the whole
    /// extent goes back.
    #[allow(clippy::too_many_arguments)]
    fn split_to_fit(
        &self,
        reg: &Registry,
        tier: &Tier,
        id: ExtentId,
        addr: usize,
        esize: usize,
        size: usize,
        align: usize,
    ) -> Result<ExtentId, AllocError> {
        let lead = align_up(addr, align) - addr;
        debug_assert!(lead + size <= esize);
        let trail = esize - lead - size;

        let mut id = id;
        if lead != 0 {
            match self.split(reg, id, lead) {
                Ok(rest) => {
                    self.record(reg, tier, id);
                    id = rest;
                }
                Err(e) => {
                    self.record(reg, tier, id);
                    return Err(e);
                }
            }
        }
        if trail != 0 {
            match self.split(reg, id, size) {
                Ok(rest) => self.record(reg, tier, rest),
                Err(e) => {
                    self.record(reg, tier, id);
                    return Err(e);
                }
            }
        }
        Ok(id)
    }

    fn commit(&self, reg: &Registry, tier: &Tier, id: ExtentId) -> Result<(), AllocError> {
        let extent = reg.extents.snapshot(id);
        if extent.committed {
            return Ok(());
        }
        match unsafe { reg.hooks().commit(extent.addr as *mut u8, extent.size) } {
            Ok(()) => {
                reg.extents.update(id, |e| {
                    e.committed = true;
                    e.zeroed = true;
                });
                Ok(())
            }
            Err(e) => {
                warn!("commit of {} bytes at {:#x} failed: {}", extent.size, extent.addr, e);
                self.record(reg, tier, id);
                Err(e.into())
            }
        }
    }

    fn alloc_retained(&self, reg: &Registry, size: usize, align: usize) -> Result<ExtentId, AllocError> {
        let mut grow = self.grow.lock();
        if let Some(id) = self.recycle(reg, &self.retained, size, align)? {
            return Ok(id);
        }
        if !reg.config.retain {
            drop(grow);
            return self.map_exact(reg, size, align);
        }
        self.grow_retained(reg, &mut grow, size, align)
    }

    /// Map the next chunk of address space in the growth series, keep what the
    /// request needs and retain the rest.
    fn grow_retained(
        &self,
        reg: &Registry,
        grow: &mut Grow,
        size: usize,
        align: usize,
    ) -> Result<ExtentId, AllocError> {
        let sc = classes();
        let needed = size
            .checked_add(align - PAGE)
            .ok_or(AllocError::OutOfMemory)?;
        let mut pind = grow.next;
        while pind < sc.npsizes() && sc.psz_size(pind) < needed {
            pind += 1;
        }
        if pind >= sc.npsizes() || pind > grow.limit {
            debug!(
                "arena {}: {} bytes exceeds the growth limit of {} bytes",
                self.arena,
                needed,
                sc.psz_size(grow.limit)
            );
            return Err(AllocError::OutOfMemory);
        }
        let alloc_size = sc.psz_size(pind);
        let id = self.map_new(reg, alloc_size, PAGE)?;

        let doubled = sc.psz_ceil_index(alloc_size.saturating_mul(2));
        grow.next = doubled.min(grow.limit);
        debug!(
            "arena {}: grew by {} bytes for a {} byte request, next growth {} bytes",
            self.arena,
            alloc_size,
            size,
            sc.psz_size(grow.next)
        );

        let addr = reg.extents.snapshot(id).addr;
        let id = self.split_to_fit(reg, &self.retained, id, addr, alloc_size, size, align)?;
        self.commit(reg, &self.retained, id)?;
        Ok(id)
    }

    fn map_exact(&self, reg: &Registry, size: usize, align: usize) -> Result<ExtentId, AllocError> {
        let id = self.map_new(reg, size, align)?;
        self.commit(reg, &self.retained, id)?;
        Ok(id)
    }

    /// Map fresh address space and register it as a retained extent. Nothing
    /// is left behind on failure.
    fn map_new(&self, reg: &Registry, size: usize, align: usize) -> Result<ExtentId, AllocError> {
        let mapping = unsafe { reg.hooks().map(size, align) }.map_err(map_failed)?;
        let addr = mapping.addr.as_ptr();

        let id = match self.new_descriptor(reg) {
            Ok(id) => id,
            Err(e) => {
                let _ = unsafe { reg.hooks().unmap(addr, mapping.size) };
                return Err(e);
            }
        };
        let mut extent = Extent::new(
            addr as usize,
            mapping.size,
            ExtentState::Retained,
            self.arena,
            reg.next_serial(),
        );
        extent.committed = mapping.committed;
        extent.zeroed = mapping.zeroed;
        *reg.extents.get(id).lock() = extent;

        if let Err(e) = reg.emap.register(&reg.base, reg.hooks(), id, &extent) {
            self.release_descriptor(reg, id);
            let _ = unsafe { reg.hooks().unmap(addr, mapping.size) };
            return Err(e);
        }
        self.mapped.fetch_add(mapping.size, Ordering::Relaxed);
        Ok(id)
    }

    ////////////////////////////////////////////////////////////
    // Splitting and merging

    /// Split `id` at offset `at`; `id` keeps the head, the returned extent is
    /// the tail. The caller owns `id`.
    fn split(&self, reg: &Registry, id: ExtentId, at: usize) -> Result<ExtentId, AllocError> {
        let extent = reg.extents.snapshot(id);
        debug_assert!(at % PAGE == 0 && at > 0 && at < extent.size);
        reg.hooks()
            .split(extent.addr as *mut u8, extent.size, at)
            .map_err(|e| {
                warn!("split of {:#x}+{} at {} refused: {}", extent.addr, extent.size, at, e);
                AllocError::from(e)
            })?;
        let tail_id = self.new_descriptor(reg)?;

        let mut tail = extent;
        tail.addr = extent.addr + at;
        tail.size = extent.size - at;
        tail.nfree = 0;
        tail.bitmap = Default::default();
        *reg.extents.get(tail_id).lock() = tail;
        reg.extents.update(id, |e| e.size = at);
        reg.emap.remap(tail_id, &tail);
        trace!("split {:#x}+{} at {}", extent.addr, extent.size, at);
        Ok(tail_id)
    }

    /// Merge `b` into `a`, which must directly precede it. The caller owns
    /// both; `b`'s descriptor is released.
    fn merge(&self, reg: &Registry, a: ExtentId, b: ExtentId) -> Result<(), HookError> {
        let ea = reg.extents.snapshot(a);
        let eb = reg.extents.snapshot(b);
        debug_assert_eq!(ea.end(), eb.addr);
        reg.hooks()
            .merge(ea.addr as *mut u8, ea.size, eb.addr as *mut u8, eb.size)?;
        let merged = reg.extents.update(a, |e| {
            e.size += eb.size;
            e.serial = e.serial.min(eb.serial);
            e.zeroed &= eb.zeroed;
            e.committed &= eb.committed;
        });
        reg.emap.write_range(merged.leaf_entry(a), eb.addr, eb.size);
        self.release_descriptor(reg, b);
        trace!("merged {:#x}+{} and {:#x}+{}", ea.addr, ea.size, eb.addr, eb.size);
        Ok(())
    }

    /// Merge `id` with free neighbors in `set`, returning the surviving id.
    fn coalesce(&self, reg: &Registry, set: &mut ExtentSet, id: ExtentId) -> ExtentId {
        let mut id = id;
        loop {
            let extent = reg.extents.snapshot(id);
            let mut merged = false;

            if let Some(next) = reg.emap.try_acquire_neighbor(&reg.extents, extent.end()) {
                if next.extent.addr == extent.end() && self.mergeable(set, next.id, &next.extent) {
                    set.remove(next.id);
                    match self.merge(reg, id, next.id) {
                        Ok(()) => merged = true,
                        Err(e) => {
                            debug!("merge refused: {}", e);
                            set.insert(next.id, next.extent.addr, next.extent.size);
                        }
                    }
                }
            }

            if let Some(prev) = reg.emap.try_acquire_neighbor(&reg.extents, extent.addr - PAGE) {
                if prev.extent.end() == extent.addr && self.mergeable(set, prev.id, &prev.extent) {
                    set.remove(prev.id);
                    match self.merge(reg, prev.id, id) {
                        Ok(()) => {
                            id = prev.id;
                            merged = true;
                        }
                        Err(e) => {
                            debug!("merge refused: {}", e);
                            set.insert(prev.id, prev.extent.addr, prev.extent.size);
                        }
                    }
                }
            }

            if !merged {
                return id;
            }
        }
    }

    fn mergeable(&self, set: &ExtentSet, id: ExtentId, extent: &Extent) -> bool {
        extent.arena == self.arena && extent.state == set.state() && set.contains(id)
    }

    /// Insert an extent (already in `tier`'s state) into `tier`, coalescing
    /// first unless the tier delays it.
    fn record(&self, reg: &Registry, tier: &Tier, id: ExtentId) {
        tier.with(|set| {
            let id = if set.delay_coalesce() {
                id
            } else {
                self.coalesce(reg, set, id)
            };
            let extent = reg.extents.snapshot(id);
            debug_assert_eq!(extent.state, set.state());
            set.insert(id, extent.addr, extent.size);
        });
    }

    ////////////////////////////////////////////////////////////
    // Resizing in place

    /// Grow active extent `id` to `size` bytes by taking over the free extent
    /// that directly follows it, and relabel it as class `szind`. Fails,
    /// leaving `id` as it was, if that neighbor is missing, busy or too small.
    pub fn expand(
        &self,
        reg: &Registry,
        id: ExtentId,
        size: usize,
        szind: usize,
    ) -> Result<(), AllocError> {
        let extent = reg.extents.snapshot(id);
        debug_assert_eq!(extent.state, ExtentState::Active);
        debug_assert!(size > extent.size && size % PAGE == 0);
        let need = size - extent.size;
        let end = extent.end();

        let tier = match reg.emap.try_acquire_neighbor(&reg.extents, end) {
            Some(next) => match next.extent.state {
                ExtentState::Dirty => &self.dirty,
                ExtentState::Muzzy => &self.muzzy,
                ExtentState::Retained => &self.retained,
                ExtentState::Active => return Err(AllocError::OutOfMemory),
            },
            None => return Err(AllocError::OutOfMemory),
        };
        let next = tier
            .with(|set| {
                let next = reg.emap.try_acquire_neighbor(&reg.extents, end)?;
                let fits = next.extent.addr == end
                    && next.extent.size >= need
                    && self.mergeable(set, next.id, &next.extent);
                if fits {
                    set.remove(next.id);
                }
                fits.then_some(next)
            })
            .ok_or(AllocError::OutOfMemory)?;

        if next.extent.size > need {
            match self.split(reg, next.id, need) {
                Ok(rest) => self.record(reg, tier, rest),
                Err(e) => {
                    self.record(reg, tier, next.id);
                    return Err(e);
                }
            }
        }
        self.commit(reg, tier, next.id)?;
        if let Err(e) = self.merge(reg, id, next.id) {
            debug!("merge refused: {}", e);
            self.record(reg, tier, next.id);
            return Err(e.into());
        }

        let extent = reg.extents.update(id, |e| e.szind = Some(szind));
        reg.emap.remap(id, &extent);
        self.active_pages.fetch_add(need / PAGE, Ordering::Relaxed);
        trace!("expanded {:#x} to {} bytes", extent.addr, extent.size);
        Ok(())
    }

    /// Cut active extent `id` down to `size` bytes, relabel it as class
    /// `szind`, and free the tail.
    pub fn shrink(
        &self,
        reg: &Registry,
        id: ExtentId,
        size: usize,
        szind: usize,
    ) -> Result<(), AllocError> {
        debug_assert_eq!(reg.extents.snapshot(id).state, ExtentState::Active);
        let tail = self.split(reg, id, size)?;
        let extent = reg.extents.update(id, |e| e.szind = Some(szind));
        reg.emap.remap(id, &extent);
        trace!("shrank {:#x} to {} bytes", extent.addr, extent.size);
        self.dalloc(reg, tail);
        Ok(())
    }

    ////////////////////////////////////////////////////////////
    // Deallocation and purging

    /// Return an active extent to the dirty tier.
    pub fn dalloc(&self, reg: &Registry, id: ExtentId) {
        let extent = reg.extents.update(id, |e| {
            debug_assert_eq!(e.state, ExtentState::Active);
            e.state = ExtentState::Dirty;
            e.szind = None;
            e.slab = false;
            e.nfree = 0;
        });
        reg.emap.remap(id, &extent);
        self.active_pages
            .fetch_sub(extent.size / PAGE, Ordering::Relaxed);
        self.record(reg, &self.dirty, id);

        if self.decay_dirty.lock().time() == DecayTime::Immediate {
            self.decay(reg, PurgeState::Dirty);
        }
    }

    /// Advance `state`'s decay engine and purge down to its limit. Returns the
    /// number of pages purged.
    pub fn decay(&self, reg: &Registry, state: PurgeState) -> usize {
        let lock = self.decay_lock(state);
        let tier = self.tier(state);

        let mut decay = lock.lock();
        if decay.is_purging() {
            return 0;
        }
        let current = tier.npages();
        decay.update(reg.now(), current);
        let limit = match decay.limit(current) {
            Some(limit) if current > limit => limit,
            _ => return 0,
        };
        decay.begin_purge();
        drop(decay);

        let purged = self.purge_to(reg, state, limit);

        let mut decay = lock.lock();
        decay.purged(purged);
        decay.end_purge();
        purged
    }

    /// Purge both tiers completely, regardless of decay settings.
    pub fn purge_all(&self, reg: &Registry) -> usize {
        self.fast.flush(&reg.descriptors);
        let mut total = 0;
        for state in [PurgeState::Dirty, PurgeState::Muzzy] {
            let lock = self.decay_lock(state);
            if !lock.lock().begin_purge() {
                continue;
            }
            let purged = self.purge_to(reg, state, 0);
            let mut decay = lock.lock();
            decay.purged(purged);
            decay.end_purge();
            total += purged;
        }
        total
    }

    /// Evict the oldest extents of `state`'s tier until it holds at most
    /// `limit` pages.
    fn purge_to(&self, reg: &Registry, state: PurgeState, limit: usize) -> usize {
        let tier = self.tier(state);
        let mut purged = 0;
        let mut nmadvise = 0;
        loop {
            let victim = tier.with(|set| {
                if set.npages() <= limit {
                    return None;
                }
                let id = set.oldest()?;
                set.remove(id);
                Some(if set.delay_coalesce() {
                    self.coalesce(reg, set, id)
                } else {
                    id
                })
            });
            let id = match victim {
                Some(id) => id,
                None => break,
            };
            let extent = reg.extents.snapshot(id);
            purged += extent.size / PAGE;
            nmadvise += 1;
            self.purge_extent(reg, state, id, extent);
        }

        if purged != 0 {
            let counters = self.counters(state);
            counters.npurge.fetch_add(1, Ordering::Relaxed);
            counters.nmadvise.fetch_add(nmadvise, Ordering::Relaxed);
            counters.purged.fetch_add(purged as u64, Ordering::Relaxed);
            debug!(
                "arena {}: purged {} {:?} pages in {} extents, limit {}",
                self.arena, purged, state, nmadvise, limit
            );
        }
        purged
    }

    /// Move one evicted extent to the next tier down, or out of the allocator.
    fn purge_extent(&self, reg: &Registry, state: PurgeState, id: ExtentId, extent: Extent) {
        let addr = extent.addr as *mut u8;
        let hooks = reg.hooks();

        if state == PurgeState::Dirty && self.decay_muzzy.lock().time() != DecayTime::Immediate {
            match unsafe { hooks.purge_lazy(addr, extent.size) } {
                Ok(()) => {
                    reg.extents.update(id, |e| {
                        e.state = ExtentState::Muzzy;
                        e.zeroed = false;
                    });
                    self.record(reg, &self.muzzy, id);
                    return;
                }
                Err(e) => debug!("lazy purge refused, purging harder: {}", e),
            }
        }

        if !reg.config.retain {
            reg.emap.deregister(&extent);
            if let Err(e) = unsafe { hooks.unmap(addr, extent.size) } {
                warn!("unmap of {:#x}+{} failed: {}", extent.addr, extent.size, e);
            }
            self.release_descriptor(reg, id);
            self.mapped.fetch_sub(extent.size, Ordering::Relaxed);
            return;
        }

        let (committed, zeroed) = match unsafe { hooks.decommit(addr, extent.size) } {
            Ok(()) => (false, false),
            Err(e) => {
                debug!("decommit refused, forcing a purge: {}", e);
                match unsafe { hooks.purge_forced(addr, extent.size) } {
                    Ok(()) => (true, true),
                    Err(e) => {
                        warn!("purge of {:#x}+{} failed: {}", extent.addr, extent.size, e);
                        (true, false)
                    }
                }
            }
        };
        reg.extents.update(id, |e| {
            e.state = ExtentState::Retained;
            e.committed = committed;
            e.zeroed = zeroed;
        });
        self.record(reg, &self.retained, id);
    }

    ////////////////////////////////////////////////////////////
    // Tuning and introspection

    pub fn decay_time(&self, state: PurgeState) -> DecayTime {
        self.decay_lock(state).lock().time()
    }

    pub fn set_decay_time(&self, reg: &Registry, state: PurgeState, time: DecayTime) {
        self.decay_lock(state).lock().reset(time, reg.now());
        debug!("arena {}: {:?} decay time set to {:?}", self.arena, state, time);
        self.decay(reg, state);
    }

    /// Descriptor ids parked in this arena's fast cache.
    pub fn cached_descriptors(&self) -> usize {
        self.fast.len()
    }

    pub fn stats(&self) -> PageStats {
        PageStats {
            active_pages: self.active_pages.load(Ordering::Relaxed),
            dirty_pages: self.dirty.npages(),
            muzzy_pages: self.muzzy.npages(),
            retained_pages: self.retained.npages(),
            mapped: self.mapped.load(Ordering::Relaxed),
            dirty_purge: self.dirty_counters.snapshot(),
            muzzy_purge: self.muzzy_counters.snapshot(),
        }
    }

    /// Cross-check every tier against the descriptors and the address map.
    pub fn validate(&self, reg: &Registry, validity: &mut Validity) {
        for tier in [&self.dirty, &self.muzzy, &self.retained] {
            let set = tier.set.lock();
            validity.set_mismatches += set.check();
            if set.npages() != tier.npages() {
                validity.set_mismatches += 1;
            }
            for (id, addr, size) in set.iter() {
                let extent = reg.extents.snapshot(id);
                if extent.state != set.state()
                    || extent.addr != addr
                    || extent.size != size
                    || extent.arena != self.arena
                {
                    validity.set_mismatches += 1;
                }
                let head = reg.emap.lookup(addr).map(|e| e.id);
                let last = reg.emap.lookup(addr + size - PAGE).map(|e| e.id);
                if head != Some(id) || last != Some(id) {
                    validity.map_mismatches += 1;
                }
            }
        }
    }

    /// Unmap every free extent. Used when the allocator is dropped.
    pub fn teardown(&self, reg: &Registry) {
        let hooks = reg.hooks();
        for tier in [&self.dirty, &self.muzzy, &self.retained] {
            let extents = tier.with(|set| set.drain());
            for (_, addr, size) in extents {
                if let Err(e) = unsafe { hooks.unmap(addr as *mut u8, size) } {
                    warn!("teardown unmap of {:#x}+{} failed: {}", addr, size, e);
                }
            }
        }
        self.fast.flush(&reg.descriptors);
    }
}
