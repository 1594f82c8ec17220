//! The allocator front end.
//!
//! ## [`Allocator`](struct.Allocator.html)
//!
//! An `Allocator` owns a set of arenas and all the metadata they share. It is
//! `Send + Sync`; every thread that uses it is bound on first use to the
//! arena with the fewest threads, and allocates from that arena from then on.
//! Any thread may free any allocation: the address map knows which arena
//! owns it.
//!
//! ## [`Registry`](struct.Registry.html)
//!
//! The shared state behind an `Allocator`: the hook table, the bootstrap
//! allocator, the descriptor table and cache, the address map, the
//! configuration and the clock. Arenas are created lazily the first time a
//! thread is bound to them.
//!
//! Dropping the allocator unmaps everything it ever mapped, including live
//! allocations.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, trace, warn};
use spin::Once;

use crate::arena::Arena;
use crate::background::BackgroundPurger;
use crate::base::Base;
use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::decay::DecayTime;
use crate::emap::Emap;
use crate::error::AllocError;
use crate::extent::{ExtentId, ExtentState, ExtentTable};
use crate::extent_cache::DescriptorCache;
use crate::hooks::ExtentHooks;
use crate::pages::PurgeState;
use crate::size_class::classes;
use crate::stats::{DescriptorStats, Stats, Validity};
use crate::sync::Mutex;
use crate::witness::{self, LockRank};

/// Registry ids key thread-local caches, so they are never reused.
static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Uids of registries that have not been dropped.
static LIVE: Mutex<BTreeSet<u64>> = Mutex::new(LockRank::LiveRegistries, BTreeSet::new());

thread_local! {
    /// `(registry uid, arena index)` for every live allocator this thread has
    /// used. Entries of dropped registries are pruned on the next binding.
    static BINDINGS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

pub struct Registry {
    uid: u64,
    hooks: Box<dyn ExtentHooks>,
    clock: Box<dyn Clock>,
    pub config: Config,
    pub base: Base,
    pub extents: ExtentTable,
    pub descriptors: DescriptorCache,
    pub emap: Emap,
    arenas: Box<[Once<Arena>]>,
    /// Serializes thread binding.
    binding: Mutex<()>,
    serial: AtomicU64,
}

impl Registry {
    pub fn new(
        hooks: Box<dyn ExtentHooks>,
        config: Config,
        clock: Box<dyn Clock>,
    ) -> Result<Self, AllocError> {
        config.validate()?;
        let uid = NEXT_UID.fetch_add(1, Ordering::Relaxed);
        debug!("registry {}: {}", uid, config);
        LIVE.lock().insert(uid);
        Ok(Registry {
            uid,
            hooks,
            clock,
            arenas: (0..config.narenas).map(|_| Once::new()).collect(),
            config,
            base: Base::new(),
            extents: ExtentTable::new(),
            descriptors: DescriptorCache::new(),
            emap: Emap::new(uid),
            binding: Mutex::new(LockRank::Registry, ()),
            serial: AtomicU64::new(0),
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn hooks(&self) -> &dyn ExtentHooks {
        &*self.hooks
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    pub fn narenas(&self) -> usize {
        self.arenas.len()
    }

    /// Arena `index`, created if this is its first use.
    pub fn arena(&self, index: usize) -> Result<&Arena, AllocError> {
        let once = self
            .arenas
            .get(index)
            .ok_or(AllocError::InvalidArena(index))?;
        Ok(once.call_once(|| Arena::new(self, index)))
    }

    /// Arenas that have been created so far.
    pub fn arenas(&self) -> impl Iterator<Item = &Arena> + '_ {
        self.arenas.iter().filter_map(Once::get)
    }

    /// The calling thread's arena, binding the thread on first use.
    pub fn thread_arena(&self) -> Result<&Arena, AllocError> {
        let cached = BINDINGS
            .try_with(|b| {
                b.borrow()
                    .iter()
                    .find(|&&(uid, _)| uid == self.uid)
                    .map(|&(_, index)| index)
            })
            .ok()
            .flatten();
        match cached {
            Some(index) => self.arena(index),
            None => {
                let arena = self.bind()?;
                let _ = BINDINGS.try_with(|b| {
                    let mut bindings = b.borrow_mut();
                    let live = LIVE.lock();
                    bindings.retain(|&(uid, _)| live.contains(&uid));
                    bindings.push((self.uid, arena.index()));
                });
                Ok(arena)
            }
        }
    }

    /// Pick the arena with the fewest bound threads, lowest index first.
    fn bind(&self) -> Result<&Arena, AllocError> {
        let _guard = self.binding.lock();
        let load = |i: usize| {
            self.arenas[i]
                .get()
                .map_or(0, |a| a.nthreads().load(Ordering::Relaxed))
        };
        let index = (0..self.arenas.len())
            .min_by_key(|&i| load(i))
            .ok_or(AllocError::InvalidArena(0))?;
        let arena = self.arena(index)?;
        arena.nthreads().fetch_add(1, Ordering::Relaxed);
        debug!("registry {}: thread bound to arena {}", self.uid, index);
        Ok(arena)
    }

    /// Allocate from `arena`, dispatching on size and alignment.
    pub fn alloc_in(
        &self,
        arena: &Arena,
        layout: Layout,
        zero: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        witness::assert_lockless();
        let sc = classes();
        let usable = sc
            .aligned_usable_size(layout.size().max(1), layout.align())
            .ok_or(AllocError::OutOfMemory)?;
        if usable < sc.large_min() {
            let class = sc.size_to_index(usable).ok_or(AllocError::OutOfMemory)?;
            arena.alloc_small(self, class, zero)
        } else {
            arena.alloc_large(self, usable, layout.align(), zero)
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation from this registry.
    pub unsafe fn dealloc(&self, ptr: NonNull<u8>) {
        witness::assert_lockless();
        let entry = match self.emap.lookup(ptr.as_ptr() as usize) {
            Some(entry) => entry,
            None => {
                debug_assert!(false, "freeing unknown pointer {:p}", ptr);
                return;
            }
        };
        match self.arenas.get(entry.arena as usize).and_then(Once::get) {
            Some(arena) => arena.dalloc(self, ptr, entry),
            None => debug_assert!(false, "pointer {:p} from a missing arena", ptr),
        }
    }

    /// Resize the large allocation at `ptr` to `usable` bytes (a large class
    /// size) without moving it. Returns false, with nothing changed, when the
    /// pages cannot be grown or cut in place.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this registry.
    pub unsafe fn resize_in_place(&self, ptr: NonNull<u8>, usable: usize, align: usize) -> bool {
        witness::assert_lockless();
        if usable < classes().large_min() || ptr.as_ptr() as usize % align != 0 {
            return false;
        }
        let entry = match self.emap.lookup(ptr.as_ptr() as usize) {
            Some(entry) if !entry.slab => entry,
            _ => return false,
        };
        match self.arenas.get(entry.arena as usize).and_then(Once::get) {
            Some(arena) => match arena.resize_large(self, entry, usable) {
                Ok(()) => true,
                Err(e) => {
                    trace!("in-place resize of {:p} to {} failed: {}", ptr, usable, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Usable size of the allocation at `ptr`, if this registry owns it.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let entry = self.emap.lookup(ptr.as_ptr() as usize)?;
        entry.szind.map(|i| classes().index_to_size(i))
    }

    pub fn stats(&self) -> Stats {
        let parked: usize = self.arenas().map(|a| a.pages().cached_descriptors()).sum();
        Stats {
            arenas: self.arenas().map(Arena::stats).collect(),
            base: self.base.stats(),
            descriptors: DescriptorStats {
                created: self.descriptors.created(),
                in_use: self.descriptors.in_use().saturating_sub(parked),
                cached: self.descriptors.count() + parked,
            },
        }
    }

    pub fn validate(&self) -> Validity {
        let mut validity = Validity::default();
        for arena in self.arenas() {
            arena.validate(self, &mut validity);
        }
        validity
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        LIVE.lock().remove(&self.uid);
        for arena in self.arenas() {
            arena.pages().teardown(self);
        }
        // Whatever is still registered as active is a live allocation.
        let hooks = self.hooks();
        let mut live = 0;
        for raw in 1..=self.descriptors.created() as u32 {
            let id = match ExtentId::new(raw) {
                Some(id) => id,
                None => continue,
            };
            let extent = self.extents.snapshot(id);
            if extent.state != ExtentState::Active
                || self.emap.lookup(extent.addr).map(|e| e.id) != Some(id)
            {
                continue;
            }
            live += 1;
            if let Err(e) = unsafe { hooks.unmap(extent.addr as *mut u8, extent.size) } {
                warn!("teardown unmap of {:#x}+{} failed: {}", extent.addr, extent.size, e);
            }
        }
        unsafe { self.base.teardown(hooks) };
        debug!("registry {} torn down with {} live extents", self.uid, live);
    }
}

/// A concurrent allocator with size-classed slabs, tiered free-page caches
/// and time-based purging.
///
/// ```
/// use core::alloc::Layout;
/// use tiered_alloc::{Allocator, Config, ToyVm};
///
/// let alloc = Allocator::new(ToyVm::default(), Config::default()).unwrap();
/// let ptr = alloc.alloc(Layout::new::<[u64; 4]>()).unwrap();
/// assert!(alloc.usable_size(ptr).unwrap() >= 32);
/// unsafe { alloc.dealloc(ptr) };
/// ```
pub struct Allocator {
    // Stopped before the registry goes away.
    background: Option<BackgroundPurger>,
    inner: Arc<Registry>,
}

impl Allocator {
    pub fn new(hooks: impl ExtentHooks + 'static, config: Config) -> Result<Self, AllocError> {
        Allocator::with_clock(hooks, config, MonotonicClock::default())
    }

    /// An allocator whose decay runs on `clock`.
    pub fn with_clock(
        hooks: impl ExtentHooks + 'static,
        config: Config,
        clock: impl Clock + 'static,
    ) -> Result<Self, AllocError> {
        let inner = Arc::new(Registry::new(Box::new(hooks), config, Box::new(clock))?);
        let background = if inner.config.background_thread {
            Some(BackgroundPurger::spawn(inner.clone())?)
        } else {
            None
        };
        Ok(Allocator { background, inner })
    }

    /// An allocator over the OS's virtual memory, configured from
    /// `TIERED_ALLOC_CONF`.
    #[cfg(feature = "use_libc")]
    pub fn unix() -> Result<Self, AllocError> {
        Allocator::new(crate::unix::LibcHooks::new()?, Config::from_env()?)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn narenas(&self) -> usize {
        self.inner.narenas()
    }

    /// The arena the calling thread allocates from.
    pub fn thread_arena(&self) -> Result<usize, AllocError> {
        self.inner.thread_arena().map(Arena::index)
    }

    pub fn has_background_thread(&self) -> bool {
        self.background.as_ref().map_or(false, BackgroundPurger::is_running)
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate memory fitting `layout`. Zero-sized layouts get a minimal
    /// allocation.
    pub fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let arena = self.inner.thread_arena()?;
        self.inner.alloc_in(arena, layout, false)
    }

    pub fn alloc_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let arena = self.inner.thread_arena()?;
        self.inner.alloc_in(arena, layout, true)
    }

    /// Allocate from a specific arena instead of the thread's.
    pub fn alloc_in(&self, arena: usize, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let arena = self.inner.arena(arena)?;
        self.inner.alloc_in(arena, layout, false)
    }

    /// Free an allocation. The layout is not needed.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and not been freed since.
    pub unsafe fn dealloc(&self, ptr: NonNull<u8>) {
        self.inner.dealloc(ptr)
    }

    /// Resize an allocation. Large allocations grow into free pages that
    /// follow them or give back their tail without moving; anything else
    /// moves. On error the original allocation is untouched.
    ///
    /// # Safety
    ///
    /// As for [`dealloc`](Self::dealloc).
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let old = self.inner.usable_size(ptr).ok_or(AllocError::OutOfMemory)?;
        let new = classes()
            .aligned_usable_size(layout.size().max(1), layout.align())
            .ok_or(AllocError::OutOfMemory)?;
        if new == old && ptr.as_ptr() as usize % layout.align() == 0 {
            return Ok(ptr);
        }
        if old >= classes().large_min() && self.inner.resize_in_place(ptr, new, layout.align()) {
            return Ok(ptr);
        }
        let moved = self.alloc(layout)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old.min(layout.size()));
        self.dealloc(ptr);
        Ok(moved)
    }

    /// Usable size of an allocation, or `None` if this allocator does not own
    /// `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.inner.usable_size(ptr)
    }

    ////////////////////////////////////////////////////////////
    // Bulk interface

    /// Allocate up to `count` regions of small class `class` with a single
    /// bin lock. Returns fewer only if memory ran out part way.
    pub fn refill(&self, class: usize, count: usize) -> Result<Vec<NonNull<u8>>, AllocError> {
        let arena = self.inner.thread_arena()?;
        let bin = arena.bin(class)?;
        let mut out = Vec::with_capacity(count);
        if count != 0 {
            bin.refill(&self.inner, arena.pages(), count, &mut out)?;
        }
        Ok(out)
    }

    /// Free regions of small class `class`, one bin lock per arena they came
    /// from. Nothing is freed if any pointer is unknown.
    ///
    /// # Safety
    ///
    /// Every pointer must be a live allocation of class `class` from this
    /// allocator.
    pub unsafe fn drain(&self, class: usize, ptrs: &[NonNull<u8>]) -> Result<(), AllocError> {
        if class >= classes().nbins() {
            return Err(AllocError::InvalidSizeClass(class));
        }
        let mut batch = Vec::with_capacity(ptrs.len());
        for &ptr in ptrs {
            let entry = self
                .inner
                .emap
                .lookup(ptr.as_ptr() as usize)
                .ok_or(AllocError::UnknownPointer(ptr.as_ptr() as usize))?;
            debug_assert!(entry.slab && entry.szind == Some(class));
            batch.push((entry.arena as usize, ptr, entry.id));
        }
        batch.sort_unstable_by_key(|&(arena, ptr, _)| (arena, ptr.as_ptr() as usize));

        let mut rest = &batch[..];
        while let Some(&(index, _, _)) = rest.first() {
            let len = rest.iter().take_while(|&&(a, _, _)| a == index).count();
            let (group, tail) = rest.split_at(len);
            rest = tail;

            let arena = self.inner.arena(index)?;
            let regions: Vec<_> = group.iter().map(|&(_, ptr, id)| (ptr, id)).collect();
            arena.bin(class)?.drain(&self.inner, arena.pages(), &regions);
            arena.tick(&self.inner, regions.len() as u32);
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////
    // Tuning

    pub fn decay_time(&self, arena: usize, state: PurgeState) -> Result<DecayTime, AllocError> {
        Ok(self.inner.arena(arena)?.pages().decay_time(state))
    }

    /// Change an arena's decay time for one tier, purging at once if the new
    /// time calls for it.
    pub fn set_decay_time(
        &self,
        arena: usize,
        state: PurgeState,
        time: DecayTime,
    ) -> Result<(), AllocError> {
        let time = time.validate()?;
        let arena = self.inner.arena(arena)?;
        arena.pages().set_decay_time(&self.inner, state, time);
        Ok(())
    }

    /// Purge every dirty and muzzy page of one arena. Returns pages purged.
    pub fn purge(&self, arena: usize) -> Result<usize, AllocError> {
        Ok(self.inner.arena(arena)?.purge(&self.inner))
    }

    /// Purge every dirty and muzzy page of every arena.
    pub fn purge_all(&self) -> usize {
        self.inner.arenas().map(|a| a.purge(&self.inner)).sum()
    }

    /// Run every arena's decay engines now.
    pub fn decay(&self) -> usize {
        decay_all(&self.inner)
    }

    ////////////////////////////////////////////////////////////
    // Introspection

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Check every invariant the allocator can see. Meant for tests and
    /// debugging; it takes every bin and extent set lock in turn.
    pub fn validate(&self) -> Validity {
        self.inner.validate()
    }
}

/// One decay pass over every created arena.
pub(crate) fn decay_all(reg: &Registry) -> usize {
    reg.arenas().map(|a| a.decay(reg)).sum()
}
