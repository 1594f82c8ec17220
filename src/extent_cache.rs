//! Recycling of descriptor ids.
//!
//! [`DescriptorCache`] is shared by every arena: a locked free list in front
//! of the descriptor table. [`FastCache`] sits in front of it in each arena,
//! a handful of atomic slots that can be filled and emptied without taking
//! any lock.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::base::Base;
use crate::error::AllocError;
use crate::extent::{ExtentId, ExtentTable};
use crate::hooks::ExtentHooks;
use crate::sync::Mutex;
use crate::witness::LockRank;

struct Shared {
    free: Vec<ExtentId>,
    /// Next never-used id.
    fresh: u32,
}

pub struct DescriptorCache {
    inner: Mutex<Shared>,
    /// Ids waiting on the free list.
    count: AtomicUsize,
    /// Ids handed out and not yet returned.
    in_use: AtomicUsize,
}

impl Default for DescriptorCache {
    fn default() -> Self {
        DescriptorCache::new()
    }
}

impl DescriptorCache {
    pub fn new() -> Self {
        DescriptorCache {
            inner: Mutex::new(
                LockRank::DescriptorCache,
                Shared {
                    free: Vec::new(),
                    fresh: 1,
                },
            ),
            count: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// A recycled id, or a fresh one carved from the table.
    pub fn get(
        &self,
        table: &ExtentTable,
        base: &Base,
        hooks: &dyn ExtentHooks,
    ) -> Result<ExtentId, AllocError> {
        let mut shared = self.inner.lock();
        let id = match shared.free.pop() {
            Some(id) => {
                self.count.fetch_sub(1, Ordering::Relaxed);
                id
            }
            None => {
                let id = ExtentId::new(shared.fresh).ok_or(AllocError::OutOfMemory)?;
                table.reserve(base, hooks, id)?;
                shared.fresh += 1;
                id
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    pub fn put(&self, id: ExtentId) {
        let mut shared = self.inner.lock();
        debug_assert!(!shared.free.contains(&id), "double put of {:?}", id);
        shared.free.push(id);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Ids out of the cache: live descriptors plus those parked in fast
    /// caches.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Ids ever created.
    pub fn created(&self) -> usize {
        (self.inner.lock().fresh - 1) as usize
    }
}

const FAST_SLOTS: usize = 64;

/// A small lock-free stash of descriptor ids for one arena.
pub struct FastCache {
    slots: [AtomicU32; FAST_SLOTS],
    depth: usize,
}

impl FastCache {
    pub fn new(depth: usize) -> Self {
        const EMPTY: AtomicU32 = AtomicU32::new(0);
        let depth = depth.min(FAST_SLOTS);
        FastCache {
            slots: [EMPTY; FAST_SLOTS],
            depth,
        }
    }

    pub fn get(&self) -> Option<ExtentId> {
        for slot in &self.slots[..self.depth] {
            if slot.load(Ordering::Relaxed) == 0 {
                continue;
            }
            let raw = slot.swap(0, Ordering::Acquire);
            if let Some(id) = ExtentId::new(raw) {
                return Some(id);
            }
        }
        None
    }

    /// Stash `id`, spilling to `shared` when full. A cache of depth zero
    /// always spills.
    pub fn put(&self, shared: &DescriptorCache, id: ExtentId) {
        for slot in &self.slots[..self.depth] {
            if slot
                .compare_exchange(0, id.get(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
        shared.put(id);
    }

    /// Return every stashed id to `shared`.
    pub fn flush(&self, shared: &DescriptorCache) -> usize {
        let mut flushed = 0;
        for slot in &self.slots[..self.depth] {
            if let Some(id) = ExtentId::new(slot.swap(0, Ordering::Acquire)) {
                shared.put(id);
                flushed += 1;
            }
        }
        flushed
    }

    pub fn len(&self) -> usize {
        self.slots[..self.depth]
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != 0)
            .count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::hooks::ToyVm;

    #[test]
    fn recycles_before_carving() {
        let vm = ToyVm::with_capacity(8 << 20);
        let base = Base::new();
        let table = ExtentTable::new();
        let cache = DescriptorCache::new();

        let a = cache.get(&table, &base, &vm).unwrap();
        let b = cache.get(&table, &base, &vm).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.in_use(), 2);
        cache.put(a);
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.get(&table, &base, &vm).unwrap(), a);
        assert_eq!(cache.created(), 2);
        unsafe { base.teardown(&vm) };
    }

    #[test]
    fn fast_cache_spills_and_flushes() {
        let vm = ToyVm::with_capacity(8 << 20);
        let base = Base::new();
        let table = ExtentTable::new();
        let shared = DescriptorCache::new();
        let fast = FastCache::new(2);

        let ids: Vec<ExtentId> = (0..3)
            .map(|_| shared.get(&table, &base, &vm).unwrap())
            .collect();
        for &id in &ids {
            fast.put(&shared, id);
        }
        assert_eq!(fast.len(), 2);
        assert_eq!(shared.count(), 1);

        assert!(fast.get().is_some());
        assert_eq!(fast.flush(&shared), 1);
        assert!(fast.is_empty());
        assert_eq!(shared.count(), 2);

        let none = FastCache::new(0);
        none.put(&shared, ids[0]);
        assert!(none.is_empty());
        assert_eq!(shared.count(), 3);
        unsafe { base.teardown(&vm) };
    }
}
