//! A radix tree from page addresses to packed extent metadata.
//!
//! The 36 significant page-number bits of a 48-bit address are consumed in
//! three levels of 12 bits each:
//!
//! ```text
//!  47        36 35        24 23        12 11         0
//! [ root index | mid index  | leaf index | page offset ]
//! ```
//!
//! Interior nodes and leaves are created on first use, from the bootstrap
//! allocator, and live until the tree's owner tears down the base. Reads walk
//! the tree without locking; a thread-local cache of recently used leaves
//! skips the walk entirely most of the time.

use core::cell::RefCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;
use static_assertions::const_assert;

use crate::base::Base;
use crate::error::AllocError;
use crate::extent::ExtentId;
use crate::hooks::ExtentHooks;
use crate::size_class::LG_PAGE;
use crate::sync::Mutex;
use crate::witness::LockRank;

const LG_VADDR: u32 = 48;
const LG_FANOUT: u32 = 12;
const FANOUT: usize = 1 << LG_FANOUT;
const LEAF_SHIFT: u32 = LG_PAGE;
const MID_SHIFT: u32 = LEAF_SHIFT + LG_FANOUT;
const ROOT_SHIFT: u32 = MID_SHIFT + LG_FANOUT;

const_assert!(ROOT_SHIFT + LG_FANOUT == LG_VADDR);

const ID_BITS: u32 = 32;
const SZIND_BITS: u32 = 8;
const ARENA_BITS: u32 = 16;
const SZIND_SHIFT: u32 = ID_BITS;
const ARENA_SHIFT: u32 = SZIND_SHIFT + SZIND_BITS;
const SLAB_SHIFT: u32 = ARENA_SHIFT + ARENA_BITS;
const NO_SZIND: u64 = (1 << SZIND_BITS) - 1;

const_assert!(SLAB_SHIFT < u64::BITS);

/// Upper bound on the number of arenas a leaf entry can name.
pub const MAX_ARENAS: usize = 1 << ARENA_BITS;

/// The metadata stored for each page of a registered extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    pub id: ExtentId,
    /// Size class of the allocation the page belongs to, if active.
    pub szind: Option<usize>,
    pub arena: u16,
    pub slab: bool,
}

impl LeafEntry {
    pub fn pack(&self) -> u64 {
        let szind = match self.szind {
            Some(ind) => {
                debug_assert!((ind as u64) < NO_SZIND);
                ind as u64
            }
            None => NO_SZIND,
        };
        self.id.get() as u64
            | szind << SZIND_SHIFT
            | (self.arena as u64) << ARENA_SHIFT
            | (self.slab as u64) << SLAB_SHIFT
    }

    /// `None` for an empty slot.
    pub fn unpack(word: u64) -> Option<LeafEntry> {
        let id = ExtentId::new((word & ((1 << ID_BITS) - 1)) as u32)?;
        let szind = (word >> SZIND_SHIFT) & NO_SZIND;
        Some(LeafEntry {
            id,
            szind: if szind == NO_SZIND {
                None
            } else {
                Some(szind as usize)
            },
            arena: (word >> ARENA_SHIFT) as u16,
            slab: (word >> SLAB_SHIFT) & 1 == 1,
        })
    }
}

type Leaf = [AtomicU64; FANOUT];

struct NodePtr<T>(NonNull<T>);

// Nodes are immutable once published, apart from the atomics they contain.
unsafe impl<T> Send for NodePtr<T> {}
unsafe impl<T> Sync for NodePtr<T> {}

type Mid = [Once<NodePtr<Leaf>>; FANOUT];

#[derive(Clone, Copy)]
struct CacheEntry {
    uid: u64,
    key: usize,
    leaf: *const Leaf,
}

const EMPTY: CacheEntry = CacheEntry {
    uid: 0,
    key: 0,
    leaf: core::ptr::null(),
};

const L1_SIZE: usize = 16;
const L2_SIZE: usize = 8;

/// Recently used leaves: a direct-mapped tier backed by a small LRU tier.
struct LookupCache {
    l1: [CacheEntry; L1_SIZE],
    l2: [CacheEntry; L2_SIZE],
}

impl LookupCache {
    fn get(&mut self, uid: u64, key: usize) -> Option<*const Leaf> {
        let slot = key % L1_SIZE;
        let hit = self.l1[slot];
        if hit.uid == uid && hit.key == key {
            return Some(hit.leaf);
        }
        let pos = self.l2.iter().position(|e| e.uid == uid && e.key == key)?;
        let found = self.l2[pos];
        // Promote into the direct-mapped slot; the displaced entry goes to
        // the front of the LRU tier.
        self.l2.copy_within(0..pos, 1);
        self.l2[0] = self.l1[slot];
        self.l1[slot] = found;
        Some(found.leaf)
    }

    fn insert(&mut self, uid: u64, key: usize, leaf: *const Leaf) {
        let slot = key % L1_SIZE;
        self.l2.copy_within(0..L2_SIZE - 1, 1);
        self.l2[0] = self.l1[slot];
        self.l1[slot] = CacheEntry { uid, key, leaf };
    }
}

thread_local! {
    static CACHE: RefCell<LookupCache> = const {
        RefCell::new(LookupCache {
            l1: [EMPTY; L1_SIZE],
            l2: [EMPTY; L2_SIZE],
        })
    };
}

pub struct Rtree {
    uid: u64,
    root: Box<[Once<NodePtr<Mid>>]>,
    init_lock: Mutex<()>,
}

#[inline]
fn subkey(addr: usize, shift: u32) -> usize {
    (addr >> shift) & (FANOUT - 1)
}

#[inline]
fn leaf_key(addr: usize) -> usize {
    addr >> MID_SHIFT
}

/// Allocate a node of `FANOUT` values from the base, initializing every slot.
fn alloc_node<T>(
    base: &Base,
    hooks: &dyn ExtentHooks,
    init: impl Fn() -> T,
) -> Result<NonNull<[T; FANOUT]>, AllocError> {
    let ptr = base.alloc(
        hooks,
        core::mem::size_of::<[T; FANOUT]>(),
        core::mem::align_of::<[T; FANOUT]>(),
    )?;
    let node = ptr.cast::<T>();
    for i in 0..FANOUT {
        unsafe { node.as_ptr().add(i).write(init()) };
    }
    Ok(ptr.cast())
}

impl Rtree {
    /// `uid` must be unique among all trees that ever exist in the process;
    /// it keys the thread-local lookup cache.
    pub fn new(uid: u64) -> Self {
        debug_assert!(uid != 0);
        Rtree {
            uid,
            root: (0..FANOUT).map(|_| Once::new()).collect(),
            init_lock: Mutex::new(LockRank::RtreeInit, ()),
        }
    }

    fn walk(&self, addr: usize) -> Option<&Leaf> {
        let mid = self.root[subkey(addr, ROOT_SHIFT)].get()?;
        let mid = unsafe { mid.0.as_ref() };
        let leaf = mid[subkey(addr, MID_SHIFT)].get()?;
        Some(unsafe { leaf.0.as_ref() })
    }

    fn leaf(&self, addr: usize) -> Option<&Leaf> {
        debug_assert!((addr as u64) >> LG_VADDR == 0, "address {:#x} out of range", addr);
        let key = leaf_key(addr);
        let cached = CACHE
            .try_with(|c| c.borrow_mut().get(self.uid, key))
            .ok()
            .flatten();
        if let Some(leaf) = cached {
            return Some(unsafe { &*leaf });
        }
        let leaf = self.walk(addr)?;
        let _ = CACHE.try_with(|c| c.borrow_mut().insert(self.uid, key, leaf));
        Some(leaf)
    }

    /// Make sure the leaf covering `addr` exists.
    pub fn ensure(
        &self,
        base: &Base,
        hooks: &dyn ExtentHooks,
        addr: usize,
    ) -> Result<(), AllocError> {
        if self.leaf(addr).is_some() {
            return Ok(());
        }
        let mid = self.root[subkey(addr, ROOT_SHIFT)].try_call_once(|| {
            let _guard = self.init_lock.lock();
            alloc_node(base, hooks, Once::new).map(NodePtr)
        })?;
        let mid = unsafe { mid.0.as_ref() };
        mid[subkey(addr, MID_SHIFT)].try_call_once(|| {
            let _guard = self.init_lock.lock();
            alloc_node(base, hooks, || AtomicU64::new(0)).map(NodePtr)
        })?;
        Ok(())
    }

    /// Read the slot for `addr`'s page.
    #[inline]
    pub fn read(&self, addr: usize) -> Option<LeafEntry> {
        let leaf = self.leaf(addr)?;
        LeafEntry::unpack(leaf[subkey(addr, LEAF_SHIFT)].load(Ordering::Acquire))
    }

    /// Write the slot for `addr`'s page. The leaf must already exist.
    #[inline]
    pub fn write(&self, addr: usize, entry: Option<LeafEntry>) {
        let word = entry.map(|e| e.pack()).unwrap_or(0);
        match self.leaf(addr) {
            Some(leaf) => leaf[subkey(addr, LEAF_SHIFT)].store(word, Ordering::Release),
            None => debug_assert!(false, "write to {:#x} without a leaf", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::hooks::ToyVm;
    use crate::size_class::PAGE;

    fn entry(id: u32, szind: Option<usize>, arena: u16, slab: bool) -> LeafEntry {
        LeafEntry {
            id: ExtentId::new(id).unwrap(),
            szind,
            arena,
            slab,
        }
    }

    #[test]
    fn packing() {
        let e = entry(u32::MAX, Some(231), 65535, true);
        assert_eq!(LeafEntry::unpack(e.pack()), Some(e));
        let e = entry(7, None, 0, false);
        assert_eq!(LeafEntry::unpack(e.pack()), Some(e));
        assert_eq!(LeafEntry::unpack(0), None);
    }

    #[test]
    fn write_then_read() {
        let vm = ToyVm::with_capacity(8 << 20);
        let base = Base::new();
        let tree = Rtree::new(1 << 40);
        let addr = 0x7f12_3456_7000usize;

        assert_eq!(tree.read(addr), None);
        tree.ensure(&base, &vm, addr).unwrap();
        assert_eq!(tree.read(addr), None);

        let e = entry(3, Some(4), 1, true);
        tree.write(addr, Some(e));
        assert_eq!(tree.read(addr), Some(e));
        assert_eq!(tree.read(addr + PAGE - 1), Some(e));
        assert_eq!(tree.read(addr + PAGE), None);
        tree.write(addr, None);
        assert_eq!(tree.read(addr), None);
        unsafe { base.teardown(&vm) };
    }

    #[test]
    fn trees_do_not_share_cache_entries() {
        let vm = ToyVm::with_capacity(8 << 20);
        let base = Base::new();
        let a = Rtree::new((1 << 40) + 1);
        let b = Rtree::new((1 << 40) + 2);
        let addr = 0x5555_0000_0000usize;
        a.ensure(&base, &vm, addr).unwrap();
        b.ensure(&base, &vm, addr).unwrap();
        a.write(addr, Some(entry(1, None, 0, false)));
        b.write(addr, Some(entry(2, None, 0, false)));
        for _ in 0..3 {
            assert_eq!(a.read(addr).unwrap().id.get(), 1);
            assert_eq!(b.read(addr).unwrap().id.get(), 2);
        }
        unsafe { base.teardown(&vm) };
    }

    #[test]
    fn many_leaves_through_the_cache() {
        let vm = ToyVm::with_capacity(64 << 20);
        let base = Base::new();
        let tree = Rtree::new((1 << 40) + 3);
        // More distinct leaves than both cache tiers hold.
        let addrs: Vec<usize> = (0..40).map(|i| 0x1000_0000_0000 + (i << MID_SHIFT)).collect();
        for (i, &addr) in addrs.iter().enumerate() {
            tree.ensure(&base, &vm, addr).unwrap();
            tree.write(addr, Some(entry(i as u32 + 1, None, 0, false)));
        }
        for _ in 0..2 {
            for (i, &addr) in addrs.iter().enumerate() {
                assert_eq!(tree.read(addr).unwrap().id.get(), i as u32 + 1);
            }
        }
        unsafe { base.teardown(&vm) };
    }

    #[test]
    fn node_allocation_failure() {
        let vm = ToyVm::with_capacity(PAGE);
        let base = Base::new();
        let tree = Rtree::new((1 << 40) + 4);
        assert_eq!(
            tree.ensure(&base, &vm, 0x2000_0000_0000),
            Err(AllocError::OutOfMemory)
        );
        assert_eq!(tree.read(0x2000_0000_0000), None);
    }
}
