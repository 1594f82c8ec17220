//! Extent descriptors and the table that stores them.
//!
//! Descriptors are addressed by [`ExtentId`], a non-zero index into a table
//! of fixed-size chunks carved from the bootstrap allocator. Collections
//! (extent sets, bins) store ids, never pointers, and each descriptor sits
//! behind its own leaf lock.

use core::num::NonZeroU32;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::base::Base;
use crate::bitmap::SlabBitmap;
use crate::error::AllocError;
use crate::hooks::ExtentHooks;
use crate::rtree::LeafEntry;
use crate::sync::Mutex;
use crate::witness::LockRank;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtentId(NonZeroU32);

impl ExtentId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ExtentId)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    fn slot(self) -> (usize, usize) {
        let index = (self.get() - 1) as usize;
        (index / CHUNK_LEN, index % CHUNK_LEN)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtentState {
    Active,
    Dirty,
    Muzzy,
    Retained,
}

/// Everything the allocator knows about one contiguous range of pages.
#[derive(Clone, Copy, Debug)]
pub struct Extent {
    pub addr: usize,
    pub size: usize,
    pub state: ExtentState,
    pub arena: u16,
    /// Size class of the allocation this extent backs, while active.
    pub szind: Option<usize>,
    pub slab: bool,
    pub committed: bool,
    /// Known to read as zeroes.
    pub zeroed: bool,
    /// Creation order; merged extents keep the older serial.
    pub serial: u64,
    /// Free regions, for slabs.
    pub nfree: usize,
    pub bitmap: SlabBitmap,
}

impl Extent {
    pub fn new(addr: usize, size: usize, state: ExtentState, arena: u16, serial: u64) -> Self {
        Extent {
            addr,
            size,
            state,
            arena,
            szind: None,
            slab: false,
            committed: true,
            zeroed: false,
            serial,
            nfree: 0,
            bitmap: SlabBitmap::default(),
        }
    }

    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    /// The address map entry for this extent's pages.
    pub fn leaf_entry(&self, id: ExtentId) -> LeafEntry {
        LeafEntry {
            id,
            szind: self.szind,
            arena: self.arena,
            slab: self.slab,
        }
    }
}

impl Default for Extent {
    fn default() -> Self {
        Extent::new(0, 0, ExtentState::Retained, 0, 0)
    }
}

const CHUNK_LEN: usize = 1024;
const MAX_CHUNKS: usize = 16 * 1024;

type Chunk = [Mutex<Extent>; CHUNK_LEN];

/// Storage for every descriptor ever created.
///
/// Chunks are published once and never move, so a reference to a descriptor
/// stays valid for the lifetime of the table.
pub struct ExtentTable {
    chunks: Box<[AtomicPtr<Chunk>]>,
}

impl Default for ExtentTable {
    fn default() -> Self {
        ExtentTable::new()
    }
}

impl ExtentTable {
    pub fn new() -> Self {
        ExtentTable {
            chunks: (0..MAX_CHUNKS).map(|_| AtomicPtr::new(null_mut())).collect(),
        }
    }

    /// Largest id the table can hold.
    pub fn capacity(&self) -> usize {
        MAX_CHUNKS * CHUNK_LEN
    }

    /// Make storage for `id` available. Called with increasing ids from the
    /// descriptor cache, under its lock.
    pub fn reserve(
        &self,
        base: &Base,
        hooks: &dyn ExtentHooks,
        id: ExtentId,
    ) -> Result<(), AllocError> {
        let (chunk, _) = id.slot();
        if chunk >= MAX_CHUNKS {
            return Err(AllocError::OutOfMemory);
        }
        if !self.chunks[chunk].load(Ordering::Acquire).is_null() {
            return Ok(());
        }
        let ptr = base.alloc(
            hooks,
            core::mem::size_of::<Chunk>(),
            core::mem::align_of::<Chunk>(),
        )?;
        let entries = ptr.cast::<Mutex<Extent>>();
        for i in 0..CHUNK_LEN {
            unsafe {
                entries
                    .as_ptr()
                    .add(i)
                    .write(Mutex::new(LockRank::Descriptor, Extent::default()))
            };
        }
        self.chunks[chunk].store(ptr.cast::<Chunk>().as_ptr(), Ordering::Release);
        log::debug!("extent table: chunk {} ready", chunk);
        Ok(())
    }

    /// The lock around `id`'s descriptor. `id` must have been reserved.
    pub fn get(&self, id: ExtentId) -> &Mutex<Extent> {
        let (chunk, index) = id.slot();
        let ptr = self.chunks[chunk].load(Ordering::Acquire);
        assert!(!ptr.is_null(), "unreserved extent id {}", id.get());
        unsafe { &(*ptr)[index] }
    }

    /// Copy of `id`'s descriptor.
    pub fn snapshot(&self, id: ExtentId) -> Extent {
        *self.get(id).lock()
    }

    /// Update `id`'s descriptor, returning the new value.
    pub fn update(&self, id: ExtentId, f: impl FnOnce(&mut Extent)) -> Extent {
        let mut extent = self.get(id).lock();
        f(&mut extent);
        *extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::hooks::ToyVm;
    use crate::size_class::PAGE;

    #[test]
    fn ids_map_to_distinct_slots() {
        let vm = ToyVm::with_capacity(16 << 20);
        let base = Base::new();
        let table = ExtentTable::new();
        let ids: Vec<ExtentId> = [1, 2, 1024, 1025, 3000]
            .iter()
            .map(|&i| ExtentId::new(i).unwrap())
            .collect();
        for &id in &ids {
            table.reserve(&base, &vm, id).unwrap();
            table.update(id, |e| e.addr = id.get() as usize * PAGE);
        }
        for &id in &ids {
            assert_eq!(table.snapshot(id).addr, id.get() as usize * PAGE);
        }
        // 1, 2 share a chunk; 1024 is the last of the first chunk.
        assert_eq!(ExtentId::new(1024).unwrap().slot(), (0, 1023));
        assert_eq!(ExtentId::new(1025).unwrap().slot(), (1, 0));
        unsafe { base.teardown(&vm) };
    }

    #[test]
    fn zero_is_not_an_id() {
        assert!(ExtentId::new(0).is_none());
    }
}
