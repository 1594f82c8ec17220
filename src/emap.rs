//! The address map: which extent owns each page.
//!
//! Every extent the allocator knows about, active or free, is registered
//! here for each of its pages. Lookups are lock-free. Writers are whoever
//! owns the extent at the time: the bin or page allocator that just took it
//! out of a collection.

use crate::base::Base;
use crate::error::AllocError;
use crate::extent::{Extent, ExtentId, ExtentTable};
use crate::hooks::ExtentHooks;
use crate::rtree::{LeafEntry, Rtree};
use crate::size_class::PAGE;

/// A neighbor seen through the address map, with a consistent copy of its
/// descriptor.
#[derive(Clone, Copy, Debug)]
pub struct Neighbor {
    pub id: ExtentId,
    pub extent: Extent,
}

pub struct Emap {
    rtree: Rtree,
}

/// Leaf keys change every 16 MiB; one address per leaf is enough to create it.
const LEAF_SPAN: usize = PAGE << 12;

impl Emap {
    pub fn new(uid: u64) -> Self {
        Emap {
            rtree: Rtree::new(uid),
        }
    }

    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<LeafEntry> {
        self.rtree.read(addr)
    }

    /// Map every page of `extent` to `id`.
    ///
    /// All tree nodes are created before the first slot is written, so a
    /// failure leaves nothing behind.
    pub fn register(
        &self,
        base: &Base,
        hooks: &dyn ExtentHooks,
        id: ExtentId,
        extent: &Extent,
    ) -> Result<(), AllocError> {
        debug_assert!(extent.size >= PAGE && extent.addr % PAGE == 0);
        let first = extent.addr / LEAF_SPAN;
        let last = (extent.end() - 1) / LEAF_SPAN;
        for leaf in first..=last {
            let addr = (leaf * LEAF_SPAN).max(extent.addr);
            self.rtree.ensure(base, hooks, addr)?;
        }
        self.remap(id, extent);
        Ok(())
    }

    /// Rewrite every page of `extent`, after a split, a merge, or a change of
    /// size class or slab flag. The pages must already be registered.
    pub fn remap(&self, id: ExtentId, extent: &Extent) {
        self.write_range(extent.leaf_entry(id), extent.addr, extent.size);
    }

    /// Point the pages of `[addr, addr + size)` at `entry`, head page last.
    pub fn write_range(&self, entry: LeafEntry, addr: usize, size: usize) {
        for page in (addr + PAGE..addr + size).step_by(PAGE) {
            self.rtree.write(page, Some(entry));
        }
        self.rtree.write(addr, Some(entry));
    }

    /// Clear every page of `extent`, head page first.
    pub fn deregister(&self, extent: &Extent) {
        self.rtree.write(extent.addr, None);
        for page in (extent.addr + PAGE..extent.end()).step_by(PAGE) {
            self.rtree.write(page, None);
        }
    }

    /// Resolve the extent covering `addr` and take a snapshot of its
    /// descriptor under its lock, re-checking that the mapping did not move
    /// while the lock was being taken.
    ///
    /// The snapshot is only a claim: the caller must still confirm ownership
    /// (for example, membership in an extent set it has locked) before acting
    /// on it.
    pub fn try_acquire_neighbor(&self, table: &ExtentTable, addr: usize) -> Option<Neighbor> {
        let entry = self.lookup(addr)?;
        let extent = {
            let guard = table.get(entry.id).lock();
            if self.lookup(addr).map(|e| e.id) != Some(entry.id) {
                return None;
            }
            *guard
        };
        if extent.addr > addr || extent.end() <= addr {
            return None;
        }
        Some(Neighbor {
            id: entry.id,
            extent,
        })
    }
}
