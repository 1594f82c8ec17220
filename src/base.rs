//! The bootstrap allocator.
//!
//! Metadata (radix tree nodes, descriptor table chunks) is carved from large
//! blocks obtained straight from the hooks. Nothing is ever freed
//! individually; every block is returned on teardown.
//!
//! Each block starts with a header linking it to the previously mapped block:
//!
//! ```text
//!   blocks -> [hdr|....used....|..free..] -> [hdr|......used......] -> null
//!                               ^cursor ^end
//! ```

use core::ptr::{null_mut, NonNull};

use log::debug;
use static_assertions::const_assert;

use crate::error::AllocError;
use crate::hooks::ExtentHooks;
use crate::size_class::{round_up, CACHELINE, PAGE};
use crate::sync::Mutex;
use crate::witness::LockRank;

const BLOCK_MIN: usize = 256 << 10;
const BLOCK_MAX: usize = 4 << 20;

#[repr(C, align(64))]
struct BlockHeader {
    next: *mut BlockHeader,
    size: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const_assert!(HEADER_SIZE % CACHELINE == 0);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BaseStats {
    /// Bytes handed out, after rounding.
    pub allocated: usize,
    /// Bytes mapped for blocks, headers included.
    pub mapped: usize,
    pub blocks: usize,
}

struct BaseInner {
    blocks: *mut BlockHeader,
    cursor: usize,
    end: usize,
    next_block_size: usize,
    stats: BaseStats,
}

// The block list is only touched under the base lock.
unsafe impl Send for BaseInner {}

pub struct Base {
    inner: Mutex<BaseInner>,
}

impl Default for Base {
    fn default() -> Self {
        Base::new()
    }
}

impl BaseInner {
    fn grow(&mut self, hooks: &dyn ExtentHooks, needed: usize) -> Result<(), AllocError> {
        let size = round_up(needed + HEADER_SIZE, PAGE).max(self.next_block_size);
        let mapping = unsafe { hooks.map(size, PAGE) }.map_err(|e| {
            debug!("base: mapping a {} byte block failed: {}", size, e);
            AllocError::OutOfMemory
        })?;
        let ptr = mapping.addr.as_ptr();
        if !mapping.committed {
            if let Err(e) = unsafe { hooks.commit(ptr, mapping.size) } {
                debug!("base: committing a {} byte block failed: {}", size, e);
                let _ = unsafe { hooks.unmap(ptr, mapping.size) };
                return Err(AllocError::OutOfMemory);
            }
        }

        let header = ptr as *mut BlockHeader;
        unsafe {
            header.write(BlockHeader {
                next: self.blocks,
                size: mapping.size,
            });
        }
        self.blocks = header;
        self.cursor = ptr as usize + HEADER_SIZE;
        self.end = ptr as usize + mapping.size;
        self.next_block_size = (self.next_block_size * 2).min(BLOCK_MAX);
        self.stats.mapped += mapping.size;
        self.stats.blocks += 1;
        debug!(
            "base: mapped block {} of {} bytes at {:p}",
            self.stats.blocks, mapping.size, ptr
        );
        Ok(())
    }
}

impl Base {
    pub const fn new() -> Self {
        Base {
            inner: Mutex::new(
                LockRank::Base,
                BaseInner {
                    blocks: null_mut(),
                    cursor: 0,
                    end: 0,
                    next_block_size: BLOCK_MIN,
                    stats: BaseStats {
                        allocated: 0,
                        mapped: 0,
                        blocks: 0,
                    },
                },
            ),
        }
    }

    /// Allocate `size` bytes aligned to `align`, in whole cache lines. The
    /// memory is not initialized.
    pub fn alloc(
        &self,
        hooks: &dyn ExtentHooks,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(CACHELINE);
        let size = round_up(size.max(1), CACHELINE);

        let mut inner = self.inner.lock();
        let mut start = round_up(inner.cursor, align);
        if inner.blocks.is_null() || start + size > inner.end {
            inner.grow(hooks, size + align)?;
            start = round_up(inner.cursor, align);
        }
        debug_assert!(start + size <= inner.end);
        inner.cursor = start + size;
        inner.stats.allocated += size;
        // `start` lies inside a block returned by the hooks.
        Ok(unsafe { NonNull::new_unchecked(start as *mut u8) })
    }

    pub fn stats(&self) -> BaseStats {
        self.inner.lock().stats
    }

    /// Unmap every block.
    ///
    /// # Safety
    ///
    /// No pointer returned by `alloc` may be used afterwards.
    pub unsafe fn teardown(&self, hooks: &dyn ExtentHooks) {
        let mut inner = self.inner.lock();
        let mut block = inner.blocks;
        while !block.is_null() {
            let BlockHeader { next, size } = block.read();
            if let Err(e) = hooks.unmap(block as *mut u8, size) {
                log::warn!("base: unmapping block {:p} failed: {}", block, e);
            }
            block = next;
        }
        inner.blocks = null_mut();
        inner.cursor = 0;
        inner.end = 0;
        inner.stats = BaseStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::sync::atomic::Ordering;

    use test_log::test;

    use crate::hooks::ToyVm;

    #[test]
    fn carves_aligned_cache_lines() {
        let vm = ToyVm::with_capacity(8 << 20);
        let base = Base::new();
        let a = base.alloc(&vm, 10, 8).unwrap();
        let b = base.alloc(&vm, 100, 4096).unwrap();
        let c = base.alloc(&vm, 1, 1).unwrap();
        assert_eq!(a.as_ptr() as usize % CACHELINE, 0);
        assert_eq!(b.as_ptr() as usize % 4096, 0);
        assert!(c.as_ptr() as usize >= b.as_ptr() as usize + 128);
        let stats = base.stats();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.mapped, BLOCK_MIN);
        assert_eq!(stats.allocated, 64 + 128 + 64);
    }

    #[test]
    fn large_requests_get_their_own_block() {
        let vm = ToyVm::with_capacity(16 << 20);
        let base = Base::new();
        base.alloc(&vm, 64, 64).unwrap();
        let big = base.alloc(&vm, 1 << 20, PAGE).unwrap();
        unsafe { core::ptr::write_bytes(big.as_ptr(), 1, 1 << 20) };
        assert_eq!(base.stats().blocks, 2);

        unsafe { base.teardown(&vm) };
        assert_eq!(vm.counters.unmaps.load(Ordering::Relaxed), 2);
        assert_eq!(base.stats(), BaseStats::default());
    }

    #[test]
    fn failure_is_out_of_memory() {
        let vm = ToyVm::with_capacity(PAGE);
        let base = Base::new();
        assert_eq!(base.alloc(&vm, 64, 64), Err(AllocError::OutOfMemory));
    }
}
