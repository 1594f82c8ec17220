//! The hook table: every interaction with virtual memory goes through an
//! [`ExtentHooks`] implementation.
//!
//! ## [`ExtentHooks`](trait.ExtentHooks.html)
//!
//! A small trait abstracting over the OS calls the allocator needs: mapping
//! and unmapping address space, committing and decommitting it, and the two
//! flavours of purge. Splitting and merging are notifications; a backend that
//! cannot treat two adjacent ranges as one refuses the merge.
//!
//! ## [`ToyVm`](struct.ToyVm.html)
//!
//! `ToyVm` is a single large zeroed region from the global allocator that
//! pretends to be a virtual address space, and implements `ExtentHooks` for
//! such a purpose. It counts every call, can be told to fail, and is mainly
//! useful for testing.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::HookError;
use crate::size_class::{round_up, PAGE};

/// A fresh range of address space returned by [`ExtentHooks::map`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub addr: NonNull<u8>,
    pub size: usize,
    /// The range is known to read as zeroes.
    pub zeroed: bool,
    /// The range is backed (readable and writable) without a `commit` call.
    pub committed: bool,
}

pub trait ExtentHooks: Send + Sync {
    /// Map at least `size` bytes aligned to `align` (a power of two, at least
    /// a page).
    ///
    /// # Safety
    ///
    /// The returned range must not overlap any range the allocator already
    /// manages, and must stay valid until it is passed to `unmap`.
    unsafe fn map(&self, size: usize, align: usize) -> Result<Mapping, HookError>;

    /// Return `[addr, addr + size)` to the system.
    ///
    /// # Safety
    ///
    /// The range must have come from `map` (possibly as part of a larger
    /// mapping), and no live allocation may remain in it.
    unsafe fn unmap(&self, addr: *mut u8, size: usize) -> Result<(), HookError>;

    /// Back the range with memory. After success the range reads as zeroes.
    ///
    /// # Safety
    ///
    /// The range must be mapped and owned by the caller.
    unsafe fn commit(&self, addr: *mut u8, size: usize) -> Result<(), HookError>;

    /// Release the backing memory, keeping the address range reserved.
    ///
    /// # Safety
    ///
    /// As for `commit`; the contents are lost.
    unsafe fn decommit(&self, addr: *mut u8, size: usize) -> Result<(), HookError>;

    /// Tell the system it may reclaim the pages whenever it likes. Contents are
    /// undefined afterwards but the range stays usable.
    ///
    /// # Safety
    ///
    /// As for `commit`; the contents are lost.
    unsafe fn purge_lazy(&self, addr: *mut u8, size: usize) -> Result<(), HookError>;

    /// Release the pages now. After success the range reads as zeroes.
    ///
    /// # Safety
    ///
    /// As for `commit`; the contents are lost.
    unsafe fn purge_forced(&self, addr: *mut u8, size: usize) -> Result<(), HookError>;

    /// `[addr, addr + size)` is about to be split at offset `at`.
    fn split(&self, _addr: *mut u8, _size: usize, _at: usize) -> Result<(), HookError> {
        Ok(())
    }

    /// The adjacent ranges `[a, a + a_size)` and `[b, b + b_size)` are about to
    /// become one extent.
    fn merge(
        &self,
        _a: *mut u8,
        _a_size: usize,
        _b: *mut u8,
        _b_size: usize,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

impl<H: ExtentHooks + ?Sized> ExtentHooks for std::sync::Arc<H> {
    unsafe fn map(&self, size: usize, align: usize) -> Result<Mapping, HookError> {
        (**self).map(size, align)
    }

    unsafe fn unmap(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        (**self).unmap(addr, size)
    }

    unsafe fn commit(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        (**self).commit(addr, size)
    }

    unsafe fn decommit(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        (**self).decommit(addr, size)
    }

    unsafe fn purge_lazy(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        (**self).purge_lazy(addr, size)
    }

    unsafe fn purge_forced(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        (**self).purge_forced(addr, size)
    }

    fn split(&self, addr: *mut u8, size: usize, at: usize) -> Result<(), HookError> {
        (**self).split(addr, size, at)
    }

    fn merge(
        &self,
        a: *mut u8,
        a_size: usize,
        b: *mut u8,
        b_size: usize,
    ) -> Result<(), HookError> {
        (**self).merge(a, a_size, b, b_size)
    }
}

/// Counters for calls into a [`ToyVm`].
#[derive(Default, Debug)]
pub struct ToyVmCounters {
    pub maps: AtomicUsize,
    pub unmaps: AtomicUsize,
    pub commits: AtomicUsize,
    pub decommits: AtomicUsize,
    pub lazy_purges: AtomicUsize,
    pub forced_purges: AtomicUsize,
    pub purged_bytes: AtomicUsize,
}

/// An in-process address space for tests.
///
/// Mappings are bump-allocated from one zeroed region and never reused, so a
/// fresh mapping always reads as zeroes.
pub struct ToyVm {
    region: NonNull<u8>,
    layout: Layout,
    used: AtomicUsize,
    pub counters: ToyVmCounters,
    /// When set, every `map` call fails.
    pub fail_maps: AtomicBool,
    /// When set, `purge_lazy` is refused.
    pub refuse_lazy: AtomicBool,
    /// When set, `decommit` is refused.
    pub refuse_decommit: AtomicBool,
    /// When set, `merge` is refused.
    pub refuse_merge: AtomicBool,
}

// The region is only handed out in disjoint pieces, and all bookkeeping is
// atomic.
unsafe impl Send for ToyVm {}
unsafe impl Sync for ToyVm {}

impl Default for ToyVm {
    fn default() -> Self {
        ToyVm::with_capacity(256 << 20)
    }
}

impl ToyVm {
    /// A toy address space of `capacity` bytes (rounded up to whole pages).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = round_up(capacity.max(PAGE), PAGE);
        let layout = Layout::from_size_align(capacity, PAGE).expect("toy vm layout");
        let region = unsafe { std::alloc::alloc_zeroed(layout) };
        let region = match NonNull::new(region) {
            Some(region) => region,
            None => std::alloc::handle_alloc_error(layout),
        };
        ToyVm {
            region,
            layout,
            used: AtomicUsize::new(0),
            counters: ToyVmCounters::default(),
            fail_maps: AtomicBool::new(false),
            refuse_lazy: AtomicBool::new(false),
            refuse_decommit: AtomicBool::new(false),
            refuse_merge: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes of the region handed out so far.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Whether `[addr, addr + size)` lies within the toy region.
    pub fn contains(&self, addr: *const u8, size: usize) -> bool {
        let start = self.region.as_ptr() as usize;
        let addr = addr as usize;
        addr >= start && addr + size <= start + self.layout.size()
    }

    fn count(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ToyVm {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.region.as_ptr(), self.layout) };
    }
}

impl ExtentHooks for ToyVm {
    unsafe fn map(&self, size: usize, align: usize) -> Result<Mapping, HookError> {
        if self.fail_maps.load(Ordering::Relaxed) {
            return Err(HookError::Os {
                op: "map",
                errno: 12,
            });
        }
        let align = align.max(PAGE);
        let size = round_up(size, PAGE);
        let start = self.region.as_ptr() as usize;

        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let addr = round_up(start + used, align);
            let end = match addr.checked_add(size) {
                Some(end) if end <= start + self.capacity() => end,
                _ => return Err(HookError::Exhausted),
            };
            match self.used.compare_exchange_weak(
                used,
                end - start,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    Self::count(&self.counters.maps);
                    let addr = self.region.as_ptr().add(addr - start);
                    return Ok(Mapping {
                        addr: NonNull::new_unchecked(addr),
                        size,
                        zeroed: true,
                        committed: true,
                    });
                }
                Err(current) => used = current,
            }
        }
    }

    unsafe fn unmap(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        debug_assert!(self.contains(addr, size));
        Self::count(&self.counters.unmaps);
        Ok(())
    }

    unsafe fn commit(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        debug_assert!(self.contains(addr, size));
        core::ptr::write_bytes(addr, 0, size);
        Self::count(&self.counters.commits);
        Ok(())
    }

    unsafe fn decommit(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        debug_assert!(self.contains(addr, size));
        if self.refuse_decommit.load(Ordering::Relaxed) {
            return Err(HookError::Unsupported { op: "decommit" });
        }
        Self::count(&self.counters.decommits);
        Ok(())
    }

    unsafe fn purge_lazy(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        debug_assert!(self.contains(addr, size));
        if self.refuse_lazy.load(Ordering::Relaxed) {
            return Err(HookError::Unsupported { op: "purge_lazy" });
        }
        Self::count(&self.counters.lazy_purges);
        self.counters
            .purged_bytes
            .fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn purge_forced(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        debug_assert!(self.contains(addr, size));
        core::ptr::write_bytes(addr, 0, size);
        Self::count(&self.counters.forced_purges);
        self.counters
            .purged_bytes
            .fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    fn merge(
        &self,
        _a: *mut u8,
        _a_size: usize,
        _b: *mut u8,
        _b_size: usize,
    ) -> Result<(), HookError> {
        if self.refuse_merge.load(Ordering::Relaxed) {
            return Err(HookError::Unsupported { op: "merge" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn maps_are_disjoint_and_aligned() {
        let vm = ToyVm::with_capacity(1 << 20);
        let a = unsafe { vm.map(3 * PAGE, PAGE).unwrap() };
        let b = unsafe { vm.map(PAGE, 64 * 1024).unwrap() };
        assert_eq!(a.size, 3 * PAGE);
        assert_eq!(b.addr.as_ptr() as usize % (64 * 1024), 0);
        assert!(b.addr.as_ptr() as usize >= a.addr.as_ptr() as usize + a.size);
        assert!(a.zeroed && a.committed);
        assert_eq!(vm.counters.maps.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn exhaustion_and_failure() {
        let vm = ToyVm::with_capacity(4 * PAGE);
        unsafe {
            assert!(vm.map(4 * PAGE, PAGE).is_ok());
            assert_eq!(vm.map(PAGE, PAGE), Err(HookError::Exhausted));
        }

        let vm = ToyVm::with_capacity(4 * PAGE);
        vm.fail_maps.store(true, Ordering::Relaxed);
        assert!(matches!(
            unsafe { vm.map(PAGE, PAGE) },
            Err(HookError::Os { op: "map", .. })
        ));
        assert_eq!(vm.used(), 0);
    }

    #[test]
    fn forced_purge_zeroes() {
        let vm = ToyVm::with_capacity(1 << 20);
        let m = unsafe { vm.map(PAGE, PAGE).unwrap() };
        unsafe {
            core::ptr::write_bytes(m.addr.as_ptr(), 0xAB, PAGE);
            vm.purge_forced(m.addr.as_ptr(), PAGE).unwrap();
            assert_eq!(*m.addr.as_ptr().add(17), 0);
        }
        assert_eq!(vm.counters.purged_bytes.load(Ordering::Relaxed), PAGE);
    }
}
