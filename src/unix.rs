//! [`ExtentHooks`] backed by `mmap`, `munmap` and `madvise`.

use core::ptr::{null_mut, NonNull};

use log::warn;

use crate::error::HookError;
use crate::hooks::{ExtentHooks, Mapping};
use crate::size_class::PAGE;

/// LibcHooks uses virtual memory pages from the OS.
#[derive(Debug)]
pub struct LibcHooks {
    _private: (),
}

fn os_error(op: &'static str) -> HookError {
    HookError::Os {
        op,
        errno: errno::errno().0,
    }
}

unsafe fn mmap_anon(addr: *mut u8, size: usize, prot: libc::c_int, flags: libc::c_int) -> *mut u8 {
    let ptr = libc::mmap(
        addr as *mut libc::c_void,
        size,
        prot,
        // MAP_ANON: no file descriptor, we're just going to use the memory.
        // MAP_PRIVATE: not shared with any other process.
        libc::MAP_ANON | libc::MAP_PRIVATE | flags,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        null_mut()
    } else {
        ptr as *mut u8
    }
}

impl LibcHooks {
    /// Fails if the OS page size is not the allocator's page size.
    pub fn new() -> Result<Self, HookError> {
        let pagesize = sysconf::page::pagesize();
        if pagesize != PAGE {
            warn!("OS page size {} does not match {}", pagesize, PAGE);
            return Err(HookError::Unsupported { op: "page size" });
        }
        Ok(LibcHooks { _private: () })
    }
}

impl ExtentHooks for LibcHooks {
    unsafe fn map(&self, size: usize, align: usize) -> Result<Mapping, HookError> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let ptr = mmap_anon(null_mut(), size, prot, 0);
        if ptr.is_null() {
            return Err(os_error("mmap"));
        }
        if ptr as usize % align != 0 {
            // Map with enough slack to find an aligned start, then trim both
            // ends.
            libc::munmap(ptr as *mut libc::c_void, size);
            let padded = size
                .checked_add(align - PAGE)
                .ok_or(HookError::Exhausted)?;
            let ptr = mmap_anon(null_mut(), padded, prot, 0);
            if ptr.is_null() {
                return Err(os_error("mmap"));
            }
            let start = ptr as usize;
            let aligned = (start + align - 1) & !(align - 1);
            let lead = aligned - start;
            let trail = padded - lead - size;
            if lead != 0 {
                libc::munmap(ptr as *mut libc::c_void, lead);
            }
            if trail != 0 {
                libc::munmap((aligned + size) as *mut libc::c_void, trail);
            }
            return Ok(Mapping {
                addr: NonNull::new_unchecked(aligned as *mut u8),
                size,
                zeroed: true,
                committed: true,
            });
        }
        Ok(Mapping {
            addr: NonNull::new_unchecked(ptr),
            size,
            zeroed: true,
            committed: true,
        })
    }

    unsafe fn unmap(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        if libc::munmap(addr as *mut libc::c_void, size) != 0 {
            return Err(os_error("munmap"));
        }
        Ok(())
    }

    unsafe fn commit(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        let ptr = mmap_anon(
            addr,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED,
        );
        if ptr != addr {
            return Err(os_error("commit"));
        }
        Ok(())
    }

    unsafe fn decommit(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        let ptr = mmap_anon(
            addr,
            size,
            libc::PROT_NONE,
            libc::MAP_FIXED | libc::MAP_NORESERVE,
        );
        if ptr != addr {
            return Err(os_error("decommit"));
        }
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    unsafe fn purge_lazy(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        if libc::madvise(addr as *mut libc::c_void, size, libc::MADV_FREE) != 0 {
            return Err(os_error("madvise(MADV_FREE)"));
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
    unsafe fn purge_lazy(&self, _addr: *mut u8, _size: usize) -> Result<(), HookError> {
        Err(HookError::Unsupported { op: "purge_lazy" })
    }

    // Only Linux guarantees that MADV_DONTNEED on private anonymous memory
    // zero-fills.
    #[cfg(target_os = "linux")]
    unsafe fn purge_forced(&self, addr: *mut u8, size: usize) -> Result<(), HookError> {
        if libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) != 0 {
            return Err(os_error("madvise(MADV_DONTNEED)"));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    unsafe fn purge_forced(&self, _addr: *mut u8, _size: usize) -> Result<(), HookError> {
        Err(HookError::Unsupported { op: "purge_forced" })
    }
}
