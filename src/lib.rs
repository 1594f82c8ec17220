//! A concurrent extent allocator.
//!
//! Requests are rounded to a fixed table of size classes. Small classes are
//! carved out of slabs; large classes get whole runs of pages ("extents").
//! Freed pages are not handed straight back to the operating system: they
//! pass through three tiers, each cheaper to reuse than the next,
//!
//! - **dirty**: freed, still backed by memory;
//! - **muzzy**: lazily purged, the OS may reclaim them;
//! - **retained**: decommitted, only the address range is kept,
//!
//! and move down a tier as a smooth time-based decay curve allows. A radix
//! tree maps every page back to the extent that owns it, so frees need no
//! size and may come from any thread.
//!
//! All interaction with virtual memory goes through an [`ExtentHooks`]
//! implementation: [`LibcHooks`] for real `mmap`-backed memory, or [`ToyVm`]
//! for an in-process test address space.
//!
//! ```
//! use core::alloc::Layout;
//! use tiered_alloc::{Allocator, Config, ToyVm};
//!
//! let config: Config = "narenas:2,dirty_decay_ms:0".parse().unwrap();
//! let alloc = Allocator::new(ToyVm::default(), config).unwrap();
//! let p = alloc.alloc(Layout::from_size_align(100_000, 16).unwrap()).unwrap();
//! unsafe { alloc.dealloc(p) };
//! assert_eq!(alloc.stats().dirty_pages(), 0);
//! assert!(alloc.validate().is_valid());
//! ```

pub mod allocators;
mod arena;
mod background;
mod base;
mod bin;
mod bitmap;
pub mod clock;
pub mod config;
pub mod decay;
mod emap;
pub mod error;
mod extent;
mod extent_cache;
mod extent_set;
pub mod hooks;
mod pages;
mod rtree;
pub mod size_class;
pub mod stats;
mod sync;
mod witness;

#[cfg(feature = "use_libc")]
pub mod unix;

pub use allocators::Allocator;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::Config;
pub use decay::{DecayKernel, DecayTime};
pub use error::{AllocError, HookError};
pub use hooks::{ExtentHooks, Mapping, ToyVm};
pub use pages::PurgeState;
pub use stats::{Stats, Validity};
#[cfg(feature = "use_libc")]
pub use unix::LibcHooks;
