//! Error types.

use thiserror::Error;

/// A failure reported by an [`ExtentHooks`](crate::hooks::ExtentHooks)
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The operating system refused the call.
    #[error("{op} failed with errno {errno}")]
    Os { op: &'static str, errno: i32 },
    /// The backend does not implement this operation; callers fall back to
    /// a weaker one (for example `purge_forced` instead of `decommit`).
    #[error("{op} is not supported by this backend")]
    Unsupported { op: &'static str },
    /// The backend has no address space left.
    #[error("address space exhausted")]
    Exhausted,
}

/// Errors surfaced by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Metadata or address space could not be obtained, or the request is
    /// larger than the largest size class.
    #[error("out of memory")]
    OutOfMemory,
    /// An OS hook failed while servicing a request.
    #[error(transparent)]
    Hook(#[from] HookError),
    /// A configuration key or value was rejected.
    #[error("invalid configuration for `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },
    /// A decay time outside `-1..=DECAY_MS_MAX` milliseconds.
    #[error("invalid decay time {0} ms")]
    InvalidDecayTime(i64),
    #[error("arena {0} does not exist")]
    InvalidArena(usize),
    #[error("size class {0} is not a small (slab) class")]
    InvalidSizeClass(usize),
    /// A pointer handed back that this allocator never returned.
    #[error("pointer {0:#x} does not belong to this allocator")]
    UnknownPointer(usize),
    #[error("could not start the background purge thread: {0}")]
    BackgroundThread(String),
}

impl AllocError {
    pub(crate) fn config(key: &str, reason: impl Into<String>) -> Self {
        AllocError::InvalidConfig {
            key: key.to_owned(),
            reason: reason.into(),
        }
    }
}
