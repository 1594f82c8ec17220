//! Debug-only lock-order checking.
//!
//! Every [`Mutex`](crate::sync::Mutex) carries a [`LockRank`]. In builds with
//! `debug_assertions`, each thread records the ranks it currently holds and
//! acquiring a lock whose rank is not strictly greater than every held rank
//! panics. Without `debug_assertions` all of this compiles away.
//!
//! The checker knows nothing about the locks themselves; it only sees ranks.

/// Lock ranks, in the order they must be acquired.
///
/// A thread never holds two locks of the same rank, so in particular it
/// never holds two bin locks at once.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    Bin = 10,
    Decay = 20,
    ExtentGrow = 21,
    Extents = 22,
    DescriptorCache = 23,
    RtreeInit = 25,
    Base = 30,
    Registry = 40,
    LiveRegistries = 41,
    /// Per-descriptor locks: leaves, nothing is acquired while one is held.
    Descriptor = 50,
    Prng = 51,
}

#[cfg(debug_assertions)]
mod imp {
    use super::LockRank;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
    }

    pub fn acquire(rank: LockRank) {
        // During thread teardown the list may already be gone; skip checking.
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&worst) = held.iter().max() {
                if worst >= rank {
                    let snapshot = held.clone();
                    drop(held);
                    panic!(
                        "lock order reversal: acquiring {:?} while holding {:?}",
                        rank, snapshot
                    );
                }
            }
            held.push(rank);
        });
    }

    pub fn release(rank: LockRank) {
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == rank) {
                held.remove(pos);
            }
        });
    }

    pub fn held() -> Vec<LockRank> {
        HELD.try_with(|held| held.borrow().clone())
            .unwrap_or_default()
    }
}

#[cfg(not(debug_assertions))]
mod imp {
    use super::LockRank;

    #[inline(always)]
    pub fn acquire(_rank: LockRank) {}

    #[inline(always)]
    pub fn release(_rank: LockRank) {}

    #[inline(always)]
    pub fn held() -> Vec<LockRank> {
        Vec::new()
    }
}

/// Record that the current thread is about to acquire a lock of `rank`.
#[inline]
pub fn acquire(rank: LockRank) {
    imp::acquire(rank)
}

/// Record that the current thread released a lock of `rank`.
#[inline]
pub fn release(rank: LockRank) {
    imp::release(rank)
}

/// Ranks currently held by this thread (always empty in release builds).
pub fn held() -> Vec<LockRank> {
    imp::held()
}

/// Assert (in debug builds) that this thread holds no ranked lock.
#[inline]
pub fn assert_lockless() {
    debug_assert!(held().is_empty(), "expected no locks held, found {:?}", held());
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn in_order_acquisition_is_accepted() {
        acquire(LockRank::Bin);
        acquire(LockRank::Extents);
        acquire(LockRank::Descriptor);
        release(LockRank::Descriptor);
        release(LockRank::Extents);
        release(LockRank::Bin);
        assert_lockless();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order reversal")]
    fn reversed_acquisition_panics() {
        acquire(LockRank::Decay);
        acquire(LockRank::Bin);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order reversal")]
    fn two_locks_of_the_same_rank_panic() {
        acquire(LockRank::Bin);
        acquire(LockRank::Bin);
    }
}
