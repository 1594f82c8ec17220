//! A spin mutex that reports its rank to the lock-order checker.

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::witness::{self, LockRank};

pub struct Mutex<T> {
    rank: LockRank,
    inner: spin::Mutex<T>,
}

pub struct MutexGuard<'a, T> {
    rank: LockRank,
    guard: spin::MutexGuard<'a, T>,
}

impl<T> Mutex<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Mutex {
            rank,
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        witness::acquire(self.rank);
        MutexGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("rank", &self.rank).finish()
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        witness::release(self.rank);
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
