//! Region bitmaps for slabs.
//!
//! A set bit marks an allocated region. Bits at or beyond the slab's region
//! count are set at initialization, so a search for an unset bit never walks
//! off the end of the slab.

use static_assertions::const_assert;

use crate::size_class::SLAB_MAXREGS;

const WORD_BITS: usize = u64::BITS as usize;
pub const BITMAP_WORDS: usize = SLAB_MAXREGS / WORD_BITS;

// The smallest class packs a page with regions; every region needs a bit.
const_assert!(BITMAP_WORDS * WORD_BITS >= SLAB_MAXREGS);
const_assert!(SLAB_MAXREGS % WORD_BITS == 0);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SlabBitmap {
    words: [u64; BITMAP_WORDS],
}

impl Default for SlabBitmap {
    fn default() -> Self {
        SlabBitmap {
            words: [u64::MAX; BITMAP_WORDS],
        }
    }
}

impl SlabBitmap {
    /// A bitmap with `nregs` free regions.
    pub fn new(nregs: usize) -> Self {
        debug_assert!(nregs >= 1 && nregs <= SLAB_MAXREGS);
        let mut words = [u64::MAX; BITMAP_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let lo = i * WORD_BITS;
            if lo >= nregs {
                break;
            }
            let live = (nregs - lo).min(WORD_BITS);
            *word = if live == WORD_BITS {
                0
            } else {
                u64::MAX << live
            };
        }
        SlabBitmap { words }
    }

    #[inline]
    pub fn get(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    #[inline]
    pub fn set(&mut self, bit: usize) {
        debug_assert!(!self.get(bit));
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
    }

    #[inline]
    pub fn unset(&mut self, bit: usize) {
        debug_assert!(self.get(bit), "freeing unallocated region {}", bit);
        self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
    }

    /// Index of the lowest free region.
    pub fn first_unset(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|&(_, &w)| w != u64::MAX)
            .map(|(i, &w)| i * WORD_BITS + (!w).trailing_zeros() as usize)
    }

    /// Claim the lowest free region.
    pub fn claim(&mut self) -> Option<usize> {
        let bit = self.first_unset()?;
        self.set(bit);
        Some(bit)
    }

    /// Number of set bits among the first `nregs`.
    pub fn count_set(&self, nregs: usize) -> usize {
        (0..nregs).filter(|&b| self.get(b)).count()
    }
}

impl core::fmt::Debug for SlabBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SlabBitmap[")?;
        for w in &self.words {
            write!(f, "{:016x}", w)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn claims_in_address_order() {
        let mut bm = SlabBitmap::new(100);
        for i in 0..100 {
            assert_eq!(bm.claim(), Some(i));
        }
        assert_eq!(bm.claim(), None);
        bm.unset(70);
        bm.unset(3);
        assert_eq!(bm.claim(), Some(3));
        assert_eq!(bm.claim(), Some(70));
        assert_eq!(bm.count_set(100), 100);
    }

    #[test]
    fn padding_bits_are_set() {
        let bm = SlabBitmap::new(1);
        assert!(!bm.get(0));
        assert!(bm.get(1));
        assert!(bm.get(SLAB_MAXREGS - 1));

        let full = SlabBitmap::new(SLAB_MAXREGS);
        assert_eq!(full.count_set(SLAB_MAXREGS), 0);
        assert_eq!(full.first_unset(), Some(0));
    }

    #[test]
    fn word_boundaries() {
        let mut bm = SlabBitmap::new(128);
        for _ in 0..64 {
            bm.claim();
        }
        assert_eq!(bm.first_unset(), Some(64));
        bm.unset(63);
        assert_eq!(bm.first_unset(), Some(63));
    }
}
