//! Free extents of one state (dirty, muzzy or retained) for one arena.
//!
//! Two orderings are kept: by (page-size bucket, address) for fit queries,
//! and by insertion age for eviction. The set owns membership only; the
//! descriptors themselves live in the extent table.

use std::collections::BTreeMap;

use crate::extent::{ExtentId, ExtentState};
use crate::size_class::{classes, PAGE};

#[derive(Clone, Copy, Debug)]
struct Member {
    addr: usize,
    size: usize,
    bucket: usize,
    age: u64,
}

#[derive(Debug)]
pub struct ExtentSet {
    state: ExtentState,
    by_size: BTreeMap<(usize, usize), ExtentId>,
    by_age: BTreeMap<u64, ExtentId>,
    members: BTreeMap<ExtentId, Member>,
    npages: usize,
    next_age: u64,
    delay_coalesce: bool,
}

fn bucket_of(size: usize) -> usize {
    classes().psz_floor_index(size)
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

impl ExtentSet {
    pub fn new(state: ExtentState, delay_coalesce: bool) -> Self {
        ExtentSet {
            state,
            by_size: BTreeMap::new(),
            by_age: BTreeMap::new(),
            members: BTreeMap::new(),
            npages: 0,
            next_age: 0,
            delay_coalesce,
        }
    }

    pub fn state(&self) -> ExtentState {
        self.state
    }

    /// Whether neighbors are merged only on eviction rather than on insert.
    pub fn delay_coalesce(&self) -> bool {
        self.delay_coalesce
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: ExtentId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn insert(&mut self, id: ExtentId, addr: usize, size: usize) {
        debug_assert!(size >= PAGE && size % PAGE == 0 && addr % PAGE == 0);
        let bucket = bucket_of(size);
        let age = self.next_age;
        self.next_age += 1;
        let previous = self.members.insert(
            id,
            Member {
                addr,
                size,
                bucket,
                age,
            },
        );
        debug_assert!(previous.is_none(), "{:?} inserted twice", id);
        self.by_size.insert((bucket, addr), id);
        self.by_age.insert(age, id);
        self.npages += size / PAGE;
    }

    /// Remove `id`, returning its address and size.
    pub fn remove(&mut self, id: ExtentId) -> Option<(usize, usize)> {
        let member = self.members.remove(&id)?;
        self.by_size.remove(&(member.bucket, member.addr));
        self.by_age.remove(&member.age);
        self.npages -= member.size / PAGE;
        Some((member.addr, member.size))
    }

    /// Find an extent that can hold `size` bytes at `align`.
    ///
    /// With `max_active_fit` set, an extent whose bucket is more than
    /// `2^max_active_fit` times the request is refused, so that large free
    /// extents are not chopped up for small requests.
    pub fn fit(&self, size: usize, align: usize, max_active_fit: Option<u32>) -> Option<ExtentId> {
        debug_assert!(size >= PAGE && align.is_power_of_two());
        if align <= PAGE {
            return self.first_fit(size, max_active_fit);
        }
        let padded = size.checked_add(align - PAGE)?;
        if let Some(id) = self.first_fit(padded, max_active_fit) {
            return Some(id);
        }

        // Something smaller than `padded` may still happen to be well aligned.
        let sc = classes();
        let lo = bucket_of(size);
        let hi = sc.psz_ceil_index(padded);
        self.by_size
            .range((lo, 0)..(hi.saturating_add(1), 0))
            .map(|(_, &id)| (id, self.members[&id]))
            .find(|(_, m)| align_up(m.addr, align) + size <= m.addr + m.size)
            .map(|(id, _)| id)
    }

    fn first_fit(&self, size: usize, max_active_fit: Option<u32>) -> Option<ExtentId> {
        let sc = classes();
        let floor = bucket_of(size);

        // An extent in the request's own bucket wastes the least.
        let near = self
            .by_size
            .range((floor, 0)..(floor + 1, 0))
            .map(|(_, &id)| id)
            .find(|id| self.members[id].size >= size);
        if near.is_some() {
            return near;
        }

        let ceil = sc.psz_ceil_index(size).max(floor + 1);
        let (&(bucket, _), &id) = self.by_size.range((ceil, 0)..).next()?;
        if let Some(lg) = max_active_fit {
            if sc.psz_size(bucket) >> lg > size {
                return None;
            }
        }
        Some(id)
    }

    /// Remove and return the best fit: `(id, addr, size)`.
    pub fn take_fit(
        &mut self,
        size: usize,
        align: usize,
        max_active_fit: Option<u32>,
    ) -> Option<(ExtentId, usize, usize)> {
        let id = self.fit(size, align, max_active_fit)?;
        let (addr, size) = self.remove(id)?;
        Some((id, addr, size))
    }

    /// The least recently inserted extent.
    pub fn oldest(&self) -> Option<ExtentId> {
        self.by_age.values().next().copied()
    }

    /// Address and size of a member.
    #[cfg(test)]
    pub fn get(&self, id: ExtentId) -> Option<(usize, usize)> {
        self.members.get(&id).map(|m| (m.addr, m.size))
    }

    /// Members as `(id, addr, size)`, in address order within each bucket.
    pub fn iter(&self) -> impl Iterator<Item = (ExtentId, usize, usize)> + '_ {
        self.by_size.iter().map(move |(&(_, addr), &id)| (id, addr, self.members[&id].size))
    }

    /// Remove everything.
    pub fn drain(&mut self) -> Vec<(ExtentId, usize, usize)> {
        let all: Vec<_> = self.iter().collect();
        self.by_size.clear();
        self.by_age.clear();
        self.members.clear();
        self.npages = 0;
        all
    }

    /// Number of inconsistencies between the page count and the two indexes.
    pub fn check(&self) -> usize {
        let mut errors = 0;
        let pages: usize = self.members.values().map(|m| m.size / PAGE).sum();
        if pages != self.npages {
            errors += 1;
        }
        if self.by_size.len() != self.members.len() || self.by_age.len() != self.members.len() {
            errors += 1;
        }
        for (id, m) in &self.members {
            if self.by_size.get(&(m.bucket, m.addr)) != Some(id) {
                errors += 1;
            }
            if self.by_age.get(&m.age) != Some(id) {
                errors += 1;
            }
            if m.bucket != bucket_of(m.size) {
                errors += 1;
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn id(raw: u32) -> ExtentId {
        ExtentId::new(raw).unwrap()
    }

    const BASE: usize = 0x1000_0000;

    #[test]
    fn page_count_follows_membership() {
        let mut set = ExtentSet::new(ExtentState::Dirty, true);
        set.insert(id(1), BASE, 4 * PAGE);
        set.insert(id(2), BASE + 8 * PAGE, PAGE);
        assert_eq!(set.npages(), 5);
        assert_eq!(set.remove(id(1)), Some((BASE, 4 * PAGE)));
        assert_eq!(set.remove(id(1)), None);
        assert_eq!(set.npages(), 1);
        assert_eq!(set.check(), 0);
        assert_eq!(set.drain(), vec![(id(2), BASE + 8 * PAGE, PAGE)]);
        assert!(set.is_empty());
        assert_eq!(set.npages(), 0);
    }

    #[test]
    fn prefers_own_bucket_then_lowest_address() {
        let mut set = ExtentSet::new(ExtentState::Muzzy, false);
        // 9 pages sits in the 8-page bucket, next to the exact request.
        set.insert(id(1), BASE + 100 * PAGE, 16 * PAGE);
        set.insert(id(2), BASE + 50 * PAGE, 9 * PAGE);
        set.insert(id(3), BASE, 16 * PAGE);
        assert_eq!(set.fit(9 * PAGE, PAGE, None), Some(id(2)));
        // 8 pages: the 9-page extent is also the lowest in its bucket.
        assert_eq!(set.fit(8 * PAGE, PAGE, None), Some(id(2)));
        // 10 pages: falls through to the 16-page bucket, lowest address.
        assert_eq!(set.fit(10 * PAGE, PAGE, None), Some(id(3)));
        assert_eq!(set.fit(17 * PAGE, PAGE, None), None);
    }

    #[test]
    fn active_fit_cap() {
        let mut set = ExtentSet::new(ExtentState::Dirty, true);
        set.insert(id(1), BASE, 512 * PAGE);
        assert_eq!(set.fit(PAGE, PAGE, Some(6)), None);
        assert_eq!(set.fit(8 * PAGE, PAGE, Some(6)), Some(id(1)));
        assert_eq!(set.fit(PAGE, PAGE, None), Some(id(1)));
    }

    #[test]
    fn aligned_fit() {
        let align = 16 * PAGE;
        let mut set = ExtentSet::new(ExtentState::Retained, false);
        // Too small for the padded search, but its interior is aligned.
        set.insert(id(1), BASE + align, 4 * PAGE);
        assert_eq!(set.fit(4 * PAGE, align, None), Some(id(1)));

        let mut set = ExtentSet::new(ExtentState::Retained, false);
        set.insert(id(2), BASE + PAGE, 4 * PAGE);
        assert_eq!(set.fit(4 * PAGE, align, None), None);
        set.insert(id(3), BASE + 64 * PAGE + PAGE, 20 * PAGE);
        assert_eq!(set.take_fit(4 * PAGE, align, None).map(|t| t.0), Some(id(3)));
        assert_eq!(set.check(), 0);
    }

    #[test]
    fn oldest_first() {
        let mut set = ExtentSet::new(ExtentState::Dirty, true);
        set.insert(id(5), BASE + 10 * PAGE, PAGE);
        set.insert(id(3), BASE, PAGE);
        set.insert(id(4), BASE + 20 * PAGE, PAGE);
        assert_eq!(set.oldest(), Some(id(5)));
        set.remove(id(5));
        assert_eq!(set.oldest(), Some(id(3)));
        set.insert(id(5), BASE + 10 * PAGE, PAGE);
        set.remove(id(3));
        assert_eq!(set.oldest(), Some(id(4)));
    }
}
