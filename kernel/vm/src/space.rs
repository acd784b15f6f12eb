//! Ordered region table of one address space.
//!
//! Regions live in a `BTreeMap` keyed by start address, so the region
//! covering an address is `range(..=addr).next_back()` and neighbors are one
//! step away. Gaps between regions are unmapped space.
//!
//! # Algorithm
//!
//! - **Split**: a region straddling a boundary is cut in two with
//!   [`VirtualRegion::split_off`]; nothing else moves.
//! - **Merge**: a left-to-right pass over a span, starting at the region
//!   that ends at the span's start and ending with the region that starts at
//!   its end. Each neighbor the [`CoalescingPolicy`] accepts is absorbed
//!   into its left partner, which keeps its start and appends the
//!   neighbor's direct runs.
//!
//! All mutating helpers are infallible. Callers validate a request fully
//! before touching the table, which keeps every public operation atomic.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Bound;

use orbis_core::addr::checked_align_up;

use crate::VirtAddr;
use crate::policy::CoalescingPolicy;
use crate::prot::{MemoryType, Protection};
use crate::region::{Backing, RegionName, VirtualRegion};

/// The region table plus the policy that governs it.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    /// Regions by start address. Sorted, never overlapping, never empty.
    regions: BTreeMap<u64, VirtualRegion>,
    policy: CoalescingPolicy,
    /// Non-fixed searches never go below this address.
    search_floor: u64,
    /// One past the highest usable address.
    limit: u64,
    /// Last name stamp handed out.
    name_seq: u64,
}

impl AddressSpace {
    /// Creates an empty address space usable up to `limit`.
    #[must_use]
    pub fn new(search_floor: VirtAddr, limit: VirtAddr, policy: CoalescingPolicy) -> Self {
        Self {
            regions: BTreeMap::new(),
            policy,
            search_floor: search_floor.as_u64(),
            limit: limit.as_u64(),
            name_seq: 0,
        }
    }

    /// The active coalescing policy.
    #[must_use]
    pub fn policy(&self) -> &CoalescingPolicy {
        &self.policy
    }

    /// One past the highest usable address.
    #[must_use]
    pub fn limit(&self) -> VirtAddr {
        VirtAddr::new(self.limit)
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Iterates over all regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &VirtualRegion> + '_ {
        self.regions.values()
    }

    /// Key of the region containing `addr`.
    fn covering_key(&self, addr: u64) -> Option<u64> {
        self.regions
            .range(..=addr)
            .next_back()
            .filter(|(_, r)| r.contains(VirtAddr::new(addr)))
            .map(|(&k, _)| k)
    }

    /// Returns the region containing `addr`.
    #[must_use]
    pub fn find(&self, addr: VirtAddr) -> Option<&VirtualRegion> {
        self.covering_key(addr.as_u64())
            .and_then(|k| self.regions.get(&k))
    }

    /// Returns the first region starting at or after `addr`.
    #[must_use]
    pub fn next_at_or_after(&self, addr: VirtAddr) -> Option<&VirtualRegion> {
        self.regions.range(addr.as_u64()..).next().map(|(_, r)| r)
    }

    /// Iterates over the regions intersecting `[start, end)`.
    pub fn overlapping(
        &self,
        start: VirtAddr,
        end: VirtAddr,
    ) -> impl Iterator<Item = &VirtualRegion> + '_ {
        let (start, end) = (start.as_u64(), end.as_u64().max(start.as_u64()));
        let first = self.covering_key(start).unwrap_or(start);
        self.regions.range(first..end).map(|(_, r)| r)
    }

    /// Returns `true` if no region intersects `[start, end)`.
    #[must_use]
    pub fn is_free(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.overlapping(start, end).next().is_none()
    }

    /// Returns `true` if every page of `[start, end)` belongs to a region.
    #[must_use]
    pub fn is_fully_mapped(&self, start: VirtAddr, end: VirtAddr) -> bool {
        let mut cursor = start;
        for r in self.overlapping(start, end) {
            if r.start > cursor {
                break;
            }
            cursor = r.end;
        }
        cursor >= end
    }

    /// Lowest `align`-aligned free range of `size` bytes at or after `hint`.
    #[must_use]
    pub fn find_free(&self, hint: VirtAddr, size: u64, align: u64) -> Option<VirtAddr> {
        let mut cursor = checked_align_up(hint.as_u64().max(self.search_floor), align)?;
        let first = self.covering_key(cursor).unwrap_or(cursor);
        for r in self.regions.range(first..).map(|(_, r)| r) {
            let (s, e) = (r.start.as_u64(), r.end.as_u64());
            if s >= self.limit {
                break;
            }
            if e <= cursor {
                continue;
            }
            if cursor.checked_add(size)? <= s {
                break;
            }
            cursor = checked_align_up(e, align)?;
        }
        let fits = cursor.checked_add(size).is_some_and(|e| e <= self.limit);
        fits.then_some(VirtAddr::new(cursor))
    }

    /// Hands out the next name stamp.
    pub(crate) fn next_name_stamp(&mut self) -> u64 {
        self.name_seq += 1;
        self.name_seq
    }

    /// Inserts `region` into a free range and, if the policy merges on map,
    /// coalesces it with its neighbors. Returns the start of the region
    /// that now holds the inserted range.
    pub(crate) fn insert(&mut self, region: VirtualRegion) -> VirtAddr {
        debug_assert!(self.is_free(region.start, region.end));
        let (start, end) = (region.start, region.end);
        self.regions.insert(start.as_u64(), region);
        if self.policy.coalesce_on_map {
            self.merge_span(start, end);
        }
        self.find(start).map_or(start, |r| r.start)
    }

    /// Splits the region straddling `at`, if any.
    pub(crate) fn split_at(&mut self, at: VirtAddr) {
        let Some(key) = self.covering_key(at.as_u64()) else {
            return;
        };
        if key == at.as_u64() {
            return;
        }
        let Some(head) = self.regions.get_mut(&key) else {
            return;
        };
        let tail = head.split_off(at);
        log::trace!("vm: split [{}..{}) at {}", head.start, tail.end, at);
        self.regions.insert(at.as_u64(), tail);
    }

    /// Removes every byte of `[start, end)` from the table and returns the
    /// removed pieces.
    pub(crate) fn remove_range(&mut self, start: VirtAddr, end: VirtAddr) -> Vec<VirtualRegion> {
        self.split_at(start);
        self.split_at(end);
        let keys: Vec<u64> = self
            .regions
            .range(start.as_u64()..end.as_u64())
            .map(|(&k, _)| k)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.regions.remove(&k))
            .collect()
    }

    /// Sets `prot` (and `memory_type`, if given) on every non-reserved
    /// region in `[start, end)`, splitting boundary regions that change.
    pub(crate) fn retag(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        prot: Protection,
        memory_type: Option<MemoryType>,
    ) {
        let changes = |r: &VirtualRegion| {
            !matches!(r.backing, Backing::Reserved)
                && (r.prot != prot || memory_type.is_some_and(|t| t != r.memory_type))
        };
        for boundary in [start, end] {
            if self.find(boundary).is_some_and(changes) {
                self.split_at(boundary);
            }
        }
        for region in self
            .regions
            .range_mut(start.as_u64()..end.as_u64())
            .map(|(_, r)| r)
        {
            if changes(&*region) {
                region.prot = prot;
                if let Some(t) = memory_type {
                    region.memory_type = t;
                }
            }
        }
        if self.policy.auto_remerge_after_split {
            self.merge_span(start, end);
        }
    }

    /// Names every region of the fully mapped range `[start, end)` and runs
    /// a merge pass over it.
    pub(crate) fn set_name(&mut self, start: VirtAddr, end: VirtAddr, name: &RegionName) {
        debug_assert!(self.is_fully_mapped(start, end));
        self.split_at(start);
        self.split_at(end);
        let stamp = self.next_name_stamp();
        for region in self
            .regions
            .range_mut(start.as_u64()..end.as_u64())
            .map(|(_, r)| r)
        {
            region.name = name.clone();
            region.name_stamp = stamp;
        }
        self.merge_span(start, end);
    }

    /// Merges every eligible neighbor pair touching `[start, end]`.
    pub(crate) fn merge_span(&mut self, start: VirtAddr, end: VirtAddr) {
        let (start, end) = (start.as_u64(), end.as_u64());
        let left_edge = self
            .regions
            .range(..start)
            .next_back()
            .filter(|(_, r)| r.end.as_u64() >= start)
            .map(|(&k, _)| k);
        let Some(mut cur) =
            left_edge.or_else(|| self.regions.range(start..).next().map(|(&k, _)| k))
        else {
            return;
        };
        while let Some(next) = self
            .regions
            .range((Bound::Excluded(cur), Bound::Unbounded))
            .next()
            .map(|(&k, _)| k)
            .filter(|&k| k <= end)
        {
            let mergeable = match (self.regions.get(&cur), self.regions.get(&next)) {
                (Some(left), Some(right)) => self.policy.can_merge(left, right),
                _ => false,
            };
            if mergeable {
                self.absorb(cur, next);
            } else {
                cur = next;
            }
        }
    }

    /// Extends the region at `left` over the one at `right`.
    fn absorb(&mut self, left: u64, right: u64) {
        let Some(right) = self.regions.remove(&right) else {
            return;
        };
        let Some(left) = self.regions.get_mut(&left) else {
            return;
        };
        let (name, stamp) = {
            let (name, stamp) = CoalescingPolicy::surviving_name(left, &right);
            (name.clone(), stamp)
        };
        log::trace!(
            "vm: merge [{}..{}) + [{}..{})",
            left.start,
            left.end,
            right.start,
            right.end
        );
        left.append(right);
        left.name = name;
        left.name_stamp = stamp;
    }

    /// Virtual ranges whose direct backing lies in `[phys_start, phys_end)`.
    pub(crate) fn direct_aliases(
        &self,
        phys_start: u64,
        phys_end: u64,
    ) -> Vec<(VirtAddr, VirtAddr)> {
        let mut hits = Vec::new();
        for r in self.regions.values() {
            let mut virt = r.start;
            for run in r.runs() {
                let (p, pe) = (run.phys.as_u64(), run.phys_end().as_u64());
                let (lo, hi) = (p.max(phys_start), pe.min(phys_end));
                if lo < hi {
                    hits.push((virt + (lo - p), virt + (hi - p)));
                }
                virt += run.len;
            }
        }
        hits
    }

    /// The region starting exactly at `start`.
    pub(crate) fn region_mut(&mut self, start: VirtAddr) -> Option<&mut VirtualRegion> {
        self.regions.get_mut(&start.as_u64())
    }

    /// Checks the table invariants.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut prev_end = 0;
        for (&k, r) in &self.regions {
            assert_eq!(k, r.start.as_u64(), "region keyed by wrong address");
            assert!(r.start < r.end, "empty region at {}", r.start);
            assert!(k >= prev_end, "overlapping regions at {}", r.start);
            match r.backing {
                Backing::Direct { phys } => {
                    assert_eq!(r.runs().first().map(|run| run.phys), Some(phys));
                    assert_eq!(r.runs().iter().map(|run| run.len).sum::<u64>(), r.size());
                }
                _ => assert!(r.runs().is_empty(), "stray runs at {}", r.start),
            }
            prev_end = r.end.as_u64();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PhysAddr;

    const BASE: u64 = 0x10_0000_0000;
    const LIMIT: u64 = 0x20_0000_0000;

    fn va(raw: u64) -> VirtAddr {
        VirtAddr::new(raw)
    }

    fn space(policy: CoalescingPolicy) -> AddressSpace {
        AddressSpace::new(va(BASE), va(LIMIT), policy)
    }

    fn region(start: u64, end: u64, backing: Backing) -> VirtualRegion {
        VirtualRegion::new(
            va(start),
            va(end),
            Protection::READ_WRITE,
            MemoryType::WB_ONION,
            backing,
        )
    }

    fn flexible(start: u64, end: u64) -> VirtualRegion {
        region(start, end, Backing::Flexible)
    }

    fn direct(start: u64, end: u64, phys: u64) -> VirtualRegion {
        region(
            start,
            end,
            Backing::Direct {
                phys: PhysAddr::new(phys),
            },
        )
    }

    fn bounds(s: &AddressSpace) -> Vec<(u64, u64)> {
        s.iter()
            .map(|r| (r.start.as_u64() - BASE, r.end.as_u64() - BASE))
            .collect()
    }

    #[test]
    fn lookup() {
        let mut s = space(CoalescingPolicy::LEGACY);
        s.insert(flexible(BASE, BASE + 0x8000));
        s.insert(flexible(BASE + 0x10000, BASE + 0x14000));
        assert_eq!(s.find(va(BASE + 0x4000)).map(|r| r.start), Some(va(BASE)));
        assert!(s.find(va(BASE + 0x8000)).is_none());
        assert_eq!(
            s.next_at_or_after(va(BASE + 0x4000)).map(|r| r.start),
            Some(va(BASE + 0x10000))
        );
        assert!(s.next_at_or_after(va(BASE + 0x10004)).is_none());
        assert!(s.is_free(va(BASE + 0x8000), va(BASE + 0x10000)));
        assert!(!s.is_free(va(BASE + 0x8000), va(BASE + 0x14000)));
        assert!(s.is_fully_mapped(va(BASE), va(BASE + 0x8000)));
        assert!(!s.is_fully_mapped(va(BASE), va(BASE + 0x14000)));
    }

    #[test]
    fn find_free_skips_regions_and_aligns() {
        let mut s = space(CoalescingPolicy::LEGACY);
        s.insert(flexible(BASE, BASE + 0x8000));
        assert_eq!(s.find_free(va(0), 0x4000, 0x4000), Some(va(BASE + 0x8000)));
        assert_eq!(
            s.find_free(va(0), 0x4000, 0x10000),
            Some(va(BASE + 0x10000))
        );
        s.insert(flexible(BASE + 0x8000, BASE + 0xc000));
        assert_eq!(s.find_free(va(BASE), 0x4000, 0x4000), Some(va(BASE + 0xc000)));
        assert_eq!(s.find_free(va(LIMIT - 0x4000), 0x8000, 0x4000), None);
    }

    #[test]
    fn coalesce_on_map_follows_policy() {
        let mut legacy = space(CoalescingPolicy::LEGACY);
        let mut current = space(CoalescingPolicy::CURRENT);
        for s in [&mut legacy, &mut current] {
            s.insert(flexible(BASE, BASE + 0x4000));
            s.insert(flexible(BASE + 0x4000, BASE + 0x8000));
            s.assert_consistent();
        }
        assert_eq!(legacy.len(), 2);
        assert_eq!(bounds(&current), [(0, 0x8000)]);
    }

    #[test]
    fn merged_direct_keeps_left_offset() {
        let mut s = space(CoalescingPolicy::CURRENT);
        s.insert(direct(BASE + 0x4000, BASE + 0x8000, 0x90_0000));
        let start = s.insert(direct(BASE, BASE + 0x4000, 0x10_0000));
        assert_eq!(start, va(BASE));
        let merged = s.find(va(BASE)).unwrap();
        assert_eq!(merged.end, va(BASE + 0x8000));
        assert_eq!(merged.phys_at(merged.start), Some(PhysAddr::new(0x10_0000)));
        assert_eq!(
            merged.phys_at(va(BASE + 0x4000)),
            Some(PhysAddr::new(0x90_0000))
        );
    }

    #[test]
    fn aliases_follow_merged_runs() {
        let mut s = space(CoalescingPolicy::CURRENT);
        s.insert(direct(BASE, BASE + 0x4000, 0x10_0000));
        s.insert(direct(BASE + 0x4000, BASE + 0xc000, 0x30_0000));
        assert_eq!(s.len(), 1);
        assert_eq!(
            s.direct_aliases(0x30_4000, 0x40_0000),
            [(va(BASE + 0x8000), va(BASE + 0xc000))]
        );
        assert_eq!(
            s.direct_aliases(0x10_0000, 0x10_4000),
            [(va(BASE), va(BASE + 0x4000))]
        );
        assert!(s.direct_aliases(0x10_4000, 0x30_0000).is_empty());

        let removed = s.remove_range(va(BASE), va(BASE + 0x8000));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].runs().len(), 2);
        let rest = s.find(va(BASE + 0x8000)).unwrap();
        assert_eq!(rest.phys_at(rest.start), Some(PhysAddr::new(0x30_4000)));
        s.assert_consistent();
    }

    #[test]
    fn remove_range_truncates_and_splits() {
        let mut s = space(CoalescingPolicy::LEGACY);
        s.insert(flexible(BASE, BASE + 0x10000));
        let removed = s.remove_range(va(BASE + 0x4000), va(BASE + 0x8000));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].size(), 0x4000);
        assert_eq!(bounds(&s), [(0, 0x4000), (0x8000, 0x10000)]);
        assert!(s.remove_range(va(BASE + 0x4000), va(BASE + 0x8000)).is_empty());
        s.assert_consistent();
    }

    #[test]
    fn retag_interior_splits_in_three() {
        let mut s = space(CoalescingPolicy::CURRENT);
        s.insert(flexible(BASE, BASE + 0x10000));
        s.retag(va(BASE + 0x4000), va(BASE + 0x8000), Protection::READ, None);
        assert_eq!(bounds(&s), [(0, 0x4000), (0x4000, 0x8000), (0x8000, 0x10000)]);
        assert_eq!(s.find(va(BASE + 0x4000)).unwrap().prot, Protection::READ);
        s.assert_consistent();
    }

    #[test]
    fn retag_with_same_attributes_does_not_split() {
        let mut s = space(CoalescingPolicy::CURRENT);
        s.insert(flexible(BASE, BASE + 0x10000));
        s.retag(va(BASE + 0x4000), va(BASE + 0x8000), Protection::READ_WRITE, None);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn retag_remerges_when_asked() {
        let policy = CoalescingPolicy {
            auto_remerge_after_split: true,
            ..CoalescingPolicy::CURRENT
        };
        let mut s = space(policy);
        s.insert(flexible(BASE, BASE + 0x10000));
        s.retag(va(BASE + 0x4000), va(BASE + 0x8000), Protection::READ, None);
        assert_eq!(s.len(), 3);
        s.retag(va(BASE + 0x4000), va(BASE + 0x8000), Protection::READ_WRITE, None);
        assert_eq!(bounds(&s), [(0, 0x10000)]);
    }

    #[test]
    fn retag_leaves_reservations_alone() {
        let mut s = space(CoalescingPolicy::LEGACY);
        let mut rsvd = flexible(BASE, BASE + 0x8000);
        rsvd.backing = Backing::Reserved;
        rsvd.prot = Protection::empty();
        s.insert(rsvd);
        s.retag(va(BASE + 0x4000), va(BASE + 0x8000), Protection::READ, None);
        assert_eq!(s.len(), 1);
        assert_eq!(s.find(va(BASE)).unwrap().prot, Protection::empty());
    }

    #[test]
    fn naming_merges_under_legacy() {
        let mut s = space(CoalescingPolicy::LEGACY);
        s.insert(direct(BASE, BASE + 0x4000, 0x0));
        s.insert(direct(BASE + 0x4000, BASE + 0x8000, 0x4000));
        assert_eq!(s.len(), 2);
        let name = RegionName::new("pool").unwrap();
        s.set_name(va(BASE), va(BASE + 0x8000), &name);
        assert_eq!(bounds(&s), [(0, 0x8000)]);
        assert_eq!(s.find(va(BASE)).unwrap().name, name);
    }

    #[test]
    fn naming_a_subrange_splits() {
        let mut s = space(CoalescingPolicy::LEGACY);
        s.insert(flexible(BASE, BASE + 0xc000));
        s.set_name(
            va(BASE + 0x4000),
            va(BASE + 0x8000),
            &RegionName::new("mid").unwrap(),
        );
        assert_eq!(bounds(&s), [(0, 0x4000), (0x4000, 0x8000), (0x8000, 0xc000)]);
    }

    #[test]
    fn newest_name_survives_merge() {
        let mut s = space(CoalescingPolicy::CURRENT);
        let mut left = flexible(BASE, BASE + 0x4000);
        left.no_coalesce = true;
        s.insert(left);
        s.insert(flexible(BASE + 0x4000, BASE + 0x8000));
        s.set_name(va(BASE + 0x4000), va(BASE + 0x8000), &RegionName::new("old").unwrap());
        s.set_name(va(BASE), va(BASE + 0x4000), &RegionName::new("new").unwrap());
        s.region_mut(va(BASE)).unwrap().no_coalesce = false;
        s.merge_span(va(BASE), va(BASE + 0x8000));
        assert_eq!(s.len(), 1);
        assert_eq!(s.find(va(BASE)).unwrap().name.as_str(), "new");
    }

    #[test]
    fn direct_aliases_are_clipped() {
        let mut s = space(CoalescingPolicy::LEGACY);
        s.insert(direct(BASE, BASE + 0x10000, 0x20_0000));
        s.insert(direct(BASE + 0x20000, BASE + 0x24000, 0x20_0000));
        s.insert(flexible(BASE + 0x30000, BASE + 0x34000));
        let hits = s.direct_aliases(0x20_4000, 0x20_8000);
        assert_eq!(hits, [(va(BASE + 0x4000), va(BASE + 0x8000))]);
        let hits = s.direct_aliases(0x20_0000, 0x20_4000);
        assert_eq!(hits.len(), 2);
    }
}
