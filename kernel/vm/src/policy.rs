//! Coalescing policy: when adjacent regions merge and when splits stick.
//!
//! Firmware revisions differ only in the switches below, so a revision is
//! modelled as a [`CoalescingPolicy`] value handed to the manager at
//! construction time rather than as version checks scattered through the
//! algorithms.

use crate::region::{Backing, RegionName, VirtualRegion};

/// Merge/split decision table for one firmware behavior generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CoalescingPolicy {
    /// Adjacent direct regions only merge if their pool offsets are
    /// contiguous as well.
    pub require_physical_contiguity: bool,
    /// Differing names block a merge. When `false`, the merged region takes
    /// the most recently assigned name.
    pub name_sensitive_merge: bool,
    /// Regions split by a protection or type change are merged again with
    /// matching neighbors right away.
    pub auto_remerge_after_split: bool,
    /// `map` and `reserve` try to merge the new region with its neighbors.
    /// When `false`, only a naming pass merges.
    pub coalesce_on_map: bool,
    /// A `FIXED` request at address zero is rejected outright.
    pub reject_fixed_null: bool,
}

impl CoalescingPolicy {
    /// Early firmware: strict, merges only when a range is renamed.
    pub const LEGACY: Self = Self {
        require_physical_contiguity: true,
        name_sensitive_merge: true,
        auto_remerge_after_split: false,
        coalesce_on_map: false,
        reject_fixed_null: false,
    };

    /// Current firmware: merges on virtual contiguity alone and lets the
    /// newest name win.
    pub const CURRENT: Self = Self {
        require_physical_contiguity: false,
        name_sensitive_merge: false,
        auto_remerge_after_split: false,
        coalesce_on_map: true,
        reject_fixed_null: true,
    };

    /// Returns `true` if `left` and `right` may be merged into one region.
    ///
    /// `left` must precede `right` in the address space.
    #[must_use]
    pub fn can_merge(&self, left: &VirtualRegion, right: &VirtualRegion) -> bool {
        if left.end != right.start || left.no_coalesce || right.no_coalesce {
            return false;
        }
        if left.prot != right.prot || left.memory_type != right.memory_type {
            return false;
        }
        let backing_ok = match (left.backing, right.backing) {
            (Backing::Direct { .. }, Backing::Direct { phys: rp }) => {
                !self.require_physical_contiguity || left.phys_end() == Some(rp)
            }
            (Backing::Flexible, Backing::Flexible)
            | (Backing::Reserved, Backing::Reserved)
            | (Backing::Stack, Backing::Stack) => true,
            _ => false,
        };
        backing_ok && (!self.name_sensitive_merge || left.name == right.name)
    }

    /// Picks the name a merged region keeps: the one assigned last.
    #[must_use]
    pub fn surviving_name<'a>(
        left: &'a VirtualRegion,
        right: &'a VirtualRegion,
    ) -> (&'a RegionName, u64) {
        if right.name_stamp >= left.name_stamp {
            (&right.name, right.name_stamp)
        } else {
            (&left.name, left.name_stamp)
        }
    }
}

impl Default for CoalescingPolicy {
    fn default() -> Self {
        Self::CURRENT
    }
}
