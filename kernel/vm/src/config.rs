//! Construction-time configuration of an address space.
//!
//! Defaults describe a retail console process; tests shrink the pools. With
//! the `serde` feature a host can load a profile (including the coalescing
//! revision) from a config file.

use crate::policy::CoalescingPolicy;
use crate::{PAGE_MASK, VmError, VmResult};

/// Lowest address handed out to non-fixed mappings.
pub const DEFAULT_VA_START: u64 = 0x40_0000;
/// One past the highest user virtual address.
pub const DEFAULT_VA_END: u64 = 0x7F_FFFF_C000;
/// Where non-fixed mappings without a hint start searching.
pub const DEFAULT_MAP_SEARCH_BASE: u64 = 0x2_0000_0000;
/// Size of the direct memory pool (5 GiB).
pub const DEFAULT_DIRECT_MEMORY_SIZE: u64 = 0x1_4000_0000;
/// Capacity of the flexible memory budget (448 MiB).
pub const DEFAULT_FLEXIBLE_MEMORY_SIZE: u64 = 0x1C00_0000;

/// Address-space configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VmConfig {
    /// Lowest address handed out to non-fixed mappings. Fixed mappings
    /// may go below it.
    pub va_start: u64,
    /// One past the highest mappable virtual address.
    pub va_end: u64,
    /// Search start for non-fixed mappings with a zero hint.
    pub map_search_base: u64,
    /// Size of the direct memory pool in bytes.
    pub direct_memory_size: u64,
    /// Capacity of the flexible budget in bytes.
    pub flexible_memory_size: u64,
    /// Merge/split behavior revision.
    pub policy: CoalescingPolicy,
}

impl VmConfig {
    /// Returns a copy using `policy`.
    #[must_use]
    pub const fn with_policy(mut self, policy: CoalescingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns a copy with a flexible budget of `bytes`.
    #[must_use]
    pub const fn with_flexible_memory(mut self, bytes: u64) -> Self {
        self.flexible_memory_size = bytes;
        self
    }

    /// Returns a copy with a direct pool of `bytes`.
    #[must_use]
    pub const fn with_direct_memory(mut self, bytes: u64) -> Self {
        self.direct_memory_size = bytes;
        self
    }

    /// Checks that bounds are page aligned and ordered.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for misaligned or inverted bounds, or a search
    /// base outside them.
    pub fn validate(&self) -> VmResult<()> {
        let aligned = (self.va_start | self.va_end | self.map_search_base) & PAGE_MASK == 0;
        let ordered = self.va_start < self.va_end
            && (self.va_start..self.va_end).contains(&self.map_search_base);
        if aligned && ordered {
            Ok(())
        } else {
            Err(VmError::InvalidArgument)
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            va_start: DEFAULT_VA_START,
            va_end: DEFAULT_VA_END,
            map_search_base: DEFAULT_MAP_SEARCH_BASE,
            direct_memory_size: DEFAULT_DIRECT_MEMORY_SIZE,
            flexible_memory_size: DEFAULT_FLEXIBLE_MEMORY_SIZE,
            policy: CoalescingPolicy::default(),
        }
    }
}
