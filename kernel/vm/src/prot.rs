//! Protection bits, mapping flags and memory-type tags.
//!
//! Bit values follow the console ABI so raw syscall arguments can be
//! converted with `from_bits` and rejected when they carry unknown bits.

use core::fmt;

use crate::{VmError, VmResult};

bitflags::bitflags! {
    /// CPU and GPU access permissions of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: u32 {
        /// CPU read.
        const READ      = 0x01;
        /// CPU write.
        const WRITE     = 0x02;
        /// CPU execute.
        const EXECUTE   = 0x04;
        /// GPU read.
        const GPU_READ  = 0x10;
        /// GPU write.
        const GPU_WRITE = 0x20;

        /// CPU read and write.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// CPU and GPU read and write.
        const ALL_READ_WRITE = Self::READ_WRITE.bits()
            | Self::GPU_READ.bits()
            | Self::GPU_WRITE.bits();
    }
}

impl Protection {
    /// Converts raw syscall bits, rejecting unknown ones.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] if `raw` has unknown bits set.
    pub fn from_raw(raw: u32) -> VmResult<Self> {
        Self::from_bits(raw).ok_or(VmError::InvalidArgument)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag: Self, c: char| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}{}",
            bit(Self::READ, 'r'),
            bit(Self::WRITE, 'w'),
            bit(Self::EXECUTE, 'x'),
            bit(Self::GPU_READ, 'R'),
            bit(Self::GPU_WRITE, 'W'),
        )
    }
}

bitflags::bitflags! {
    /// Flags accepted by the mapping entry points.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Shared mapping.
        const SHARED      = 0x0001;
        /// Private (copy-on-write) mapping.
        const PRIVATE     = 0x0002;
        /// Place the mapping exactly at the hint or fail.
        const FIXED       = 0x0010;
        /// Thread stack mapping.
        const STACK       = 0x0400;
        /// Not backed by a file.
        const ANONYMOUS   = 0x1000;
        /// Never merge this region with its neighbors.
        const NO_COALESCE = 0x0040_0000;
    }
}

impl MapFlags {
    /// Converts raw syscall bits, rejecting unknown ones.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] if `raw` has unknown bits set.
    pub fn from_raw(raw: u32) -> VmResult<Self> {
        Self::from_bits(raw).ok_or(VmError::InvalidArgument)
    }
}

/// Cache/coherency tag of a direct-memory mapping.
///
/// The hardware knows eleven memory types; the tag is carried through the
/// bookkeeping and only compared for merge decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct MemoryType(u8);

impl MemoryType {
    /// Write-back, CPU-coherent ("onion") memory. The default type.
    pub const WB_ONION: Self = Self(0);
    /// Write-combined, GPU-preferred ("garlic") memory.
    pub const WC_GARLIC: Self = Self(3);
    /// Write-back, GPU-preferred memory.
    pub const WB_GARLIC: Self = Self(10);
    /// Highest valid tag.
    pub const MAX: Self = Self(10);

    /// Validates a raw type tag.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for tags above [`MemoryType::MAX`].
    pub fn new(raw: u8) -> VmResult<Self> {
        if raw > Self::MAX.0 {
            return Err(VmError::InvalidArgument);
        }
        Ok(Self(raw))
    }

    /// Returns the raw tag.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mt{}", self.0)
    }
}
