//! Virtual-memory region manager for the orbis kernel.
//!
//! This crate is the bookkeeping layer behind the console memory syscalls.
//! It tracks which parts of a process address space are mapped, what backs
//! them, and with which protection, memory type and name. It does not touch
//! page tables: callers translate the committed regions into real mappings.
//!
//! # Layout
//!
//! - [`direct`]: extents of the bounded direct (physical) memory pool.
//! - [`flexible`]: the capped budget shared by anonymous and file mappings.
//! - [`policy`]: the merge/split decision table for one firmware revision.
//! - [`space`]: the ordered region table and its split/merge algorithms.
//! - [`manager`]: the locked facade composing all of the above.
//! - [`api`]: the console-style entry points built on the manager.
//! - [`mmap`]: the POSIX-style `mmap`/`munmap` route.
//! - [`config`]: pool sizes, address bounds and the policy revision.
//!
//! Everything is host-testable; the crate is `no_std` outside of tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod api;
pub mod config;
pub mod direct;
pub mod flexible;
pub mod manager;
pub mod mmap;
pub mod policy;
pub mod prot;
pub mod region;
pub mod space;

pub use config::VmConfig;
pub use manager::{MapRequest, VirtualAddressSpaceManager};
pub use orbis_core::addr::{PhysAddr, VirtAddr};
pub use policy::CoalescingPolicy;
pub use prot::{MapFlags, MemoryType, Protection};
pub use region::{Backing, PhysRun, RegionInfo, RegionName, VirtualRegion};

/// Page granularity of the console address space (16 KiB).
pub const PAGE_SIZE: u64 = 0x4000;

/// Mask of the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Errors reported by every public operation of this crate.
///
/// The variants mirror the kernel's errno taxonomy; see
/// [`errno`](Self::errno) and [`kernel_code`](Self::kernel_code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Misaligned or zero size, inverted range, fixed-mapping collision,
    /// disallowed null address, malformed flags, or a naming request over
    /// a range that is not fully mapped.
    #[error("invalid argument")]
    InvalidArgument,
    /// The flexible budget, the direct pool, or the virtual range is
    /// exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// Nothing is mapped or allocated where the caller pointed.
    #[error("not found")]
    NotFound,
}

impl VmError {
    /// Returns the POSIX errno value for this error.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => 22,
            Self::OutOfMemory => 12,
            Self::NotFound => 2,
        }
    }

    /// Returns the console kernel error code (`0x8002_0000 | errno`).
    #[must_use]
    pub const fn kernel_code(self) -> u32 {
        0x8002_0000 | self.errno() as u32
    }
}

/// Result alias used across the crate.
pub type VmResult<T> = Result<T, VmError>;

/// Validates a page-aligned, non-empty `[addr, addr + size)` range and
/// returns its exclusive end.
pub(crate) fn checked_range(addr: u64, size: u64) -> VmResult<u64> {
    if size == 0 || size & PAGE_MASK != 0 || addr & PAGE_MASK != 0 {
        return Err(VmError::InvalidArgument);
    }
    addr.checked_add(size).ok_or(VmError::InvalidArgument)
}

/// Normalizes a caller alignment: zero means one page, anything else must
/// be a power of two no smaller than a page.
pub(crate) fn checked_alignment(alignment: u64) -> VmResult<u64> {
    match alignment {
        0 => Ok(PAGE_SIZE),
        a if a.is_power_of_two() && a >= PAGE_SIZE => Ok(a),
        _ => Err(VmError::InvalidArgument),
    }
}
