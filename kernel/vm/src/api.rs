//! Console-style memory entry points.
//!
//! Thin wrappers that take raw syscall arguments (protection bits, flag
//! words, signed memory-type tags), validate them, and call into the
//! [`VirtualAddressSpaceManager`]. Sizes and addresses must already be page
//! aligned here; only the POSIX route in [`crate::mmap`] rounds.

use crate::direct::ExtentInfo;
use crate::manager::{MapRequest, VirtualAddressSpaceManager};
use crate::prot::{MapFlags, MemoryType, Protection};
use crate::region::{Backing, RegionInfo, RegionName};
use crate::{PhysAddr, VirtAddr, VmError, VmResult};

/// Flags the explicit map calls honor.
const MAP_CALL_FLAGS: MapFlags = MapFlags::FIXED.union(MapFlags::NO_COALESCE);

fn memory_type(raw: i32) -> VmResult<MemoryType> {
    u8::try_from(raw)
        .map_err(|_| VmError::InvalidArgument)
        .and_then(MemoryType::new)
}

fn map_flags(raw: u32) -> VmResult<MapFlags> {
    MapFlags::from_raw(raw).map(|f| f & MAP_CALL_FLAGS)
}

/// Allocates `len` bytes of direct memory inside `[search_start, search_end)`.
///
/// # Errors
///
/// [`VmError::InvalidArgument`] for an unknown memory type, plus everything
/// [`VirtualAddressSpaceManager::allocate_direct`] rejects.
pub fn allocate_direct_memory(
    vm: &VirtualAddressSpaceManager,
    search_start: u64,
    search_end: u64,
    len: u64,
    alignment: u64,
    memory_type_raw: i32,
) -> VmResult<PhysAddr> {
    let mt = memory_type(memory_type_raw)?;
    vm.allocate_direct(
        PhysAddr::new(search_start),
        PhysAddr::new(search_end),
        len,
        alignment,
        mt,
    )
}

/// Allocates `len` bytes anywhere in the direct pool.
///
/// # Errors
///
/// As [`allocate_direct_memory`].
pub fn allocate_main_direct_memory(
    vm: &VirtualAddressSpaceManager,
    len: u64,
    alignment: u64,
    memory_type_raw: i32,
) -> VmResult<PhysAddr> {
    let total = vm.direct_memory_size();
    allocate_direct_memory(vm, 0, total, len, alignment, memory_type_raw)
}

#[allow(clippy::too_many_arguments)]
fn map_direct(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    mt: MemoryType,
    prot: u32,
    flags: u32,
    direct_offset: u64,
    alignment: u64,
    name: RegionName,
) -> VmResult<VirtAddr> {
    let req = MapRequest::new(
        Backing::Direct {
            phys: PhysAddr::new(direct_offset),
        },
        len,
    )
    .hint(addr)
    .prot(Protection::from_raw(prot)?)
    .flags(map_flags(flags)?)
    .memory_type(mt)
    .alignment(alignment)
    .name(name);
    vm.map(&req)
}

/// Type of the allocation at `direct_offset`; unallocated memory cannot be
/// mapped.
fn extent_type(vm: &VirtualAddressSpaceManager, direct_offset: u64) -> VmResult<MemoryType> {
    vm.direct_memory_type(PhysAddr::new(direct_offset))
        .map(|e| e.memory_type)
        .map_err(|_| VmError::InvalidArgument)
}

/// Maps allocated direct memory with the memory type chosen at allocation.
///
/// # Errors
///
/// - [`VmError::InvalidArgument`] if `direct_offset` is not allocated, or for
///   unknown protection or flag bits.
/// - Everything [`VirtualAddressSpaceManager::map`] rejects.
pub fn map_direct_memory(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    prot: u32,
    flags: u32,
    direct_offset: u64,
    alignment: u64,
) -> VmResult<VirtAddr> {
    let mt = extent_type(vm, direct_offset)?;
    map_direct(
        vm,
        addr,
        len,
        mt,
        prot,
        flags,
        direct_offset,
        alignment,
        RegionName::empty(),
    )
}

/// Maps allocated direct memory with an explicit memory type.
///
/// # Errors
///
/// - [`VmError::InvalidArgument`] for an unknown memory type, protection or
///   flag bits.
/// - Everything [`VirtualAddressSpaceManager::map`] rejects.
#[allow(clippy::too_many_arguments)]
pub fn map_direct_memory2(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    memory_type_raw: i32,
    prot: u32,
    flags: u32,
    direct_offset: u64,
    alignment: u64,
) -> VmResult<VirtAddr> {
    let mt = memory_type(memory_type_raw)?;
    map_direct(
        vm,
        addr,
        len,
        mt,
        prot,
        flags,
        direct_offset,
        alignment,
        RegionName::empty(),
    )
}

/// Like [`map_direct_memory`], naming the new range.
///
/// # Errors
///
/// As [`map_direct_memory`], plus [`VmError::InvalidArgument`] for an
/// invalid name.
#[allow(clippy::too_many_arguments)]
pub fn map_named_direct_memory(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    prot: u32,
    flags: u32,
    direct_offset: u64,
    alignment: u64,
    name: &str,
) -> VmResult<VirtAddr> {
    let name = RegionName::new(name)?;
    let mt = extent_type(vm, direct_offset)?;
    map_direct(
        vm,
        addr,
        len,
        mt,
        prot,
        flags,
        direct_offset,
        alignment,
        name,
    )
}

/// Maps `len` bytes of flexible memory.
///
/// # Errors
///
/// Everything [`VirtualAddressSpaceManager::map`] rejects, plus
/// [`VmError::InvalidArgument`] for unknown protection or flag bits.
pub fn map_flexible_memory(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    prot: u32,
    flags: u32,
) -> VmResult<VirtAddr> {
    map_named_flexible_memory(vm, addr, len, prot, flags, "")
}

/// Maps `len` bytes of flexible memory under `name`.
///
/// # Errors
///
/// Everything [`VirtualAddressSpaceManager::map`] rejects, plus
/// [`VmError::InvalidArgument`] for unknown protection or flag bits.
/// Invalid names fail the same way.
pub fn map_named_flexible_memory(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    prot: u32,
    flags: u32,
    name: &str,
) -> VmResult<VirtAddr> {
    let req = MapRequest::new(Backing::Flexible, len)
        .hint(addr)
        .prot(Protection::from_raw(prot)?)
        .flags(map_flags(flags)?)
        .name(RegionName::new(name)?);
    vm.map(&req)
}

/// System-library variant of [`map_named_flexible_memory`]. It draws from
/// the same budget.
///
/// # Errors
///
/// As [`map_named_flexible_memory`].
pub fn map_named_system_flexible_memory(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    prot: u32,
    flags: u32,
    name: &str,
) -> VmResult<VirtAddr> {
    map_named_flexible_memory(vm, addr, len, prot, flags, name)
}

/// Reserves `len` bytes of address space.
///
/// # Errors
///
/// [`VmError::InvalidArgument`] for unknown flag bits, plus everything
/// [`VirtualAddressSpaceManager::reserve`] rejects.
pub fn reserve_virtual_range(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    flags: u32,
    alignment: u64,
) -> VmResult<VirtAddr> {
    vm.reserve(addr, len, map_flags(flags)?, alignment)
}

/// Changes protection over `[addr, addr + len)`.
///
/// # Errors
///
/// [`VmError::InvalidArgument`] for unknown protection bits, plus everything
/// [`VirtualAddressSpaceManager::protect`] rejects.
pub fn protect(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    prot: u32,
) -> VmResult<()> {
    vm.protect(addr, len, Protection::from_raw(prot)?)
}

/// Changes memory type and protection over `[addr, addr + len)`.
///
/// # Errors
///
/// [`VmError::InvalidArgument`] for an unknown memory type or protection
/// bits, plus everything [`VirtualAddressSpaceManager::type_protect`] rejects.
pub fn type_protect(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    memory_type_raw: i32,
    prot: u32,
) -> VmResult<()> {
    let mt = memory_type(memory_type_raw)?;
    vm.type_protect(addr, len, mt, Protection::from_raw(prot)?)
}

/// Names the fully mapped range `[addr, addr + len)`.
///
/// # Errors
///
/// As [`VirtualAddressSpaceManager::set_range_name`].
pub fn set_virtual_range_name(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    name: &str,
) -> VmResult<()> {
    vm.set_range_name(addr, len, name)
}

/// Region containing `addr`.
///
/// # Errors
///
/// [`VmError::NotFound`] if `addr` is unmapped.
pub fn query_at(vm: &VirtualAddressSpaceManager, addr: VirtAddr) -> VmResult<RegionInfo> {
    vm.query(addr)
}

/// First region starting at or after `addr`.
///
/// # Errors
///
/// [`VmError::NotFound`] if no region starts at or after `addr`.
pub fn query_next_at(vm: &VirtualAddressSpaceManager, addr: VirtAddr) -> VmResult<RegionInfo> {
    vm.query_next(addr)
}

/// `(start, end, prot)` of the region containing `addr`.
///
/// # Errors
///
/// [`VmError::NotFound`] if `addr` is unmapped.
pub fn query_protection(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
) -> VmResult<(VirtAddr, VirtAddr, Protection)> {
    vm.query_protection(addr)
}

/// Frees direct memory and unmaps everything backed by it.
///
/// # Errors
///
/// As [`VirtualAddressSpaceManager::release_direct`].
pub fn release_direct_memory(
    vm: &VirtualAddressSpaceManager,
    offset: u64,
    len: u64,
) -> VmResult<()> {
    vm.release_direct(PhysAddr::new(offset), len, false)
}

/// Like [`release_direct_memory`], but `[offset, offset + len)` must be
/// exactly one earlier allocation.
///
/// # Errors
///
/// As [`VirtualAddressSpaceManager::release_direct`].
pub fn release_direct_memory_checked(
    vm: &VirtualAddressSpaceManager,
    offset: u64,
    len: u64,
) -> VmResult<()> {
    vm.release_direct(PhysAddr::new(offset), len, true)
}

/// Unmaps flexible memory, crediting the budget.
///
/// # Errors
///
/// As [`VirtualAddressSpaceManager::unmap`].
pub fn release_flexible_memory(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
) -> VmResult<()> {
    vm.unmap(addr, len)
}

/// The allocation containing `offset`.
///
/// # Errors
///
/// [`VmError::NotFound`] if `offset` is not allocated.
pub fn get_direct_memory_type(
    vm: &VirtualAddressSpaceManager,
    offset: u64,
) -> VmResult<ExtentInfo> {
    vm.direct_memory_type(PhysAddr::new(offset))
}

/// Largest free direct chunk inside `[start, end)` as `(offset, size)`.
///
/// # Errors
///
/// [`VmError::InvalidArgument`] for an inverted range or a bad alignment.
pub fn available_direct_memory_size(
    vm: &VirtualAddressSpaceManager,
    start: u64,
    end: u64,
    alignment: u64,
) -> VmResult<(PhysAddr, u64)> {
    vm.available_direct(PhysAddr::new(start), PhysAddr::new(end), alignment)
}

/// Bytes left in the flexible budget.
#[must_use]
pub fn available_flexible_memory_size(vm: &VirtualAddressSpaceManager) -> u64 {
    vm.available_flexible()
}

/// Size of the direct pool.
#[must_use]
pub fn direct_memory_size(vm: &VirtualAddressSpaceManager) -> u64 {
    vm.direct_memory_size()
}

/// One operation of a [`batch_map`] call. Map entries are placed at their
/// exact address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEntry {
    /// [`map_direct_memory2`] at a fixed address.
    MapDirect {
        /// Target address.
        addr: VirtAddr,
        /// Length in bytes.
        len: u64,
        /// Raw protection bits.
        prot: u32,
        /// Raw memory type.
        memory_type: i32,
        /// Pool offset.
        offset: u64,
    },
    /// [`map_flexible_memory`] at a fixed address.
    MapFlexible {
        /// Target address.
        addr: VirtAddr,
        /// Length in bytes.
        len: u64,
        /// Raw protection bits.
        prot: u32,
    },
    /// Unmap.
    Unmap {
        /// Start address.
        addr: VirtAddr,
        /// Length in bytes.
        len: u64,
    },
    /// [`protect`].
    Protect {
        /// Start address.
        addr: VirtAddr,
        /// Length in bytes.
        len: u64,
        /// Raw protection bits.
        prot: u32,
    },
    /// [`type_protect`].
    TypeProtect {
        /// Start address.
        addr: VirtAddr,
        /// Length in bytes.
        len: u64,
        /// Raw memory type.
        memory_type: i32,
        /// Raw protection bits.
        prot: u32,
    },
}

/// Applies `entries` in order and stops at the first failure.
///
/// Returns how many entries succeeded and the failing entry's error, if
/// any. Each entry is atomic; the batch is not.
pub fn batch_map(
    vm: &VirtualAddressSpaceManager,
    entries: &[BatchEntry],
) -> (usize, VmResult<()>) {
    let fixed = MapFlags::FIXED.bits();
    for (done, entry) in entries.iter().enumerate() {
        let res = match *entry {
            BatchEntry::MapDirect {
                addr,
                len,
                prot,
                memory_type,
                offset,
            } => map_direct_memory2(vm, addr, len, memory_type, prot, fixed, offset, 0).map(drop),
            BatchEntry::MapFlexible { addr, len, prot } => {
                map_flexible_memory(vm, addr, len, prot, fixed).map(drop)
            }
            BatchEntry::Unmap { addr, len } => vm.unmap(addr, len),
            BatchEntry::Protect { addr, len, prot } => protect(vm, addr, len, prot),
            BatchEntry::TypeProtect {
                addr,
                len,
                memory_type,
                prot,
            } => type_protect(vm, addr, len, memory_type, prot),
        };
        if let Err(err) = res {
            log::debug!("vm: batch stopped at entry {done}: {err}");
            return (done, Err(err));
        }
    }
    (entries.len(), Ok(()))
}
