//! The locked facade over one process address space.
//!
//! [`VirtualAddressSpaceManager`] owns the region table, the direct pool and
//! the flexible budget behind a single reader-writer lock. Every mutating
//! operation is one write-locked critical section that validates the whole
//! request before changing anything; queries take the lock shared.

use alloc::vec::Vec;

use orbis_core::sync::RwLock;

use crate::config::VmConfig;
use crate::direct::{ExtentInfo, PhysicalDirectMemoryAllocator};
use crate::flexible::FlexibleMemoryBudget;
use crate::policy::CoalescingPolicy;
use crate::prot::{MapFlags, MemoryType, Protection};
use crate::region::{Backing, RegionInfo, RegionMap, RegionName, VirtualRegion};
use crate::space::AddressSpace;
use crate::{
    PAGE_MASK, PAGE_SIZE, PhysAddr, VirtAddr, VmError, VmResult, checked_alignment, checked_range,
};

/// Parameters of a single mapping request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    /// Exact address with [`MapFlags::FIXED`], search hint otherwise. A zero
    /// hint searches from the configured map base.
    pub addr: VirtAddr,
    /// Size in bytes, a non-zero multiple of [`PAGE_SIZE`].
    pub size: u64,
    /// Access permissions.
    pub prot: Protection,
    /// `FIXED` and `NO_COALESCE` are honored here.
    pub flags: MapFlags,
    /// What backs the mapping.
    pub backing: Backing,
    /// Memory-type tag.
    pub memory_type: MemoryType,
    /// Placement alignment; zero means one page.
    pub alignment: u64,
    /// Initial range name.
    pub name: RegionName,
}

impl MapRequest {
    /// A read-write, write-back request of `size` bytes placed anywhere.
    #[must_use]
    pub fn new(backing: Backing, size: u64) -> Self {
        Self {
            addr: VirtAddr::ZERO,
            size,
            prot: Protection::READ_WRITE,
            flags: MapFlags::empty(),
            backing,
            memory_type: MemoryType::WB_ONION,
            alignment: 0,
            name: RegionName::empty(),
        }
    }

    /// Uses `addr` as the search hint.
    #[must_use]
    pub fn hint(mut self, addr: VirtAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Places the mapping exactly at `addr`.
    #[must_use]
    pub fn fixed(mut self, addr: VirtAddr) -> Self {
        self.addr = addr;
        self.flags |= MapFlags::FIXED;
        self
    }

    /// Sets the protection.
    #[must_use]
    pub fn prot(mut self, prot: Protection) -> Self {
        self.prot = prot;
        self
    }

    /// Adds mapping flags.
    #[must_use]
    pub fn flags(mut self, flags: MapFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the memory type.
    #[must_use]
    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    /// Sets the placement alignment.
    #[must_use]
    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets the initial name.
    #[must_use]
    pub fn name(mut self, name: RegionName) -> Self {
        self.name = name;
        self
    }
}

/// Everything the lock protects.
#[derive(Debug)]
struct VmState {
    space: AddressSpace,
    direct: PhysicalDirectMemoryAllocator,
    budget: FlexibleMemoryBudget,
    map_search_base: VirtAddr,
}

impl VmState {
    /// Chooses `[start, end)` for `req` without reserving it.
    fn place(&self, req: &MapRequest) -> VmResult<(VirtAddr, VirtAddr)> {
        let align = checked_alignment(req.alignment)?;
        if req.size == 0 || req.size & PAGE_MASK != 0 {
            return Err(VmError::InvalidArgument);
        }
        if !req.flags.contains(MapFlags::FIXED) {
            let hint = if req.addr.is_null() {
                self.map_search_base
            } else {
                req.addr
            };
            let start = self
                .space
                .find_free(hint, req.size, align)
                .ok_or(VmError::OutOfMemory)?;
            return Ok((start, start + req.size));
        }

        let addr = req.addr;
        if addr.is_null() && self.space.policy().reject_fixed_null {
            log::warn!("vm: fixed mapping at null rejected");
            return Err(VmError::InvalidArgument);
        }
        if !addr.is_aligned(align) {
            return Err(VmError::InvalidArgument);
        }
        let end = addr
            .checked_add(req.size)
            .filter(|&end| end <= self.space.limit())
            .ok_or(VmError::InvalidArgument)?;
        if !self.space.is_free(addr, end) {
            log::warn!("vm: fixed mapping [{addr}..{end}) collides with a mapped region");
            return Err(VmError::InvalidArgument);
        }
        Ok((addr, end))
    }

    fn map(&mut self, req: &MapRequest) -> VmResult<VirtAddr> {
        let (start, end) = self.place(req)?;
        match req.backing {
            Backing::Direct { phys } => {
                if !phys.is_aligned(PAGE_SIZE) || !self.direct.is_allocated(phys, req.size) {
                    log::warn!(
                        "vm: direct mapping of unallocated [{phys:#x}..{:#x})",
                        phys.as_u64().saturating_add(req.size)
                    );
                    return Err(VmError::InvalidArgument);
                }
            }
            Backing::Flexible => self.budget.reserve(req.size)?,
            Backing::Reserved | Backing::Stack => {}
        }

        let name_stamp = if req.name.is_empty() {
            0
        } else {
            self.space.next_name_stamp()
        };
        let mut region = VirtualRegion::new(start, end, req.prot, req.memory_type, req.backing);
        region.name = req.name.clone();
        region.name_stamp = name_stamp;
        region.no_coalesce = req.flags.contains(MapFlags::NO_COALESCE);
        self.space.insert(region);
        log::debug!(
            "vm: mapped [{start}..{end}) {} {} {}",
            req.prot,
            req.memory_type,
            req.backing.tag()
        );
        Ok(start)
    }

    /// Unmaps what is left of a file placeholder inside `[start, end)`.
    fn discard_placeholder(&mut self, start: VirtAddr, end: VirtAddr) {
        let pieces: Vec<_> = self
            .space
            .overlapping(start, end)
            .filter(|r| is_file_placeholder(r))
            .map(|r| (r.start.max(start), r.end.min(end)))
            .collect();
        for (s, e) in pieces {
            self.unmap(s, e);
        }
    }

    fn unmap(&mut self, start: VirtAddr, end: VirtAddr) {
        let removed = self.space.remove_range(start, end);
        let credit: u64 = removed
            .iter()
            .filter(|r| r.backing.is_budgeted())
            .map(VirtualRegion::size)
            .sum();
        self.budget.release(credit);
        if !removed.is_empty() {
            log::debug!(
                "vm: unmapped [{start}..{end}) ({} pieces, {credit:#x} flexible bytes)",
                removed.len()
            );
        }
    }
}

/// Inaccessible, unmergeable flexible region standing in for a file
/// mapping under population.
fn is_file_placeholder(region: &VirtualRegion) -> bool {
    region.backing == Backing::Flexible && region.no_coalesce && region.prot.is_empty()
}

/// Virtual address space manager of one process.
#[derive(Debug)]
pub struct VirtualAddressSpaceManager {
    config: VmConfig,
    state: RwLock<VmState>,
}

impl VirtualAddressSpaceManager {
    /// Creates an empty address space.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] if `config` fails
    /// [`VmConfig::validate`].
    pub fn new(config: VmConfig) -> VmResult<Self> {
        config.validate()?;
        let state = VmState {
            space: AddressSpace::new(
                VirtAddr::new(config.va_start),
                VirtAddr::new(config.va_end),
                config.policy,
            ),
            direct: PhysicalDirectMemoryAllocator::new(config.direct_memory_size),
            budget: FlexibleMemoryBudget::new(config.flexible_memory_size),
            map_search_base: VirtAddr::new(config.map_search_base),
        };
        Ok(Self {
            config,
            state: RwLock::new(state),
        })
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The active coalescing policy.
    #[must_use]
    pub fn policy(&self) -> CoalescingPolicy {
        self.config.policy
    }

    /// Maps a new region.
    ///
    /// With [`MapFlags::FIXED`] the exact range must be free; otherwise the
    /// lowest free range at or after the hint is used. Flexible mappings are
    /// charged to the budget, direct mappings must target allocated pool
    /// memory.
    ///
    /// # Errors
    ///
    /// - [`VmError::InvalidArgument`] for bad sizes or alignment, a fixed
    ///   collision, a disallowed null address, or unallocated direct memory.
    /// - [`VmError::OutOfMemory`] if no free range fits or the flexible
    ///   budget is exhausted.
    pub fn map(&self, req: &MapRequest) -> VmResult<VirtAddr> {
        self.state.write().map(req)
    }

    /// Removes every mapping in `[addr, addr + size)`, splitting regions that
    /// straddle the boundaries. Unmapped holes are not an error.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for a misaligned, empty or overflowing range.
    pub fn unmap(&self, addr: VirtAddr, size: u64) -> VmResult<()> {
        let end = checked_range(addr.as_u64(), size)?;
        self.state.write().unmap(addr, VirtAddr::new(end));
        Ok(())
    }

    /// Changes the protection of every mapped, non-reserved region in
    /// `[addr, addr + size)`.
    ///
    /// # Errors
    ///
    /// [`VmError::NotFound`] if nothing is mapped in the range.
    pub fn protect(&self, addr: VirtAddr, size: u64, prot: Protection) -> VmResult<()> {
        self.retag(addr, size, prot, None)
    }

    /// Like [`protect`](Self::protect), also replacing the memory type.
    ///
    /// # Errors
    ///
    /// As [`protect`](Self::protect).
    pub fn type_protect(
        &self,
        addr: VirtAddr,
        size: u64,
        memory_type: MemoryType,
        prot: Protection,
    ) -> VmResult<()> {
        self.retag(addr, size, prot, Some(memory_type))
    }

    fn retag(
        &self,
        addr: VirtAddr,
        size: u64,
        prot: Protection,
        memory_type: Option<MemoryType>,
    ) -> VmResult<()> {
        let end = VirtAddr::new(checked_range(addr.as_u64(), size)?);
        let mut state = self.state.write();
        if state.space.is_free(addr, end) {
            return Err(VmError::NotFound);
        }
        state.space.retag(addr, end, prot, memory_type);
        log::debug!("vm: protect [{addr}..{end}) {prot}");
        Ok(())
    }

    /// Names the fully mapped range `[addr, addr + size)`.
    ///
    /// Regions straddling the boundaries are split, then the range and its
    /// immediate neighbors go through a merge pass.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for a bad name or a range with holes.
    pub fn set_range_name(&self, addr: VirtAddr, size: u64, name: &str) -> VmResult<()> {
        let name = RegionName::new(name)?;
        let end = VirtAddr::new(checked_range(addr.as_u64(), size)?);
        let mut state = self.state.write();
        if !state.space.is_fully_mapped(addr, end) {
            log::warn!("vm: naming [{addr}..{end}) which is not fully mapped");
            return Err(VmError::InvalidArgument);
        }
        state.space.set_name(addr, end, &name);
        log::debug!("vm: named [{addr}..{end}) \"{name}\"");
        Ok(())
    }

    /// Returns the region containing `addr`.
    ///
    /// # Errors
    ///
    /// [`VmError::NotFound`] if `addr` is unmapped.
    pub fn query(&self, addr: VirtAddr) -> VmResult<RegionInfo> {
        self.state
            .read()
            .space
            .find(addr)
            .map(VirtualRegion::info)
            .ok_or(VmError::NotFound)
    }

    /// Returns the first region starting at or after `addr`.
    ///
    /// # Errors
    ///
    /// [`VmError::NotFound`] if no region starts at or after `addr`.
    pub fn query_next(&self, addr: VirtAddr) -> VmResult<RegionInfo> {
        self.state
            .read()
            .space
            .next_at_or_after(addr)
            .map(VirtualRegion::info)
            .ok_or(VmError::NotFound)
    }

    /// Returns `(start, end, prot)` of the region containing `addr`.
    ///
    /// # Errors
    ///
    /// [`VmError::NotFound`] if `addr` is unmapped.
    pub fn query_protection(&self, addr: VirtAddr) -> VmResult<(VirtAddr, VirtAddr, Protection)> {
        self.state
            .read()
            .space
            .find(addr)
            .map(|r| (r.start, r.end, r.prot))
            .ok_or(VmError::NotFound)
    }

    /// Reserves address space without backing or access rights.
    /// `NO_COALESCE` in `flags` keeps the reservation from ever merging.
    ///
    /// # Errors
    ///
    /// As [`map`](Self::map), except that nothing is charged to a budget.
    pub fn reserve(
        &self,
        addr: VirtAddr,
        size: u64,
        flags: MapFlags,
        alignment: u64,
    ) -> VmResult<VirtAddr> {
        let req = MapRequest {
            addr,
            size,
            prot: Protection::empty(),
            flags: flags & (MapFlags::FIXED | MapFlags::NO_COALESCE),
            backing: Backing::Reserved,
            memory_type: MemoryType::WB_ONION,
            alignment,
            name: RegionName::empty(),
        };
        self.map(&req)
    }

    /// Allocates `size` bytes of direct memory inside
    /// `[search_start, search_end)`.
    ///
    /// # Errors
    ///
    /// - [`VmError::InvalidArgument`] for a misaligned size or alignment, or an
    ///   empty or inverted search range.
    /// - [`VmError::OutOfMemory`] if no free chunk fits.
    pub fn allocate_direct(
        &self,
        search_start: PhysAddr,
        search_end: PhysAddr,
        size: u64,
        alignment: u64,
        memory_type: MemoryType,
    ) -> VmResult<PhysAddr> {
        self.state
            .write()
            .direct
            .allocate(search_start, search_end, size, alignment, memory_type)
    }

    /// Frees `[offset, offset + size)` of the direct pool and unmaps every
    /// virtual range backed by it.
    ///
    /// # Errors
    ///
    /// - [`VmError::InvalidArgument`] if `checked` and the range is not
    ///   exactly one allocation, or the range is malformed.
    /// - [`VmError::NotFound`] if nothing in the range is allocated.
    pub fn release_direct(&self, offset: PhysAddr, size: u64, checked: bool) -> VmResult<()> {
        let mut state = self.state.write();
        if let Err(err) = state.direct.check_release(offset, size, checked) {
            if checked && err == VmError::InvalidArgument {
                log::warn!("vm: checked release of [{offset:#x}+{size:#x}) matches no allocation");
            }
            return Err(err);
        }
        state.direct.free(offset, size)?;

        let phys_start = offset.as_u64();
        let aliases = state.space.direct_aliases(phys_start, phys_start + size);
        for &(start, end) in &aliases {
            state.unmap(start, end);
        }
        log::debug!(
            "vm: released direct [{offset:#x}+{size:#x}), {} mappings dropped",
            aliases.len()
        );
        Ok(())
    }

    /// Largest free chunk of the direct pool inside `[start, end)`.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for an inverted range or a bad alignment.
    pub fn available_direct(
        &self,
        start: PhysAddr,
        end: PhysAddr,
        alignment: u64,
    ) -> VmResult<(PhysAddr, u64)> {
        self.state.read().direct.available_size(start, end, alignment)
    }

    /// The direct allocation containing `offset`.
    ///
    /// # Errors
    ///
    /// [`VmError::NotFound`] if `offset` is not allocated.
    pub fn direct_memory_type(&self, offset: PhysAddr) -> VmResult<ExtentInfo> {
        self.state.read().direct.query_type(offset)
    }

    /// Size of the direct pool.
    #[must_use]
    pub fn direct_memory_size(&self) -> u64 {
        self.state.read().direct.total_size()
    }

    /// Bytes left in the flexible budget.
    #[must_use]
    pub fn available_flexible(&self) -> u64 {
        self.state.read().budget.available()
    }

    /// Bytes charged to the flexible budget.
    #[must_use]
    pub fn flexible_used(&self) -> u64 {
        self.state.read().budget.used()
    }

    /// Snapshot of every region in address order.
    #[must_use]
    pub fn regions(&self) -> RegionMap {
        RegionMap(self.state.read().space.iter().map(VirtualRegion::info).collect())
    }

    /// Maps an inaccessible, unmergeable flexible placeholder for a file
    /// mapping that is populated outside the lock.
    ///
    /// # Errors
    ///
    /// As [`map`](Self::map).
    pub(crate) fn provision_file(&self, req: &MapRequest) -> VmResult<VirtAddr> {
        let placeholder = MapRequest {
            prot: Protection::empty(),
            flags: (req.flags & MapFlags::FIXED) | MapFlags::NO_COALESCE,
            backing: Backing::Flexible,
            name: RegionName::empty(),
            ..req.clone()
        };
        self.map(&placeholder)
    }

    /// Turns the placeholder at `start` into the final mapping.
    ///
    /// # Errors
    ///
    /// [`VmError::NotFound`] if the placeholder was unmapped or cut while
    /// the lock was released. Any surviving placeholder pieces are unmapped
    /// and credited back to the budget.
    pub(crate) fn commit_file(&self, start: VirtAddr, req: &MapRequest) -> VmResult<()> {
        let mut state = self.state.write();
        let end = start + req.size;
        let merges = state.space.policy().coalesce_on_map;
        let stamp = if req.name.is_empty() {
            0
        } else {
            state.space.next_name_stamp()
        };
        let intact = state
            .space
            .find(start)
            .is_some_and(|r| r.start == start && r.end == end && is_file_placeholder(r));
        if !intact {
            log::debug!("vm: file placeholder [{start}..{end}) was cut, discarding it");
            state.discard_placeholder(start, end);
            return Err(VmError::NotFound);
        }
        let region = state.space.region_mut(start).ok_or(VmError::NotFound)?;
        region.prot = req.prot;
        region.memory_type = req.memory_type;
        region.no_coalesce = req.flags.contains(MapFlags::NO_COALESCE);
        region.name = req.name.clone();
        region.name_stamp = stamp;
        if merges && !region.no_coalesce {
            state.space.merge_span(start, end);
        }
        log::debug!("vm: committed file mapping [{start}..{end}) {}", req.prot);
        Ok(())
    }
}
