//! POSIX-style `mmap`/`munmap`.
//!
//! Anonymous, file-backed and direct-offset requests all land in the same
//! [`VirtualAddressSpaceManager`]. File contents come from a [`FileSource`];
//! population runs with the manager unlocked, behind an inaccessible
//! placeholder region that is committed or rolled back afterwards.

use orbis_core::addr::checked_align_up;

use crate::manager::{MapRequest, VirtualAddressSpaceManager};
use crate::prot::{MapFlags, Protection};
use crate::region::Backing;
use crate::{PAGE_MASK, PAGE_SIZE, PhysAddr, VirtAddr, VmError, VmResult};

/// Storage behind a file mapping.
pub trait FileSource {
    /// File length in bytes.
    fn len(&self) -> u64;

    /// Returns `true` for an empty file.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads `len` bytes starting at file offset `offset` into the mapping.
    ///
    /// # Errors
    ///
    /// Any error aborts the mapping; it is returned to the `mmap` caller.
    fn populate(&self, offset: u64, len: u64) -> VmResult<()>;
}

/// What an `mmap` request maps.
#[derive(Clone, Copy)]
pub enum MapSource<'a> {
    /// Zero-filled memory from the flexible budget. Requires
    /// [`MapFlags::ANONYMOUS`].
    Anonymous,
    /// File contents starting at the page-aligned `offset`.
    File {
        /// Backing storage.
        source: &'a dyn FileSource,
        /// Page-aligned file offset of the first mapped byte.
        offset: u64,
    },
    /// Allocated direct memory at the given pool offset.
    Direct(PhysAddr),
}

impl core::fmt::Debug for MapSource<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::File { source, offset } => f
                .debug_struct("File")
                .field("len", &source.len())
                .field("offset", offset)
                .finish(),
            Self::Direct(phys) => f.debug_tuple("Direct").field(phys).finish(),
        }
    }
}

/// Checks flag/source combinations and picks the backing.
fn backing_for(flags: MapFlags, source: &MapSource<'_>) -> VmResult<Backing> {
    if flags.contains(MapFlags::SHARED | MapFlags::PRIVATE) {
        return Err(VmError::InvalidArgument);
    }
    let anonymous = flags.contains(MapFlags::ANONYMOUS);
    let stack = flags.contains(MapFlags::STACK);
    match *source {
        MapSource::Anonymous if anonymous && stack => Ok(Backing::Stack),
        MapSource::Anonymous if anonymous => Ok(Backing::Flexible),
        MapSource::File { offset, .. } if !anonymous && !stack && offset & PAGE_MASK == 0 => {
            Ok(Backing::Flexible)
        }
        MapSource::Direct(phys) if !anonymous && !stack => Ok(Backing::Direct { phys }),
        _ => Err(VmError::InvalidArgument),
    }
}

/// Maps `len` bytes (rounded up to whole pages) described by `source`.
///
/// # Errors
///
/// - [`VmError::InvalidArgument`] for a zero length, malformed flags, or a
///   misaligned file offset, plus everything [`VirtualAddressSpaceManager::map`]
///   rejects.
/// - [`VmError::OutOfMemory`] if no space or budget is left.
/// - Whatever [`FileSource::populate`] fails with; the mapping is rolled back.
pub fn mmap(
    vm: &VirtualAddressSpaceManager,
    addr: VirtAddr,
    len: u64,
    prot: Protection,
    flags: MapFlags,
    source: MapSource<'_>,
) -> VmResult<VirtAddr> {
    if len == 0 {
        return Err(VmError::InvalidArgument);
    }
    let size = checked_align_up(len, PAGE_SIZE).ok_or(VmError::InvalidArgument)?;
    let backing = backing_for(flags, &source)?;
    let req = MapRequest::new(backing, size)
        .hint(addr)
        .prot(prot)
        .flags(flags & (MapFlags::FIXED | MapFlags::NO_COALESCE));

    let MapSource::File { source, offset } = source else {
        return vm.map(&req);
    };
    offset.checked_add(size).ok_or(VmError::InvalidArgument)?;

    let start = vm.provision_file(&req)?;
    let file_bytes = source.len().saturating_sub(offset).min(size);
    if file_bytes > 0 {
        if let Err(err) = source.populate(offset, file_bytes) {
            log::debug!("vm: populating [{start}+{size:#x}) failed: {err}");
            vm.unmap(start, size)?;
            return Err(err);
        }
    }
    vm.commit_file(start, &req)?;
    Ok(start)
}

/// Unmaps `len` bytes (rounded up to whole pages) at the page-aligned
/// `addr`.
///
/// # Errors
///
/// [`VmError::InvalidArgument`] for a zero length or a misaligned `addr`.
pub fn munmap(vm: &VirtualAddressSpaceManager, addr: VirtAddr, len: u64) -> VmResult<()> {
    if len == 0 || !addr.is_aligned(PAGE_SIZE) {
        return Err(VmError::InvalidArgument);
    }
    let size = checked_align_up(len, PAGE_SIZE).ok_or(VmError::InvalidArgument)?;
    vm.unmap(addr, size)
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::config::VmConfig;
    use crate::prot::MemoryType;
    use crate::CoalescingPolicy;

    struct MemFile {
        len: u64,
        fail: bool,
        calls: Cell<u32>,
    }

    impl MemFile {
        fn new(len: u64) -> Self {
            Self {
                len,
                fail: false,
                calls: Cell::new(0),
            }
        }
    }

    impl FileSource for MemFile {
        fn len(&self) -> u64 {
            self.len
        }

        fn populate(&self, _offset: u64, _len: u64) -> VmResult<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(VmError::NotFound)
            } else {
                Ok(())
            }
        }
    }

    /// Checks during population that the placeholder is visible and the
    /// manager is not locked.
    struct Observer<'a> {
        vm: &'a VirtualAddressSpaceManager,
    }

    impl FileSource for Observer<'_> {
        fn len(&self) -> u64 {
            0x8000
        }

        fn populate(&self, _offset: u64, _len: u64) -> VmResult<()> {
            let placeholder = self.vm.query_next(VirtAddr::ZERO)?;
            assert_eq!(placeholder.prot, Protection::empty());
            assert!(placeholder.no_coalesce);
            assert_eq!(self.vm.flexible_used(), 0x8000);
            Ok(())
        }
    }

    fn manager() -> VirtualAddressSpaceManager {
        let config = VmConfig::default()
            .with_policy(CoalescingPolicy::CURRENT)
            .with_flexible_memory(0x10_0000)
            .with_direct_memory(0x10_0000);
        VirtualAddressSpaceManager::new(config).unwrap()
    }

    const ANON_PRIVATE: MapFlags = MapFlags::ANONYMOUS.union(MapFlags::PRIVATE);

    #[test]
    fn anonymous_rounds_length_up() {
        let vm = manager();
        let rw = Protection::READ_WRITE;
        let a = mmap(&vm, VirtAddr::ZERO, 0x100, rw, ANON_PRIVATE, MapSource::Anonymous).unwrap();
        let info = vm.query(a).unwrap();
        assert_eq!(info.size(), PAGE_SIZE);
        assert!(info.is_flexible());
        assert_eq!(vm.flexible_used(), PAGE_SIZE);
        munmap(&vm, a, 0x100).unwrap();
        assert_eq!(vm.flexible_used(), 0);
    }

    #[test]
    fn malformed_flags_are_rejected() {
        let vm = manager();
        let file = MemFile::new(0x4000);
        let rw = Protection::READ_WRITE;
        let at = |offset| MapSource::File {
            source: &file,
            offset,
        };
        let cases = [
            (ANON_PRIVATE | MapFlags::SHARED, MapSource::Anonymous),
            (MapFlags::PRIVATE, MapSource::Anonymous),
            (ANON_PRIVATE, at(0)),
            (MapFlags::STACK | MapFlags::PRIVATE, at(0)),
            (MapFlags::PRIVATE, at(0x100)),
            (ANON_PRIVATE, MapSource::Direct(PhysAddr::ZERO)),
        ];
        for (flags, source) in cases {
            assert_eq!(
                mmap(&vm, VirtAddr::ZERO, 0x4000, rw, flags, source),
                Err(VmError::InvalidArgument),
                "{flags:?} {source:?}"
            );
        }
        assert_eq!(
            mmap(&vm, VirtAddr::ZERO, 0, rw, ANON_PRIVATE, MapSource::Anonymous),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(file.calls.get(), 0);
        assert!(vm.regions().0.is_empty());
    }

    #[test]
    fn stack_is_not_budgeted() {
        let vm = manager();
        let flags = ANON_PRIVATE | MapFlags::STACK;
        let rw = Protection::READ_WRITE;
        let a = mmap(&vm, VirtAddr::ZERO, 0x8000, rw, flags, MapSource::Anonymous).unwrap();
        assert!(vm.query(a).unwrap().is_stack());
        assert_eq!(vm.flexible_used(), 0);
    }

    #[test]
    fn direct_offset_route() {
        let vm = manager();
        let end = PhysAddr::new(0x10_0000);
        let phys = vm
            .allocate_direct(PhysAddr::ZERO, end, 0x8000, 0, MemoryType::WB_ONION)
            .unwrap();
        let source = MapSource::Direct(phys);
        let ro = Protection::READ;
        let a = mmap(&vm, VirtAddr::ZERO, 0x8000, ro, MapFlags::SHARED, source).unwrap();
        assert_eq!(vm.query(a).unwrap().direct_offset(), Some(phys));
    }

    #[test]
    fn file_mapping_commits_after_populate() {
        let vm = manager();
        let file = MemFile::new(0x6000);
        let a = mmap(
            &vm,
            VirtAddr::ZERO,
            0x8000,
            Protection::READ,
            MapFlags::PRIVATE,
            MapSource::File { source: &file, offset: 0 },
        )
        .unwrap();
        assert_eq!(file.calls.get(), 1);
        let info = vm.query(a).unwrap();
        assert_eq!(info.prot, Protection::READ);
        assert!(info.is_flexible() && !info.no_coalesce);
        assert_eq!(vm.flexible_used(), 0x8000);
    }

    #[test]
    fn population_runs_unlocked() {
        let vm = manager();
        let observer = Observer { vm: &vm };
        mmap(
            &vm,
            VirtAddr::ZERO,
            0x8000,
            Protection::READ_WRITE,
            MapFlags::SHARED,
            MapSource::File { source: &observer, offset: 0 },
        )
        .unwrap();
    }

    #[test]
    fn failed_population_rolls_back() {
        let vm = manager();
        let file = MemFile {
            fail: true,
            ..MemFile::new(0x4000)
        };
        let res = mmap(
            &vm,
            VirtAddr::ZERO,
            0x4000,
            Protection::READ,
            MapFlags::PRIVATE,
            MapSource::File { source: &file, offset: 0 },
        );
        assert_eq!(res, Err(VmError::NotFound));
        assert!(vm.regions().0.is_empty());
        assert_eq!(vm.flexible_used(), 0);
    }

    #[test]
    fn mapping_past_end_of_file_skips_population() {
        let vm = manager();
        let file = MemFile::new(0x4000);
        mmap(
            &vm,
            VirtAddr::ZERO,
            0x4000,
            Protection::READ,
            MapFlags::PRIVATE,
            MapSource::File { source: &file, offset: 0x8000 },
        )
        .unwrap();
        assert_eq!(file.calls.get(), 0);
    }

    #[test]
    fn munmap_requires_aligned_address() {
        let vm = manager();
        assert_eq!(
            munmap(&vm, VirtAddr::new(0x2_0000_0100), 0x4000),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(munmap(&vm, VirtAddr::new(0x2_0000_0000), 0x10), Ok(()));
    }
}
