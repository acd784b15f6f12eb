//! Region records kept in the address-space table.

use alloc::vec::Vec;
use core::fmt;

use crate::prot::{MemoryType, Protection};
use crate::{PAGE_SIZE, PhysAddr, VirtAddr, VmError, VmResult};

/// Longest accepted range name, in bytes.
pub const RANGE_NAME_MAX: usize = 31;

/// Short inline name attached to a range of the address space.
///
/// The ABI buffer is 32 bytes including the terminator, hence at most
/// [`RANGE_NAME_MAX`] bytes of text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RegionName(heapless::String<32>);

impl RegionName {
    /// The empty name.
    #[must_use]
    pub const fn empty() -> Self {
        Self(heapless::String::new())
    }

    /// Validates and copies `name`.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] if `name` is longer than [`RANGE_NAME_MAX`]
    /// bytes or contains a NUL.
    pub fn new(name: &str) -> VmResult<Self> {
        if name.len() > RANGE_NAME_MAX || name.contains('\0') {
            return Err(VmError::InvalidArgument);
        }
        let mut s = heapless::String::new();
        s.push_str(name).map_err(|()| VmError::InvalidArgument)?;
        Ok(Self(s))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if no name is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a region is backed by.
///
/// This is a closed set; every operation matches on it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backing {
    /// Anonymous or file-backed memory charged to the flexible budget.
    Flexible,
    /// Direct memory starting at `phys` in the direct pool.
    Direct {
        /// Pool offset backing the first byte of the region.
        phys: PhysAddr,
    },
    /// Address space held without any backing or access rights.
    Reserved,
    /// Thread stack.
    Stack,
}

impl Backing {
    /// Returns `true` if regions of this kind are charged to the flexible
    /// budget.
    #[must_use]
    pub const fn is_budgeted(&self) -> bool {
        matches!(self, Self::Flexible)
    }

    /// Short tag used in region dumps.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Flexible => "flex",
            Self::Direct { .. } => "direct",
            Self::Reserved => "rsvd",
            Self::Stack => "stack",
        }
    }
}

/// Stretch of a direct region backed by consecutive pool offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysRun {
    /// Length in bytes, a multiple of the page size.
    pub len: u64,
    /// Pool offset of the first byte.
    pub phys: PhysAddr,
}

impl PhysRun {
    /// One past the last pool offset of the run.
    #[must_use]
    pub fn phys_end(&self) -> PhysAddr {
        self.phys + self.len
    }
}

/// Pool offset `offset` bytes into a run list.
fn run_lookup(runs: &[PhysRun], mut offset: u64) -> Option<PhysAddr> {
    for run in runs {
        if offset < run.len {
            return Some(run.phys + offset);
        }
        offset -= run.len;
    }
    None
}

/// Appends `run`, folding it into the last run when the offsets continue.
fn push_run(runs: &mut Vec<PhysRun>, run: PhysRun) {
    match runs.last_mut() {
        Some(last) if last.phys_end() == run.phys => last.len += run.len,
        _ => runs.push(run),
    }
}

/// Cuts a run list `offset` bytes in and returns the tail.
fn split_runs(runs: &mut Vec<PhysRun>, offset: u64) -> Vec<PhysRun> {
    let mut run_end = 0;
    let Some(i) = runs.iter().position(|r| {
        run_end += r.len;
        offset < run_end
    }) else {
        return Vec::new();
    };
    let mut tail = runs.split_off(i);
    let run = tail[0];
    let inner = offset - (run_end - run.len);
    if inner > 0 {
        runs.push(PhysRun {
            len: inner,
            phys: run.phys,
        });
        tail[0] = PhysRun {
            len: run.len - inner,
            phys: run.phys + inner,
        };
    }
    tail
}

/// A contiguous, attribute-uniform span of virtual address space.
///
/// `start` and `end` are page-aligned and `start < end`. A direct region
/// may be the merge of pieces backed by unrelated pool offsets; `runs`
/// records them in virtual order and `backing` holds the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualRegion {
    /// First byte of the region.
    pub start: VirtAddr,
    /// One past the last byte.
    pub end: VirtAddr,
    /// Access permissions.
    pub prot: Protection,
    /// Memory-type tag.
    pub memory_type: MemoryType,
    /// Backing kind.
    pub backing: Backing,
    /// Range name, possibly empty.
    pub name: RegionName,
    /// Sequence number of the last name assignment. Higher is newer.
    pub name_stamp: u64,
    /// Permanently excluded from merging.
    pub no_coalesce: bool,
    /// Pool runs of a direct region, summing to its size. Empty otherwise.
    pub(crate) runs: Vec<PhysRun>,
}

impl VirtualRegion {
    /// Creates an unnamed, mergeable region over `[start, end)`.
    #[must_use]
    pub fn new(
        start: VirtAddr,
        end: VirtAddr,
        prot: Protection,
        memory_type: MemoryType,
        backing: Backing,
    ) -> Self {
        let runs = match backing {
            Backing::Direct { phys } => alloc::vec![PhysRun {
                len: end - start,
                phys,
            }],
            Backing::Flexible | Backing::Reserved | Backing::Stack => Vec::new(),
        };
        Self {
            start,
            end,
            prot,
            memory_type,
            backing,
            name: RegionName::empty(),
            name_stamp: 0,
            no_coalesce: false,
            runs,
        }
    }

    /// Pool runs backing a direct region, in virtual order.
    #[must_use]
    pub fn runs(&self) -> &[PhysRun] {
        &self.runs
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if `addr` lies inside the region.
    #[must_use]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Returns `true` if the region intersects `[start, end)`.
    #[must_use]
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end
    }

    /// Pool offset backing `addr`, for direct regions.
    #[must_use]
    pub fn phys_at(&self, addr: VirtAddr) -> Option<PhysAddr> {
        if !self.contains(addr) {
            return None;
        }
        run_lookup(&self.runs, addr - self.start)
    }

    /// Pool offset just past the last byte, for direct regions.
    #[must_use]
    pub fn phys_end(&self) -> Option<PhysAddr> {
        self.runs.last().map(PhysRun::phys_end)
    }

    /// Splits the region at `at`, shrinking `self` to `[start, at)` and
    /// returning `[at, end)`. Direct runs are cut at the same offset.
    pub(crate) fn split_off(&mut self, at: VirtAddr) -> Self {
        debug_assert!(self.start < at && at < self.end);
        debug_assert!(at.is_aligned(PAGE_SIZE));
        let tail_runs = split_runs(&mut self.runs, at - self.start);
        let mut tail = Self {
            start: at,
            runs: tail_runs,
            ..self.clone()
        };
        if let (Backing::Direct { .. }, Some(first)) = (tail.backing, tail.runs.first()) {
            tail.backing = Backing::Direct { phys: first.phys };
        }
        self.end = at;
        tail
    }

    /// Extends the region over `right`, which must start at `self.end`.
    /// The name is settled by the caller.
    pub(crate) fn append(&mut self, right: Self) {
        debug_assert_eq!(self.end, right.start);
        self.end = right.end;
        for run in right.runs {
            push_run(&mut self.runs, run);
        }
    }

    /// Read-only snapshot of the region.
    #[must_use]
    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            start: self.start,
            end: self.end,
            prot: self.prot,
            memory_type: self.memory_type,
            backing: self.backing,
            name: self.name.clone(),
            no_coalesce: self.no_coalesce,
            runs: self.runs.clone(),
        }
    }
}

/// Snapshot of a region returned by the query operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// First byte of the region.
    pub start: VirtAddr,
    /// One past the last byte.
    pub end: VirtAddr,
    /// Access permissions.
    pub prot: Protection,
    /// Memory-type tag.
    pub memory_type: MemoryType,
    /// Backing kind.
    pub backing: Backing,
    /// Range name.
    pub name: RegionName,
    /// Region is excluded from merging.
    pub no_coalesce: bool,
    /// Pool runs of a direct region, in virtual order.
    pub runs: Vec<PhysRun>,
}

impl RegionInfo {
    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Pool offset of the first byte, for direct regions.
    #[must_use]
    pub fn direct_offset(&self) -> Option<PhysAddr> {
        match self.backing {
            Backing::Direct { phys } => Some(phys),
            _ => None,
        }
    }

    /// Pool offset backing `addr`, for direct regions.
    #[must_use]
    pub fn phys_at(&self, addr: VirtAddr) -> Option<PhysAddr> {
        if addr < self.start || addr >= self.end {
            return None;
        }
        run_lookup(&self.runs, addr - self.start)
    }

    /// Region is flexible memory.
    #[must_use]
    pub fn is_flexible(&self) -> bool {
        matches!(self.backing, Backing::Flexible)
    }

    /// Region is direct memory.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self.backing, Backing::Direct { .. })
    }

    /// Region is a thread stack.
    #[must_use]
    pub fn is_stack(&self) -> bool {
        matches!(self.backing, Backing::Stack)
    }

    /// Region has backing memory (anything but a reservation).
    #[must_use]
    pub fn is_committed(&self) -> bool {
        !matches!(self.backing, Backing::Reserved)
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#014x}-{:#014x} {} {} {:<6}",
            self.start, self.end, self.prot, self.memory_type, self.backing.tag()
        )?;
        if let Some(phys) = self.direct_offset() {
            write!(f, " @{phys:#x}")?;
            if self.runs.len() > 1 {
                write!(f, " +{}", self.runs.len() - 1)?;
            }
        }
        if !self.name.is_empty() {
            write!(f, " \"{}\"", self.name)?;
        }
        if self.no_coalesce {
            f.write_str(" nc")?;
        }
        Ok(())
    }
}

/// Address-ordered snapshot of every region, printable as a maps dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionMap(pub Vec<RegionInfo>);

impl fmt::Display for RegionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for info in &self.0 {
            writeln!(f, "{info}")?;
        }
        Ok(())
    }
}
