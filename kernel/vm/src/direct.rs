//! Direct memory pool allocator.
//!
//! Tracks which byte ranges of the bounded direct pool `[0, total)` are
//! allocated. Allocated ranges (extents) are kept in a `BTreeMap` keyed by
//! start offset; free space is whatever lies between them.
//!
//! # Algorithm
//!
//! - **Allocate**: first-fit walk over the gaps between extents, starting at
//!   the extent that covers (or precedes) the search start.
//! - **Free**: every extent intersecting the freed range is trimmed; an
//!   extent straddling both ends is split in two.
//!
//! Virtual mappings refer to pool offsets, not to extents, so freeing never
//! has to chase owners. The manager sweeps the region table instead.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use orbis_core::addr::{align_down, checked_align_up};

use crate::prot::MemoryType;
use crate::{PAGE_SIZE, PhysAddr, VmError, VmResult, checked_alignment, checked_range};

/// One allocated range of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    size: u64,
    memory_type: MemoryType,
}

/// Public view of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentInfo {
    /// First pool offset of the extent.
    pub start: PhysAddr,
    /// One past the last pool offset.
    pub end: PhysAddr,
    /// Memory type requested at allocation time.
    pub memory_type: MemoryType,
}

/// Allocator for the direct memory pool.
#[derive(Debug, Clone)]
pub struct PhysicalDirectMemoryAllocator {
    total: u64,
    /// Allocated extents by start offset. Never overlapping, never empty.
    extents: BTreeMap<u64, Extent>,
}

impl PhysicalDirectMemoryAllocator {
    /// Creates an allocator for a pool of `total` bytes (rounded down to
    /// whole pages).
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            total: align_down(total, PAGE_SIZE),
            extents: BTreeMap::new(),
        }
    }

    /// Size of the pool.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_size(&self) -> u64 {
        self.extents.values().map(|e| e.size).sum()
    }

    /// Iterates over all extents in offset order.
    pub fn extents(&self) -> impl Iterator<Item = ExtentInfo> + '_ {
        self.extents.iter().map(|(&start, e)| ExtentInfo {
            start: PhysAddr::new(start),
            end: PhysAddr::new(start + e.size),
            memory_type: e.memory_type,
        })
    }

    /// Allocates `size` bytes inside `[search_start, search_end)` at the
    /// lowest offset satisfying `alignment` (zero means one page).
    ///
    /// # Errors
    ///
    /// - [`VmError::InvalidArgument`] for a misaligned or zero size, a bad
    ///   alignment, or an empty search range.
    /// - [`VmError::OutOfMemory`] if no free sub-range fits.
    pub fn allocate(
        &mut self,
        search_start: PhysAddr,
        search_end: PhysAddr,
        size: u64,
        alignment: u64,
        memory_type: MemoryType,
    ) -> VmResult<PhysAddr> {
        let align = checked_alignment(alignment)?;
        if size == 0 || size % PAGE_SIZE != 0 || search_start >= search_end {
            return Err(VmError::InvalidArgument);
        }
        let end = search_end.as_u64().min(self.total);
        let offset = self
            .find_free(search_start.as_u64(), end, size, align)
            .ok_or(VmError::OutOfMemory)?;
        self.extents.insert(offset, Extent { size, memory_type });
        log::debug!(
            "direct: allocated [{:#x}..{:#x}) {}",
            offset,
            offset + size,
            memory_type
        );
        Ok(PhysAddr::new(offset))
    }

    /// First-fit search for an aligned hole of `size` bytes in `[start, end)`.
    fn find_free(&self, start: u64, end: u64, size: u64, align: u64) -> Option<u64> {
        let mut cursor = checked_align_up(start, align)?;
        let first_key = self.first_key_touching(cursor);
        for (&s, ext) in self.extents.range(first_key..) {
            if s >= end {
                break;
            }
            let ext_end = s + ext.size;
            if ext_end <= cursor {
                continue;
            }
            if cursor.checked_add(size)? <= s {
                break;
            }
            cursor = checked_align_up(ext_end, align)?;
        }
        let fits = cursor.checked_add(size).is_some_and(|e| e <= end);
        fits.then_some(cursor)
    }

    /// Key of the extent covering `offset`, or `offset` itself.
    fn first_key_touching(&self, offset: u64) -> u64 {
        match self.extents.range(..=offset).next_back() {
            Some((&s, ext)) if s + ext.size > offset => s,
            _ => offset,
        }
    }

    /// Returns the largest free, `alignment`-aligned chunk inside
    /// `[start, end)` as `(offset, size)`. The size is zero if nothing is
    /// free.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for an inverted range or a bad alignment.
    pub fn available_size(
        &self,
        start: PhysAddr,
        end: PhysAddr,
        alignment: u64,
    ) -> VmResult<(PhysAddr, u64)> {
        let align = checked_alignment(alignment)?;
        if start >= end {
            return Err(VmError::InvalidArgument);
        }
        let end = align_down(end.as_u64().min(self.total), PAGE_SIZE);
        let mut best = (start, 0);
        let mut consider = |gap_start: u64, gap_end: u64| {
            if let Some(aligned) = checked_align_up(gap_start, align) {
                if aligned < gap_end && gap_end - aligned > best.1 {
                    best = (PhysAddr::new(aligned), gap_end - aligned);
                }
            }
        };

        let mut cursor = start.as_u64();
        let first_key = self.first_key_touching(cursor);
        for (&s, ext) in self.extents.range(first_key..) {
            if s >= end {
                break;
            }
            if s > cursor {
                consider(cursor, s);
            }
            cursor = cursor.max(s + ext.size);
        }
        if cursor < end {
            consider(cursor, end);
        }
        Ok(best)
    }

    /// Returns the extent containing `offset`.
    ///
    /// # Errors
    ///
    /// [`VmError::NotFound`] if `offset` is not allocated.
    pub fn query_type(&self, offset: PhysAddr) -> VmResult<ExtentInfo> {
        let raw = offset.as_u64();
        match self.extents.range(..=raw).next_back() {
            Some((&s, ext)) if raw < s + ext.size => Ok(ExtentInfo {
                start: PhysAddr::new(s),
                end: PhysAddr::new(s + ext.size),
                memory_type: ext.memory_type,
            }),
            _ => Err(VmError::NotFound),
        }
    }

    /// Returns `true` if every byte of `[offset, offset + size)` is
    /// allocated.
    #[must_use]
    pub fn is_allocated(&self, offset: PhysAddr, size: u64) -> bool {
        let Some(end) = offset.as_u64().checked_add(size) else {
            return false;
        };
        let mut cursor = offset.as_u64();
        let first_key = self.first_key_touching(cursor);
        for (&s, ext) in self.extents.range(first_key..) {
            if cursor >= end || s > cursor {
                break;
            }
            cursor = cursor.max(s + ext.size);
        }
        cursor >= end
    }

    /// Returns `true` if `[offset, offset + size)` is exactly one extent.
    #[must_use]
    pub fn is_exact_extent(&self, offset: PhysAddr, size: u64) -> bool {
        self.extents
            .get(&offset.as_u64())
            .is_some_and(|ext| ext.size == size)
    }

    /// Starts of all extents intersecting `[offset, end)`.
    fn intersecting(&self, offset: u64, end: u64) -> Vec<u64> {
        let first_key = self.first_key_touching(offset);
        self.extents
            .range(first_key..end)
            .filter(|&(&s, ext)| s + ext.size > offset)
            .map(|(&s, _)| s)
            .collect()
    }

    /// Frees every allocated byte of `[offset, offset + size)`, trimming or
    /// splitting partially covered extents.
    ///
    /// # Errors
    ///
    /// - [`VmError::InvalidArgument`] for a misaligned or empty range.
    /// - [`VmError::NotFound`] if no extent intersects the range.
    pub fn free(&mut self, offset: PhysAddr, size: u64) -> VmResult<()> {
        let start = offset.as_u64();
        let end = checked_range(start, size)?;
        let hits = self.intersecting(start, end);
        if hits.is_empty() {
            return Err(VmError::NotFound);
        }
        for s in hits {
            let Some(ext) = self.extents.remove(&s) else {
                continue;
            };
            let ext_end = s + ext.size;
            if s < start {
                self.extents.insert(
                    s,
                    Extent {
                        size: start - s,
                        ..ext
                    },
                );
            }
            if ext_end > end {
                self.extents.insert(
                    end,
                    Extent {
                        size: ext_end - end,
                        ..ext
                    },
                );
            }
        }
        log::debug!("direct: freed [{start:#x}..{end:#x})");
        Ok(())
    }

    /// Validates a release request without changing anything.
    ///
    /// With `checked`, the range must be exactly one extent
    /// ([`VmError::InvalidArgument`] otherwise); without, it must intersect
    /// at least one ([`VmError::NotFound`] otherwise).
    ///
    /// # Errors
    ///
    /// See above. A malformed range is [`VmError::InvalidArgument`] either way.
    pub fn check_release(&self, offset: PhysAddr, size: u64, checked: bool) -> VmResult<()> {
        let start = offset.as_u64();
        let end = checked_range(start, size)?;
        if checked {
            if !self.is_exact_extent(offset, size) {
                return Err(VmError::InvalidArgument);
            }
        } else if self.intersecting(start, end).is_empty() {
            return Err(VmError::NotFound);
        }
        Ok(())
    }
}
