//! Flexible memory budget.
//!
//! Anonymous and file-backed mappings draw from one capped pool. The
//! budget only counts bytes; placement is the address space's business.

use crate::{VmError, VmResult};

/// Capacity accounting for flexible memory. Invariant: `used <= capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexibleMemoryBudget {
    capacity: u64,
    used: u64,
}

impl FlexibleMemoryBudget {
    /// Creates an empty budget of `capacity` bytes.
    #[must_use]
    pub const fn new(capacity: u64) -> Self {
        Self { capacity, used: 0 }
    }

    /// Debits `amount` bytes. Fails without side effects if the budget
    /// would be exceeded.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfMemory`] if fewer than `amount` bytes are left.
    pub fn reserve(&mut self, amount: u64) -> VmResult<()> {
        let new_used = self
            .used
            .checked_add(amount)
            .filter(|&u| u <= self.capacity)
            .ok_or(VmError::OutOfMemory)?;
        self.used = new_used;
        Ok(())
    }

    /// Credits `amount` bytes back.
    ///
    /// Releasing more than is in use is a caller bug.
    pub fn release(&mut self, amount: u64) {
        debug_assert!(amount <= self.used, "flexible budget over-release");
        self.used = self.used.saturating_sub(amount);
    }

    /// Bytes still available.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.capacity - self.used
    }

    /// Bytes in use.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Total capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
