//! Writer-preferring spinning reader-writer lock.
//!
//! The lock word packs three fields into one `AtomicU32`:
//!
//! ```text
//!  31        30             29..0
//! +--------+--------------+-------------+
//! | WRITER | WRITE_WANTED | reader count|
//! +--------+--------------+-------------+
//! ```
//!
//! A writer that fails to acquire the lock raises `WRITE_WANTED`, which
//! stops new readers from entering. Existing readers drain, and the writer
//! then takes the lock. This keeps a steady stream of queries from starving
//! address-space mutations.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 1 << 31;
const WRITE_WANTED: u32 = 1 << 30;
const READER_MASK: u32 = WRITE_WANTED - 1;

/// A spinning reader-writer lock that favours writers.
///
/// Const-constructable and suitable for `static` items.
pub struct RwLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: Shared access hands out `&T` to several threads at once (needs
// `T: Sync`); exclusive access moves `&mut T` between threads (needs `T: Send`).
unsafe impl<T: Send> Send for RwLock<T> {}
// SAFETY: See above.
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked lock wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the value. No locking is needed
    /// because `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Acquires shared access, spinning while a writer holds or waits for
    /// the lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_read() {
                return guard;
            }
            core::hint::spin_loop();
        }
    }

    /// Attempts to acquire shared access without spinning.
    ///
    /// Fails if a writer holds the lock or has announced itself.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | WRITE_WANTED) != 0 || s & READER_MASK == READER_MASK {
            return None;
        }
        self.state
            .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockReadGuard { lock: self })
    }

    /// Acquires exclusive access, spinning until every reader has left.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_write() {
                return guard;
            }
            // Announce the pending writer so readers back off.
            self.state.fetch_or(WRITE_WANTED, Ordering::Relaxed);
            core::hint::spin_loop();
        }
    }

    /// Attempts to acquire exclusive access without spinning.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | READER_MASK) != 0 {
            return None;
        }
        // Taking the lock consumes any pending-writer announcement.
        self.state
            .compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockWriteGuard { lock: self })
    }

    /// Returns the number of readers currently holding the lock.
    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READER_MASK
    }

    /// Returns `true` if a writer currently holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.reader_count())
            .field("write_locked", &self.is_write_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard for shared access to an [`RwLock`].
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: A reader count is held, so no writer can exist.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// RAII guard for exclusive access to an [`RwLock`].
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The WRITER bit is held, so no other reference exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The WRITER bit is held, so no other reference exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        // Another writer may have raised WRITE_WANTED while we held the
        // lock; keep that bit so it still wins against new readers.
        self.lock.state.fetch_and(WRITE_WANTED, Ordering::Release);
    }
}
