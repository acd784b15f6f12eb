//! Synchronization primitives shared by the memory-management crates.

mod rwlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
