//! Core types and synchronization primitives for the orbis kernel.
//!
//! Host-testable pieces shared by the memory-management crates: address
//! newtypes with alignment helpers, and the reader-writer lock that guards
//! a process address space. Nothing here depends on a kernel target, so
//! the crate builds and tests with plain `cargo test`.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod sync;
