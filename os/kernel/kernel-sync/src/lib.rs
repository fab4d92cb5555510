//! # Kernel synchronization primitives
//!
//! Each memory manager is guarded by exactly one [`SpinLock`]; the global
//! instances that are built at boot live in a [`SyncOnceCell`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
