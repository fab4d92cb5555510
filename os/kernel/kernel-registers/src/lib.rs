//! # Typed x86-64 Paging Registers
//!
//! [`Cr3`](cr3::Cr3) selects the active address space; [`tlb`] holds the
//! invalidation instructions that must follow every change to a live mapping.
//! The instructions themselves are only compiled with the `asm` feature on
//! `x86_64`, so the types remain usable in host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod tlb;

pub use cr3::Cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The access is privileged and must run in ring 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The access is privileged and must run in ring 0. Storing may change
    /// the translation of every address, including the executing code.
    unsafe fn store_unsafe(self);
}
