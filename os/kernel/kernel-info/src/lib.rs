//! # Kernel Memory Configuration and Boot Interface
//!
//! Compile-time layout and tuning constants for the memory core, plus the
//! boot-provided memory map types the physical memory manager is seeded from.
//!
//! ## Memory Layout ([`memory`])
//!
//! ```text
//! Physical memory:
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │ Low memory (< 1 MiB)         │ never handed out
//! 0x0010_0000 ├──────────────────────────────┤ LOW_MEMORY_RESERVED
//!             │ Kernel image, early RAM      │ identity mapped up to 16 MiB
//! 0x0100_0000 ├──────────────────────────────┤ IDENTITY_MAP_BYTES
//!             │ RAM tracked by the bitmap    │ up to MAX_PHYSICAL_MEMORY
//!             └──────────────────────────────┘
//!
//! Virtual memory:
//! 0x0000_0000_0000_0000 ┌──────────────────────┐
//!                       │ User half            │ PML4 0..=255, per address space
//! 0xFFFF_8000_0000_0000 ├──────────────────────┤ PML4 256 (KERNEL_HALF_FIRST_INDEX)
//!                       │ Kernel half          │ shared by every address space
//! KERNEL_HEAP_BASE      ├──────────────────────┤ 0xFFFF_C000_0000_0000
//!                       │ Kernel heap arena    │ grows up to KERNEL_HEAP_MAX_SIZE
//!                       └──────────────────────┘
//! ```
//!
//! ## Boot Information ([`boot`])
//!
//! The bootloader hands over a list of [`MemoryRegion`](boot::MemoryRegion)s.
//! Only [`Usable`](boot::MemoryRegionKind::Usable) regions are ever released
//! to the frame allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
