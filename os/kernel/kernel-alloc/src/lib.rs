//! # Kernel Memory Management
//!
//! The three memory managers of the kernel, each behind its own lock:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Kernel heap (heap)                           │
//! │   boundary tags, sorted free list, growth    │
//! └──────────────────────┬───────────────────────┘
//!                        │ HeapBacking
//! ┌──────────────────────▼───────────────────────┐
//! │ Virtual memory manager (vmm)                 │
//! │   4-level tables, address spaces, TLB        │
//! └──────────────────────┬───────────────────────┘
//!                        │ FrameAlloc
//! ┌──────────────────────▼───────────────────────┐
//! │ Physical memory manager (frame_alloc)        │
//! │   one bit per 4 KiB frame, first fit         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Locks are only ever taken top to bottom: heap, then VMM, then PMM.
//!
//! The managers are generic over the [`kernel_vmem`] seams so they run on
//! the host in tests. [`kernel_memory`] wires the real ones together for the
//! kernel: the identity [`phys_mapper`] and the CR3-backed [`mmu`].
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::frame_alloc::PhysicalMemoryManager;
//! use kernel_info::boot::MemoryRegion;
//!
//! let pmm = PhysicalMemoryManager::new();
//! pmm.init(Some(&[MemoryRegion::usable(0, 16 * 1024 * 1024)]));
//!
//! let frame = pmm.allocate_pages(1).unwrap();
//! assert_eq!(pmm.free_pages(frame, 1), Ok(1));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod heap;
#[cfg(target_arch = "x86_64")]
pub mod kernel_memory;
#[cfg(target_arch = "x86_64")]
pub mod mmu;
pub mod phys_mapper;
pub mod vmm;
