//! # Virtual Memory Support
//!
//! x86-64 four-level paging: the bit-exact entry format, the 512-entry table
//! node, and an [`AddressSpace`] that walks and mutates one PML4-rooted tree.
//!
//! ## Virtual address → physical address walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Every level uses the same nine-bit index math (see [`TableLevel`]). A PDPT
//! or PD entry with the huge-page bit set ends the walk early with a 1 GiB or
//! 2 MiB leaf; a PT entry is always a 4 KiB leaf.
//!
//! ## Seams
//!
//! The tree lives in physical frames, so the walker needs three services it
//! does not own:
//!
//! - [`FrameAlloc`] hands out and takes back 4 KiB frames for table nodes,
//! - [`PhysMapper`] turns a table's physical address into a reference,
//! - [`Mmu`] reads and loads CR3 and maintains the TLB.
//!
//! In the kernel these are the frame bitmap, the identity map and the CPU;
//! in tests they are a vector of aligned frames and a recording fake.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
mod page_entry_bits;
mod page_table;

pub use crate::address_space::{AddressSpace, MapError, RootPage};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, TableIndex, TableLevel};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Source of 4 KiB physical frames for page-table nodes.
pub trait FrameAlloc {
    /// A free frame, or `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        (**self).free_4k(page);
    }
}

/// Access to physical memory from the running kernel.
pub trait PhysMapper {
    /// Reinterpret the bytes at `pa` as a `T`.
    ///
    /// # Safety
    /// `pa` must be reachable through the mapper, properly aligned for `T`,
    /// and hold a valid `T`. The caller must not create overlapping mutable
    /// references to the same frame.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Whether the frame at `pa` can be reached through the mapper at all.
    /// Page tables are only ever placed in reachable frames.
    #[inline]
    fn reaches(&self, _pa: PhysicalAddress) -> bool {
        true
    }
}

/// The memory-management unit of the executing CPU.
pub trait Mmu {
    /// Root of the address space currently loaded (CR3).
    fn active_root(&self) -> RootPage;

    /// Load `root` as the active address space.
    ///
    /// # Safety
    /// `root` must be a valid PML4 that maps the executing code, the stack
    /// and every structure the caller touches afterwards.
    unsafe fn activate(&self, root: RootPage);

    /// Drop the cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop every cached non-global translation.
    fn flush_all(&self);
}
