//! Where arena memory comes from.

use crate::frame_alloc::PhysicalMemoryManager;
use crate::vmm::{Vmm, VmmError};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{FrameAlloc, Mmu, PageEntryBits, PhysMapper};
use log::{trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BackingError {
    #[error("no physical frame left to back the heap")]
    OutOfFrames,
    #[error("mapping heap memory failed: {0}")]
    Map(VmmError),
    #[error("range [{start}, +{len:#x}) lies outside the backing region")]
    OutOfBounds { start: VirtualAddress, len: usize },
}

/// Makes a virtual range of the arena usable.
///
/// The heap only ever asks for page-aligned ranges that directly follow
/// what it already owns.
pub trait HeapBacking {
    /// Back `[start, start + len)` with readable and writable memory.
    ///
    /// # Errors
    /// The range could not be backed. Nothing stays backed in that case.
    fn back(&mut self, start: VirtualAddress, len: usize) -> Result<(), BackingError>;
}

/// Memory that is already there, e.g. a static array or a host buffer.
#[derive(Debug, Copy, Clone)]
pub struct StaticBacking {
    start: u64,
    end: u64,
}

impl StaticBacking {
    /// # Safety
    /// `[start, start + len)` must be valid for reads and writes and owned by
    /// the heap for as long as the heap lives.
    #[must_use]
    pub const unsafe fn new(start: VirtualAddress, len: usize) -> Self {
        Self {
            start: start.as_u64(),
            end: start.as_u64().saturating_add(len as u64),
        }
    }
}

impl HeapBacking for StaticBacking {
    fn back(&mut self, start: VirtualAddress, len: usize) -> Result<(), BackingError> {
        let inside = start.as_u64() >= self.start
            && start
                .as_u64()
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end);
        if inside {
            Ok(())
        } else {
            Err(BackingError::OutOfBounds { start, len })
        }
    }
}

/// Fresh frames from the PMM mapped into the kernel address space.
pub struct MappedBacking<'a, 'm, M: PhysMapper, U: Mmu, A: FrameAlloc> {
    vmm: &'a Vmm<'m, M, U, A>,
    pmm: &'a PhysicalMemoryManager,
}

impl<'a, 'm, M: PhysMapper, U: Mmu, A: FrameAlloc> MappedBacking<'a, 'm, M, U, A> {
    #[must_use]
    pub const fn new(vmm: &'a Vmm<'m, M, U, A>, pmm: &'a PhysicalMemoryManager) -> Self {
        Self { vmm, pmm }
    }

    fn release(&self, start: VirtualAddress, pages: u64) {
        let root = self.vmm.kernel_address_space();
        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            if let Some(frame) = self.vmm.unmap_page_in(root, va)
                && let Err(err) = self.pmm.free_pages(frame, 1)
            {
                warn!("could not return heap frame {frame}: {err}");
            }
        }
    }
}

impl<M: PhysMapper, U: Mmu, A: FrameAlloc> HeapBacking for MappedBacking<'_, '_, M, U, A> {
    fn back(&mut self, start: VirtualAddress, len: usize) -> Result<(), BackingError> {
        let root = self.vmm.kernel_address_space();
        let pages = (len as u64).div_ceil(PAGE_SIZE);

        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            let Some(frame) = self.pmm.allocate_pages(1) else {
                self.release(start, i);
                return Err(BackingError::OutOfFrames);
            };
            if let Err(err) = self.vmm.map_page_in(root, va, frame, PageEntryBits::kernel_rw_nx()) {
                // The frame is not mapped yet; release() only sees pages before it.
                if let Err(free_err) = self.pmm.free_pages(frame, 1) {
                    warn!("could not return heap frame {frame}: {free_err}");
                }
                self.release(start, i);
                return Err(BackingError::Map(err));
            }
        }

        trace!("backed {pages} heap page(s) at {start}");
        Ok(())
    }
}
