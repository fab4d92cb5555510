//! The kernel's memory managers and the order they come up in.
//!
//! ```text
//! PMM::init(memory map) ─► reserve kernel image ─► Vmm::init (identity map, CR3)
//!                                                      │
//!                     KernelHeap::init(KERNEL_HEAP_BASE, MappedBacking) ◄┘
//! ```
//!
//! With the `global-allocator` feature the heap also serves `alloc`.

use crate::frame_alloc::{FrameStats, PhysicalMemoryManager};
use crate::heap::{HeapConfig, HeapError, KernelHeap, MappedBacking};
use crate::mmu::X86Mmu;
use crate::phys_mapper::IdentityPhysMapper;
use crate::vmm::{Vmm, VmmError};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{KERNEL_HEAP_BASE, KERNEL_HEAP_INITIAL_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SyncOnceCell;
use log::info;

pub type KernelVmm = Vmm<'static, IdentityPhysMapper, X86Mmu, &'static PhysicalMemoryManager>;

pub type KernelHeapBacking =
    MappedBacking<'static, 'static, IdentityPhysMapper, X86Mmu, &'static PhysicalMemoryManager>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("kernel memory is already initialized")]
    AlreadyInitialized,
    #[error("virtual memory setup failed: {0}")]
    Vmm(#[from] VmmError),
    #[error("heap setup failed: {0}")]
    Heap(#[from] HeapError),
}

static PMM: PhysicalMemoryManager = PhysicalMemoryManager::new();
static MAPPER: IdentityPhysMapper = IdentityPhysMapper;
static VMM: SyncOnceCell<KernelVmm> = SyncOnceCell::new();

#[cfg_attr(feature = "global-allocator", global_allocator)]
static HEAP: KernelHeap<KernelHeapBacking> = KernelHeap::new();

/// Bring up physical memory, paging and the heap, in that order.
///
/// `kernel_image` is the physical range of the loaded kernel; it is taken
/// out of the free frames before anything is allocated.
///
/// # Errors
/// [`InitError::AlreadyInitialized`] on a second call, otherwise whichever
/// stage failed. A failed call leaves the CPU on its previous address space
/// if paging was not yet switched.
///
/// # Safety
/// Ring 0, single-threaded, with the kernel executing from identity-mapped
/// memory below [`IDENTITY_MAP_BYTES`](kernel_info::memory::IDENTITY_MAP_BYTES).
pub unsafe fn init(
    memory_map: Option<&[MemoryRegion]>,
    kernel_image: Option<(PhysicalAddress, u64)>,
) -> Result<FrameStats, InitError> {
    if VMM.get().is_some() {
        return Err(InitError::AlreadyInitialized);
    }

    PMM.init(memory_map);
    if let Some((base, len)) = kernel_image {
        let reserved = PMM.reserve_range(base, len);
        info!("reserved {reserved} frame(s) for the kernel image at {base}");
    }

    let vmm = unsafe { Vmm::init(&MAPPER, X86Mmu, &PMM)? };
    let vmm = VMM.set(vmm).map_err(|_| InitError::AlreadyInitialized)?;

    unsafe {
        HEAP.init(
            VirtualAddress::new(KERNEL_HEAP_BASE),
            KERNEL_HEAP_INITIAL_SIZE,
            MappedBacking::new(vmm, &PMM),
            HeapConfig::default(),
        )?;
    }

    Ok(PMM.stats())
}

#[must_use]
pub fn pmm() -> &'static PhysicalMemoryManager {
    &PMM
}

/// `None` until [`init`] has built the kernel address space.
#[must_use]
pub fn vmm() -> Option<&'static KernelVmm> {
    VMM.get()
}

#[must_use]
pub fn heap() -> &'static KernelHeap<KernelHeapBacking> {
    &HEAP
}
