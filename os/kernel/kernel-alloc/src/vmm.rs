//! # Virtual Memory Manager
//!
//! Owns the kernel address space and serializes every page-table change
//! behind one lock. Single-page operations act on the **active** address
//! space (whatever the MMU currently has loaded); the `_in` variants take an
//! explicit root and only touch the TLB when that root is active.
//!
//! Kernel-half addresses always go to the kernel PML4, whichever root was
//! asked for.
//!
//! ```text
//! map_page ──► AddressSpace::map_4k ──► FrameAlloc (new tables)
//!     │
//!     └──────► Mmu::invalidate_page
//! ```
//!
//! Unmapping never frees the frame: the caller decides what the frame was.

use kernel_info::memory::{IDENTITY_MAP_BYTES, KERNEL_HALF_FIRST_INDEX, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_sync::SpinLock;
use kernel_vmem::{
    AddressSpace, FrameAlloc, MapError, Mmu, PageEntryBits, PhysMapper, RootPage, TableLevel,
};
use log::{debug, error, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("virtual address {0} is not page aligned")]
    UnalignedVirtual(VirtualAddress),
    #[error("physical address {0} is not page aligned")]
    UnalignedPhysical(PhysicalAddress),
    #[error("range wraps around the address space")]
    InvalidRange,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("refusing to destroy the kernel address space")]
    KernelSpace,
    #[error("refusing to destroy the active address space")]
    ActiveSpace,
}

/// What [`Vmm::map_page`] found in the slot it wrote.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapOutcome {
    /// The page was not mapped before.
    Created,
    /// The page already mapped the same frame; flags were rewritten.
    Unchanged,
    /// The page mapped a different frame, which is now unreachable through it.
    Remapped { previous: PhysicalAddress },
}

struct VmmState<A> {
    alloc: A,
}

/// Kernel virtual memory manager.
pub struct Vmm<'m, M: PhysMapper, U: Mmu, A: FrameAlloc> {
    mapper: &'m M,
    mmu: U,
    kernel_root: RootPage,
    state: SpinLock<VmmState<A>>,
}

fn is_kernel_half(va: VirtualAddress) -> bool {
    TableLevel::Pml4.index_of(va).as_usize() >= KERNEL_HALF_FIRST_INDEX
}

fn page_of(va: VirtualAddress) -> Result<VirtualPage<Size4K>, VmmError> {
    VirtualPage::from_aligned(va).ok_or_else(|| {
        error!("refusing to map unaligned virtual address {va}");
        VmmError::UnalignedVirtual(va)
    })
}

fn frame_of(pa: PhysicalAddress) -> Result<PhysicalPage<Size4K>, VmmError> {
    PhysicalPage::from_aligned(pa).ok_or_else(|| {
        error!("refusing to map unaligned physical address {pa}");
        VmmError::UnalignedPhysical(pa)
    })
}

impl<'m, M: PhysMapper, U: Mmu, A: FrameAlloc> Vmm<'m, M, U, A> {
    /// Build the kernel address space, identity map the first
    /// [`IDENTITY_MAP_BYTES`] (page 0 excluded so null dereferences fault)
    /// and switch to it.
    ///
    /// # Errors
    /// [`VmmError::Map`] if `alloc` runs dry while building the tables.
    ///
    /// # Safety
    /// The executing code, stack and every table frame handed out by `alloc`
    /// must lie inside the identity window, and `mapper` must be valid both
    /// before and after the switch.
    pub unsafe fn init(mapper: &'m M, mmu: U, mut alloc: A) -> Result<Self, VmmError> {
        let kernel = AddressSpace::create(mapper, &mut alloc)?;

        let mut addr = PAGE_SIZE;
        while addr < IDENTITY_MAP_BYTES {
            kernel.map_4k(
                &mut alloc,
                VirtualPage::containing(VirtualAddress::new(addr)),
                PhysicalPage::containing(PhysicalAddress::new(addr)),
                PageEntryBits::kernel_rw(),
            )?;
            addr += PAGE_SIZE;
        }

        let root = kernel.root_page();
        unsafe { mmu.activate(root) };
        info!(
            "kernel address space at {}, identity mapped {} KiB",
            root.base(),
            IDENTITY_MAP_BYTES / 1024
        );

        Ok(Self {
            mapper,
            mmu,
            kernel_root: root,
            state: SpinLock::new(VmmState { alloc }),
        })
    }

    fn space(&self, root: RootPage) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, root).borrowing_from(self.kernel_root)
    }

    /// The tree a change at `va` requested for `root` has to go to.
    fn owner_of(&self, root: RootPage, va: VirtualAddress) -> RootPage {
        if is_kernel_half(va) {
            self.kernel_root
        } else {
            root
        }
    }

    /// Whether the running CPU may cache a translation of `va` in `root`.
    fn is_live(&self, root: RootPage, va: VirtualAddress) -> bool {
        is_kernel_half(va) || root == self.mmu.active_root()
    }

    fn map_locked(
        &self,
        state: &mut VmmState<A>,
        root: RootPage,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<MapOutcome, VmmError> {
        let page = page_of(va)?;
        let frame = frame_of(pa)?;

        let owner = self.owner_of(root, va);
        let previous = self.space(owner).map_4k(&mut state.alloc, page, frame, flags)?;
        if self.is_live(owner, va) {
            self.mmu.invalidate_page(va);
        }

        Ok(match previous {
            None => MapOutcome::Created,
            Some(old) if old == frame => MapOutcome::Unchanged,
            Some(old) => {
                warn!("remapping {va}: {} -> {pa}", old.base());
                MapOutcome::Remapped {
                    previous: old.base(),
                }
            }
        })
    }

    fn unmap_locked(&self, root: RootPage, va: VirtualAddress) -> Option<PhysicalAddress> {
        let owner = self.owner_of(root, va);
        let frame = self.space(owner).unmap_4k(VirtualPage::containing(va))?;
        if self.is_live(owner, va) {
            self.mmu.invalidate_page(va);
        }
        Some(frame.base())
    }

    /// Map the page at `va` to the frame at `pa` in the active address space.
    ///
    /// Mapping over an existing entry is allowed; a change of frame is
    /// logged and reported as [`MapOutcome::Remapped`].
    ///
    /// # Errors
    /// - [`VmmError::UnalignedVirtual`] / [`VmmError::UnalignedPhysical`].
    /// - [`VmmError::Map`] if a table could not be allocated or a huge page
    ///   covers `va`.
    pub fn map_page(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<MapOutcome, VmmError> {
        let mut state = self.state.lock();
        let root = self.mmu.active_root();
        self.map_locked(&mut state, root, va, pa, flags)
    }

    /// [`map_page`](Self::map_page) in the address space rooted at `root`.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page).
    pub fn map_page_in(
        &self,
        root: RootPage,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<MapOutcome, VmmError> {
        let mut state = self.state.lock();
        self.map_locked(&mut state, root, va, pa, flags)
    }

    /// Map `count` consecutive pages. All or nothing: if any page fails,
    /// every page this call mapped is unmapped again before returning.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page), plus [`VmmError::InvalidRange`] if
    /// either range wraps.
    pub fn map_pages(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: usize,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let mut state = self.state.lock();
        let root = self.mmu.active_root();

        for i in 0..count {
            let offset = (i as u64) * PAGE_SIZE;
            let result = match (va.checked_add(offset), pa.checked_add(offset)) {
                (Some(v), Some(p)) => self.map_locked(&mut state, root, v, p, flags),
                _ => Err(VmmError::InvalidRange),
            };
            if let Err(err) = result {
                for j in 0..i {
                    self.unmap_locked(root, va + (j as u64) * PAGE_SIZE);
                }
                warn!("mapping {count} pages at {va} failed at page {i}, rolled back: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove the mapping of the page containing `va` from the active
    /// address space. Returns the frame it mapped; the frame is not freed.
    pub fn unmap_page(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _state = self.state.lock();
        self.unmap_locked(self.mmu.active_root(), va)
    }

    /// [`unmap_page`](Self::unmap_page) in the address space rooted at `root`.
    pub fn unmap_page_in(&self, root: RootPage, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _state = self.state.lock();
        self.unmap_locked(root, va)
    }

    /// Unmap `count` consecutive pages; returns how many were mapped.
    pub fn unmap_pages(&self, va: VirtualAddress, count: usize) -> usize {
        let _state = self.state.lock();
        let root = self.mmu.active_root();
        (0..count as u64)
            .filter_map(|i| va.checked_add(i * PAGE_SIZE))
            .filter(|&v| self.unmap_locked(root, v).is_some())
            .count()
    }

    /// Translate `va` in the active address space, keeping the page offset.
    #[must_use]
    pub fn get_physical(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _state = self.state.lock();
        self.space(self.mmu.active_root()).translate(va)
    }

    /// Translate `va` in the address space rooted at `root`.
    #[must_use]
    pub fn get_physical_in(&self, root: RootPage, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _state = self.state.lock();
        self.space(root).translate(va)
    }

    /// A new address space sharing the kernel half (and the supervisor-only
    /// lower-half entries) of the kernel address space.
    ///
    /// # Errors
    /// [`VmmError::Map`] if no frame is left for the root table.
    pub fn create_address_space(&self) -> Result<RootPage, VmmError> {
        let mut state = self.state.lock();
        let space = AddressSpace::create(self.mapper, &mut state.alloc)?;
        let shared = space.share_kernel_entries(&self.space(self.kernel_root));
        debug!(
            "created address space at {} ({shared} kernel slots shared)",
            space.root_page().base()
        );
        Ok(space.root_page())
    }

    /// Free every page table the address space at `root` owns, and the root.
    /// Mapped frames are left to their owners. Returns the number of table
    /// frames released.
    ///
    /// # Errors
    /// [`VmmError::KernelSpace`] or [`VmmError::ActiveSpace`]; nothing is freed.
    pub fn destroy_address_space(&self, root: RootPage) -> Result<usize, VmmError> {
        let mut state = self.state.lock();
        if root == self.kernel_root {
            error!("refusing to destroy the kernel address space");
            return Err(VmmError::KernelSpace);
        }
        if root == self.mmu.active_root() {
            error!("refusing to destroy the active address space {}", root.base());
            return Err(VmmError::ActiveSpace);
        }

        let freed = self.space(root).release_tables(&mut state.alloc);
        debug!("destroyed address space at {}, {freed} table(s) freed", root.base());
        Ok(freed)
    }

    /// Load `root` into the MMU.
    ///
    /// # Safety
    /// `root` must come from this manager and must not have been destroyed.
    pub unsafe fn switch_address_space(&self, root: RootPage) {
        let _state = self.state.lock();
        unsafe { self.mmu.activate(root) };
    }

    #[must_use]
    pub fn current_address_space(&self) -> RootPage {
        self.mmu.active_root()
    }

    #[must_use]
    pub const fn kernel_address_space(&self) -> RootPage {
        self.kernel_root
    }

    pub fn invalidate_page(&self, va: VirtualAddress) {
        self.mmu.invalidate_page(va);
    }

    /// Reload the whole translation cache. Coarse; there is no shootdown.
    pub fn flush_tlb(&self) {
        self.mmu.flush_all();
    }
}
