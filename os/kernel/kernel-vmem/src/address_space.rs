//! # Address Space (x86-64, PML4-rooted)
//!
//! Walks and mutates one translation tree. All four levels go through the
//! same loop; only the index shift differs (see [`TableLevel::index_of`]).
//!
//! - [`AddressSpace::map_4k`] installs a leaf, creating missing tables.
//! - [`AddressSpace::unmap_4k`] clears a leaf and hands back its frame.
//! - [`AddressSpace::translate`] resolves a VA, including 2 MiB and 1 GiB leaves.
//! - [`AddressSpace::share_kernel_entries`] seeds a new space from the kernel's.
//! - [`AddressSpace::release_tables`] tears a user space down.
//!
//! Tables created by a walk that later runs out of memory are left linked;
//! they are empty and get reused by the next walk through the same range.
//!
//! A space created with [`AddressSpace::borrowing_from`] shares lower-half
//! tables with the kernel. Those are never written through this space: the
//! first write below a borrowed table gives the space its own copy of the
//! path (copy-on-write of the intermediate tables), and release skips
//! whatever is still borrowed.
//!
//! Nothing here touches the TLB. Whoever mutates an active space owes the
//! invalidation.

use crate::{FrameAlloc, PageEntryBits, PageTable, PhysMapper, TableIndex, TableLevel};
use kernel_info::memory::KERNEL_HALF_FIRST_INDEX;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use log::{trace, warn};

/// The PML4 frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Why a mapping could not be installed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame left for a new {0} table")]
    OutOfMemory(TableLevel),
    #[error("a huge page in the {0} covers the address")]
    HugePageConflict(TableLevel),
}

/// Parent level and the level of the table its entries link to.
const LINKS: [(TableLevel, TableLevel); 3] = [
    (TableLevel::Pml4, TableLevel::Pdpt),
    (TableLevel::Pdpt, TableLevel::Pd),
    (TableLevel::Pd, TableLevel::Pt),
];

/// Handle to one translation tree.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
    kernel: Option<RootPage>,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing tree.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self {
            root,
            mapper,
            kernel: None,
        }
    }

    /// Allocate an empty tree.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for the PML4.
    pub fn create<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc_table(mapper, alloc, TableLevel::Pml4)?;
        Ok(Self::from_root(mapper, root))
    }

    /// Treat lower-half tables shared with the tree at `kernel` as borrowed.
    #[inline]
    #[must_use]
    pub const fn borrowing_from(mut self, kernel: RootPage) -> Self {
        self.kernel = Some(kernel);
        self
    }

    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// The kernel root to compare against when walking to `va`. Kernel-half
    /// tables are never copied.
    fn shadow_root(&self, va: VirtualAddress) -> Option<RootPage> {
        if TableLevel::Pml4.index_of(va).as_usize() >= KERNEL_HALF_FIRST_INDEX {
            return None;
        }
        self.kernel.filter(|&kernel| kernel != self.root)
    }

    /// The child `index` links to in `shadow`, the kernel table at the same
    /// position as the one being walked.
    fn shadow_child(
        &self,
        shadow: Option<PhysicalPage<Size4K>>,
        index: TableIndex,
    ) -> Option<PhysicalPage<Size4K>> {
        shadow.and_then(|table| self.table(table).get(index).next_table())
    }

    #[inline]
    fn table(&self, page: PhysicalPage<Size4K>) -> &'m mut PageTable {
        // SAFETY: only frames linked into a tree (or freshly allocated for
        // one) reach this point, and they always hold a `PageTable`.
        unsafe { self.mapper.phys_to_mut(page.base()) }
    }

    /// The table of `level` on the path to `va`, without creating anything,
    /// and whether that table is borrowed from the kernel.
    fn table_at(&self, va: VirtualAddress, level: TableLevel) -> Option<(PhysicalPage<Size4K>, bool)> {
        let mut table = self.root;
        let mut shadow = self.shadow_root(va);
        for current in TableLevel::WALK {
            if current == level {
                return Some((table, shadow == Some(table)));
            }
            let index = current.index_of(va);
            table = self.table(table).get(index).next_table()?;
            shadow = self.shadow_child(shadow, index);
        }
        None
    }

    /// The entry for `va` at `level`, if the walk gets that far.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress, level: TableLevel) -> Option<PageEntryBits> {
        let (table, _) = self.table_at(va, level)?;
        Some(self.table(table).get(level.index_of(va)))
    }

    /// Whether the table of `level` on the path to `va` is the kernel's.
    #[must_use]
    pub fn is_borrowed(&self, va: VirtualAddress, level: TableLevel) -> bool {
        self.table_at(va, level).is_some_and(|(_, borrowed)| borrowed)
    }

    /// The PT covering `va`, creating PDPT, PD and PT as needed.
    ///
    /// New links are present and writable, and user accessible when `user`
    /// is set. Existing links on the path are promoted to user access when a
    /// user leaf is about to be installed below them. Tables on the path
    /// that are borrowed from the kernel are copied first.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] naming the level whose table could not be allocated.
    /// - [`MapError::HugePageConflict`] if a 1 GiB or 2 MiB leaf covers `va`.
    pub fn ensure_leaf_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let mut table = self.root;
        let mut shadow = self.shadow_root(va);
        for (level, child_level) in LINKS {
            let node = self.table(table);
            let index = level.index_of(va);
            let entry = node.get(index);
            let kernel_child = self.shadow_child(shadow, index);

            table = if !entry.present() {
                let child = alloc_table(self.mapper, alloc, child_level)?;
                node.set(index, PageEntryBits::table_link(child, user));
                child
            } else if entry.huge_page() {
                warn!("{va} is covered by a huge page in the {level}");
                return Err(MapError::HugePageConflict(level));
            } else {
                let mut child = PhysicalPage::containing(entry.physical_address());
                let mut link = entry;
                if kernel_child == Some(child) {
                    child = self.copy_table(alloc, child, child_level)?;
                    link = link.with_physical_address(child.base());
                }
                if user {
                    link = link.with_user_access(true);
                }
                if link != entry {
                    node.set(index, link);
                }
                child
            };
            shadow = kernel_child;
        }
        Ok(table)
    }

    /// A private copy of the borrowed `table`. Its entries still point at
    /// the kernel's children.
    fn copy_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: PhysicalPage<Size4K>,
        level: TableLevel,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let copy = alloc_table(self.mapper, alloc, level)?;
        let src = self.table(table);
        let dst = self.table(copy);
        for (index, entry) in src.present() {
            dst.set(index, entry);
        }
        trace!("copied borrowed {level} table {} to {}", table.base(), copy.base());
        Ok(copy)
    }

    /// Map `page → frame` with `flags` (the present bit is implied and any
    /// address bits in `flags` are ignored).
    ///
    /// Returns the frame previously mapped at `page`, if any.
    ///
    /// # Errors
    /// See [`ensure_leaf_table`](Self::ensure_leaf_table).
    pub fn map_4k<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        page: VirtualPage<Size4K>,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<Option<PhysicalPage<Size4K>>, MapError> {
        let va = page.base();
        let pt = self.table(self.ensure_leaf_table(alloc, va, flags.user_access())?);
        let index = TableLevel::Pt.index_of(va);

        let previous = pt.get(index);
        pt.set(
            index,
            flags
                .flags()
                .with_present(true)
                .with_physical_address(frame.base()),
        );
        Ok(previous
            .present()
            .then_some(PhysicalPage::containing(previous.physical_address())))
    }

    /// Clear the 4 KiB leaf at `page` and return the frame it mapped.
    ///
    /// `None` if nothing is mapped there, if the address is covered by a
    /// huge page (those are never split), or if the leaf sits in a table
    /// borrowed from the kernel.
    pub fn unmap_4k(&self, page: VirtualPage<Size4K>) -> Option<PhysicalPage<Size4K>> {
        let va = page.base();
        let (pt, borrowed) = self.table_at(va, TableLevel::Pt)?;
        if borrowed {
            warn!("not unmapping {va}: the mapping belongs to the kernel");
            return None;
        }
        let pt = self.table(pt);
        let index = TableLevel::Pt.index_of(va);

        let entry = pt.get(index);
        if !entry.present() {
            return None;
        }
        pt.set(index, PageEntryBits::zero());
        Some(PhysicalPage::containing(entry.physical_address()))
    }

    /// Resolve `va`, keeping its offset inside the page (of whatever size).
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for level in TableLevel::WALK {
            let entry = self.table(table).get(level.index_of(va));
            if !entry.present() {
                return None;
            }
            if entry.is_leaf_at(level) {
                let mask = level.entry_span() - 1;
                // Bit 12 of a huge leaf is PAT, not address.
                let base = entry.physical_address().as_u64() & !mask;
                return Some(PhysicalAddress::new(base | (va.as_u64() & mask)));
            }
            table = PhysicalPage::containing(entry.physical_address());
        }
        None
    }

    /// Seed this (fresh) space from the kernel's PML4.
    ///
    /// Every kernel-half slot is copied by value, so the lower-level kernel
    /// tables are shared and later kernel mappings show up here too. Present
    /// supervisor-only slots of the lower half (the boot identity map) are
    /// copied as well; those are borrowed and never released by this space.
    ///
    /// Returns the number of slots copied.
    pub fn share_kernel_entries(&self, kernel: &Self) -> usize {
        if kernel.root == self.root {
            return 0;
        }
        let src = kernel.table(kernel.root);
        let dst = self.table(self.root);

        let mut copied = 0;
        for (index, entry) in src.present() {
            if index.as_usize() >= KERNEL_HALF_FIRST_INDEX || !entry.user_access() {
                dst.set(index, entry);
                copied += 1;
            }
        }
        copied
    }

    /// Free every table this space owns, then its root.
    ///
    /// Only the lower half is walked; the kernel half is shared. Tables
    /// that still sit at the same position in the kernel tree (see
    /// [`borrowing_from`](Self::borrowing_from)) are borrowed and skipped.
    /// Leaf frames are never freed; huge leaves are skipped.
    ///
    /// Returns the number of table frames handed back to `alloc`.
    pub fn release_tables<A: FrameAlloc>(self, alloc: &mut A) -> usize {
        let shadow = self.kernel.filter(|&kernel| kernel != self.root);
        let pml4 = self.table(self.root);

        let mut freed = 0;
        for (index, entry) in pml4.present() {
            if index.as_usize() >= KERNEL_HALF_FIRST_INDEX {
                break;
            }
            freed += self.release_link(alloc, entry, index, TableLevel::Pdpt, shadow);
        }

        alloc.free_4k(self.root);
        freed + 1
    }

    /// Release the subtree behind `entry` (a link at `index` to a table of
    /// `level`) unless the kernel table `shadow` links to the same table.
    fn release_link<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        entry: PageEntryBits,
        index: TableIndex,
        level: TableLevel,
        shadow: Option<PhysicalPage<Size4K>>,
    ) -> usize {
        let Some(child) = entry.next_table() else {
            return 0;
        };
        let kernel_child = self.shadow_child(shadow, index);
        if kernel_child == Some(child) {
            trace!("{level} table {} is borrowed from the kernel", child.base());
            return 0;
        }
        self.release_subtree(alloc, child, level, kernel_child)
    }

    /// Free `table` (of `level`) and every owned table below it. Depth is
    /// bounded by the level chain: a PT's entries are leaves and are not
    /// followed.
    fn release_subtree<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: PhysicalPage<Size4K>,
        level: TableLevel,
        shadow: Option<PhysicalPage<Size4K>>,
    ) -> usize {
        let mut freed = 0;
        if let Some(child_level) = level.next() {
            for (index, entry) in self.table(table).present() {
                freed += self.release_link(alloc, entry, index, child_level, shadow);
            }
        }
        alloc.free_4k(table);
        freed + 1
    }
}

fn alloc_table<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    alloc: &mut A,
    level: TableLevel,
) -> Result<PhysicalPage<Size4K>, MapError> {
    let Some(page) = alloc.alloc_4k() else {
        warn!("out of frames for a new {level} table");
        return Err(MapError::OutOfMemory(level));
    };
    if !mapper.reaches(page.base()) {
        warn!("frame {} for a new {level} table is out of reach", page.base());
        alloc.free_4k(page);
        return Err(MapError::OutOfMemory(level));
    }
    // SAFETY: the frame was just handed to us; nothing else references it.
    let table: &mut PageTable = unsafe { mapper.phys_to_mut(page.base()) };
    table.clear();
    trace!("new {level} table at {}", page.base());
    Ok(page)
}
