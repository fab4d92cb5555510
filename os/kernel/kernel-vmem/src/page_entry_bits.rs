use crate::TableLevel;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// One 64-bit x86-64 paging-structure entry, valid at every level.
///
/// | Bits  | Field | Meaning |
/// |-------|-------|---------|
/// | 0     | P     | Present |
/// | 1     | RW    | Writable |
/// | 2     | US    | User accessible |
/// | 3     | PWT   | Write-through |
/// | 4     | PCD   | Cache disabled |
/// | 5     | A     | Accessed |
/// | 6     | D     | Dirty (leaf only) |
/// | 7     | PS    | Huge page (PDPT and PD only) |
/// | 8     | G     | Global (leaf only) |
/// | 9–11  |       | Available to the OS |
/// | 12–51 |       | Physical frame address |
/// | 52–62 |       | Available to the OS |
/// | 63    | NX    | No execute |
///
/// The layout is bit exact so entries built elsewhere (an ELF loader turning
/// segment permissions into flags, say) can be written as raw `u64`s.
///
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalAddress;
/// let e = PageEntryBits::kernel_rw().with_physical_address(PhysicalAddress::new(0x0020_0000));
/// assert_eq!(e.into_bits(), 0x0020_0003);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// PS. A leaf at the PDPT (1 GiB) or PD (2 MiB) level.
    pub huge_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available_low: u8,
    /// Frame address bits 51:12.
    #[bits(40)]
    frame_bits: u64,
    #[bits(11)]
    pub os_available_high: u16,
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Every bit except the frame address.
    pub const FLAGS_MASK: u64 = !(((1 << 40) - 1) << 12);

    /// A not-present entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_frame_bits(pa.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame_bits(pa.as_u64() >> 12)
    }

    /// The same entry with the frame address cleared.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        Self::from_bits(self.into_bits() & Self::FLAGS_MASK)
    }

    /// The next-level table, if this is a present non-huge link.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() && !self.huge_page() {
            Some(PhysicalPage::containing(self.physical_address()))
        } else {
            None
        }
    }

    /// Whether a present entry at `level` maps memory rather than a table.
    #[inline]
    #[must_use]
    pub const fn is_leaf_at(self, level: TableLevel) -> bool {
        self.present() && (matches!(level, TableLevel::Pt) || self.huge_page())
    }

    /// Link to a next-level table: present and writable, user if requested.
    /// Leaf permissions narrow access further down.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_address(table.base())
    }

    /// Kernel data: read/write, supervisor only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Kernel data that must not be executed.
    #[inline]
    #[must_use]
    pub const fn kernel_rw_nx() -> Self {
        Self::kernel_rw().with_no_execute(true)
    }

    /// Device registers: uncached, write-through, not executable.
    #[inline]
    #[must_use]
    pub const fn mmio() -> Self {
        Self::kernel_rw_nx()
            .with_cache_disabled(true)
            .with_write_through(true)
    }

    /// User data: read/write, not executable.
    #[inline]
    #[must_use]
    pub const fn user_rw_nx() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_no_execute(true)
    }

    /// User code: read and execute.
    #[inline]
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_match_the_architecture() {
        assert_eq!(PageEntryBits::new().with_present(true).into_bits(), 1 << 0);
        assert_eq!(PageEntryBits::new().with_writable(true).into_bits(), 1 << 1);
        assert_eq!(PageEntryBits::new().with_user_access(true).into_bits(), 1 << 2);
        assert_eq!(PageEntryBits::new().with_write_through(true).into_bits(), 1 << 3);
        assert_eq!(PageEntryBits::new().with_cache_disabled(true).into_bits(), 1 << 4);
        assert_eq!(PageEntryBits::new().with_accessed(true).into_bits(), 1 << 5);
        assert_eq!(PageEntryBits::new().with_dirty(true).into_bits(), 1 << 6);
        assert_eq!(PageEntryBits::new().with_huge_page(true).into_bits(), 1 << 7);
        assert_eq!(PageEntryBits::new().with_global(true).into_bits(), 1 << 8);
        assert_eq!(PageEntryBits::new().with_no_execute(true).into_bits(), 1 << 63);
    }

    #[test]
    fn address_field_spans_bits_12_to_51() {
        let pa = PhysicalAddress::new(0x000F_FFFF_FFFF_F000);
        let e = PageEntryBits::new().with_physical_address(pa);
        assert_eq!(e.into_bits(), 0x000F_FFFF_FFFF_F000);
        assert_eq!(e.physical_address(), pa);
        assert_eq!(e.flags(), PageEntryBits::zero());
    }

    #[test]
    fn address_does_not_disturb_flags() {
        let e = PageEntryBits::user_rw_nx().with_physical_address(PhysicalAddress::new(0x5000));
        assert_eq!(e.into_bits(), 0x8000_0000_0000_5007);
        assert_eq!(e.flags(), PageEntryBits::user_rw_nx());
    }

    #[test]
    fn huge_entries_are_leaves_not_links() {
        let huge = PageEntryBits::kernel_rw().with_huge_page(true);
        assert!(huge.next_table().is_none());
        assert!(huge.is_leaf_at(TableLevel::Pd));

        let link = PageEntryBits::kernel_rw();
        assert!(link.next_table().is_some());
        assert!(!link.is_leaf_at(TableLevel::Pd));
        assert!(link.is_leaf_at(TableLevel::Pt));
        assert!(!PageEntryBits::zero().is_leaf_at(TableLevel::Pt));
    }
}
