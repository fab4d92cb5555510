//! # Kernel Boot Information

/// Classification of a physical memory region reported by the bootloader.
///
/// The discriminants follow the multiboot/E820 type numbering.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may use.
    Usable = 1,
    /// Firmware or device owned; never touched.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    BadMemory = 5,
}

impl MemoryRegionKind {
    /// Map a raw multiboot/E820 type. Unknown types are treated as reserved.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Reserved,
        }
    }
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    /// End address (exclusive), saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}
