use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// CR3, the page-map level-4 base register (PCID disabled).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–2, reserved.
    #[bits(3)]
    __: u8,

    /// Bit 3, PWT: write-through caching for PML4 accesses.
    pub pwt: bool,

    /// Bit 4, PCD: caching disabled for PML4 accesses.
    pub pcd: bool,

    /// Bits 5–11, reserved.
    #[bits(7)]
    __: u8,

    /// Bits 12–51, PML4 frame number.
    #[bits(40)]
    pml4_frame: u64,

    /// Bits 52–63, reserved.
    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with write-back caching.
    #[must_use]
    pub const fn for_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_pml4_frame(root.base().as_u64() >> 12)
    }

    /// The PML4 frame this value points at.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing(PhysicalAddress::new(self.pml4_frame() << 12))
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
