//! The x86-64 MMU of the executing CPU.

use kernel_memory_addresses::VirtualAddress;
use kernel_registers::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe, tlb};
use kernel_vmem::{Mmu, RootPage};

/// [`Mmu`] backed by CR3, `invlpg` and CR3 reloads. Ring 0 only.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

impl Mmu for X86Mmu {
    fn active_root(&self) -> RootPage {
        // SAFETY: the kernel runs in ring 0.
        unsafe { Cr3::load_unsafe() }.root()
    }

    unsafe fn activate(&self, root: RootPage) {
        unsafe { Cr3::for_root(root).store_unsafe() }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: the kernel runs in ring 0.
        unsafe { tlb::invalidate_page(va) }
    }

    fn flush_all(&self) {
        // SAFETY: the kernel runs in ring 0.
        unsafe { tlb::flush_all() }
    }
}
