//! TLB maintenance for the executing CPU. There is no cross-CPU shootdown.

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use kernel_memory_addresses::VirtualAddress;

/// Drop the cached translation of the page containing `va`.
///
/// # Safety
/// Ring 0 only.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Drop every non-global cached translation by reloading CR3.
///
/// # Safety
/// Ring 0 only.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub unsafe fn flush_all() {
    unsafe {
        let cr3 = Cr3::load_unsafe();
        cr3.store_unsafe();
    }
}
