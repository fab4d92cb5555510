//! # Identity-mapped physical memory access
//!
//! During early boot, and for every table frame below the identity window,
//! a physical address is also a valid virtual address in the kernel address
//! space. [`IdentityPhysMapper`] relies on exactly that.

use kernel_info::memory::{IDENTITY_MAP_BYTES, PAGE_SIZE};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for identity-mapped physical memory (`va == pa`).
///
/// Only frames below [`IDENTITY_MAP_BYTES`] stay reachable once the kernel
/// address space is active, and page 0 is never mapped. New page tables are
/// refused anywhere else.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = pa.as_u64() as usize as *mut T;
        // SAFETY: the caller guarantees `pa` is identity mapped and holds a `T`.
        unsafe { &mut *va }
    }

    fn reaches(&self, pa: PhysicalAddress) -> bool {
        (PAGE_SIZE..=IDENTITY_MAP_BYTES - PAGE_SIZE).contains(&pa.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_identity_window_is_reachable() {
        let mapper = IdentityPhysMapper;
        assert!(!mapper.reaches(PhysicalAddress::zero()));
        assert!(mapper.reaches(PhysicalAddress::new(PAGE_SIZE)));
        assert!(mapper.reaches(PhysicalAddress::new(IDENTITY_MAP_BYTES - PAGE_SIZE)));
        assert!(!mapper.reaches(PhysicalAddress::new(IDENTITY_MAP_BYTES)));
        assert!(!mapper.reaches(PhysicalAddress::new(64 * 1024 * 1024)));
    }
}
