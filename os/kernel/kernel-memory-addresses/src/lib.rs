//! # Physical and Virtual Address Types
//!
//! Zero-cost wrappers that keep physical and virtual addresses apart at
//! compile time, plus the page and frame views the memory managers work in.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in RAM or MMIO space. |
//! | [`VirtualAddress`] | A byte address translated by the page tables. |
//! | [`PhysicalPage<S>`] | The page-aligned base of a physical page of size `S`. |
//! | [`VirtualPage<S>`] | The page-aligned base of a virtual page of size `S`. |
//! | [`FrameNumber`] | Index of a 4 KiB physical frame, `address >> 12`. |
//!
//! Page sizes are the marker types [`Size4K`], [`Size2M`] and [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0020_1234);
//! let page = pa.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0x0020_1000);
//! assert_eq!(page.join(pa.offset::<Size4K>()), pa);
//! assert_eq!(pa.frame_number().as_u64(), 0x201);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod frame_number;
mod page;
mod page_size;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use page::{PhysicalPage, VirtualPage};
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Align `x` down to the previous multiple of `align` (a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
/// assert_eq!(align_down(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to the next multiple of `align` (a power of two).
///
/// Returns `None` if the result does not fit in a `u64`.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
/// assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
/// assert_eq!(align_up(u64::MAX, 0x1000), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Whether `x` is a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn is_aligned(x: u64, align: u64) -> bool {
    x & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0, 4096), 0);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(48, 16), Some(48));
        assert!(is_aligned(0x20_0000, Size2M::SIZE));
        assert!(!is_aligned(0x20_1000, Size2M::SIZE));
    }

    #[test]
    fn pages_split_and_join() {
        let va = VirtualAddress::new(0xFFFF_8000_0040_2ABC);
        let page = va.page::<Size4K>();
        assert_eq!(page.base().as_u64(), 0xFFFF_8000_0040_2000);
        assert_eq!(va.offset::<Size4K>(), 0xABC);
        assert_eq!(page.join(0xABC), va);

        let big = va.page::<Size2M>();
        assert_eq!(big.base().as_u64(), 0xFFFF_8000_0040_0000);
        assert_eq!(va.offset::<Size2M>(), 0x2ABC);
    }

    #[test]
    fn aligned_constructors_reject_misalignment() {
        assert!(PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x1000)).is_some());
        assert!(PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x1001)).is_none());
        assert!(VirtualPage::<Size4K>::from_aligned(VirtualAddress::new(0x2010)).is_none());
    }

    #[test]
    fn frame_numbers() {
        let frame = FrameNumber::containing(PhysicalAddress::new(0x10_0FFF));
        assert_eq!(frame.as_u64(), 0x100);
        assert_eq!(frame.base(), PhysicalAddress::new(0x10_0000));
        assert_eq!(FrameNumber::new(7).page().base().as_u64(), 0x7000);
    }
}
