use crate::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use core::fmt;

/// Index of a 4 KiB physical frame (`physical address >> 12`).
///
/// This is the unit the frame bitmap is indexed by.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_u64() >> Size4K::SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << Size4K::SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing(self.base())
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.0)
    }
}
