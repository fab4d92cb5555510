use crate::{FrameNumber, PageSize, PhysicalAddress, Size4K, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// Page-aligned base of a physical page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `addr` (low bits dropped).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::OFFSET_MASK,
            _size: PhantomData,
        }
    }

    /// `Some` only if `addr` already sits on a page boundary.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Rebuild a full address from this page and an in-page offset.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.base | (offset & S::OFFSET_MASK))
    }
}

impl PhysicalPage<Size4K> {
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::containing(self.base())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::LABEL, self.base)
    }
}

/// Page-aligned base of a virtual page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::OFFSET_MASK,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> VirtualAddress {
        VirtualAddress::new(self.base | (offset & S::OFFSET_MASK))
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::LABEL, self.base)
    }
}
