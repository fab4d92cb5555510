use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), the number of in-page offset bits.
    const SHIFT: u32;
    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;
    /// Short label used in log output.
    const LABEL: &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const LABEL: &'static str = $label;
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::LABEL)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, the base granularity of frames and mappings.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page, a page-directory leaf.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page, a PDPT leaf.
    Size1G, 30, "1G"
);
