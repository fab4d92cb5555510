use crate::PageEntryBits;
use core::fmt;
use kernel_info::memory::PAGE_TABLE_ENTRIES;
use kernel_memory_addresses::VirtualAddress;

/// Index into a 512-entry table node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// `None` unless `index < 512`.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Option<Self> {
        if index < PAGE_TABLE_ENTRIES {
            #[allow(clippy::cast_possible_truncation)]
            Some(Self(index as u16))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// All 512 indices in order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn all() -> impl Iterator<Item = Self> {
        (0..PAGE_TABLE_ENTRIES as u16).map(Self)
    }
}

/// The four levels of the translation tree, root first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl TableLevel {
    /// Root to leaf.
    pub const WALK: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Position of this level's nine index bits in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Index of `va` in a table of this level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// The level the entries of this level point at.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

/// One 4 KiB page-table node of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; PAGE_TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::zero(); PAGE_TABLE_ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: TableIndex) -> PageEntryBits {
        self.entries[index.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, index: TableIndex, entry: PageEntryBits) {
        self.entries[index.as_usize()] = entry;
    }

    /// Mark every entry not present.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.fill(PageEntryBits::zero());
    }

    /// Present entries with their indices.
    pub fn present(&self) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        TableIndex::all()
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_the_nine_bit_split() {
        let va = VirtualAddress::new(0xFFFF_8012_3456_7000);
        assert_eq!(TableLevel::Pml4.index_of(va).as_usize(), 256);
        assert_eq!(TableLevel::Pdpt.index_of(va).as_usize(), 0x48);
        assert_eq!(TableLevel::Pd.index_of(va).as_usize(), 0x1A2);
        assert_eq!(TableLevel::Pt.index_of(va).as_usize(), 0x167);
    }

    #[test]
    fn levels_chain_root_to_leaf() {
        let mut level = TableLevel::Pml4;
        let mut seen = vec![level];
        while let Some(next) = level.next() {
            seen.push(next);
            level = next;
        }
        assert_eq!(seen, TableLevel::WALK);
        assert_eq!(TableLevel::Pd.entry_span(), 2 * 1024 * 1024);
    }

    #[test]
    fn table_index_is_bounded() {
        assert!(TableIndex::new(511).is_some());
        assert!(TableIndex::new(512).is_none());
        assert_eq!(TableIndex::all().count(), 512);
    }

    #[test]
    fn present_skips_empty_slots() {
        let mut t = PageTable::zeroed();
        t.set(TableIndex::new(3).unwrap(), PageEntryBits::kernel_rw());
        t.set(TableIndex::new(300).unwrap(), PageEntryBits::user_rx());
        let idx: Vec<usize> = t.present().map(|(i, _)| i.as_usize()).collect();
        assert_eq!(idx, [3, 300]);
        t.clear();
        assert_eq!(t.present().count(), 0);
    }
}
