//! Block headers. This is the only place that reinterprets arena memory.
//!
//! ```text
//! ┌──────────────────────────────┬─────────────────────────┐
//! │ BlockHeader (HEADER_SIZE)    │ payload                 │
//! └──────────────────────────────┴─────────────────────────┘
//! ^ block address                ^ pointer handed out
//! |<──────────────── size_and_flags & !USED ──────────────>|
//! ```

use core::ptr::NonNull;

/// Alignment of every block and therefore of every payload.
pub const HEAP_ALIGN: usize = 16;

/// Smallest payload a block is created with.
pub const MIN_PAYLOAD: usize = 32;

/// Tag of a block that is handed out.
pub const ALLOC_MAGIC: u32 = 0xA110_CA7E;

/// Tag of a block on the free list.
pub const FREE_MAGIC: u32 = 0xF4EE_B10C;

/// Low bit of `size_and_flags`; sizes are multiples of [`HEAP_ALIGN`].
const USED: usize = 1;

#[repr(C, align(16))]
struct BlockHeader {
    size_and_flags: usize,
    magic: u32,
    _reserved: u32,
    /// Address of the next block on the free list, or 0.
    next_free: usize,
    /// Address of the previous block on the free list, or 0.
    prev_free: usize,
    /// Address of the block physically before this one, or 0 for the first.
    prev_phys: usize,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest block that can exist on its own.
pub const MIN_BLOCK: usize = HEADER_SIZE + MIN_PAYLOAD;

const _: () = {
    assert!(HEADER_SIZE.is_multiple_of(HEAP_ALIGN));
    assert!(MIN_PAYLOAD.is_multiple_of(HEAP_ALIGN));
};

/// Total block size for a payload of `payload` bytes, or `None` on overflow.
pub const fn block_size_for(payload: usize) -> Option<usize> {
    let payload = if payload < MIN_PAYLOAD { MIN_PAYLOAD } else { payload };
    match payload.checked_add(HEADER_SIZE + HEAP_ALIGN - 1) {
        Some(n) => Some(n & !(HEAP_ALIGN - 1)),
        None => None,
    }
}

/// A block in the arena, named by its header address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Block(usize);

impl Block {
    /// # Safety
    /// `addr` must be [`HEAP_ALIGN`]-aligned and leave room for a header
    /// inside memory owned by the arena for as long as the value is used.
    pub const unsafe fn at(addr: usize) -> Self {
        Self(addr)
    }

    /// Rebuild from a raw link field; 0 means none.
    ///
    /// # Safety
    /// As [`at`](Self::at) for non-zero `addr`.
    const unsafe fn link(addr: usize) -> Option<Self> {
        if addr == 0 { None } else { Some(Self(addr)) }
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline]
    fn header(self) -> *mut BlockHeader {
        self.0 as *mut BlockHeader
    }

    /// Write a fresh header, replacing whatever was there.
    pub fn init(self, size: usize, prev_phys: Option<Self>) {
        // SAFETY: `Block` values only exist for arena addresses with room for a header.
        unsafe {
            self.header().write(BlockHeader {
                size_and_flags: size,
                magic: FREE_MAGIC,
                _reserved: 0,
                next_free: 0,
                prev_free: 0,
                prev_phys: prev_phys.map_or(0, Self::addr),
            });
        }
    }

    #[inline]
    pub fn size(self) -> usize {
        // SAFETY: see `init`.
        unsafe { (*self.header()).size_and_flags & !USED }
    }

    #[inline]
    pub fn set_size(self, size: usize) {
        // SAFETY: see `init`.
        unsafe {
            let h = self.header();
            (*h).size_and_flags = size | ((*h).size_and_flags & USED);
        }
    }

    #[inline]
    pub fn is_used(self) -> bool {
        // SAFETY: see `init`.
        unsafe { (*self.header()).size_and_flags & USED != 0 }
    }

    #[inline]
    pub fn magic(self) -> u32 {
        // SAFETY: see `init`.
        unsafe { (*self.header()).magic }
    }

    /// Whether the tag and the used flag agree.
    pub fn is_consistent(self) -> bool {
        matches!(
            (self.magic(), self.is_used()),
            (ALLOC_MAGIC, true) | (FREE_MAGIC, false)
        )
    }

    pub fn mark_used(self) {
        // SAFETY: see `init`.
        unsafe {
            let h = self.header();
            (*h).size_and_flags |= USED;
            (*h).magic = ALLOC_MAGIC;
            (*h).next_free = 0;
            (*h).prev_free = 0;
        }
    }

    pub fn mark_free(self) {
        // SAFETY: see `init`.
        unsafe {
            let h = self.header();
            (*h).size_and_flags &= !USED;
            (*h).magic = FREE_MAGIC;
        }
    }

    #[cfg(test)]
    pub fn set_magic(self, magic: u32) {
        // SAFETY: see `init`.
        unsafe { (*self.header()).magic = magic }
    }

    pub fn next_free(self) -> Option<Self> {
        // SAFETY: link fields only ever hold arena block addresses.
        unsafe { Self::link((*self.header()).next_free) }
    }

    pub fn set_next_free(self, next: Option<Self>) {
        // SAFETY: see `init`.
        unsafe { (*self.header()).next_free = next.map_or(0, Self::addr) }
    }

    pub fn prev_free(self) -> Option<Self> {
        // SAFETY: as `next_free`.
        unsafe { Self::link((*self.header()).prev_free) }
    }

    pub fn set_prev_free(self, prev: Option<Self>) {
        // SAFETY: see `init`.
        unsafe { (*self.header()).prev_free = prev.map_or(0, Self::addr) }
    }

    pub fn prev_phys(self) -> Option<Self> {
        // SAFETY: as `next_free`.
        unsafe { Self::link((*self.header()).prev_phys) }
    }

    pub fn set_prev_phys(self, prev: Option<Self>) {
        // SAFETY: see `init`.
        unsafe { (*self.header()).prev_phys = prev.map_or(0, Self::addr) }
    }

    /// Address just past this block.
    #[inline]
    pub fn end(self) -> usize {
        self.0 + self.size()
    }

    #[inline]
    pub const fn payload_addr(self) -> usize {
        self.0 + HEADER_SIZE
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: block addresses are never zero.
        unsafe { NonNull::new_unchecked(self.payload_addr() as *mut u8) }
    }

    /// Bytes a caller may use behind [`payload`](Self::payload).
    #[inline]
    pub fn payload_capacity(self) -> usize {
        self.size() - HEADER_SIZE
    }
}
