//! The arena: physically adjacent blocks plus an address-sorted free list.
//!
//! ```text
//! start                                                         end   max_end
//! ├──────────┬──────────────┬────────┬─────────────────────────┤ · · · ┤
//! │ used     │ free         │ used   │ free                    │
//! └──────────┴──────┬───────┴────────┴──────┬──────────────────┘
//!   free_head ──────┘ ◄──── prev_free ───── └─► next_free = 0
//! ```
//!
//! Two free blocks are never physically adjacent once an operation returns.

use super::backing::HeapBacking;
use super::block::{
    ALLOC_MAGIC, Block, FREE_MAGIC, HEADER_SIZE, HEAP_ALIGN, MIN_BLOCK, block_size_for,
};
use super::HeapError;
use core::ptr::NonNull;
use kernel_info::memory::{KERNEL_HEAP_GROWTH, KERNEL_HEAP_MAX_SIZE, PAGE_SIZE};
use kernel_memory_addresses::VirtualAddress;
use log::{debug, error, trace, warn};

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

const fn align_up(x: usize, align: usize) -> Option<usize> {
    match x.checked_add(align - 1) {
        Some(n) => Some(n & !(align - 1)),
        None => None,
    }
}

/// Runtime heap limits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapConfig {
    /// Minimum number of bytes added per expansion.
    pub growth: usize,
    /// Hard upper bound of the arena size.
    pub max_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            growth: KERNEL_HEAP_GROWTH,
            max_size: KERNEL_HEAP_MAX_SIZE,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes between the arena start and its current end.
    pub arena_bytes: usize,
    /// Bytes in used blocks, headers included.
    pub used_bytes: usize,
    /// Bytes in free blocks, headers included.
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub allocations: u64,
    pub frees: u64,
    pub expansions: u64,
    pub failed_allocations: u64,
}

/// What a clean [`validate`](BlockArena::validate) walk found.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapReport {
    pub blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapCorruption {
    #[error("block {0:#x}: magic does not match its state")]
    BadMagic(usize),
    #[error("block {0:#x}: size out of bounds")]
    BadSize(usize),
    #[error("block {0:#x}: broken link to its physical predecessor")]
    BrokenPhysLink(usize),
    #[error("block {0:#x}: free and not coalesced with its free predecessor")]
    Uncoalesced(usize),
    #[error("blocks cover {covered:#x} of {span:#x} arena bytes")]
    SpanMismatch { covered: usize, span: usize },
    #[error("last block recorded at {recorded:#x}, walk ended at {found:#x}")]
    LastBlock { recorded: usize, found: usize },
    #[error("free list entry {0:#x} is not a free block of the arena")]
    FreeListEntry(usize),
    #[error("free list is not sorted at {0:#x}")]
    FreeListOrder(usize),
    #[error("free list back link broken at {0:#x}")]
    FreeListLink(usize),
    #[error("free list holds {listed} block(s), the arena has {free} free")]
    FreeListIncomplete { listed: usize, free: usize },
}

pub struct BlockArena<B> {
    start: usize,
    end: usize,
    max_end: usize,
    growth: usize,
    free_head: Option<Block>,
    last: Block,
    backing: B,
    stats: HeapStats,
}

impl<B: HeapBacking> BlockArena<B> {
    /// Back `[start, start + size)`, both rounded up to whole pages, and seed
    /// it with one free block. A zero `size` still backs one page.
    ///
    /// # Safety
    /// The range up to `start + config.max_size` must be reserved for the
    /// arena; `backing` must make any part of it it accepts read/writable.
    pub unsafe fn init(
        start: VirtualAddress,
        size: usize,
        mut backing: B,
        config: HeapConfig,
    ) -> Result<Self, HeapError> {
        let requested = usize::try_from(start.as_u64()).map_err(|_| HeapError::InvalidPointer(0))?;
        let start = align_up(requested, PAGE).ok_or(HeapError::InvalidPointer(requested))?;
        let size = align_up(size.max(1), PAGE).ok_or(HeapError::LimitReached(size))?;
        let max_size = align_up(config.max_size, PAGE)
            .ok_or(HeapError::LimitReached(config.max_size))?
            .max(size);
        let end = start.checked_add(size).ok_or(HeapError::LimitReached(size))?;
        let max_end = start.checked_add(max_size).ok_or(HeapError::LimitReached(max_size))?;

        backing.back(VirtualAddress::new(start as u64), size)?;

        // SAFETY: the range was just backed and is page aligned.
        let first = unsafe { Block::at(start) };
        first.init(size, None);

        Ok(Self {
            start,
            end,
            max_end,
            growth: config.growth,
            free_head: Some(first),
            last: first,
            backing,
            stats: HeapStats {
                arena_bytes: size,
                free_bytes: size,
                free_blocks: 1,
                ..HeapStats::default()
            },
        })
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        self.stats
    }

    /// # Safety
    /// `addr` must name a block header inside `[start, end)`.
    const unsafe fn block(addr: usize) -> Block {
        unsafe { Block::at(addr) }
    }

    fn next_phys(&self, block: Block) -> Option<Block> {
        if block == self.last {
            None
        } else {
            // SAFETY: every block but the last is followed by another one.
            Some(unsafe { Self::block(block.end()) })
        }
    }

    /// Repair the back link of whatever now follows `block`.
    fn relink_successor(&mut self, block: Block, old_last: Block) {
        if old_last.addr() < block.end() {
            self.last = block;
        } else if let Some(next) = self.next_phys(block) {
            next.set_prev_phys(Some(block));
        }
    }

    fn unlink(&mut self, block: Block) {
        let prev = block.prev_free();
        let next = block.next_free();
        match prev {
            Some(p) => p.set_next_free(next),
            None => self.free_head = next,
        }
        if let Some(n) = next {
            n.set_prev_free(prev);
        }
        block.set_next_free(None);
        block.set_prev_free(None);
    }

    fn insert_sorted(&mut self, block: Block) {
        let mut prev = None;
        let mut cursor = self.free_head;
        while let Some(node) = cursor {
            if node.addr() > block.addr() {
                break;
            }
            prev = Some(node);
            cursor = node.next_free();
        }

        block.set_prev_free(prev);
        block.set_next_free(cursor);
        match prev {
            Some(p) => p.set_next_free(Some(block)),
            None => self.free_head = Some(block),
        }
        if let Some(n) = cursor {
            n.set_prev_free(Some(block));
        }
    }

    /// Put `new` at the list position of `old`; `new` lies between `old` and its successor.
    fn replace_in_list(&mut self, old: Block, new: Block) {
        let prev = old.prev_free();
        let next = old.next_free();
        new.set_prev_free(prev);
        new.set_next_free(next);
        match prev {
            Some(p) => p.set_next_free(Some(new)),
            None => self.free_head = Some(new),
        }
        if let Some(n) = next {
            n.set_prev_free(Some(new));
        }
    }

    /// Cut `block` down to `size` bytes; the tail becomes a new free block
    /// that the caller still has to put on the free list.
    fn split_off(&mut self, block: Block, size: usize) -> Option<Block> {
        let total = block.size();
        if total - size < MIN_BLOCK {
            return None;
        }
        let old_last = self.last;
        // SAFETY: `size < total`, so the tail header lies inside `block`.
        let rest = unsafe { Self::block(block.addr() + size) };
        rest.init(total - size, Some(block));
        block.set_size(size);
        self.relink_successor(rest, old_last);
        Some(rest)
    }

    fn first_fit(&self, need: usize) -> Option<Block> {
        let mut cursor = self.free_head;
        while let Some(block) = cursor {
            if block.size() >= need {
                return Some(block);
            }
            cursor = block.next_free();
        }
        None
    }

    fn take(&mut self, block: Block, need: usize) -> NonNull<u8> {
        if let Some(rest) = self.split_off(block, need) {
            self.replace_in_list(block, rest);
        } else {
            self.unlink(block);
            self.stats.free_blocks -= 1;
        }
        block.mark_used();

        let size = block.size();
        self.stats.used_bytes += size;
        self.stats.free_bytes -= size;
        self.stats.used_blocks += 1;
        self.stats.allocations += 1;
        block.payload()
    }

    /// First-fit allocation; grows the arena once if nothing fits.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let Some(need) = block_size_for(size) else {
            self.stats.failed_allocations += 1;
            return None;
        };

        if let Some(block) = self.first_fit(need) {
            return Some(self.take(block, need));
        }

        match self.expand(need) {
            Ok(()) => {
                if let Some(block) = self.first_fit(need) {
                    return Some(self.take(block, need));
                }
            }
            Err(err) => warn!("heap allocation of {size} bytes failed: {err}"),
        }
        self.stats.failed_allocations += 1;
        None
    }

    /// The used block that owns `ptr`, without modifying anything.
    fn used_block(&self, ptr: usize) -> Result<Block, HeapError> {
        let in_arena = ptr >= self.start + HEADER_SIZE && ptr < self.end;
        if !in_arena || !(ptr - HEADER_SIZE).is_multiple_of(HEAP_ALIGN) {
            error!("pointer {ptr:#x} does not belong to the heap");
            return Err(HeapError::InvalidPointer(ptr));
        }

        // SAFETY: aligned and inside the arena; the tag is checked before trusting the rest.
        let block = unsafe { Self::block(ptr - HEADER_SIZE) };
        match block.magic() {
            ALLOC_MAGIC if block.is_used() => {}
            FREE_MAGIC => {
                warn!("double free of {ptr:#x}");
                return Err(HeapError::DoubleFree(ptr));
            }
            magic => {
                error!("heap block at {:#x} is corrupted (magic {magic:#010x})", block.addr());
                return Err(HeapError::Corrupted(ptr));
            }
        }

        let size = block.size();
        if size < MIN_BLOCK || block.addr().checked_add(size).is_none_or(|end| end > self.end) {
            error!("heap block at {:#x} has impossible size {size:#x}", block.addr());
            return Err(HeapError::Corrupted(ptr));
        }
        Ok(block)
    }

    /// Release the allocation at `ptr` and merge it with free neighbours.
    pub fn free(&mut self, ptr: usize) -> Result<(), HeapError> {
        let block = self.used_block(ptr)?;
        let size = block.size();

        block.mark_free();
        self.insert_sorted(block);
        self.stats.used_bytes -= size;
        self.stats.free_bytes += size;
        self.stats.used_blocks -= 1;
        self.stats.free_blocks += 1;
        self.stats.frees += 1;

        self.coalesce(block);
        Ok(())
    }

    /// Merge the free, listed `next` into `block`, which directly precedes it.
    fn absorb(&mut self, block: Block, next: Block) {
        self.unlink(next);
        let old_last = self.last;
        block.set_size(block.size() + next.size());
        self.relink_successor(block, old_last);
        self.stats.free_blocks -= 1;
    }

    fn coalesce(&mut self, block: Block) -> Block {
        if let Some(next) = self.next_phys(block)
            && !next.is_used()
        {
            self.absorb(block, next);
        }
        match block.prev_phys() {
            Some(prev) if !prev.is_used() => {
                self.absorb(prev, block);
                prev
            }
            _ => block,
        }
    }

    /// Grow the arena by at least `min` bytes, never past its maximum.
    pub fn expand(&mut self, min: usize) -> Result<(), HeapError> {
        let room = self.max_end - self.end;
        let needed = align_up(min, PAGE).ok_or(HeapError::LimitReached(min))?;
        if needed > room {
            warn!(
                "heap cannot grow by {min:#x} bytes: {:#x} of {:#x} in use",
                self.end - self.start,
                self.max_end - self.start
            );
            return Err(HeapError::LimitReached(min));
        }
        let grow = align_up(min.max(self.growth), PAGE)
            .unwrap_or(needed)
            .min(room);

        let at = self.end;
        self.backing.back(VirtualAddress::new(at as u64), grow).inspect_err(|err| {
            warn!("heap expansion by {grow:#x} bytes failed: {err}");
        })?;

        // SAFETY: `[at, at + grow)` was just backed.
        let block = unsafe { Self::block(at) };
        block.init(grow, Some(self.last));
        self.last = block;
        self.end = at + grow;
        self.insert_sorted(block);

        self.stats.arena_bytes += grow;
        self.stats.free_bytes += grow;
        self.stats.free_blocks += 1;
        self.stats.expansions += 1;
        debug!("heap grew by {grow:#x} bytes to {:#x}", self.end - self.start);

        self.coalesce(block);
        Ok(())
    }

    /// Resize the allocation at `ptr`. `Ok(None)` means it was freed.
    ///
    /// On [`HeapError::OutOfMemory`] the original allocation is untouched.
    pub fn reallocate(&mut self, ptr: usize, new_size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let block = self.used_block(ptr)?;
        let need = block_size_for(new_size).ok_or(HeapError::OutOfMemory)?;
        let size = block.size();
        if need <= size {
            return Ok(Some(block.payload()));
        }

        if let Some(next) = self.next_phys(block)
            && !next.is_used()
            && size + next.size() >= need
        {
            let gained = next.size();
            self.absorb(block, next);
            self.stats.used_bytes += gained;
            self.stats.free_bytes -= gained;

            if let Some(rest) = self.split_off(block, need) {
                self.insert_sorted(rest);
                let returned = rest.size();
                self.stats.used_bytes -= returned;
                self.stats.free_bytes += returned;
                self.stats.free_blocks += 1;
            }
            trace!("grew {ptr:#x} in place to {new_size} bytes");
            return Ok(Some(block.payload()));
        }

        let Some(moved) = self.allocate(new_size) else {
            return Err(HeapError::OutOfMemory);
        };
        let keep = block.payload_capacity().min(new_size);
        // SAFETY: both payloads hold at least `keep` bytes and are distinct blocks.
        unsafe { core::ptr::copy_nonoverlapping(block.payload().as_ptr(), moved.as_ptr(), keep) };
        self.free(ptr)?;
        Ok(Some(moved))
    }

    /// Payload capacity of the live allocation at `ptr`.
    pub fn usable_size(&self, ptr: usize) -> Result<usize, HeapError> {
        let block = self.used_block(ptr)?;
        Ok(block.payload_capacity())
    }

    /// Walk every block and the whole free list.
    pub fn validate(&self) -> Result<HeapReport, HeapCorruption> {
        let mut report = HeapReport::default();
        let mut prev: Option<Block> = None;
        let mut addr = self.start;

        while addr < self.end {
            // SAFETY: `addr` is the start or the end of a block checked below.
            let block = unsafe { Self::block(addr) };
            if !block.is_consistent() {
                return Err(HeapCorruption::BadMagic(addr));
            }
            let size = block.size();
            if size < MIN_BLOCK
                || !size.is_multiple_of(HEAP_ALIGN)
                || addr.checked_add(size).is_none_or(|end| end > self.end)
            {
                return Err(HeapCorruption::BadSize(addr));
            }
            if block.prev_phys() != prev {
                return Err(HeapCorruption::BrokenPhysLink(addr));
            }

            if block.is_used() {
                report.used_blocks += 1;
                report.used_bytes += size;
            } else {
                if prev.is_some_and(|p| !p.is_used()) {
                    return Err(HeapCorruption::Uncoalesced(addr));
                }
                report.free_blocks += 1;
                report.free_bytes += size;
            }
            report.blocks += 1;
            prev = Some(block);
            addr += size;
        }

        let span = self.end - self.start;
        let covered = report.used_bytes + report.free_bytes;
        if covered != span {
            return Err(HeapCorruption::SpanMismatch { covered, span });
        }
        if prev != Some(self.last) {
            return Err(HeapCorruption::LastBlock {
                recorded: self.last.addr(),
                found: prev.map_or(0, Block::addr),
            });
        }

        self.validate_free_list(report.free_blocks)?;
        Ok(report)
    }

    fn validate_free_list(&self, free: usize) -> Result<(), HeapCorruption> {
        let mut listed = 0;
        let mut prev: Option<Block> = None;
        let mut cursor = self.free_head;

        while let Some(node) = cursor {
            let addr = node.addr();
            if addr < self.start || addr >= self.end || !addr.is_multiple_of(HEAP_ALIGN) {
                return Err(HeapCorruption::FreeListEntry(addr));
            }
            if node.is_used() || node.magic() != FREE_MAGIC {
                return Err(HeapCorruption::FreeListEntry(addr));
            }
            if prev.is_some_and(|p| p >= node) {
                return Err(HeapCorruption::FreeListOrder(addr));
            }
            if node.prev_free() != prev {
                return Err(HeapCorruption::FreeListLink(addr));
            }
            listed += 1;
            if listed > free {
                return Err(HeapCorruption::FreeListIncomplete { listed, free });
            }
            prev = Some(node);
            cursor = node.next_free();
        }

        if listed == free {
            Ok(())
        } else {
            Err(HeapCorruption::FreeListIncomplete { listed, free })
        }
    }
}
