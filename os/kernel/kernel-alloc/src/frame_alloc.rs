//! # Physical Memory Manager
//!
//! One bit per 4 KiB frame, set when the frame is in use. The bitmap covers
//! [`MAX_PHYSICAL_MEMORY`](kernel_info::memory::MAX_PHYSICAL_MEMORY) and
//! lives inline, so the manager works before any heap exists.
//!
//! Every frame starts out used. [`init`](PhysicalMemoryManager::init)
//! releases the usable regions of the boot memory map, never the first MiB.
//! Allocation is a first-fit scan for a run of clear bits.

use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{
    FALLBACK_USABLE_END, FALLBACK_USABLE_START, LOW_MEMORY_RESERVED, MAX_PHYSICAL_FRAMES,
    PAGE_SIZE,
};
use kernel_memory_addresses::{
    FrameNumber, PhysicalAddress, PhysicalPage, Size4K, align_down, align_up,
};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;
use log::{debug, error, info, warn};

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_PHYSICAL_FRAMES / WORD_BITS;

/// Refusals of [`PhysicalMemoryManager::free_pages`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("physical address {0} is not page aligned")]
    Unaligned(PhysicalAddress),
    #[error("{count} frame(s) at {addr} exceed the tracked memory")]
    OutOfRange { addr: PhysicalAddress, count: usize },
}

/// A consistent snapshot of the frame counters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    /// Longest run of consecutive free frames.
    pub largest_free_run: usize,
}

struct FrameBitmap {
    words: [u64; WORDS],
    /// Frames below this index are tracked; everything above stays used.
    total: usize,
    used: usize,
}

impl FrameBitmap {
    const fn new() -> Self {
        Self {
            words: [u64::MAX; WORDS],
            total: 0,
            used: 0,
        }
    }

    #[inline]
    const fn is_used(&self, frame: usize) -> bool {
        self.words[frame / WORD_BITS] & (1 << (frame % WORD_BITS)) != 0
    }

    #[inline]
    const fn set_used(&mut self, frame: usize) {
        self.words[frame / WORD_BITS] |= 1 << (frame % WORD_BITS);
    }

    #[inline]
    const fn set_free(&mut self, frame: usize) {
        self.words[frame / WORD_BITS] &= !(1 << (frame % WORD_BITS));
    }

    /// Clear `[first, end)`; returns how many bits actually changed.
    fn release_range(&mut self, first: usize, end: usize) -> usize {
        let mut released = 0;
        for frame in first..end {
            if self.is_used(frame) {
                self.set_free(frame);
                released += 1;
            }
        }
        released
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut frame = 0;
        while frame < self.total {
            if run_len == 0 && frame % WORD_BITS == 0 && self.words[frame / WORD_BITS] == u64::MAX {
                frame += WORD_BITS;
                continue;
            }
            if self.is_used(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            frame += 1;
        }
        None
    }

    fn largest_free_run(&self) -> usize {
        let (mut best, mut run) = (0, 0);
        for frame in 0..self.total {
            if self.is_used(frame) {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best
    }
}

/// Frame index range `[first, end)` covering the whole frames of `[base, end)`.
#[allow(clippy::cast_possible_truncation)]
fn whole_frames(base: u64, end: u64) -> (usize, usize) {
    let first = align_up(base, PAGE_SIZE).unwrap_or(u64::MAX) / PAGE_SIZE;
    let last = align_down(end, PAGE_SIZE) / PAGE_SIZE;
    let cap = MAX_PHYSICAL_FRAMES as u64;
    (first.min(cap) as usize, last.min(cap) as usize)
}

/// Bitmap frame allocator behind a single lock.
pub struct PhysicalMemoryManager {
    inner: SpinLock<FrameBitmap>,
}

impl Default for PhysicalMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemoryManager {
    /// A manager with no usable memory; call [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(FrameBitmap::new()),
        }
    }

    /// (Re)build the bitmap from the boot memory map.
    ///
    /// Usable regions are released except below
    /// [`LOW_MEMORY_RESERVED`]; the tracked range ends at the highest address
    /// of any region, capped at the bitmap's capacity. Frames of reserved
    /// regions stay used. Without a map (or with
    /// an empty one) the fallback window of 1–16 MiB is released.
    ///
    /// Returns the number of free frames.
    pub fn init(&self, memory_map: Option<&[MemoryRegion]>) -> usize {
        let mut bitmap = self.inner.lock();
        bitmap.words.fill(u64::MAX);

        let (highest, free) = match memory_map {
            Some(regions) if !regions.is_empty() => {
                let highest = regions.iter().map(MemoryRegion::end).max().unwrap_or(0);
                let mut free = 0;
                for region in regions.iter().filter(|r| r.is_usable()) {
                    let (first, end) =
                        whole_frames(region.base.max(LOW_MEMORY_RESERVED), region.end());
                    free += bitmap.release_range(first, end);
                }
                (highest, free)
            }
            _ => {
                warn!("no memory map, assuming {FALLBACK_USABLE_START:#x}..{FALLBACK_USABLE_END:#x} is usable");
                let (first, end) = whole_frames(FALLBACK_USABLE_START, FALLBACK_USABLE_END);
                (FALLBACK_USABLE_END, bitmap.release_range(first, end))
            }
        };

        let (_, total) = whole_frames(0, highest);
        bitmap.total = total;
        bitmap.used = total - free;
        info!(
            "physical memory: {free} of {total} frames free ({} KiB)",
            free as u64 * PAGE_SIZE / 1024
        );
        free
    }

    /// First-fit allocation of `count` physically contiguous frames.
    ///
    /// `None` for `count == 0` or when no run is long enough. Low memory is
    /// never free, so a returned address is never zero.
    pub fn allocate_pages(&self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        let mut bitmap = self.inner.lock();
        let Some(first) = bitmap.find_run(count) else {
            warn!(
                "no run of {count} free frame(s) ({} free)",
                bitmap.total - bitmap.used
            );
            return None;
        };
        for frame in first..first + count {
            bitmap.set_used(frame);
        }
        bitmap.used += count;
        let addr = FrameNumber::new(first as u64).base();
        debug!("allocated {count} frame(s) at {addr}");
        Some(addr)
    }

    /// Release `count` frames starting at `addr`.
    ///
    /// Frames that are already free are reported as a double free and
    /// skipped. Returns the number of frames actually released.
    ///
    /// # Errors
    /// - [`FrameError::Unaligned`] if `addr` is not page aligned.
    /// - [`FrameError::OutOfRange`] if the range leaves the tracked memory.
    pub fn free_pages(&self, addr: PhysicalAddress, count: usize) -> Result<usize, FrameError> {
        if !addr.is_aligned::<Size4K>() {
            error!("refusing to free unaligned physical address {addr}");
            return Err(FrameError::Unaligned(addr));
        }

        let mut bitmap = self.inner.lock();
        let first = usize::try_from(addr.frame_number().as_u64()).unwrap_or(usize::MAX);
        let end = first.saturating_add(count);
        if end > bitmap.total {
            error!("refusing to free {count} frame(s) at {addr}: beyond tracked memory");
            return Err(FrameError::OutOfRange { addr, count });
        }

        let mut released = 0;
        for frame in first..end {
            if bitmap.is_used(frame) {
                bitmap.set_free(frame);
                released += 1;
            } else {
                warn!(
                    "double free of frame {}",
                    FrameNumber::new(frame as u64).base()
                );
            }
        }
        bitmap.used -= released;
        Ok(released)
    }

    /// Mark every frame overlapping `[addr, addr + size)` as used, for
    /// memory that is never allocated (kernel image, MMIO windows).
    ///
    /// Idempotent. Returns the number of frames that were free before.
    #[allow(clippy::cast_possible_truncation)]
    pub fn reserve_range(&self, addr: PhysicalAddress, size: u64) -> usize {
        let start = align_down(addr.as_u64(), PAGE_SIZE) / PAGE_SIZE;
        let end = align_up(addr.as_u64().saturating_add(size), PAGE_SIZE).unwrap_or(u64::MAX)
            / PAGE_SIZE;

        let mut bitmap = self.inner.lock();
        let end = (end.min(bitmap.total as u64)) as usize;
        let mut reserved = 0;
        for frame in (start as usize)..end {
            if !bitmap.is_used(frame) {
                bitmap.set_used(frame);
                reserved += 1;
            }
        }
        bitmap.used += reserved;
        if reserved > 0 {
            debug!("reserved {reserved} frame(s) at {addr} (+{size:#x})");
        }
        reserved
    }

    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.inner.lock().total
    }

    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.inner.lock().used
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        let bitmap = self.inner.lock();
        bitmap.total - bitmap.used
    }

    /// Whether the frame containing `addr` is tracked and free.
    #[must_use]
    pub fn is_free(&self, addr: PhysicalAddress) -> bool {
        let bitmap = self.inner.lock();
        usize::try_from(addr.frame_number().as_u64())
            .is_ok_and(|frame| frame < bitmap.total && !bitmap.is_used(frame))
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let bitmap = self.inner.lock();
        FrameStats {
            total_frames: bitmap.total,
            used_frames: bitmap.used,
            free_frames: bitmap.total - bitmap.used,
            largest_free_run: bitmap.largest_free_run(),
        }
    }
}

/// Page-table frames for the VMM come straight from the bitmap.
impl FrameAlloc for &PhysicalMemoryManager {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_pages(1).map(PhysicalAddress::page::<Size4K>)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        // Refusals are logged by free_pages.
        let _ = self.free_pages(page.base(), 1);
    }
}
