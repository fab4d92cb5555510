//! # Kernel Heap
//!
//! A boundary-tag allocator over one contiguous virtual arena. Every block
//! carries a header with its size, a state tag and links; free blocks sit on
//! an address-sorted list and are merged with free neighbours on release.
//!
//! The arena starts at the size given to [`KernelHeap::init`] and grows in
//! page multiples through its [`HeapBacking`] until
//! [`HeapConfig::max_size`] is reached. Payloads are
//! [`HEAP_ALIGN`]-aligned; stricter alignments go through
//! [`KernelHeap::allocate_aligned`].
//!
//! Misuse is refused, never trusted: freeing a foreign pointer, freeing
//! twice or finding a damaged header logs the problem and returns an error
//! without touching the arena.

mod backing;
mod block;
mod free_list;

pub use backing::{BackingError, HeapBacking, MappedBacking, StaticBacking};
pub use block::{HEADER_SIZE, HEAP_ALIGN, MIN_PAYLOAD};
pub use free_list::{HeapConfig, HeapCorruption, HeapReport, HeapStats};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use free_list::BlockArena;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use log::info;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("{0:#x} is not a heap allocation")]
    InvalidPointer(usize),
    #[error("{0:#x} was already freed")]
    DoubleFree(usize),
    #[error("heap block of {0:#x} is corrupted")]
    Corrupted(usize),
    #[error("heap limit reached, {0:#x} more bytes requested")]
    LimitReached(usize),
    #[error(transparent)]
    Backing(#[from] BackingError),
    #[error(transparent)]
    Inconsistent(#[from] HeapCorruption),
    #[error("heap is not initialized")]
    Uninitialized,
    #[error("heap is already initialized")]
    AlreadyInitialized,
}

impl HeapError {
    /// Whether the caller handed the heap something it never gave out, or
    /// the heap found itself damaged. Exhaustion is not misuse.
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::InvalidPointer(_)
                | Self::DoubleFree(_)
                | Self::Corrupted(_)
                | Self::Inconsistent(_)
                | Self::Uninitialized
        )
    }
}

const WORD: usize = size_of::<usize>();

/// The kernel heap. Every operation takes the one heap lock.
pub struct KernelHeap<B> {
    arena: SpinLock<Option<BlockArena<B>>>,
}

impl<B> Default for KernelHeap<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> KernelHeap<B> {
    /// An uninitialized heap; every allocation fails until [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arena: SpinLock::new(None),
        }
    }
}

impl<B: HeapBacking> KernelHeap<B> {
    /// Set up the arena at `start` (rounded up to a page) with `size` bytes
    /// (rounded up to whole pages).
    ///
    /// # Errors
    /// - [`HeapError::AlreadyInitialized`] on a second call.
    /// - [`HeapError::Backing`] if the initial range cannot be backed.
    ///
    /// # Safety
    /// `[start, start + config.max_size)` must be reserved for this heap and
    /// nothing else may use it.
    pub unsafe fn init(
        &self,
        start: VirtualAddress,
        size: usize,
        backing: B,
        config: HeapConfig,
    ) -> Result<(), HeapError> {
        let mut slot = self.arena.lock();
        if slot.is_some() {
            return Err(HeapError::AlreadyInitialized);
        }
        let arena = unsafe { BlockArena::init(start, size, backing, config)? };
        info!(
            "kernel heap at {:#x}, {} KiB (max {} KiB)",
            arena.start(),
            (arena.end() - arena.start()) / 1024,
            config.max_size / 1024
        );
        *slot = Some(arena);
        Ok(())
    }

    fn with_arena<R>(
        &self,
        f: impl FnOnce(&mut BlockArena<B>) -> Result<R, HeapError>,
    ) -> Result<R, HeapError> {
        self.arena
            .lock()
            .as_mut()
            .ok_or(HeapError::Uninitialized)
            .and_then(f)
    }

    /// `size` bytes aligned to [`HEAP_ALIGN`], or `None` if `size` is zero or
    /// the heap is exhausted.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.arena.lock().as_mut()?.allocate(size)
    }

    /// Release an allocation. Null is a no-op.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`], [`HeapError::DoubleFree`] or
    /// [`HeapError::Corrupted`]; the heap is left as it was.
    ///
    /// # Safety
    /// No reference into the allocation may be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        self.with_arena(|arena| arena.free(ptr as usize))
    }

    /// Resize an allocation, in place when the following block is free.
    ///
    /// Null behaves like [`allocate`](Self::allocate), a zero size like
    /// [`free`](Self::free) (returning `Ok(None)`).
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] leaves the original allocation intact;
    /// otherwise as [`free`](Self::free).
    ///
    /// # Safety
    /// On success the old pointer must not be used again.
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        if ptr.is_null() {
            return match new_size {
                0 => Ok(None),
                n => self.allocate(n).map(Some).ok_or(HeapError::OutOfMemory),
            };
        }
        self.with_arena(|arena| arena.reallocate(ptr as usize, new_size))
    }

    /// `count * size` zeroed bytes; `None` on overflow.
    #[must_use]
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        // SAFETY: the allocation holds at least `total` bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Some(ptr)
    }

    /// `size` bytes aligned to `align`, a power of two. Release with
    /// [`free_aligned`](Self::free_aligned).
    ///
    /// The block is over-allocated and the pointer it started at is kept in
    /// the word just below the returned address.
    #[must_use]
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() || size == 0 {
            return None;
        }
        let total = size.checked_add(align)?.checked_add(WORD)?;
        let raw = self.allocate(total)?;

        let base = raw.as_ptr() as usize;
        let aligned = (base + WORD).next_multiple_of(align);
        // SAFETY: `aligned - WORD >= base` and `aligned + size <= base + total`.
        unsafe {
            let aligned_ptr = raw.as_ptr().add(aligned - base);
            aligned_ptr.sub(WORD).cast::<usize>().write_unaligned(base);
            Some(NonNull::new_unchecked(aligned_ptr))
        }
    }

    /// Release a pointer from [`allocate_aligned`](Self::allocate_aligned).
    /// Null is a no-op.
    ///
    /// # Errors
    /// As [`free`](Self::free), judged on the recovered block pointer.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate_aligned`](Self::allocate_aligned).
    pub unsafe fn free_aligned(&self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        let base = unsafe { ptr.sub(WORD).cast::<usize>().read_unaligned() };
        self.with_arena(|arena| arena.free(base))
    }

    /// Payload capacity of an allocation; at least what was requested.
    ///
    /// # Errors
    /// As [`free`](Self::free).
    ///
    /// # Safety
    /// `ptr` must not be in use by a concurrent [`free`](Self::free).
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Result<usize, HeapError> {
        self.with_arena(|arena| arena.usable_size(ptr as usize))
    }

    /// Check every block header and the free list.
    ///
    /// # Errors
    /// [`HeapError::Inconsistent`] naming the first problem found, or
    /// [`HeapError::Uninitialized`].
    pub fn validate(&self) -> Result<HeapReport, HeapError> {
        self.with_arena(|arena| Ok(arena.validate()?))
    }

    /// Counters; all zero before [`init`](Self::init).
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.arena
            .lock()
            .as_ref()
            .map_or_else(HeapStats::default, BlockArena::stats)
    }
}

unsafe impl<B: HeapBacking + Send> GlobalAlloc for KernelHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = if layout.align() <= HEAP_ALIGN {
            self.allocate(layout.size())
        } else {
            self.allocate_aligned(layout.size(), layout.align())
        };
        ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Refusals are logged by the heap itself.
        let result = if layout.align() <= HEAP_ALIGN {
            unsafe { self.free(ptr) }
        } else {
            unsafe { self.free_aligned(ptr) }
        };
        debug_assert!(result.is_ok(), "dealloc of {ptr:p} refused: {result:?}");
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            return match unsafe { self.reallocate(ptr, new_size) } {
                Ok(Some(p)) => p.as_ptr(),
                Ok(None) => ptr::null_mut(),
                Err(err) => {
                    debug_assert!(!err.is_misuse(), "realloc of {ptr:p} refused: {err}");
                    ptr::null_mut()
                }
            };
        }

        let Some(moved) = self.allocate_aligned(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        unsafe {
            ptr::copy_nonoverlapping(ptr, moved.as_ptr(), layout.size().min(new_size));
            let freed = self.free_aligned(ptr);
            debug_assert!(freed.is_ok(), "realloc of {ptr:p} refused: {freed:?}");
        }
        moved.as_ptr()
    }
}
