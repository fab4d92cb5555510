//! # Memory Layout

/// Size of a page frame and of the smallest mapping.
pub const PAGE_SIZE: u64 = 4096;

/// Highest physical memory the frame bitmap can describe.
pub const MAX_PHYSICAL_MEMORY: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Number of frames (bits) in the frame bitmap.
#[allow(clippy::cast_possible_truncation)]
pub const MAX_PHYSICAL_FRAMES: usize = (MAX_PHYSICAL_MEMORY / PAGE_SIZE) as usize;

/// Physical memory below this address is never handed out, whatever the
/// memory map says (real-mode IVT, BDA, EBDA, VGA, option ROMs).
pub const LOW_MEMORY_RESERVED: u64 = 0x0010_0000; // 1 MiB

/// First byte of the window released when the bootloader supplies no map.
pub const FALLBACK_USABLE_START: u64 = LOW_MEMORY_RESERVED;

/// End (exclusive) of the window released when the bootloader supplies no map.
pub const FALLBACK_USABLE_END: u64 = 0x0100_0000; // 16 MiB

/// Bytes identity mapped into the kernel address space at boot.
pub const IDENTITY_MAP_BYTES: u64 = 0x0100_0000; // 16 MiB

/// Number of entries in every page-table node.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// First PML4 slot of the kernel half. Slots from here on are shared by
/// every address space.
pub const KERNEL_HALF_FIRST_INDEX: usize = 256;

/// Virtual base of the kernel heap arena.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Bytes mapped for the heap at boot.
pub const KERNEL_HEAP_INITIAL_SIZE: usize = 1024 * 1024;

/// Minimum growth step of the heap arena.
pub const KERNEL_HEAP_GROWTH: usize = 64 * 1024;

/// Hard ceiling of the heap arena.
pub const KERNEL_HEAP_MAX_SIZE: usize = 64 * 1024 * 1024;

#[allow(clippy::cast_possible_truncation)]
const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(MAX_PHYSICAL_FRAMES.is_multiple_of(64));
    assert!(LOW_MEMORY_RESERVED.is_multiple_of(PAGE_SIZE));
    assert!(FALLBACK_USABLE_START < FALLBACK_USABLE_END);
    assert!(FALLBACK_USABLE_END <= MAX_PHYSICAL_MEMORY);
    assert!(IDENTITY_MAP_BYTES.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HALF_FIRST_INDEX == PAGE_TABLE_ENTRIES / 2);
    assert!(KERNEL_HEAP_BASE >= 0xFFFF_8000_0000_0000);
    assert!(KERNEL_HEAP_INITIAL_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(KERNEL_HEAP_GROWTH.is_multiple_of(PAGE_SIZE as usize));
    assert!(KERNEL_HEAP_INITIAL_SIZE <= KERNEL_HEAP_MAX_SIZE);
};
