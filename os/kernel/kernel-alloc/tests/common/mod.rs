#![allow(dead_code)]

use kernel_alloc::frame_alloc::PhysicalMemoryManager;
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, Mmu, PhysMapper, RootPage};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::Once;

pub const MIB: u64 = 1024 * 1024;

#[repr(C, align(4096))]
pub struct Frame([u8; 4096]);

/// Simulated RAM: physical address `n * 4096` is `frames[n]`.
pub struct TestPhys {
    frames: Vec<UnsafeCell<Frame>>,
    reach: Cell<u64>,
}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(Frame([0; 4096]))).collect(),
            reach: Cell::new(n as u64 * 4096),
        }
    }

    /// From now on only frames below `bytes` may hold page tables.
    pub fn reach_below(&self, bytes: u64) {
        self.reach.set(bytes);
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
        assert_eq!(pa.as_u64() & 0xFFF, 0, "tables are frame aligned");
        unsafe { &mut *self.frames[idx].get().cast::<T>() }
    }

    fn reaches(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() < self.reach.get()
    }
}

/// Records what the VMM asks of the MMU. The VMM gets a reference so the
/// test can keep looking.
#[derive(Default)]
pub struct FakeMmu {
    active: Cell<Option<RootPage>>,
    pub invalidated: RefCell<Vec<VirtualAddress>>,
    pub flushes: Cell<usize>,
}

impl Mmu for &FakeMmu {
    fn active_root(&self) -> RootPage {
        self.active
            .get()
            .unwrap_or_else(|| PhysicalPage::containing(PhysicalAddress::zero()))
    }

    unsafe fn activate(&self, root: RootPage) {
        self.active.set(Some(root));
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidated.borrow_mut().push(va);
    }

    fn flush_all(&self) {
        self.flushes.set(self.flushes.get() + 1);
    }
}

/// Frames from a PMM until the shared budget runs out.
pub struct Budgeted<'a> {
    pub pmm: &'a PhysicalMemoryManager,
    pub left: &'a Cell<usize>,
}

impl FrameAlloc for Budgeted<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let left = self.left.get();
        if left == 0 {
            return None;
        }
        self.left.set(left - 1);
        self.pmm.alloc_4k()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.pmm.free_4k(page);
    }
}

/// A PMM owning `[1 MiB, 2 MiB)`: 256 free frames, all inside a
/// [`TestPhys`] of 512 frames.
pub fn small_pmm() -> PhysicalMemoryManager {
    let pmm = PhysicalMemoryManager::new();
    pmm.init(Some(&[MemoryRegion::usable(MIB, MIB)]));
    pmm
}

/// Host memory for a heap arena, page aligned.
pub struct Arena {
    pages: Vec<Frame>,
}

impl Arena {
    pub fn with_pages(n: usize) -> Self {
        Self {
            pages: (0..n).map(|_| Frame([0; 4096])).collect(),
        }
    }

    pub fn start(&mut self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.pages.as_mut_ptr())
    }

    pub fn len(&self) -> usize {
        self.pages.len() * 4096
    }
}

thread_local! {
    static CAPTURED: RefCell<Vec<(log::Level, String)>> = const { RefCell::new(Vec::new()) };
}

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        CAPTURED.with(|c| c.borrow_mut().push((record.level(), record.args().to_string())));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INSTALL: Once = Once::new();

/// Start capturing log records of the calling thread.
pub fn capture_logs() {
    INSTALL.call_once(|| {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(log::LevelFilter::Trace);
    });
    CAPTURED.with(|c| c.borrow_mut().clear());
}

/// Messages logged on this thread at `level` since [`capture_logs`].
pub fn logged(level: log::Level) -> Vec<String> {
    CAPTURED.with(|c| {
        c.borrow()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    })
}
