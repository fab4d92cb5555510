mod common;

use common::{Budgeted, FakeMmu, MIB, TestPhys, capture_logs, logged, small_pmm};
use kernel_alloc::vmm::{MapOutcome, Vmm, VmmError};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{FrameAlloc, MapError, PageEntryBits, TableLevel};
use std::cell::Cell;

type TestVmm<'a, A> = Vmm<'a, TestPhys, &'a FakeMmu, A>;

/// First address of PML4 slot 1: nothing of the kernel lives there.
const USER_BASE: u64 = 0x0000_0080_0000_0000;

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

fn pa(p: u64) -> PhysicalAddress {
    PhysicalAddress::new(p)
}

fn boot<'a, A: FrameAlloc>(phys: &'a TestPhys, mmu: &'a FakeMmu, alloc: A) -> TestVmm<'a, A> {
    unsafe { Vmm::init(phys, mmu, alloc) }.unwrap()
}

#[test]
fn init_identity_maps_all_but_page_zero() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let free_before = pmm.free_frames();
    let vmm = boot(&phys, &mmu, &pmm);

    assert_eq!(vmm.current_address_space(), vmm.kernel_address_space());
    assert_eq!(free_before - pmm.free_frames(), 11, "PML4, PDPT, PD and eight PTs");

    assert_eq!(vmm.get_physical(va(0)), None);
    assert_eq!(vmm.get_physical(va(0x1000)), Some(pa(0x1000)));
    assert_eq!(vmm.get_physical(va(16 * MIB - 1)), Some(pa(16 * MIB - 1)));
    assert_eq!(vmm.get_physical(va(16 * MIB)), None);
}

#[test]
fn map_translate_unmap_round_trip() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let (v, p) = (0x4000_0000, 0x5000_0000);

    let outcome = vmm.map_page(va(v), pa(p), PageEntryBits::kernel_rw()).unwrap();
    assert_eq!(outcome, MapOutcome::Created);
    assert_eq!(vmm.get_physical(va(v)), Some(pa(p)));
    assert!(mmu.invalidated.borrow().contains(&va(v)));

    assert_eq!(vmm.unmap_page(va(v)), Some(pa(p)));
    assert_eq!(vmm.get_physical(va(v)), None);
    assert_eq!(vmm.unmap_page(va(v)), None, "second unmap finds nothing");
}

#[test]
fn translation_preserves_the_page_offset() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    vmm.map_page(va(0x7000_3000), pa(0x9_0000), PageEntryBits::kernel_rw_nx())
        .unwrap();

    for k in (0..4096).step_by(97).chain([4095]) {
        assert_eq!(vmm.get_physical(va(0x7000_3000 + k)), Some(pa(0x9_0000 + k)));
    }
    assert_eq!(vmm.unmap_page(va(0x7000_3ABC)), Some(pa(0x9_0000)));
}

#[test]
fn remapping_warns_only_when_the_frame_changes() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let flags = PageEntryBits::kernel_rw();
    capture_logs();

    vmm.map_page(va(0x4000_0000), pa(0x20_0000), flags).unwrap();
    let same = vmm.map_page(va(0x4000_0000), pa(0x20_0000), flags).unwrap();
    assert_eq!(same, MapOutcome::Unchanged);
    assert!(logged(log::Level::Warn).is_empty());

    let moved = vmm.map_page(va(0x4000_0000), pa(0x30_0000), flags).unwrap();
    assert_eq!(moved, MapOutcome::Remapped { previous: pa(0x20_0000) });
    assert_eq!(logged(log::Level::Warn).len(), 1);
    assert_eq!(vmm.get_physical(va(0x4000_0000)), Some(pa(0x30_0000)));
}

#[test]
fn unaligned_addresses_are_refused() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let flags = PageEntryBits::kernel_rw();

    assert_eq!(
        vmm.map_page(va(0x4000_0010), pa(0x20_0000), flags),
        Err(VmmError::UnalignedVirtual(va(0x4000_0010)))
    );
    assert_eq!(
        vmm.map_page(va(0x4000_0000), pa(0x20_0001), flags),
        Err(VmmError::UnalignedPhysical(pa(0x20_0001)))
    );
    assert_eq!(vmm.get_physical(va(0x4000_0000)), None);
}

#[test]
fn failed_range_mapping_is_rolled_back() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let budget = Cell::new(usize::MAX);
    let vmm = boot(&phys, &mmu, Budgeted { pmm: &pmm, left: &budget });

    // Pages 0 and 1 share a fresh PD and PT; page 2 starts the next PT.
    let v = 0x4000_0000 + 0x1FE000;
    budget.set(2);

    let err = vmm
        .map_pages(va(v), pa(0x40_0000), 4, PageEntryBits::kernel_rw())
        .unwrap_err();
    assert_eq!(err, VmmError::Map(MapError::OutOfMemory(TableLevel::Pt)));
    for i in 0..4 {
        assert_eq!(vmm.get_physical(va(v + i * 0x1000)), None, "page {i}");
    }

    budget.set(usize::MAX);
    vmm.map_pages(va(v), pa(0x40_0000), 4, PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.get_physical(va(v + 0x3000)), Some(pa(0x40_3000)));
}

#[test]
fn unmapping_a_range_counts_what_was_mapped() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);

    vmm.map_pages(va(0x4000_0000), pa(0x20_0000), 3, PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.unmap_pages(va(0x4000_0000), 5), 3);
    assert_eq!(vmm.get_physical(va(0x4000_2000)), None);
}

#[test]
fn address_spaces_are_isolated_below_the_kernel_half() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);

    let a = vmm.create_address_space().unwrap();
    unsafe { vmm.switch_address_space(a) };
    vmm.map_page(va(USER_BASE), pa(0x20_0000), PageEntryBits::user_rw_nx())
        .unwrap();
    assert_eq!(vmm.get_physical(va(USER_BASE)), Some(pa(0x20_0000)));

    let b = vmm.create_address_space().unwrap();
    unsafe { vmm.switch_address_space(b) };
    assert_eq!(vmm.current_address_space(), b);
    assert_eq!(vmm.get_physical(va(USER_BASE)), None);
    assert_eq!(vmm.get_physical_in(a, va(USER_BASE)), Some(pa(0x20_0000)));

    assert_eq!(vmm.get_physical(va(0x1000)), Some(pa(0x1000)), "identity map is shared");
}

#[test]
fn user_mappings_in_the_identity_slot_stay_private() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let kernel = vmm.kernel_address_space();
    let free_before = pmm.free_frames();

    let a = vmm.create_address_space().unwrap();
    unsafe { vmm.switch_address_space(a) };
    vmm.map_page(va(0x4000_0000), pa(0x20_0000), PageEntryBits::user_rw_nx())
        .unwrap();
    let outcome = vmm
        .map_page(va(0x40_0000), pa(0x30_0000), PageEntryBits::user_rw_nx())
        .unwrap();
    assert_eq!(outcome, MapOutcome::Remapped { previous: pa(0x40_0000) });

    let b = vmm.create_address_space().unwrap();
    unsafe { vmm.switch_address_space(b) };
    assert_eq!(vmm.get_physical(va(0x4000_0000)), None);
    assert_eq!(vmm.get_physical(va(0x40_0000)), Some(pa(0x40_0000)));
    assert_eq!(vmm.get_physical_in(kernel, va(0x4000_0000)), None);
    assert_eq!(vmm.get_physical_in(kernel, va(0x40_0000)), Some(pa(0x40_0000)));
    assert_eq!(vmm.get_physical_in(a, va(0x40_0000)), Some(pa(0x30_0000)));
    assert_eq!(vmm.get_physical_in(a, va(0x40_1000)), Some(pa(0x40_1000)));

    unsafe { vmm.switch_address_space(kernel) };
    // Root, the copied PDPT, PD and PT, plus PD and PT for 0x4000_0000.
    assert_eq!(vmm.destroy_address_space(a), Ok(6));
    assert_eq!(vmm.destroy_address_space(b), Ok(1));
    assert_eq!(pmm.free_frames(), free_before);
    assert_eq!(vmm.get_physical(va(0x40_0000)), Some(pa(0x40_0000)));
}

#[test]
fn kernel_half_mappings_always_land_in_the_kernel_tree() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let kernel = vmm.kernel_address_space();
    let free_before = pmm.free_frames();
    let high = 0xFFFF_A000_0000_0000;

    let space = vmm.create_address_space().unwrap();
    unsafe { vmm.switch_address_space(space) };
    vmm.map_page(va(high), pa(0x20_0000), PageEntryBits::kernel_rw_nx())
        .unwrap();
    assert_eq!(vmm.get_physical_in(kernel, va(high)), Some(pa(0x20_0000)));
    assert!(mmu.invalidated.borrow().contains(&va(high)));

    unsafe { vmm.switch_address_space(kernel) };
    assert_eq!(vmm.destroy_address_space(space), Ok(1));
    assert_eq!(free_before - pmm.free_frames(), 3, "PDPT, PD and PT belong to the kernel");
    assert_eq!(vmm.get_physical(va(high)), Some(pa(0x20_0000)));

    let other = vmm.create_address_space().unwrap();
    assert_eq!(vmm.unmap_page_in(other, va(high)), Some(pa(0x20_0000)));
    assert_eq!(vmm.get_physical(va(high)), None);
}

#[test]
fn tables_outside_the_reachable_window_are_refused() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let free_before = pmm.free_frames();
    capture_logs();

    phys.reach_below(MIB);
    assert_eq!(
        vmm.map_page(va(0x4000_0000), pa(0x20_0000), PageEntryBits::kernel_rw()),
        Err(VmmError::Map(MapError::OutOfMemory(TableLevel::Pd)))
    );
    assert_eq!(pmm.free_frames(), free_before, "the refused frame went back");
    assert!(!logged(log::Level::Warn).is_empty());

    phys.reach_below(2 * MIB);
    vmm.map_page(va(0x4000_0000), pa(0x20_0000), PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.get_physical(va(0x4000_0000)), Some(pa(0x20_0000)));
}

#[test]
fn later_kernel_half_mappings_reach_existing_spaces() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let kernel_half = 0xFFFF_8000_0000_0000;

    vmm.map_page(va(kernel_half), pa(0x20_0000), PageEntryBits::kernel_rw())
        .unwrap();
    let space = vmm.create_address_space().unwrap();
    vmm.map_page(va(kernel_half + 0x1000), pa(0x21_0000), PageEntryBits::kernel_rw())
        .unwrap();

    unsafe { vmm.switch_address_space(space) };
    assert_eq!(vmm.get_physical(va(kernel_half + 0x1000)), Some(pa(0x21_0000)));
}

#[test]
fn destroy_refuses_kernel_and_active_spaces() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    capture_logs();

    let kernel = vmm.kernel_address_space();
    assert_eq!(vmm.destroy_address_space(kernel), Err(VmmError::KernelSpace));

    let space = vmm.create_address_space().unwrap();
    unsafe { vmm.switch_address_space(space) };
    assert_eq!(vmm.destroy_address_space(space), Err(VmmError::ActiveSpace));
    assert_eq!(logged(log::Level::Error).len(), 2);
}

#[test]
fn destroy_returns_every_table_frame() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let free_before = pmm.free_frames();

    let space = vmm.create_address_space().unwrap();
    vmm.map_page_in(space, va(USER_BASE), pa(0x20_0000), PageEntryBits::user_rw_nx())
        .unwrap();
    assert_eq!(free_before - pmm.free_frames(), 4);

    assert_eq!(vmm.destroy_address_space(space), Ok(4));
    assert_eq!(pmm.free_frames(), free_before);
    assert_eq!(vmm.get_physical(va(0x1000)), Some(pa(0x1000)), "kernel tables survive");
}

#[test]
fn the_tlb_is_only_touched_for_the_active_space() {
    let (phys, mmu, pmm) = (TestPhys::with_frames(512), FakeMmu::default(), small_pmm());
    let vmm = boot(&phys, &mmu, &pmm);
    let space = vmm.create_address_space().unwrap();

    vmm.map_page_in(space, va(USER_BASE), pa(0x20_0000), PageEntryBits::user_rw_nx())
        .unwrap();
    assert!(mmu.invalidated.borrow().is_empty());

    vmm.invalidate_page(va(USER_BASE));
    vmm.flush_tlb();
    assert_eq!(mmu.invalidated.borrow().as_slice(), &[va(USER_BASE)]);
    assert_eq!(mmu.flushes.get(), 1);
}

#[test]
fn running_out_of_frames_fails_cleanly() {
    let (phys, mmu) = (TestPhys::with_frames(512), FakeMmu::default());
    let pmm = small_pmm();
    let vmm = boot(&phys, &mmu, &pmm);

    while pmm.allocate_pages(1).is_some() {}
    assert!(matches!(
        vmm.create_address_space(),
        Err(VmmError::Map(MapError::OutOfMemory(TableLevel::Pml4)))
    ));
    assert_eq!(pmm.stats().free_frames, 0);
}

