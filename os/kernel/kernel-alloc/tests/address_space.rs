mod common;

use common::{MIB, PAGE, boot};
use kernel_alloc::MemoryError;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{MapFlags, Mmu};

const USER_VA: u64 = 0x40_0000;
const KERNEL_VA: u64 = 0xffff_a000_0000_0000;

fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}

#[test]
fn eager_allocation_backs_every_page() {
    let m = boot();
    let baseline = m.used_bytes();
    let space = m.vmm.create_space().unwrap();

    m.vmm.allocate(&space, va(USER_VA), 4 * PAGE, MapFlags::USER_RW).unwrap();
    for i in 0..4 {
        let (pa, flags) = m.translate(space.address_space(), USER_VA + i * PAGE).unwrap();
        assert!(flags.contains(MapFlags::USER | MapFlags::WRITABLE));
        assert!(!flags.contains(MapFlags::COPY_ON_WRITE));
        assert_eq!(m.frames.references(pa), 1);
        assert!(m.bytes(pa).iter().all(|b| *b == 0));
    }
    assert_eq!(space.regions().len(), 1);

    m.vmm.free(&space, va(USER_VA), 4 * PAGE).unwrap();
    assert!(m.translate(space.address_space(), USER_VA).is_none());
    assert!(space.regions().is_empty());

    m.vmm.destroy_space(space);
    assert_eq!(m.used_bytes(), baseline);
}

#[test]
fn requests_are_validated() {
    let m = boot();
    let space = m.vmm.create_space().unwrap();
    let rw = MapFlags::USER_RW;

    assert_eq!(m.vmm.allocate(&space, va(USER_VA + 1), PAGE, rw), Err(MemoryError::InvalidArg));
    assert_eq!(m.vmm.allocate(&space, va(USER_VA), 100, rw), Err(MemoryError::InvalidArg));
    assert_eq!(m.vmm.allocate(&space, va(USER_VA), 0, rw), Err(MemoryError::InvalidArg));
    assert_eq!(m.vmm.allocate(&space, va(KERNEL_VA), PAGE, rw), Err(MemoryError::InvalidArg));

    m.vmm.allocate(&space, va(USER_VA), 4 * PAGE, rw).unwrap();
    assert_eq!(
        m.vmm.allocate(&space, va(USER_VA + 3 * PAGE), 2 * PAGE, rw),
        Err(MemoryError::AlreadyMapped)
    );

    assert_eq!(m.vmm.free(&space, va(USER_VA), 2 * PAGE), Err(MemoryError::InvalidArg));
    assert_eq!(m.vmm.free(&space, va(USER_VA + PAGE), 3 * PAGE), Err(MemoryError::NotMapped));
    assert!(m.translate(space.address_space(), USER_VA).is_some());
    m.vmm.destroy_space(space);
}

#[test]
fn allocate_on_reference_defers_frames() {
    let m = boot();
    let space = m.vmm.create_space().unwrap();
    let before = m.frames.stats().allocations;

    let flags = MapFlags::USER_RW | MapFlags::ALLOCATE_ON_REFERENCE;
    m.vmm.allocate(&space, va(USER_VA), 64 * PAGE, flags).unwrap();
    assert_eq!(m.frames.stats().allocations, before);
    assert!(m.translate(space.address_space(), USER_VA).is_none());

    let region = space.regions().find_containing(va(USER_VA + 10 * PAGE)).cloned().unwrap();
    assert_eq!(region.start, va(USER_VA));
    assert!(region.flags.contains(MapFlags::ALLOCATE_ON_REFERENCE));
    m.vmm.destroy_space(space);
}

#[test]
fn huge_pages_are_backed_by_aligned_runs() {
    let m = boot();
    let baseline = m.used_bytes();
    let space = m.vmm.create_space().unwrap();
    let huge = MapFlags::USER_RW | MapFlags::HUGE;
    let base = 0x4000_0000;

    m.vmm.allocate(&space, va(base), 2 * MIB, huge).unwrap();
    let (pa, flags) = m.translate(space.address_space(), base + 0x234).unwrap();
    assert!(flags.contains(MapFlags::HUGE));
    assert_eq!(pa.as_u64() % (2 * MIB), 0);
    assert_eq!(m.frames.references(pa), 1);
    assert_eq!(m.frames.references(pa + (2 * MIB - PAGE)), 1);

    assert_eq!(
        m.vmm.allocate(&space, va(base + 4 * MIB + PAGE), 2 * MIB, huge),
        Err(MemoryError::Unsupported)
    );
    assert_eq!(
        m.vmm.allocate(&space, va(base + 4 * MIB), 2 * MIB, huge | MapFlags::ALLOCATE_ON_REFERENCE),
        Err(MemoryError::Unsupported)
    );

    m.vmm.free(&space, va(base), 2 * MIB).unwrap();
    assert_eq!(m.frames.references(pa), 0);
    m.vmm.destroy_space(space);
    assert_eq!(m.used_bytes(), baseline);
}

#[test]
fn kernel_regions_live_in_the_shared_half() {
    let m = boot();
    m.vmm.allocate_kernel(va(KERNEL_VA), 2 * PAGE, MapFlags::KERNEL_RW).unwrap();
    let (pa, flags) = m.translate(m.vmm.kernel_space(), KERNEL_VA + PAGE).unwrap();
    assert!(!flags.contains(MapFlags::USER));
    assert_eq!(m.frames.references(pa), 1);

    // Every user space sees the kernel half.
    let space = m.vmm.create_space().unwrap();
    assert_eq!(m.translate(space.address_space(), KERNEL_VA + PAGE).map(|t| t.0), Some(pa));

    assert_eq!(
        m.vmm.allocate_kernel(va(KERNEL_VA + 4 * PAGE), PAGE, MapFlags::USER_RW),
        Err(MemoryError::InvalidArg)
    );
    assert_eq!(
        m.vmm.allocate_kernel(va(USER_VA), PAGE, MapFlags::KERNEL_RW),
        Err(MemoryError::InvalidArg)
    );

    let used = m.used_bytes();
    m.vmm.free_kernel(va(KERNEL_VA), 2 * PAGE).unwrap();
    assert_eq!(m.used_bytes(), used - 2 * PAGE);
    assert!(m.vmm.kernel_regions().is_empty());
    m.vmm.destroy_space(space);
}

#[test]
fn failed_allocation_leaves_nothing_behind() {
    let m = boot();
    let baseline = m.used_bytes();
    let space = m.vmm.create_space().unwrap();

    let mut hoard = Vec::new();
    while let Ok(pa) = m.frames.alloc_single() {
        hoard.push(pa);
    }
    for pa in hoard.drain(..2) {
        m.frames.dereference_single(pa).unwrap();
    }

    assert_eq!(
        m.vmm.allocate(&space, va(USER_VA), 4 * PAGE, MapFlags::USER_RW),
        Err(MemoryError::OutOfMemory)
    );
    assert!(space.regions().is_empty());
    assert!(m.translate(space.address_space(), USER_VA).is_none());

    for pa in hoard {
        m.frames.dereference_single(pa).unwrap();
    }
    m.vmm.allocate(&space, va(USER_VA), 4 * PAGE, MapFlags::USER_RW).unwrap();
    m.vmm.destroy_space(space);
    assert_eq!(m.used_bytes(), baseline);
}

#[test]
fn forked_regions_share_frames_copy_on_write() {
    let m = boot();
    let baseline = m.used_bytes();
    let parent = m.vmm.create_space().unwrap();
    let child = m.vmm.create_space().unwrap();

    m.vmm.allocate(&parent, va(USER_VA), 2 * PAGE, MapFlags::USER_RW).unwrap();
    let (pa, _) = m.translate(parent.address_space(), USER_VA).unwrap();
    m.bytes(pa)[..4].copy_from_slice(b"fork");

    m.vmm.fork_region(&parent, &child, va(USER_VA)).unwrap();
    for space in [&parent, &child] {
        let (shared, flags) = m.translate(space.address_space(), USER_VA).unwrap();
        assert_eq!(shared, pa);
        assert!(flags.contains(MapFlags::COPY_ON_WRITE));
        assert!(!flags.contains(MapFlags::WRITABLE));
    }
    assert_eq!(m.frames.references(pa), 2);
    assert!(child.regions().find_exact(va(USER_VA)).is_some());

    assert_eq!(m.vmm.fork_region(&parent, &child, va(USER_VA)), Err(MemoryError::AlreadyMapped));
    assert_eq!(m.vmm.fork_region(&parent, &child, va(USER_VA + PAGE)), Err(MemoryError::NotMapped));
    assert_eq!(m.vmm.fork_region(&parent, &parent, va(USER_VA)), Err(MemoryError::InvalidArg));

    m.vmm.destroy_space(parent);
    assert_eq!(m.frames.references(pa), 1);
    assert_eq!(&m.bytes(pa)[..4], b"fork");
    m.vmm.destroy_space(child);
    assert_eq!(m.used_bytes(), baseline);
}

#[test]
fn forking_skips_untouched_pages() {
    let m = boot();
    let parent = m.vmm.create_space().unwrap();
    let child = m.vmm.create_space().unwrap();
    let lazy = MapFlags::USER_RW | MapFlags::ALLOCATE_ON_REFERENCE;

    m.vmm.allocate(&parent, va(USER_VA), 8 * PAGE, lazy).unwrap();
    m.vmm.fork_region(&parent, &child, va(USER_VA)).unwrap();
    assert!(m.translate(child.address_space(), USER_VA).is_none());
    let region = child.regions().find_exact(va(USER_VA)).cloned().unwrap();
    assert_eq!(region.flags, lazy);

    m.vmm.destroy_space(child);
    m.vmm.destroy_space(parent);
}

#[test]
fn switching_loads_the_root() {
    let m = boot();
    let a = m.vmm.create_space().unwrap();
    let b = m.vmm.create_space().unwrap();

    unsafe { m.vmm.switch_to(None, &a) };
    assert_eq!(m.mmu.current_root(), a.address_space().root());
    assert!(a.address_space().is_active());

    m.mmu.set_cpu(1);
    unsafe { m.vmm.switch_to(None, &b) };
    m.mmu.set_cpu(0);
    unsafe { m.vmm.switch_to(Some(&a), &b) };
    assert!(!a.address_space().is_active());
    assert_eq!(b.address_space().active_cpus(), 0b11);

    m.vmm.destroy_space(a);
}
