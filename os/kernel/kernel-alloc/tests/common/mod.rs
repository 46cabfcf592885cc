#![allow(dead_code)]

use kernel_alloc::frame_alloc::{BootFrameAllocator, FrameAllocator};
use kernel_alloc::vmm::fault::{PageFault, PageFaultError, TrapFrame};
use kernel_alloc::vmm::Vmm;
use kernel_info::boot::{BootMemoryInfo, MemoryKind, MemoryMapEntry};
use kernel_info::memory::KERNEL_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::testing::{TestMmu, TestPhys};
use kernel_vmem::{AddressSpace, MapError, MapFlags};

pub const PAGE: u64 = 4096;
pub const MIB: u64 = 1024 * 1024;

/// Simulated RAM: `[0, 1 MiB)` firmware, kernel image at `[1 MiB, 2 MiB)`.
pub const RAM: u64 = 16 * MIB;

/// A booted memory core on simulated hardware. Components are leaked so the
/// manager can borrow them for `'static`.
pub struct Machine {
    pub phys: &'static TestPhys,
    pub mmu: &'static TestMmu,
    pub frames: &'static FrameAllocator<'static>,
    pub vmm: Vmm<'static, TestPhys, TestMmu>,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn boot() -> Machine {
    init_logging();
    let entries: &'static [MemoryMapEntry] = Box::leak(Box::new([
        MemoryMapEntry::new(0, MIB, MemoryKind::Reserved),
        MemoryMapEntry::new(MIB, RAM - MIB, MemoryKind::Free),
    ]));
    let info = BootMemoryInfo {
        entries,
        kernel_phys_start: PhysicalAddress::new(MIB),
        kernel_phys_end: PhysicalAddress::new(2 * MIB),
        kernel_virt_start: VirtualAddress::new(KERNEL_BASE),
        kernel_virt_end: VirtualAddress::new(KERNEL_BASE + MIB),
        max_phys: PhysicalAddress::new(RAM),
    };

    let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::with_frames((RAM / PAGE) as usize)));
    let mmu: &'static TestMmu = Box::leak(Box::new(TestMmu::new()));
    let frames: &'static FrameAllocator<'static> = Box::leak(Box::new(
        FrameAllocator::new(&info, BootFrameAllocator::new(info), phys).expect("frame allocator"),
    ));
    let vmm = Vmm::new(phys, frames, mmu).expect("kernel address space");

    // Build the page tables behind both temporary slots up front so they do
    // not show up in the accounting of individual tests.
    let a = frames.alloc_single().expect("frame");
    let b = frames.alloc_single().expect("frame");
    vmm.mapper().copy_frame(a, b).expect("temporary slots");
    frames.dereference_single(a).expect("release");
    frames.dereference_single(b).expect("release");

    Machine {
        phys,
        mmu,
        frames,
        vmm,
    }
}

impl Machine {
    pub fn used_bytes(&self) -> u64 {
        self.frames.stats().used_bytes
    }

    /// The page-aligned frame and flags behind `va`, if a present leaf
    /// exists.
    pub fn translate(&self, space: &AddressSpace, va: u64) -> Option<(PhysicalAddress, MapFlags)> {
        match self.vmm.mapper().query(space, VirtualAddress::new(va)) {
            Ok((pa, flags)) if flags.contains(MapFlags::PRESENT) => {
                Some((PhysicalAddress::new(pa.as_u64() & !(PAGE - 1)), flags))
            }
            Ok(_) | Err(MapError::NotMapped) => None,
            Err(e) => panic!("query of {va:#x} failed: {e}"),
        }
    }

    pub fn bytes(&self, pa: PhysicalAddress) -> &mut [u8] {
        self.phys.frame(pa)
    }
}

/// A fault as the CPU would report it.
pub fn fault(va: u64, present: bool, write: bool, user: bool) -> PageFault {
    let error = PageFaultError::new()
        .with_present(present)
        .with_write(write)
        .with_user(user);
    PageFault::new(VirtualAddress::new(va), error)
}

pub fn regs() -> TrapFrame {
    TrapFrame {
        rip: 0x40_1000,
        rsp: 0x7fff_f000,
        ..TrapFrame::default()
    }
}
