//! # Boot-time Singletons
//!
//! The frame allocator, the virtual memory manager and the kernel heap exist
//! once per system. [`init`] builds them in dependency order from the boot
//! memory snapshot; afterwards they are reachable through the accessors
//! below and never torn down.

use crate::frame_alloc::{BootFrameAllocator, FrameAllocator};
use crate::heap::KernelHeap;
use crate::phys_mapper::HhdmPhysMapper;
use crate::vmm::{Vmm, VmmHeapBackend};
use crate::MemoryError;
use core::ptr::NonNull;
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{KERNEL_HEAP_SIZE, KERNEL_HEAP_START};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SyncOnceCell;
use kernel_vmem::Mmu;
use kernel_vmem::arch::X86Mmu;
use log::{info, warn};

pub type KernelVmm = Vmm<'static, HhdmPhysMapper, X86Mmu>;
pub type KernelHeapBackend = VmmHeapBackend<'static, 'static, HhdmPhysMapper, X86Mmu>;

static PHYS: HhdmPhysMapper = HhdmPhysMapper;
static MMU: SyncOnceCell<X86Mmu> = SyncOnceCell::new();
static FRAMES: SyncOnceCell<FrameAllocator<'static>> = SyncOnceCell::new();
static VMM: SyncOnceCell<KernelVmm> = SyncOnceCell::new();
static HEAP: SyncOnceCell<KernelHeap<KernelHeapBackend>> = SyncOnceCell::new();

/// Bring up the memory core on the bootstrap processor.
///
/// The currently loaded page tables become the kernel address space, and
/// the heap window `KERNEL_HEAP_START..KERNEL_HEAP_END` is handed to the
/// kernel heap.
///
/// # Errors
/// [`MemoryError::InvalidArg`] when called twice or for an unusable memory
/// map, [`MemoryError::OutOfMemory`] if the core's own metadata does not fit.
#[allow(clippy::cast_possible_truncation)]
pub fn init(info: &BootMemoryInfo<'_>, current_cpu: fn() -> u32) -> Result<(), MemoryError> {
    if FRAMES.get().is_some() {
        warn!("Memory core already initialized");
        return Err(MemoryError::InvalidArg);
    }
    let mmu = MMU.get_or_init(|| X86Mmu::new(current_cpu));

    let frames = FrameAllocator::new(info, BootFrameAllocator::new(*info), &PHYS)?;
    let frames = FRAMES.set(frames).map_err(|_| MemoryError::InvalidArg)?;

    let vmm = Vmm::adopt(&PHYS, frames, mmu, mmu.current_root())?;
    let vmm = VMM.set(vmm).map_err(|_| MemoryError::InvalidArg)?;

    let window = VirtualAddress::new(KERNEL_HEAP_START);
    let backend = VmmHeapBackend::new(vmm, window);
    // SAFETY: the heap window is reserved in the kernel layout and only ever
    // mapped by this backend.
    let heap = unsafe {
        KernelHeap::new(
            NonNull::new_unchecked(KERNEL_HEAP_START as usize as *mut u8),
            KERNEL_HEAP_SIZE as usize,
            backend,
        )
    };
    HEAP.set(heap).map_err(|_| MemoryError::InvalidArg)?;

    let stats = frames.stats();
    info!(
        "Memory core up: {} MiB free of {} MiB, heap at {}",
        stats.free_bytes >> 20,
        stats.total_bytes >> 20,
        window
    );
    Ok(())
}

#[inline]
pub fn mmu() -> Option<&'static X86Mmu> {
    MMU.get()
}

#[inline]
pub fn frames() -> Option<&'static FrameAllocator<'static>> {
    FRAMES.get()
}

#[inline]
pub fn vmm() -> Option<&'static KernelVmm> {
    VMM.get()
}

#[inline]
pub fn heap() -> Option<&'static KernelHeap<KernelHeapBackend>> {
    HEAP.get()
}
