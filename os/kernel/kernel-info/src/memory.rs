//! # Memory Layout

/// First address past the lower (user) canonical half.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Start of the upper (kernel) canonical half.
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// First PML4 slot belonging to the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Number of PML4 slots in a table.
pub const PML4_ENTRIES: usize = 512;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Virtual window reserved for the kernel heap.
pub const KERNEL_HEAP_START: u64 = 0xffff_c000_0000_0000;

/// Size of the kernel heap window (1 GiB of address space, backed on demand).
pub const KERNEL_HEAP_SIZE: u64 = 0x4000_0000;

pub const KERNEL_HEAP_END: u64 = KERNEL_HEAP_START + KERNEL_HEAP_SIZE;

/// Base of the temporary-mapping slots used to reach arbitrary frames.
pub const TEMP_MAP_BASE: u64 = 0xffff_fe00_0000_0000;

/// Number of temporary-mapping slots (copy-on-write needs source and target).
pub const TEMP_MAP_SLOTS: usize = 2;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

const _: () = {
    assert!(HHDM_BASE >= KERNEL_SPACE_START);
    assert!(KERNEL_HEAP_START > HHDM_BASE);
    assert!(KERNEL_HEAP_END <= TEMP_MAP_BASE);
    assert!(TEMP_MAP_BASE < KERNEL_BASE);
    assert!(KERNEL_HEAP_START.is_multiple_of(4096));
    assert!(TEMP_MAP_BASE.is_multiple_of(0x20_0000));
};
