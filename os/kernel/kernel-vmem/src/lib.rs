//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the memory core.
//!
//! ## What you get
//! - An [`AddressSpace`] owning one PML4 root behind its own lock.
//! - A [`Mapper`] that maps, unmaps, queries and remaps leaves, creates and
//!   frees address spaces, switches between them and hands out RAII
//!   [`TemporaryMapping`]s of arbitrary frames.
//! - Architecture-neutral [`MapFlags`] and their hardware encoding
//!   [`PageEntryBits`].
//! - The seams to the rest of the kernel: [`FrameAlloc`] (frames for table
//!   levels), [`PhysMapper`] (reaching a frame's bytes) and [`Mmu`] (the
//!   current CPU, CR3 and TLB maintenance).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! PML4 slots 256..512 (the upper canonical half) belong to the kernel. They
//! are populated once, when the [`Mapper`] is created, and copied into every
//! new address space so kernel mappings are shared by all of them.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

mod address_space;
pub mod arch;
mod entry;
mod error;
mod flags;
mod mapper;
pub mod table;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::address_space::{AddressSpace, Tables, cpu_bit};
pub use crate::entry::PageEntryBits;
pub use crate::error::MapError;
pub use crate::flags::MapFlags;
pub use crate::mapper::{Mapper, TemporaryMapping, Walk};
pub use crate::table::PageTable;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Source of **physical** 4 KiB frames for page-table levels and the sink
/// they return to.
///
/// Returned frames **must** be 4 KiB aligned. The frame allocator hands out
/// frames with a reference count of one; `free_4k` drops one reference.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame; `None` on out-of-memory.
    fn alloc_4k(&self) -> Option<PhysicalAddress>;

    /// Drop one reference to the frame at `pa`.
    fn free_4k(&self, pa: PhysicalAddress);

    /// Drop one reference to each of `count` physically contiguous frames.
    fn free_contiguous(&self, pa: PhysicalAddress, count: usize) {
        for i in 0..count as u64 {
            self.free_4k(pa + i * 4096);
        }
    }
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g., via a higher-half direct map, HHDM).
pub trait PhysMapper {
    /// Convert a *physical* address to a mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable for the lifetime `'a`.
    /// - `T` must match the bytes at `pa`, and the caller must rule out
    ///   aliasing `&mut` to the same frame.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Pointer through which the bytes mapped at `va` are reached, once `va`
    /// has been mapped to `pa` in the kernel address space.
    ///
    /// On hardware this is simply `va`.
    fn mapped_ptr(&self, va: VirtualAddress, _pa: PhysicalAddress) -> *mut u8 {
        va.as_u64() as usize as *mut u8
    }
}

/// Processor-side services the mapper needs from the scheduler/arch layer.
pub trait Mmu {
    /// Index of the CPU this code currently runs on.
    fn current_cpu(&self) -> u32;

    /// Root table currently loaded on this CPU.
    fn current_root(&self) -> PhysicalAddress;

    /// Load `root` as the active page-table root of this CPU.
    ///
    /// # Safety
    /// The new tables must map the executing code, stack and data.
    unsafe fn load_root(&self, root: PhysicalAddress);

    /// Invalidate the translation of `va` on this CPU.
    fn flush_local(&self, va: VirtualAddress);

    /// Invalidate the translation of `va` on every CPU in `cpus` and return
    /// once all of them have done so. The current CPU is never in the mask.
    fn shootdown(&self, cpus: u64, va: VirtualAddress);
}
