//! # Boot Memory Information
//!
//! Immutable snapshot handed to the memory core exactly once, at
//! initialization. The raw firmware memory map is translated into
//! [`MemoryMapEntry`] records by the boot code; the core never looks at the
//! firmware structures afterwards.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Classification of one span of the boot memory map.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Conventional RAM the frame allocator may hand out.
    Free = 0,
    /// RAM occupied at hand-off (boot loader data, initial page tables, ...).
    Used = 1,
    /// Firmware, MMIO and everything else that is never handed out.
    Reserved = 2,
}

/// A single `{base, length, kind}` entry of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: PhysicalAddress,
    /// Length of the span in **bytes**.
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// First physical address past the span.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64().saturating_add(self.length))
    }

    #[inline]
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind == MemoryKind::Free
    }
}

/// Information the memory core needs from the boot/arch layer.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryInfo<'a> {
    /// Memory map, ordered by ascending base address.
    pub entries: &'a [MemoryMapEntry],

    /// Physical extent of the loaded kernel image.
    pub kernel_phys_start: PhysicalAddress,
    pub kernel_phys_end: PhysicalAddress,

    /// Virtual extent of the kernel image (linked at [`KERNEL_BASE`](crate::memory::KERNEL_BASE)).
    pub kernel_virt_start: VirtualAddress,
    pub kernel_virt_end: VirtualAddress,

    /// Highest physical address the machine reports (exclusive).
    pub max_phys: PhysicalAddress,
}

impl BootMemoryInfo<'_> {
    /// Iterator over the usable (free) entries of the map.
    pub fn free_entries(&self) -> impl Iterator<Item = &MemoryMapEntry> + '_ {
        self.entries.iter().filter(|e| e.is_free())
    }

    /// Total number of bytes reported as free by the map.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_entries().map(|e| e.length).sum()
    }
}
