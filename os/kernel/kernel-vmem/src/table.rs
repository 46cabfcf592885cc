//! # Page Table Nodes
//!
//! Every level of the x86-64 walk (PML4, PDPT, PD, PT) is the same 4 KiB
//! array of 512 [`PageEntryBits`]; the level is a property of the walk, not
//! of the node.

use crate::PageEntryBits;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// A 4 KiB-aligned table of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES],
}

impl PageTable {
    /// Clear all entries.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntryBits {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntryBits) {
        self.entries[i] = e;
    }

    #[inline]
    pub const fn entry_mut(&mut self, i: usize) -> &mut PageEntryBits {
        &mut self.entries[i]
    }

    /// Whether no entry is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageEntryBits::is_unused)
    }
}

/// Walk level of a table node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Pt = 1,
    Pd = 2,
    Pdpt = 3,
    Pml4 = 4,
}

impl Level {
    /// Index into a table of this level for `va`.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        let shift = 12 + 9 * (self as u64 - 1);
        ((va.as_u64() >> shift) & 0x1FF) as usize
    }

    /// Next level down the walk; the PT is the bottom.
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Self {
        match self {
            Self::Pml4 => Self::Pdpt,
            Self::Pdpt => Self::Pd,
            Self::Pd | Self::Pt => Self::Pt,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pt => "PT",
            Self::Pd => "PD",
            Self::Pdpt => "PDPT",
            Self::Pml4 => "PML4",
        }
    }
}

/// Levels in walk order, root first.
pub const WALK: [Level; 4] = [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt];

/// `(pml4, pdpt, pd, pt)` indices of `va`.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (usize, usize, usize, usize) {
    (
        Level::Pml4.index_of(va),
        Level::Pdpt.index_of(va),
        Level::Pd.index_of(va),
        Level::Pt.index_of(va),
    )
}
