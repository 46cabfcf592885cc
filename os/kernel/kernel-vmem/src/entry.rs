//! # Page-Table Entry Encoding

use crate::MapFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// This models the common superset of PML4E, PDPTE, PDE and PTE. Two of the
/// three OS-available low bits carry the demand-paging state of a leaf:
///
/// | Bits  | Name                    | Meaning |
/// |-------|-------------------------|---------|
/// | 0     | `P`                     | Valid entry if set |
/// | 1     | `RW`                    | Writable if set |
/// | 2     | `US`                    | User-mode accessible if set |
/// | 3     | `PWT`                   | Write-through caching |
/// | 4     | `PCD`                   | Disable caching |
/// | 5     | `A`                     | Accessed |
/// | 6     | `D`                     | Dirty (leaf only) |
/// | 7     | `PS`                    | Large page (PDE/PDPTE) |
/// | 8     | `G`                     | Global (leaf only) |
/// | 9     | allocate-on-reference   | Non-present placeholder, back on first touch |
/// | 10    | copy-on-write           | Read-only share, fork on first write |
/// | 11    | OS spare                | Unused |
/// | 12–51 | `addr`                  | Physical frame bits [51:12] |
/// | 63    | `NX`                    | Execute disable |
///
/// An allocate-on-reference placeholder has `P = 0` but keeps its `RW`, `US`
/// and `NX` bits, so the permissions the page will be backed with are
/// recorded in the entry itself.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a leaf.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// In a PDE this marks a 2 MiB leaf, in a PDPTE a 1 GiB leaf. Must be
    /// clear in PML4Es; in a PTE the bit is PAT and we keep it clear.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// Allocate-on-reference (OS bit 9).
    pub allocate_on_reference: bool,

    /// Copy-on-write (OS bit 10).
    pub copy_on_write: bool,

    /// OS-available (bit 11).
    pub os_spare: bool,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available high bits and protection key (bits 52..=62); unused.
    #[bits(11)]
    __: u16,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Link to a next-level table. User-half chains carry `US` so the leaf
    /// alone decides user accessibility.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalAddress, user: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user);
        e.set_physical_address(table);
        e
    }

    /// Encode a leaf (or an allocate-on-reference placeholder) for `flags`.
    #[must_use]
    pub fn leaf(phys: PhysicalAddress, flags: MapFlags) -> Self {
        let placeholder = flags.contains(MapFlags::ALLOCATE_ON_REFERENCE);
        let mut e = Self::new()
            .with_present(!placeholder)
            .with_writable(flags.contains(MapFlags::WRITABLE))
            .with_user_access(flags.contains(MapFlags::USER))
            .with_large_page(flags.contains(MapFlags::HUGE))
            .with_allocate_on_reference(placeholder)
            .with_copy_on_write(flags.contains(MapFlags::COPY_ON_WRITE))
            .with_no_execute(!flags.contains(MapFlags::EXECUTABLE));
        if !placeholder {
            e.set_physical_address(phys);
        }
        e
    }

    /// Whether the entry is entirely empty (never mapped or cleared).
    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }

    /// Present leaf or allocate-on-reference placeholder.
    #[inline]
    #[must_use]
    pub const fn is_occupied(&self) -> bool {
        self.present() || self.allocate_on_reference()
    }

    /// Decode the abstract flags of a leaf entry.
    #[must_use]
    pub fn map_flags(&self) -> MapFlags {
        let mut f = MapFlags::empty();
        f.set(MapFlags::PRESENT, self.present());
        f.set(MapFlags::WRITABLE, self.writable());
        f.set(MapFlags::USER, self.user_access());
        f.set(MapFlags::EXECUTABLE, !self.no_execute());
        f.set(MapFlags::HUGE, self.large_page());
        f.set(MapFlags::ALLOCATE_ON_REFERENCE, self.allocate_on_reference());
        f.set(MapFlags::COPY_ON_WRITE, self.copy_on_write());
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips_flags_and_address() {
        let flags = MapFlags::PRESENT | MapFlags::WRITABLE | MapFlags::USER;
        let e = PageEntryBits::leaf(PhysicalAddress::new(0x0030_5000), flags);
        assert!(e.present());
        assert!(e.no_execute());
        assert_eq!(e.physical_address().as_u64(), 0x0030_5000);
        assert_eq!(e.map_flags(), flags);
    }

    #[test]
    fn placeholder_is_not_present_but_occupied() {
        let flags = MapFlags::WRITABLE | MapFlags::ALLOCATE_ON_REFERENCE;
        let e = PageEntryBits::leaf(PhysicalAddress::new(0x1000), flags);
        assert!(!e.present());
        assert!(e.is_occupied());
        assert!(e.writable());
        assert!(e.physical_address().is_null());
        assert_eq!(e.into_bits() & (1 << 9), 1 << 9);
    }

    #[test]
    fn cow_lives_in_bit_ten() {
        let e = PageEntryBits::leaf(
            PhysicalAddress::new(0x2000),
            MapFlags::PRESENT | MapFlags::COPY_ON_WRITE,
        );
        assert_eq!(e.into_bits() & (1 << 10), 1 << 10);
        assert!(!e.writable());
    }
}
