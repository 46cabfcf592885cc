//! # HHDM-based PhysMapper for Kernel Virtual Memory
//!
//! The kernel reaches every physical frame (page-table nodes, the frame
//! allocator's metadata) through the higher-half direct map: physical
//! address `pa` is visible at `HHDM_BASE + pa`.
//!
//! ## Example
//! ```ignore
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! let table: &mut PageTable = unsafe { HhdmPhysMapper.phys_to_mut(PhysicalAddress::new(0x1234_0000)) };
//! table.zero();
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// # Safety
/// The HHDM must be present and cover the referenced physical range.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// Virtual address at which `pa` is visible.
    #[inline]
    #[must_use]
    pub const fn virt(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(HHDM_BASE + pa.as_u64())
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virt(pa).as_u64() as usize as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *va }
    }
}
