//! # Address Space (x86-64, PML4-rooted)
//!
//! An [`AddressSpace`] owns exactly one PML4 root frame. The tree below it is
//! only mutated through the [`Mapper`](crate::Mapper), which holds the
//! space's lock for the duration of a walk.
//!
//! The set of CPUs currently running on the space is tracked as a bit mask so
//! unmaps can be shot down on exactly those cores.

use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{IrqSpinLockGuard, SpinLock};

/// Book-keeping guarded by the address-space lock.
#[derive(Debug)]
pub struct Tables {
    /// Intermediate table frames allocated below the root.
    pub count: usize,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace {
    root: PhysicalAddress,
    tables: SpinLock<Tables>,
    active_cpus: AtomicU64,
}

impl AddressSpace {
    /// Wrap an already initialized PML4 frame.
    #[must_use]
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self {
            root,
            tables: SpinLock::new(Tables { count: 0 }),
            active_cpus: AtomicU64::new(0),
        }
    }

    /// Physical address of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Take the page-table lock of this space, with interrupts masked.
    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, Tables> {
        self.tables.lock_irq()
    }

    /// Number of intermediate tables allocated below the root.
    pub fn table_count(&self) -> usize {
        self.tables.with_lock_irq(|t| t.count)
    }

    /// Bit mask of CPUs currently running on this space.
    #[inline]
    pub fn active_cpus(&self) -> u64 {
        self.active_cpus.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active_cpus() != 0
    }

    pub(crate) fn mark_active(&self, cpu: u32) {
        self.active_cpus.fetch_or(cpu_bit(cpu), Ordering::AcqRel);
    }

    pub(crate) fn mark_inactive(&self, cpu: u32) {
        self.active_cpus.fetch_and(!cpu_bit(cpu), Ordering::AcqRel);
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .field("active_cpus", &format_args!("{:#b}", self.active_cpus()))
            .finish_non_exhaustive()
    }
}

/// Mask bit for `cpu`; CPUs beyond 63 share the top bit.
#[inline]
#[must_use]
pub const fn cpu_bit(cpu: u32) -> u64 {
    if cpu >= 64 { 1 << 63 } else { 1 << cpu }
}
