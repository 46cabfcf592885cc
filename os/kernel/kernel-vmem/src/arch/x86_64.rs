//! x86-64 MMU access: CR3, `invlpg` and an IPI-driven shoot-down hook.

use crate::Mmu;
use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SyncOnceCell;
use log::warn;

/// Delivers an invalidation request for `va` to every CPU in the mask and
/// returns once all of them acknowledged it.
pub type ShootdownHook = fn(cpus: u64, va: VirtualAddress);

/// The physical-address bits of CR3.
const CR3_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

pub struct X86Mmu {
    current_cpu: fn() -> u32,
    shootdown: SyncOnceCell<ShootdownHook>,
    online: AtomicU64,
}

impl X86Mmu {
    /// `current_cpu` is supplied by the scheduler (e.g. read from the
    /// per-CPU block); until SMP bring-up only CPU 0 is online.
    #[must_use]
    pub const fn new(current_cpu: fn() -> u32) -> Self {
        Self {
            current_cpu,
            shootdown: SyncOnceCell::new(),
            online: AtomicU64::new(1),
        }
    }

    /// Install the IPI sender once application processors come up.
    pub fn set_shootdown_hook(&self, hook: ShootdownHook) {
        if self.shootdown.set(hook).is_err() {
            warn!("Shoot-down hook already installed");
        }
    }

    /// Record `cpu` as online so kernel-half shoot-downs reach it.
    pub fn cpu_online(&self, cpu: u32) {
        self.online.fetch_or(crate::cpu_bit(cpu), Ordering::AcqRel);
    }
}

impl Mmu for X86Mmu {
    #[inline]
    fn current_cpu(&self) -> u32 {
        (self.current_cpu)()
    }

    fn current_root(&self) -> PhysicalAddress {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects at CPL0.
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalAddress::new(cr3 & CR3_ADDR_MASK)
    }

    unsafe fn load_root(&self, root: PhysicalAddress) {
        unsafe {
            asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn flush_local(&self, va: VirtualAddress) {
        // SAFETY: invlpg only drops a cached translation.
        unsafe {
            asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn shootdown(&self, cpus: u64, va: VirtualAddress) {
        let targets = cpus & self.online.load(Ordering::Acquire);
        if targets == 0 {
            return;
        }
        match self.shootdown.get() {
            Some(hook) => hook(targets, va),
            None => warn!("No shoot-down hook for CPUs {:#x} ({})", targets, va),
        }
    }
}
