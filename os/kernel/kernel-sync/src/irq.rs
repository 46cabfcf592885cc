//! Interrupt masking for locks that interrupt handlers may also take.
//!
//! A CPU that holds a [`SpinLock`](crate::SpinLock) and is then interrupted
//! by a handler contending for the same lock spins forever. Taking the lock
//! through [`SpinLock::lock_irq`](crate::SpinLock::lock_irq) closes that
//! window: interrupts stay masked on the local CPU for as long as the guard
//! lives.
//!
//! # Platform
//!
//! On bare-metal `x86_64` this uses `cli`/`sti` and `pushfq; pop`, which
//! require ring 0. Hosted builds (unit tests) never take interrupts in this
//! code, so masking there is a no-op and [`interrupts_enabled`] reports
//! `false`.

/// `IF`, the interrupt-enable bit of `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// Disables hardware interrupts (`cli`).
    #[inline]
    pub fn cli_stop_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`).
    #[inline]
    pub fn sti_enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn cli_stop_interrupts() {}

    #[inline]
    pub const fn sti_enable_interrupts() {}

    #[inline]
    #[must_use]
    pub const fn rflags() -> u64 {
        0
    }
}

pub use arch::{cli_stop_interrupts, rflags, sti_enable_interrupts};

/// Whether the local CPU currently accepts maskable interrupts.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`; on drop it executes `sti` **only** if they were enabled
/// before, so guards nest.
///
/// ```no_run
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(); // interrupts disabled here if previously enabled
///     // critical section
/// }
/// // IF restored to its prior state
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether dropping this guard re-enables interrupts.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
