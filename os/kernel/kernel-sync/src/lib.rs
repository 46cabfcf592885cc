//! # Kernel synchronization primitives
//!
//! Spin-based primitives for code that must never sleep: the frame allocator,
//! page-table updates, the kernel heap and the page-fault path all run in
//! contexts where the scheduler cannot be assumed to be available.
//!
//! - [`SpinLock`]: test-and-test-and-set lock with bounded exponential
//!   `pause` backoff and an RAII guard.
//! - [`IrqGuard`]: masks interrupts on the local CPU while alive; paired
//!   with a lock by [`SpinLock::lock_irq`].
//! - [`SyncOnceCell`]: write-once cell for boot-time singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod backoff;
pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use backoff::Backoff;
pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
