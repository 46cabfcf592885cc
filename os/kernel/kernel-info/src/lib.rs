//! # Kernel Memory Configuration
//!
//! Shared configuration for the memory core:
//!
//! ### Boot Information ([`boot`])
//! The snapshot the boot/arch layer hands over once: the memory map as
//! `{base, length, kind}` entries, the kernel image boundaries and the
//! highest physical address.
//!
//! ### Memory Layout ([`memory`])
//! Compile-time virtual layout constants:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │    (non-canonical hole)         │
//! KERNEL_SPACE_START    ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_HEAP_START     ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │   Kernel Heap (1 GiB window)    │
//! TEMP_MAP_BASE         ├─────────────────────────────────┤ 0xffff_fe00_0000_0000
//!                       │   Temporary mapping slots       │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything from [`KERNEL_SPACE_START`](memory::KERNEL_SPACE_START) up is
//! shared by every address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
