//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The memory core of the kernel: physical frames, address spaces, virtual
//! regions, page-fault resolution and the kernel heap.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Kernel Heap                        │
//! │    • First-fit blocks linked by offset              │
//! │    • Grows and shrinks page by page                 │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ VmmHeapBackend
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Virtual Memory Manager (VMM)             │
//! │    • Regions per address space                      │
//! │    • Page-fault resolution (AOR, file, device, COW) │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ kernel_vmem::Mapper
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • 4 MiB regions with bitmaps and free counts     │
//! │    • Per-frame reference counts                     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//!
//! Hands out 4 KiB frames with a reference count of one. Counts are raised
//! by sharing (copy-on-write, forked regions) and the frame returns to the
//! pool when the last reference is dropped. Its metadata is carved from free
//! memory by the [`BootFrameAllocator`](frame_alloc::BootFrameAllocator).
//!
//! ### Virtual Memory Manager ([`vmm`])
//!
//! Keeps a [`RegionTracker`](vmm::regions::RegionTracker) per address space,
//! backs regions eagerly or on first touch, and resolves page faults through
//! [`Vmm::handle_page_fault`](vmm::Vmm::handle_page_fault).
//!
//! ### Kernel Heap ([`heap`])
//!
//! [`KernelHeap`](heap::KernelHeap) implements `GlobalAlloc` over the heap
//! window of the kernel layout. Two locks separate growth from list
//! surgery.
//!
//! ### Physical Mapper ([`phys_mapper`])
//!
//! Reaches physical frames through the higher-half direct map.
//!
//! ## Errors
//!
//! Every component has its own error type; all of them convert into
//! [`MemoryError`]. Heap corruption and unresolvable page faults are not
//! errors to recover from: the former panics, the latter is reported as a
//! [`FatalFault`](vmm::fault::FatalFault) for the trap handler to act on.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod error;
pub mod frame_alloc;
#[cfg(target_arch = "x86_64")]
pub mod global;
pub mod heap;
pub mod phys_mapper;
pub mod vmm;

pub use crate::error::MemoryError;
#[cfg(target_arch = "x86_64")]
pub use crate::heap::KernelAllocator;
