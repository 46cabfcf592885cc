//! Host-side doubles for the hardware seams.
//!
//! - [`TestPhys`]: simulated physical RAM; physical addresses are byte
//!   offsets into one 4 KiB-aligned heap buffer.
//! - [`BumpFrames`]: a trivial frame source that only moves a cursor.
//! - [`TestMmu`]: records local flushes and shoot-downs instead of touching
//!   CR3 or the TLB.

use crate::{FrameAlloc, Mmu, PhysMapper};
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;

const FRAME: usize = 4096;

/// Simulated physical memory of `frames` zeroed 4 KiB frames.
pub struct TestPhys {
    base: *mut u8,
    layout: Layout,
}

// SAFETY: the buffer is owned; concurrent access is governed by the same
// locks that govern real physical memory.
unsafe impl Send for TestPhys {}
unsafe impl Sync for TestPhys {}

impl TestPhys {
    /// # Panics
    /// If the host allocation fails.
    #[must_use]
    pub fn with_frames(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * FRAME, FRAME).expect("arena layout");
        // SAFETY: non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena allocation failed");
        Self { base, layout }
    }

    /// Size of the simulated RAM in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.layout.size() as u64
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    fn ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let off = usize::try_from(pa.as_u64()).expect("address fits usize");
        assert!(off < self.layout.size(), "{pa} outside simulated RAM");
        // SAFETY: bounds checked above.
        unsafe { self.base.add(off) }
    }

    /// The 4 KiB frame containing `pa`.
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub fn frame(&self, pa: PhysicalAddress) -> &mut [u8] {
        let base = PhysicalAddress::new(pa.as_u64() & !(FRAME as u64 - 1));
        // SAFETY: in bounds; tests take care not to alias.
        unsafe { core::slice::from_raw_parts_mut(self.ptr(base), FRAME) }
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        // SAFETY: allocated in `with_frames` with the same layout.
        unsafe { dealloc(self.base, self.layout) }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u64() as usize + size_of::<T>() <= self.layout.size());
        // SAFETY: the caller promises `T` matches the bytes at `pa`.
        unsafe { &mut *self.ptr(pa).cast::<T>() }
    }

    /// No real virtual memory exists on the host; mapped pages are reached
    /// through the arena directly.
    fn mapped_ptr(&self, _va: VirtualAddress, pa: PhysicalAddress) -> *mut u8 {
        self.ptr(pa)
    }
}

/// A trivial **bump** allocator: always hands out the next 4 KiB frame.
pub struct BumpFrames {
    next: AtomicU64,
    end: u64,
    allocated: AtomicUsize,
    freed: SpinLock<Vec<PhysicalAddress>>,
}

impl BumpFrames {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            end,
            allocated: AtomicUsize::new(0),
            freed: SpinLock::new(Vec::new()),
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> Vec<PhysicalAddress> {
        self.freed.with_lock(|f| f.clone())
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        let p = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n + FRAME as u64 <= self.end).then_some(n + FRAME as u64)
            })
            .ok()?;
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Some(PhysicalAddress::new(p))
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        self.freed.with_lock(|f| f.push(pa));
    }
}

/// Records TLB maintenance instead of performing it.
#[derive(Default)]
pub struct TestMmu {
    cpu: AtomicU32,
    root: AtomicU64,
    local: SpinLock<Vec<VirtualAddress>>,
    remote: SpinLock<Vec<(u64, VirtualAddress)>>,
}

impl TestMmu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend subsequent calls run on `cpu`.
    pub fn set_cpu(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn local_flushes(&self) -> Vec<VirtualAddress> {
        self.local.with_lock(|v| v.clone())
    }

    pub fn shootdowns(&self) -> Vec<(u64, VirtualAddress)> {
        self.remote.with_lock(|v| v.clone())
    }

    pub fn clear(&self) {
        self.local.with_lock(Vec::clear);
        self.remote.with_lock(Vec::clear);
    }
}

impl Mmu for TestMmu {
    fn current_cpu(&self) -> u32 {
        self.cpu.load(Ordering::SeqCst)
    }

    fn current_root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root.load(Ordering::SeqCst))
    }

    unsafe fn load_root(&self, root: PhysicalAddress) {
        self.root.store(root.as_u64(), Ordering::SeqCst);
    }

    fn flush_local(&self, va: VirtualAddress) {
        self.local.with_lock(|v| v.push(va));
    }

    fn shootdown(&self, cpus: u64, va: VirtualAddress) {
        self.remote.with_lock(|v| v.push((cpus, va)));
    }
}
