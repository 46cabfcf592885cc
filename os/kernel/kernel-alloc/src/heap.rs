//! # Kernel Heap
//!
//! A first-fit, split-and-fuse allocator over a fixed virtual window that is
//! backed page by page on demand.
//!
//! Every block starts with a [`BlockHeader`] stored in the heap itself:
//!
//! ```text
//! +---------------------+-------------------------+
//! | BlockHeader (48 B)  |      payload (size)     |
//! +---------------------+-------------------------+
//! ^ offset              ^ start = offset + HEADER
//! ```
//!
//! Blocks are linked by their **byte offsets** from the window base, in
//! ascending address order, and cover `[0, current)` without gaps. The
//! window is backed up to `current_aligned`, the page-rounded end.
//!
//! Growth backs whole pages and hands out one block spanning them; what the
//! request leaves of those pages is split off as a free block, so small
//! follow-up requests are served without touching `range` again.
//!
//! ## Locking
//! `list` guards the block list, `range` guards `current`/`current_aligned`.
//! Growth takes only `range`; freeing the trailing block takes `range` while
//! holding `list`. The order is always `list` → `range`. Both are taken with
//! interrupts masked, so an interrupt handler that allocates can never spin on
//! a lock its own CPU holds.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PageSize, Size4K};
use kernel_sync::SpinLock;
use log::{error, trace};
use thiserror::Error;

const PAGE: usize = Size4K::SIZE as usize;

/// Payload granularity and alignment.
pub const ALIGN: usize = 16;

pub const HEADER: usize = size_of::<BlockHeader>();

const BLOCK_MAGIC: u32 = 0xB10C_4EAD;
const NIL: usize = usize::MAX;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum HeapError {
    /// Zero size or an alignment that is not a power of two.
    #[error("invalid heap request")]
    InvalidArg,
    /// The window is exhausted or a page could not be backed.
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("heap block at offset {offset:#x} is corrupted")]
    Corrupted { offset: usize },
}

/// Supplies the memory behind the heap window.
pub trait HeapBackend {
    /// Back the page at byte `offset` of the window.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if no frame can be provided.
    fn map_page(&self, offset: usize) -> Result<(), HeapError>;

    /// Release the page at byte `offset` of the window.
    fn unmap_page(&self, offset: usize);
}

#[repr(C, align(16))]
struct BlockHeader {
    magic: u32,
    free: u32,
    /// Payload bytes following the header.
    size: usize,
    /// Offset of the payload.
    start: usize,
    next: usize,
    prev: usize,
}

impl BlockHeader {
    #[inline]
    const fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    const fn is_free(&self) -> bool {
        self.free != 0
    }
}

struct Range {
    /// Logical end of the heap.
    current: usize,
    /// Backed end of the heap, page aligned.
    current_aligned: usize,
}

struct List {
    head: usize,
    tail: usize,
    /// Bytes in allocated blocks, headers included.
    used: usize,
    blocks: usize,
}

/// Snapshot of the heap's accounting.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Logical end of the heap; blocks cover `[0, extent)`.
    pub extent: usize,
    pub backed_bytes: usize,
    pub used_bytes: usize,
    /// Payload bytes in free blocks.
    pub free_bytes: usize,
    pub blocks: usize,
    pub free_blocks: usize,
}

pub struct KernelHeap<B: HeapBackend> {
    base: NonNull<u8>,
    limit: usize,
    backend: B,
    range: SpinLock<Range>,
    list: SpinLock<List>,
}

// SAFETY: the window is only touched under the heap locks.
unsafe impl<B: HeapBackend + Send> Send for KernelHeap<B> {}
unsafe impl<B: HeapBackend + Sync> Sync for KernelHeap<B> {}

impl<B: HeapBackend> KernelHeap<B> {
    /// Create an empty heap over `[base, base + limit)`.
    ///
    /// # Safety
    /// The window must be page aligned and reserved for this heap, and
    /// `backend` must make the page at `base + offset` accessible once
    /// `map_page(offset)` succeeds.
    pub const unsafe fn new(base: NonNull<u8>, limit: usize, backend: B) -> Self {
        Self {
            base,
            limit,
            backend,
            range: SpinLock::new(Range {
                current: 0,
                current_aligned: 0,
            }),
            list: SpinLock::new(List {
                head: NIL,
                tail: NIL,
                used: 0,
                blocks: 0,
            }),
        }
    }

    #[inline]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    fn raw(&self, offset: usize) -> *mut BlockHeader {
        // SAFETY: offsets handed in are inside the backed window.
        unsafe { self.base.as_ptr().add(offset).cast() }
    }

    /// The header at `offset`, which must carry the block magic.
    ///
    /// # Panics
    /// On a magic or position mismatch: the heap is corrupted.
    #[allow(clippy::mut_from_ref)]
    fn block<'h>(&self, offset: usize) -> &'h mut BlockHeader {
        // SAFETY: block offsets are kept inside the backed window; callers
        // hold the list lock, or own the block exclusively during growth.
        let b = unsafe { &mut *self.raw(offset) };
        if b.magic != BLOCK_MAGIC || b.start != offset + HEADER {
            error!(
                "Heap corruption at offset {:#x}: magic {:#010x}",
                offset, b.magic
            );
            panic!("kernel heap corrupted at offset {offset:#x}");
        }
        b
    }

    /// Allocate `size` bytes aligned to [`ALIGN`].
    ///
    /// # Errors
    /// [`HeapError::InvalidArg`] for `size == 0`,
    /// [`HeapError::OutOfMemory`] if the window cannot grow.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 || size > self.limit {
            return Err(if size == 0 {
                HeapError::InvalidArg
            } else {
                HeapError::OutOfMemory
            });
        }
        let size = size.next_multiple_of(ALIGN);

        let offset = match self.first_fit(size) {
            Some(offset) => offset,
            None => {
                let offset = self.grow(size)?;
                self.insert(offset, size);
                offset
            }
        };
        trace!("Heap allocated {size} bytes at offset {offset:#x}");
        // SAFETY: inside the backed window.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset + HEADER)) })
    }

    fn first_fit(&self, size: usize) -> Option<usize> {
        let mut list = self.list.lock_irq();
        let mut cur = list.head;
        while cur != NIL {
            let b = self.block(cur);
            if b.is_free() && b.size >= size {
                self.split(&mut list, cur, size);
                let b = self.block(cur);
                b.free = 0;
                list.used += HEADER + b.size;
                return Some(cur);
            }
            cur = b.next;
        }
        None
    }

    /// Shrink block `offset` to `size` payload bytes when the rest can hold
    /// another block, and link the rest behind it as a free block.
    fn split(&self, list: &mut List, offset: usize, size: usize) {
        let b = self.block(offset);
        if b.size - size <= HEADER {
            return;
        }
        let rest = b.start + size;
        // SAFETY: the remainder lies inside block `offset`.
        unsafe {
            self.raw(rest).write(BlockHeader {
                magic: BLOCK_MAGIC,
                free: 1,
                size: b.size - size - HEADER,
                start: rest + HEADER,
                next: b.next,
                prev: offset,
            });
        }
        if b.next == NIL {
            list.tail = rest;
        } else {
            self.block(b.next).prev = rest;
        }
        b.next = rest;
        b.size = size;
        list.blocks += 1;
    }

    /// Back the window up to the page boundary past a block of `size` bytes
    /// and return the offset of one allocated block spanning all of it.
    /// Pages mapped by a failed attempt are released again.
    fn grow(&self, size: usize) -> Result<usize, HeapError> {
        let mut range = self.range.lock_irq();
        let offset = range.current;
        let end = offset
            .checked_add(HEADER + size)
            .filter(|&end| end <= self.limit)
            .ok_or(HeapError::OutOfMemory)?;

        let target = end.next_multiple_of(PAGE).max(range.current_aligned);
        let mut mapped = range.current_aligned;
        while mapped < target {
            if let Err(e) = self.backend.map_page(mapped) {
                while mapped > range.current_aligned {
                    mapped -= PAGE;
                    self.backend.unmap_page(mapped);
                }
                trace!("Heap growth to {end:#x} failed: {e}");
                return Err(HeapError::OutOfMemory);
            }
            mapped += PAGE;
        }
        if mapped > range.current_aligned {
            trace!(
                "Heap backed {:#x}..{:#x}",
                range.current_aligned, mapped
            );
            range.current_aligned = mapped;
        }
        range.current = target;

        // SAFETY: `[offset, target)` was just reserved and is backed.
        unsafe {
            self.raw(offset).write(BlockHeader {
                magic: BLOCK_MAGIC,
                free: 0,
                size: target - offset - HEADER,
                start: offset + HEADER,
                next: NIL,
                prev: NIL,
            });
        }
        Ok(offset)
    }

    /// Link the grown block at `offset` into the list, keeping address order,
    /// and split off what `size` leaves of its pages as a free block.
    fn insert(&self, offset: usize, size: usize) {
        let mut list = self.list.lock_irq();
        let mut prev = list.tail;
        while prev != NIL && prev > offset {
            prev = self.block(prev).prev;
        }
        let next = if prev == NIL {
            list.head
        } else {
            self.block(prev).next
        };

        let b = self.block(offset);
        b.prev = prev;
        b.next = next;
        if prev == NIL {
            list.head = offset;
        } else {
            self.block(prev).next = offset;
        }
        if next == NIL {
            list.tail = offset;
        } else {
            self.block(next).prev = offset;
        }
        list.blocks += 1;

        self.split(&mut list, offset, size);
        let b = self.block(offset);
        list.used += HEADER + b.size;

        // A concurrent growth may have linked a block behind this one that
        // was freed before we got here.
        let rest = b.next;
        if rest != NIL && self.block(rest).is_free() {
            let r = self.block(rest);
            if r.next != NIL && self.block(r.next).is_free() && r.end() == r.next {
                self.absorb(&mut list, rest, r.next);
            }
        }
    }

    /// Release a block returned by [`allocate`](Self::allocate).
    ///
    /// # Panics
    /// On a corrupted header or a double free.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let offset = (ptr.as_ptr() as usize)
            .checked_sub(self.base.as_ptr() as usize + HEADER)
            .filter(|&o| o < self.limit && o % ALIGN == 0);
        let current = self.range.with_lock_irq(|r| r.current);
        let Some(offset) = offset.filter(|&o| o + HEADER < current) else {
            error!("Freeing {ptr:p} outside the kernel heap");
            panic!("kernel heap: foreign pointer {ptr:p}");
        };

        let mut list = self.list.lock_irq();
        let b = self.block(offset);
        if b.is_free() {
            error!("Double free of heap block at offset {offset:#x}");
            panic!("kernel heap: double free at offset {offset:#x}");
        }
        list.used -= HEADER + b.size;
        b.free = 1;
        trace!("Heap freed {} bytes at offset {:#x}", b.size, offset);

        let mut cur = offset;
        if b.prev != NIL {
            let p = self.block(b.prev);
            if p.is_free() && p.end() == offset {
                cur = b.prev;
                self.absorb(&mut list, cur, offset);
            }
        }
        let c = self.block(cur);
        if c.next != NIL {
            let n = self.block(c.next);
            if n.is_free() && c.end() == c.next {
                self.absorb(&mut list, cur, c.next);
            }
        }

        let c = self.block(cur);
        if c.next == NIL {
            let mut range = self.range.lock_irq();
            if c.end() == range.current {
                self.release_tail(&mut list, &mut range, cur);
            }
        }
    }

    /// Merge block `victim` into its list predecessor `into`.
    fn absorb(&self, list: &mut List, into: usize, victim: usize) {
        let v = self.block(victim);
        let (size, next) = (v.size, v.next);
        v.magic = 0;

        let b = self.block(into);
        b.size += HEADER + size;
        b.next = next;
        if next == NIL {
            list.tail = into;
        } else {
            self.block(next).prev = into;
        }
        list.blocks -= 1;
    }

    /// Drop the free trailing block at `offset` and unback the pages above
    /// the new end.
    fn release_tail(&self, list: &mut List, range: &mut Range, offset: usize) {
        let b = self.block(offset);
        let prev = b.prev;
        b.magic = 0;
        if prev == NIL {
            list.head = NIL;
        } else {
            self.block(prev).next = NIL;
        }
        list.tail = prev;
        list.blocks -= 1;

        range.current = offset;
        let keep = offset.next_multiple_of(PAGE);
        while range.current_aligned > keep {
            range.current_aligned -= PAGE;
            self.backend.unmap_page(range.current_aligned);
        }
        trace!(
            "Heap shrunk to {:#x} ({:#x} backed)",
            range.current, range.current_aligned
        );
    }

    /// Allocate `size` bytes at a multiple of `align` (a power of two).
    ///
    /// The address of the underlying block is stored in the eight bytes
    /// before the returned pointer; release with
    /// [`free_aligned`](Self::free_aligned).
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate); a bad `align` is
    /// [`HeapError::InvalidArg`].
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidArg);
        }
        let align = align.max(ALIGN);
        let total = size.checked_add(align).ok_or(HeapError::OutOfMemory)?;
        let raw = self.allocate(total)?;
        let addr = (raw.as_ptr() as usize + size_of::<usize>()).next_multiple_of(align);
        let aligned = raw.as_ptr().wrapping_add(addr - raw.as_ptr() as usize);
        // SAFETY: `addr - 8 >= raw` and `addr + size <= raw + total`.
        unsafe {
            aligned
                .sub(size_of::<usize>())
                .cast::<usize>()
                .write_unaligned(raw.as_ptr() as usize);
            Ok(NonNull::new_unchecked(aligned))
        }
    }

    /// Release memory from [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// # Safety
    /// `ptr` must come from [`allocate_aligned`](Self::allocate_aligned) on
    /// this heap.
    pub unsafe fn free_aligned(&self, ptr: NonNull<u8>) {
        // SAFETY: written by `allocate_aligned`.
        let raw = unsafe {
            ptr.as_ptr()
                .sub(size_of::<usize>())
                .cast::<usize>()
                .read_unaligned()
        };
        let raw = ptr.as_ptr().wrapping_sub(ptr.as_ptr() as usize - raw);
        // SAFETY: `raw` is the block `allocate_aligned` obtained.
        unsafe { self.free(NonNull::new_unchecked(raw)) }
    }

    /// Bytes in allocated blocks, headers included.
    pub fn usage(&self) -> usize {
        self.list.with_lock_irq(|l| l.used)
    }

    /// Bytes of the window currently backed by pages.
    pub fn backed_bytes(&self) -> usize {
        self.range.with_lock_irq(|r| r.current_aligned)
    }

    pub fn stats(&self) -> HeapStats {
        let list = self.list.lock_irq();
        let (extent, backed_bytes) = self.range.with_lock_irq(|r| (r.current, r.current_aligned));
        let mut stats = HeapStats {
            extent,
            backed_bytes,
            used_bytes: list.used,
            blocks: list.blocks,
            ..HeapStats::default()
        };
        let mut cur = list.head;
        while cur != NIL {
            let b = self.block(cur);
            if b.is_free() {
                stats.free_bytes += b.size;
                stats.free_blocks += 1;
            }
            cur = b.next;
        }
        stats
    }

    /// Walk the block list and verify its structure: magic and position of
    /// every header, back links, ascending order, accounting, and that no
    /// two neighbouring free blocks are left unfused.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] naming the first bad block.
    pub fn check(&self) -> Result<(), HeapError> {
        let list = self.list.lock_irq();
        let (mut used, mut blocks) = (0, 0);
        let mut prev = NIL;
        let mut prev_free_end = None;
        let mut cur = list.head;
        while cur != NIL {
            let corrupted = HeapError::Corrupted { offset: cur };
            if cur >= self.limit || (prev != NIL && cur <= prev) {
                return Err(corrupted);
            }
            // SAFETY: checked to lie inside the window.
            let b = unsafe { &*self.raw(cur) };
            if b.magic != BLOCK_MAGIC || b.start != cur + HEADER || b.prev != prev {
                return Err(corrupted);
            }
            if b.is_free() {
                if prev_free_end == Some(cur) {
                    return Err(corrupted);
                }
                prev_free_end = Some(b.end());
            } else {
                used += HEADER + b.size;
                prev_free_end = None;
            }
            blocks += 1;
            prev = cur;
            cur = b.next;
        }
        if prev != list.tail || used != list.used || blocks != list.blocks {
            return Err(HeapError::Corrupted { offset: prev });
        }
        Ok(())
    }
}

unsafe impl<B: HeapBackend> GlobalAlloc for KernelHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let block = if layout.align() <= ALIGN {
            self.allocate(layout.size().max(1))
        } else {
            self.allocate_aligned(layout.size().max(1), layout.align())
        };
        block.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: `ptr` came from `alloc` with the same layout.
        unsafe {
            if layout.align() <= ALIGN {
                self.free(ptr);
            } else {
                self.free_aligned(ptr);
            }
        }
    }
}

/// `#[global_allocator]` adapter over the kernel heap singleton.
///
/// Allocation fails (returns null) until [`crate::global::init`] has run.
#[cfg(target_arch = "x86_64")]
pub struct KernelAllocator;

#[cfg(target_arch = "x86_64")]
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match crate::global::heap() {
            // SAFETY: forwarded.
            Some(heap) => unsafe { heap.alloc(layout) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(heap) = crate::global::heap() {
            // SAFETY: forwarded.
            unsafe { heap.dealloc(ptr, layout) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    const WINDOW: usize = 64 * PAGE;

    /// Host memory standing in for the virtual window; records which pages
    /// are backed and can be told to refuse growth.
    struct HostPages {
        mapped: Mutex<BTreeSet<usize>>,
        budget: Mutex<usize>,
    }

    impl HeapBackend for HostPages {
        fn map_page(&self, offset: usize) -> Result<(), HeapError> {
            let mut budget = self.budget.lock().unwrap();
            if *budget == 0 {
                return Err(HeapError::OutOfMemory);
            }
            *budget -= 1;
            assert!(self.mapped.lock().unwrap().insert(offset), "page mapped twice");
            Ok(())
        }

        fn unmap_page(&self, offset: usize) {
            *self.budget.lock().unwrap() += 1;
            assert!(self.mapped.lock().unwrap().remove(&offset), "page not mapped");
        }
    }

    struct Fixture {
        heap: KernelHeap<HostPages>,
        layout: Layout,
    }

    impl Fixture {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(WINDOW, PAGE).unwrap();
            let base = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            let backend = HostPages {
                mapped: Mutex::new(BTreeSet::new()),
                budget: Mutex::new(pages),
            };
            Self {
                heap: unsafe { KernelHeap::new(base, WINDOW, backend) },
                layout,
            }
        }

        fn pages(&self) -> usize {
            self.heap.backend().mapped.lock().unwrap().len()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe { dealloc(self.heap.base.as_ptr(), self.layout) }
        }
    }

    #[test]
    fn header_is_aligned() {
        assert_eq!(HEADER % ALIGN, 0);
        assert_eq!(HEADER, 48);
    }

    #[test]
    fn small_allocations_share_one_page() {
        let f = Fixture::new(64);
        let a = f.heap.allocate(3000).unwrap();
        assert_eq!(f.pages(), 1);
        let grown = f.heap.stats();
        assert_eq!(grown.extent, PAGE);
        assert_eq!(grown.blocks, 2);
        assert_eq!(grown.free_blocks, 1);
        assert_eq!(grown.free_bytes, PAGE - 3008 - 2 * HEADER);

        // Served from the remainder of the first page without growing.
        let b = f.heap.allocate(900).unwrap();
        assert_eq!(f.pages(), 1);
        assert_eq!(f.heap.stats().extent, grown.extent);
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 3008 + HEADER);
        f.heap.check().unwrap();
    }

    #[test]
    fn free_returns_usage_and_pages() {
        let f = Fixture::new(64);
        let before = f.heap.usage();
        let p = f.heap.allocate(5 * PAGE).unwrap();
        assert!(f.heap.usage() > before);
        assert_eq!(f.pages(), 6);
        unsafe { f.heap.free(p) };
        assert_eq!(f.heap.usage(), before);
        assert_eq!(f.pages(), 0);
        assert_eq!(f.heap.backed_bytes(), 0);
        f.heap.check().unwrap();
    }

    #[test]
    fn freed_block_is_split_and_reused() {
        let f = Fixture::new(64);
        let a = f.heap.allocate(1024).unwrap();
        let _b = f.heap.allocate(64).unwrap();
        unsafe { f.heap.free(a) };

        let c = f.heap.allocate(256).unwrap();
        assert_eq!(c, a);
        // c, its remainder, b and the free rest of the page.
        let tail = PAGE - (HEADER + 1024) - (HEADER + 64) - HEADER;
        let stats = f.heap.stats();
        assert_eq!(stats.blocks, 4);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, (1024 - 256 - HEADER) + tail);
        f.heap.check().unwrap();
    }

    #[test]
    fn neighbours_fuse_on_free() {
        let f = Fixture::new(64);
        let a = f.heap.allocate(128).unwrap();
        let b = f.heap.allocate(128).unwrap();
        let c = f.heap.allocate(128).unwrap();
        let _guard = f.heap.allocate(128).unwrap();

        unsafe {
            f.heap.free(a);
            f.heap.free(c);
            f.heap.free(b);
        }
        // One fused block in front of the guard, plus the rest of the page.
        assert_eq!(f.heap.stats().free_blocks, 2);
        f.heap.check().unwrap();
        let fused = f.heap.allocate(3 * 128 + 2 * HEADER).unwrap();
        assert_eq!(fused, a);
        f.heap.check().unwrap();
    }

    #[test]
    fn failed_growth_unwinds() {
        let f = Fixture::new(2);
        let _a = f.heap.allocate(100).unwrap();
        assert_eq!(f.heap.allocate(3 * PAGE), Err(HeapError::OutOfMemory));
        assert_eq!(f.pages(), 1);
        assert_eq!(f.heap.backed_bytes(), PAGE);
        let _b = f.heap.allocate(PAGE - HEADER).unwrap();
        assert_eq!(f.pages(), 2);
        f.heap.check().unwrap();
    }

    #[test]
    fn window_limit_is_enforced() {
        let f = Fixture::new(usize::MAX);
        assert_eq!(f.heap.allocate(WINDOW), Err(HeapError::OutOfMemory));
        assert_eq!(f.heap.allocate(0), Err(HeapError::InvalidArg));
    }

    #[test]
    fn aligned_allocation_round_trip() {
        let f = Fixture::new(64);
        let before = f.heap.usage();
        let p = f.heap.allocate_aligned(100, 256).unwrap();
        assert_eq!(p.as_ptr() as usize % 256, 0);
        unsafe { p.as_ptr().write_bytes(0xAB, 100) };
        f.heap.check().unwrap();
        unsafe { f.heap.free_aligned(p) };
        assert_eq!(f.heap.usage(), before);
        assert_eq!(f.heap.allocate_aligned(8, 3), Err(HeapError::InvalidArg));
    }

    #[test]
    fn global_alloc_interface() {
        let f = Fixture::new(64);
        let layout = Layout::from_size_align(40, 64).unwrap();
        let p = unsafe { f.heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        unsafe { f.heap.dealloc(p, layout) };
        assert_eq!(f.heap.usage(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let f = Fixture::new(64);
        let a = f.heap.allocate(64).unwrap();
        let _b = f.heap.allocate(64).unwrap();
        unsafe {
            f.heap.free(a);
            f.heap.free(a);
        }
    }

    #[test]
    #[should_panic(expected = "foreign pointer")]
    fn freeing_past_the_heap_end_is_fatal() {
        let f = Fixture::new(64);
        let _a = f.heap.allocate(64).unwrap();
        let beyond = f.heap.base.as_ptr().wrapping_add(8 * PAGE + HEADER);
        unsafe { f.heap.free(NonNull::new(beyond).unwrap()) };
    }

    #[test]
    #[should_panic(expected = "corrupted")]
    fn clobbered_header_is_fatal() {
        let f = Fixture::new(64);
        let a = f.heap.allocate(64).unwrap();
        unsafe {
            a.as_ptr().sub(HEADER).cast::<u32>().write(0xDEAD_BEEF);
            f.heap.free(a);
        }
    }

    #[test]
    fn check_reports_corruption() {
        let f = Fixture::new(64);
        let a = f.heap.allocate(64).unwrap();
        unsafe { a.as_ptr().sub(HEADER).cast::<u32>().write(0) };
        assert_eq!(f.heap.check(), Err(HeapError::Corrupted { offset: 0 }));
    }
}
