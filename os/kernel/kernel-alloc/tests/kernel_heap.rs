mod common;

use common::{PAGE, boot, init_logging};
use kernel_alloc::heap::{ALIGN, HEADER, HeapBackend, HeapError, KernelHeap};
use kernel_alloc::vmm::VmmHeapBackend;
use kernel_info::memory::KERNEL_HEAP_START;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MapFlags;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeSet;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::thread;

const WINDOW: usize = 1024 * PAGE as usize;

/// Host memory standing in for the heap window.
struct HostWindow {
    mapped: Mutex<BTreeSet<usize>>,
}

impl HeapBackend for HostWindow {
    fn map_page(&self, offset: usize) -> Result<(), HeapError> {
        assert!(self.mapped.lock().unwrap().insert(offset), "page {offset:#x} mapped twice");
        Ok(())
    }

    fn unmap_page(&self, offset: usize) {
        assert!(self.mapped.lock().unwrap().remove(&offset), "page {offset:#x} not mapped");
    }
}

struct Heap {
    heap: KernelHeap<HostWindow>,
    base: NonNull<u8>,
    layout: Layout,
}

impl Heap {
    fn new() -> Self {
        init_logging();
        let layout = Layout::from_size_align(WINDOW, PAGE as usize).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
        let backend = HostWindow {
            mapped: Mutex::new(BTreeSet::new()),
        };
        Self {
            heap: unsafe { KernelHeap::new(base, WINDOW, backend) },
            base,
            layout,
        }
    }

    fn pages(&self) -> usize {
        self.heap.backend().mapped.lock().unwrap().len()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[test]
fn split_remainder_serves_the_next_request() {
    let h = Heap::new();
    let a = h.heap.allocate(3000).unwrap();
    assert_eq!(h.pages(), 1);
    let grown = h.heap.stats();
    assert_eq!(grown.free_blocks, 1);
    assert_eq!(grown.extent, PAGE as usize);

    let b = h.heap.allocate(900).unwrap();
    assert_eq!(h.pages(), 1);
    assert_eq!(h.heap.stats().extent, grown.extent);
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 3008 + HEADER);
    h.heap.check().unwrap();

    unsafe {
        h.heap.free(b);
        h.heap.free(a);
    }
    assert_eq!(h.heap.usage(), 0);
    assert_eq!(h.pages(), 0);
}

#[test]
fn random_interleaving_keeps_the_heap_consistent() {
    let h = Heap::new();
    let mut rng = SmallRng::seed_from_u64(0x4ea9_0001);
    let mut live: Vec<(NonNull<u8>, usize, u8, bool)> = Vec::new();

    for round in 0..3000_u32 {
        if live.is_empty() || (live.len() < 48 && rng.gen_bool(0.55)) {
            let size = rng.gen_range(1..=2 * PAGE as usize);
            let aligned = rng.gen_ratio(1, 5);
            let ptr = if aligned {
                let align = 1_usize << rng.gen_range(5..=12_u32);
                let p = h.heap.allocate_aligned(size, align).unwrap();
                assert_eq!(p.as_ptr() as usize % align, 0);
                p
            } else {
                let p = h.heap.allocate(size).unwrap();
                assert_eq!(p.as_ptr() as usize % ALIGN, 0);
                p
            };
            let tag = (round % 255) as u8 + 1;
            unsafe { ptr.as_ptr().write_bytes(tag, size) };
            live.push((ptr, size, tag, aligned));
        } else {
            let (ptr, size, tag, aligned) = live.swap_remove(rng.gen_range(0..live.len()));
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|b| *b == tag), "block at {ptr:p} was overwritten");
            unsafe {
                if aligned {
                    h.heap.free_aligned(ptr);
                } else {
                    h.heap.free(ptr);
                }
            }
        }
        if round % 100 == 0 {
            h.heap.check().unwrap();
        }
    }

    h.heap.check().unwrap();
    let stats = h.heap.stats();
    assert_eq!(stats.blocks, live.len() + stats.free_blocks);
    assert_eq!(stats.backed_bytes, h.pages() * PAGE as usize);

    for (ptr, _, _, aligned) in live.drain(..) {
        unsafe {
            if aligned {
                h.heap.free_aligned(ptr);
            } else {
                h.heap.free(ptr);
            }
        }
    }
    h.heap.check().unwrap();
    assert_eq!(h.heap.usage(), 0);
    assert_eq!(h.heap.stats().blocks, 0);
    assert_eq!(h.pages(), 0);
}

#[test]
fn concurrent_allocations_keep_the_heap_consistent() {
    let h = Heap::new();
    let heap = &h.heap;

    thread::scope(|s| {
        for t in 0..4_u32 {
            s.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(0x4ea9_0100 + u64::from(t));
                let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
                let release = |(ptr, size, tag): (NonNull<u8>, usize, u8)| {
                    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                    assert!(bytes.iter().all(|b| *b == tag), "block at {ptr:p} was overwritten");
                    unsafe { heap.free(ptr) };
                };

                for round in 0..2000_u32 {
                    if live.is_empty() || (live.len() < 16 && rng.gen_bool(0.5)) {
                        let size = rng.gen_range(1..=PAGE as usize);
                        let ptr = heap.allocate(size).unwrap();
                        let tag = (t * 60 + round % 60 + 1) as u8;
                        unsafe { ptr.as_ptr().write_bytes(tag, size) };
                        live.push((ptr, size, tag));
                    } else {
                        release(live.swap_remove(rng.gen_range(0..live.len())));
                    }
                }
                live.drain(..).for_each(release);
            });
        }
    });

    h.heap.check().unwrap();
    assert_eq!(h.heap.usage(), 0);
    assert_eq!(h.heap.stats().blocks, 0);
    assert_eq!(h.pages(), 0);
}

#[test]
fn freed_neighbours_fuse_into_one_block() {
    let h = Heap::new();
    let blocks: Vec<_> = (0..4).map(|_| h.heap.allocate(256).unwrap()).collect();
    let guard = h.heap.allocate(64).unwrap();

    unsafe {
        h.heap.free(blocks[1]);
        h.heap.free(blocks[3]);
    }
    // Two holes plus the unused rest of the page behind the guard.
    let before = h.heap.stats();
    assert_eq!(before.free_blocks, 3);
    unsafe { h.heap.free(blocks[2]) };
    let stats = h.heap.stats();
    assert_eq!(stats.free_blocks, 2);
    assert_eq!(stats.free_bytes, before.free_bytes + 256 + 2 * HEADER);
    h.heap.check().unwrap();

    // The fused block fits a request none of its parts could.
    let big = h.heap.allocate(3 * 256).unwrap();
    assert_eq!(big, blocks[1]);
    unsafe {
        h.heap.free(big);
        h.heap.free(blocks[0]);
        h.heap.free(guard);
    }
    assert_eq!(h.pages(), 0);
}

#[test]
fn heap_pages_come_from_the_frame_allocator() {
    let m = boot();
    let window = VirtualAddress::new(KERNEL_HEAP_START);
    let backend = VmmHeapBackend::new(&m.vmm, window);

    backend.map_page(0).unwrap();
    let used = m.used_bytes();
    backend.map_page(PAGE as usize).unwrap();
    assert_eq!(m.used_bytes(), used + PAGE);

    let (pa, flags) = m.translate(m.vmm.kernel_space(), KERNEL_HEAP_START + PAGE).unwrap();
    assert_eq!(flags & MapFlags::KERNEL_RW, MapFlags::KERNEL_RW);
    assert!(!flags.contains(MapFlags::USER));
    assert_eq!(m.frames.references(pa), 1);

    // Backing a page twice is refused and the frame taken for it is dropped.
    let before = m.used_bytes();
    assert_eq!(backend.map_page(0), Err(HeapError::OutOfMemory));
    assert_eq!(m.used_bytes(), before);

    backend.unmap_page(PAGE as usize);
    assert_eq!(m.frames.references(pa), 0);
    assert!(m.translate(m.vmm.kernel_space(), KERNEL_HEAP_START + PAGE).is_none());
    backend.unmap_page(0);
    assert_eq!(m.used_bytes(), used - PAGE);
}
