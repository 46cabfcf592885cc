//! # Physical Frame Allocator
//!
//! Physical memory is tracked in **regions** of 4 MiB (1024 frames). Each
//! region carries an allocation bitmap and a cached free count; every managed
//! frame additionally carries an [`AtomicU8`] reference count where zero means
//! free.
//!
//! ```text
//!  region table (immutable)     region state (locked)      reference counts
//! ┌─────────────────────────┐  ┌──────────────────────┐   ┌──────────────────┐
//! │ base │ usable │ reserved│  │ free │ bitmap[16]    │   │ u8 × 1024/region │
//! └─────────────────────────┘  └──────────────────────┘   └──────────────────┘
//! ```
//!
//! The three arrays are carved out of free memory by the
//! [`BootFrameAllocator`], which is consumed when the [`FrameAllocator`] is
//! built. Frames that are not RAM, frame 0, the kernel image and the
//! allocator's own metadata are *reserved*: permanently allocated and never
//! referenceable.
//!
//! ## Reference counting
//! Incrementing a count that is already non-zero, and decrementing one that
//! stays non-zero, only touch the atomic. The `0 → 1` and `1 → 0` transitions
//! happen under the allocator lock together with the bitmap update, so a
//! frame with a non-zero count is never free in its bitmap.
//!
//! The allocator lock is always taken with interrupts masked; page faults and
//! interrupt handlers allocate too.

use core::sync::atomic::{AtomicU8, Ordering};
use kernel_info::boot::BootMemoryInfo;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, align_down, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, trace, warn};
use thiserror::Error;

pub const FRAME_SIZE: u64 = Size4K::SIZE;

/// Bytes covered by one region bitmap.
pub const REGION_SIZE: u64 = 4 * 1024 * 1024;

pub const FRAMES_PER_REGION: usize = (REGION_SIZE / FRAME_SIZE) as usize;

const WORDS: usize = FRAMES_PER_REGION / 64;

/// Saturation limit of a frame's reference count.
pub const MAX_REFERENCES: u8 = u8::MAX;

/// Boot allocations the frame allocator has to know about.
const MAX_BOOT_RANGES: usize = 8;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    /// Misaligned, unmanaged or reserved address, or a zero count.
    #[error("invalid frame argument")]
    InvalidArg,
    #[error("out of physical memory")]
    OutOfMemory,
    /// The reference count is saturated.
    #[error("too many references to frame")]
    TooManyReferences,
}

/// Bump allocator over the free entries of the boot memory map.
///
/// It only exists until the [`FrameAllocator`] is built: handing it to
/// [`FrameAllocator::new`] consumes it, and the ranges it gave out are
/// reserved there.
pub struct BootFrameAllocator<'a> {
    info: BootMemoryInfo<'a>,
    entry: usize,
    cursor: u64,
    ranges: [(u64, u64); MAX_BOOT_RANGES],
    used: usize,
}

impl<'a> BootFrameAllocator<'a> {
    #[must_use]
    pub const fn new(info: BootMemoryInfo<'a>) -> Self {
        Self {
            info,
            entry: 0,
            cursor: FRAME_SIZE,
            ranges: [(0, 0); MAX_BOOT_RANGES],
            used: 0,
        }
    }

    /// Hand out `bytes` (rounded up to whole frames) of physically contiguous
    /// free memory. The memory is not zeroed.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] for `bytes == 0`, otherwise
    /// [`FrameError::OutOfMemory`].
    pub fn alloc(&mut self, bytes: u64) -> Result<PhysicalAddress, FrameError> {
        if bytes == 0 {
            return Err(FrameError::InvalidArg);
        }
        let len = align_up(bytes, FRAME_SIZE);
        let kernel = (
            self.info.kernel_phys_start.align_down::<Size4K>().as_u64(),
            self.info.kernel_phys_end.align_up::<Size4K>().as_u64(),
        );

        while let Some(e) = self.info.entries.get(self.entry) {
            if !e.is_free() {
                self.entry += 1;
                continue;
            }
            let end = align_down(e.end().as_u64(), FRAME_SIZE);
            let mut start = self.cursor.max(align_up(e.base.as_u64(), FRAME_SIZE));
            if start < kernel.1 && start + len > kernel.0 {
                start = kernel.1;
            }
            if start + len <= end {
                self.cursor = start + len;
                self.record(start, start + len)?;
                trace!("Boot allocation of {len} bytes at {start:#x}");
                return Ok(PhysicalAddress::new(start));
            }
            self.entry += 1;
        }
        Err(FrameError::OutOfMemory)
    }

    fn record(&mut self, start: u64, end: u64) -> Result<(), FrameError> {
        if let Some(last) = self.ranges[..self.used].last_mut()
            && last.1 == start
        {
            last.1 = end;
            return Ok(());
        }
        let slot = self.ranges.get_mut(self.used).ok_or(FrameError::OutOfMemory)?;
        *slot = (start, end);
        self.used += 1;
        Ok(())
    }

    /// Physical ranges handed out so far, as `[start, end)`.
    pub fn consumed(&self) -> &[(u64, u64)] {
        &self.ranges[..self.used]
    }
}

/// Immutable description of one region.
struct RegionInfo {
    base: PhysicalAddress,
    /// Frames of this region that lie in free memory-map entries.
    usable: u32,
    /// Frames that are never handed out nor referenced.
    reserved: [u64; WORDS],
}

impl RegionInfo {
    #[inline]
    const fn is_reserved(&self, frame: usize) -> bool {
        self.reserved[frame / 64] & (1 << (frame % 64)) != 0
    }
}

/// Mutable allocation state of one region.
struct RegionState {
    free: u32,
    bitmap: [u64; WORDS],
}

impl RegionState {
    #[inline]
    const fn is_set(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn first_free(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i * 64 + (!w).trailing_zeros() as usize)
    }
}

struct Inner<'a> {
    states: &'a mut [RegionState],
    /// Region the next single-frame search starts at.
    hint: usize,
    used_frames: u64,
    allocations: u64,
}

/// Position of a managed frame.
#[derive(Copy, Clone, Debug)]
struct FrameIndex {
    region: usize,
    frame: usize,
}

impl FrameIndex {
    #[inline]
    const fn slot(self) -> usize {
        self.region * FRAMES_PER_REGION + self.frame
    }

    #[inline]
    const fn next(self) -> Self {
        if self.frame + 1 == FRAMES_PER_REGION {
            Self {
                region: self.region + 1,
                frame: 0,
            }
        } else {
            Self {
                region: self.region,
                frame: self.frame + 1,
            }
        }
    }
}

/// Snapshot of the allocator's accounting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameStats {
    /// Bytes of usable RAM under management.
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    /// Frames claimed from the free pool since boot.
    pub allocations: u64,
}

/// Region-bitmap physical frame allocator with per-frame reference counts.
pub struct FrameAllocator<'a> {
    regions: &'a [RegionInfo],
    refs: &'a [AtomicU8],
    usable_frames: u64,
    inner: SpinLock<Inner<'a>>,
}

impl<'a> FrameAllocator<'a> {
    /// Build the allocator for every 4 MiB span that intersects free memory.
    ///
    /// `phys` must reach the memory the `boot` allocator hands out for as
    /// long as the allocator lives.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] if the map has no free memory,
    /// [`FrameError::OutOfMemory`] if the metadata does not fit.
    pub fn new<M: PhysMapper>(
        info: &BootMemoryInfo<'_>,
        mut boot: BootFrameAllocator<'_>,
        phys: &'a M,
    ) -> Result<Self, FrameError> {
        let top = info
            .free_entries()
            .map(|e| e.end().as_u64())
            .max()
            .ok_or(FrameError::InvalidArg)?
            .max(info.max_phys.as_u64());
        let spans = top.div_ceil(REGION_SIZE);

        let count = (0..spans)
            .filter(|&s| holes(info, s) != [u64::MAX; WORDS])
            .count();
        if count == 0 {
            return Err(FrameError::InvalidArg);
        }

        let regions_pa = boot.alloc((count * size_of::<RegionInfo>()) as u64)?;
        let states_pa = boot.alloc((count * size_of::<RegionState>()) as u64)?;
        let refs_pa = boot.alloc((count * FRAMES_PER_REGION) as u64)?;

        // SAFETY: the boot allocator handed these frames to us exclusively and
        // they are large enough for `count` elements; every element is
        // written before the slices are formed.
        let (regions, states, refs) = unsafe {
            let regions = core::ptr::from_mut(phys.phys_to_mut::<RegionInfo>(regions_pa));
            let states = core::ptr::from_mut(phys.phys_to_mut::<RegionState>(states_pa));
            let refs = core::ptr::from_mut(phys.phys_to_mut::<AtomicU8>(refs_pa));

            let mut k = 0;
            for s in 0..spans {
                let reserved = holes(info, s);
                if reserved == [u64::MAX; WORDS] {
                    continue;
                }
                let usable = reserved.iter().map(|w| w.count_zeros()).sum();
                regions.add(k).write(RegionInfo {
                    base: PhysicalAddress::new(s * REGION_SIZE),
                    usable,
                    reserved,
                });
                k += 1;
            }
            core::ptr::write_bytes(refs, 0, count * FRAMES_PER_REGION);

            let regions = core::slice::from_raw_parts_mut(regions, count);
            let mut pinned = 0u64;
            let kernel = (info.kernel_phys_start.as_u64(), info.kernel_phys_end.as_u64());
            for (start, end) in core::iter::once(kernel).chain(boot.consumed().iter().copied()) {
                pinned += pin(regions, start, end);
            }

            for (i, r) in regions.iter().enumerate() {
                states.add(i).write(RegionState {
                    free: r.reserved.iter().map(|w| w.count_zeros()).sum(),
                    bitmap: r.reserved,
                });
            }
            debug!("Pinned {pinned} frames of kernel image and allocator metadata");

            (
                &*regions,
                core::slice::from_raw_parts_mut(states, count),
                core::slice::from_raw_parts(refs, count * FRAMES_PER_REGION),
            )
        };

        let usable_frames: u64 = regions.iter().map(|r| u64::from(r.usable)).sum();
        let free_frames: u64 = states.iter().map(|s| u64::from(s.free)).sum();
        let allocator = Self {
            regions,
            refs,
            usable_frames,
            inner: SpinLock::new(Inner {
                states,
                hint: 0,
                used_frames: usable_frames - free_frames,
                allocations: 0,
            }),
        };
        info!(
            "Frame allocator: {} regions, {} KiB usable, {} KiB free",
            count,
            usable_frames * FRAME_SIZE / 1024,
            free_frames * FRAME_SIZE / 1024
        );
        Ok(allocator)
    }

    /// Number of regions under management.
    #[inline]
    pub const fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn index_of(&self, pa: PhysicalAddress) -> Result<FrameIndex, FrameError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(FrameError::InvalidArg);
        }
        let base = align_down(pa.as_u64(), REGION_SIZE);
        let region = self
            .regions
            .binary_search_by_key(&base, |r| r.base.as_u64())
            .map_err(|_| FrameError::InvalidArg)?;
        let frame = ((pa.as_u64() - base) / FRAME_SIZE) as usize;
        if self.regions[region].is_reserved(frame) {
            return Err(FrameError::InvalidArg);
        }
        Ok(FrameIndex { region, frame })
    }

    fn address_of(&self, idx: FrameIndex) -> PhysicalAddress {
        self.regions[idx.region].base + idx.frame as u64 * FRAME_SIZE
    }

    /// Mark the frame allocated with a count of one.
    fn claim(&self, inner: &mut Inner<'_>, idx: FrameIndex) {
        let state = &mut inner.states[idx.region];
        debug_assert!(!state.is_set(idx.frame));
        state.bitmap[idx.frame / 64] |= 1 << (idx.frame % 64);
        state.free -= 1;
        inner.used_frames += 1;
        inner.allocations += 1;
        self.refs[idx.slot()].store(1, Ordering::SeqCst);
    }

    fn release(inner: &mut Inner<'_>, idx: FrameIndex) {
        let state = &mut inner.states[idx.region];
        debug_assert!(state.is_set(idx.frame));
        state.bitmap[idx.frame / 64] &= !(1 << (idx.frame % 64));
        state.free += 1;
        inner.used_frames -= 1;
    }

    /// Allocate one frame with a reference count of one.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if every region is full.
    pub fn alloc_single(&self) -> Result<PhysicalAddress, FrameError> {
        let mut inner = self.inner.lock_irq();
        let n = self.regions.len();
        for k in 0..n {
            let region = (inner.hint + k) % n;
            if inner.states[region].free == 0 {
                continue;
            }
            if let Some(frame) = inner.states[region].first_free() {
                let idx = FrameIndex { region, frame };
                self.claim(&mut inner, idx);
                inner.hint = region;
                let pa = self.address_of(idx);
                trace!("Allocated frame {pa}");
                return Ok(pa);
            }
        }
        warn!("Out of physical frames");
        Err(FrameError::OutOfMemory)
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] for `count == 0`,
    /// [`FrameError::OutOfMemory`] if no run is long enough.
    pub fn alloc_contiguous(&self, count: usize) -> Result<PhysicalAddress, FrameError> {
        self.alloc_contiguous_aligned(count, FRAME_SIZE)
    }

    /// Allocate `count` physically contiguous frames starting at a multiple
    /// of `align` bytes (a power of two, at least one frame).
    ///
    /// # Errors
    /// As [`alloc_contiguous`](Self::alloc_contiguous); a bad `align` is
    /// [`FrameError::InvalidArg`].
    pub fn alloc_contiguous_aligned(
        &self,
        count: usize,
        align: u64,
    ) -> Result<PhysicalAddress, FrameError> {
        if count == 0 || !align.is_power_of_two() || align < FRAME_SIZE {
            return Err(FrameError::InvalidArg);
        }
        let mut inner = self.inner.lock_irq();
        let start = self
            .find_run(inner.states, count, align)
            .ok_or(FrameError::OutOfMemory)?;
        let mut idx = start;
        for _ in 0..count {
            self.claim(&mut inner, idx);
            idx = idx.next();
        }
        let pa = self.address_of(start);
        trace!("Allocated {count} contiguous frames at {pa}");
        Ok(pa)
    }

    /// First run of `count` free frames across physically adjacent regions.
    fn find_run(&self, states: &[RegionState], count: usize, align: u64) -> Option<FrameIndex> {
        let mut start = FrameIndex { region: 0, frame: 0 };
        let mut len = 0;
        let mut expected_base = None;
        for (region, (info, state)) in self.regions.iter().zip(states.iter()).enumerate() {
            if expected_base != Some(info.base.as_u64()) {
                len = 0;
            }
            expected_base = Some(info.base.as_u64() + REGION_SIZE);
            if state.free == 0 {
                len = 0;
                continue;
            }
            let mut frame = 0;
            while frame < FRAMES_PER_REGION {
                if frame % 64 == 0 && state.bitmap[frame / 64] == u64::MAX {
                    len = 0;
                    frame += 64;
                    continue;
                }
                if state.is_set(frame) {
                    len = 0;
                } else {
                    if len == 0 {
                        let pa = info.base.as_u64() + frame as u64 * FRAME_SIZE;
                        if !pa.is_multiple_of(align) {
                            frame += 1;
                            continue;
                        }
                        start = FrameIndex { region, frame };
                    }
                    len += 1;
                    if len == count {
                        return Some(start);
                    }
                }
                frame += 1;
            }
        }
        None
    }

    /// Fill `out` with independently allocated frames; all or nothing.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] for an empty `out`,
    /// [`FrameError::OutOfMemory`] if fewer than `out.len()` frames are free.
    pub fn alloc_non_contiguous(&self, out: &mut [PhysicalAddress]) -> Result<(), FrameError> {
        if out.is_empty() {
            return Err(FrameError::InvalidArg);
        }
        for i in 0..out.len() {
            match self.alloc_single() {
                Ok(pa) => out[i] = pa,
                Err(e) => {
                    for pa in &out[..i] {
                        self.dereference_frame(self.index_of(*pa)?);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn reference_frame(&self, idx: FrameIndex) -> Result<(), FrameError> {
        let count = &self.refs[idx.slot()];
        loop {
            let bumped = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c != 0 && c < MAX_REFERENCES).then(|| c + 1)
            });
            match bumped {
                Ok(_) => return Ok(()),
                Err(MAX_REFERENCES) => return Err(FrameError::TooManyReferences),
                Err(_) => {
                    let mut inner = self.inner.lock_irq();
                    if count.load(Ordering::SeqCst) == 0 {
                        self.claim(&mut inner, idx);
                        return Ok(());
                    }
                }
            }
        }
    }

    fn dereference_frame(&self, idx: FrameIndex) {
        let count = &self.refs[idx.slot()];
        loop {
            let dropped =
                count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c > 1).then(|| c - 1));
            match dropped {
                Ok(_) => return,
                Err(0) => {
                    trace!("Frame {} is already free", self.address_of(idx));
                    return;
                }
                Err(_) => {
                    let mut inner = self.inner.lock_irq();
                    if count
                        .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        Self::release(&mut inner, idx);
                        return;
                    }
                }
            }
        }
    }

    /// Add a reference to `frame`, or allocate a fresh frame for `None`.
    ///
    /// A free frame is claimed with a count of one.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] for an unmanaged or reserved frame,
    /// [`FrameError::TooManyReferences`] at saturation,
    /// [`FrameError::OutOfMemory`] if `None` finds no frame.
    pub fn reference_single(
        &self,
        frame: Option<PhysicalAddress>,
    ) -> Result<PhysicalAddress, FrameError> {
        let Some(pa) = frame else {
            return self.alloc_single();
        };
        self.reference_frame(self.index_of(pa)?)?;
        Ok(pa)
    }

    /// Add a reference to each of `count` frames starting at `first`, or
    /// allocate a fresh contiguous run for `None`. All or nothing.
    ///
    /// # Errors
    /// As [`reference_single`](Self::reference_single); zero `count` is
    /// [`FrameError::InvalidArg`].
    pub fn reference_contiguous(
        &self,
        first: Option<PhysicalAddress>,
        count: usize,
    ) -> Result<PhysicalAddress, FrameError> {
        let Some(pa) = first else {
            return self.alloc_contiguous(count);
        };
        if count == 0 {
            return Err(FrameError::InvalidArg);
        }
        let start = self.index_of(pa)?;
        for i in 1..count as u64 {
            self.index_of(pa + i * FRAME_SIZE)?;
        }
        let mut idx = start;
        for i in 0..count {
            if let Err(e) = self.reference_frame(idx) {
                let mut undo = start;
                for _ in 0..i {
                    self.dereference_frame(undo);
                    undo = undo.next();
                }
                return Err(e);
            }
            idx = idx.next();
        }
        Ok(pa)
    }

    /// Add a reference to every frame in `frames`. All or nothing.
    ///
    /// # Errors
    /// As [`reference_single`](Self::reference_single); an empty slice is
    /// [`FrameError::InvalidArg`].
    pub fn reference_non_contiguous(&self, frames: &[PhysicalAddress]) -> Result<(), FrameError> {
        if frames.is_empty() {
            return Err(FrameError::InvalidArg);
        }
        for pa in frames {
            self.index_of(*pa)?;
        }
        for (i, pa) in frames.iter().enumerate() {
            if let Err(e) = self.reference_frame(self.index_of(*pa)?) {
                for done in &frames[..i] {
                    self.dereference_frame(self.index_of(*done)?);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop one reference to `pa`; the frame returns to the pool at zero.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] for an unmanaged or reserved frame.
    pub fn dereference_single(&self, pa: PhysicalAddress) -> Result<(), FrameError> {
        self.dereference_frame(self.index_of(pa)?);
        Ok(())
    }

    /// Drop one reference to each of `count` frames starting at `first`.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] if any frame is invalid or `count` is zero;
    /// nothing is dereferenced in that case.
    pub fn dereference_contiguous(&self, first: PhysicalAddress, count: usize) -> Result<(), FrameError> {
        if count == 0 {
            return Err(FrameError::InvalidArg);
        }
        let start = self.index_of(first)?;
        for i in 1..count as u64 {
            self.index_of(first + i * FRAME_SIZE)?;
        }
        let mut idx = start;
        for _ in 0..count {
            self.dereference_frame(idx);
            idx = idx.next();
        }
        Ok(())
    }

    /// Drop one reference to every frame in `frames`.
    ///
    /// # Errors
    /// [`FrameError::InvalidArg`] if any frame is invalid; nothing is
    /// dereferenced in that case.
    pub fn dereference_non_contiguous(&self, frames: &[PhysicalAddress]) -> Result<(), FrameError> {
        for pa in frames {
            self.index_of(*pa)?;
        }
        for pa in frames {
            self.dereference_frame(self.index_of(*pa)?);
        }
        Ok(())
    }

    /// Current reference count of `pa`; zero for free or unmanaged frames.
    pub fn references(&self, pa: PhysicalAddress) -> u8 {
        self.index_of(pa)
            .map_or(0, |idx| self.refs[idx.slot()].load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock_irq();
        let free: u64 = inner.states.iter().map(|s| u64::from(s.free)).sum();
        FrameStats {
            total_bytes: self.usable_frames * FRAME_SIZE,
            free_bytes: free * FRAME_SIZE,
            used_bytes: inner.used_frames * FRAME_SIZE,
            allocations: inner.allocations,
        }
    }

    /// Sum of the cached per-region free counts.
    pub fn region_free_frames(&self) -> u64 {
        self.inner
            .with_lock_irq(|inner| inner.states.iter().map(|s| u64::from(s.free)).sum())
    }
}

impl FrameAlloc for FrameAllocator<'_> {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.alloc_single().ok()
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        if let Err(e) = self.dereference_single(pa) {
            warn!("Dropping reference to {pa} failed: {e}");
        }
    }

    fn free_contiguous(&self, pa: PhysicalAddress, count: usize) {
        if let Err(e) = self.dereference_contiguous(pa, count) {
            warn!("Dropping {count} references at {pa} failed: {e}");
        }
    }
}

/// Mask of frames in span `s` that are not free RAM (frame 0 included).
fn holes(info: &BootMemoryInfo<'_>, s: u64) -> [u64; WORDS] {
    let lo = s * REGION_SIZE;
    let hi = lo + REGION_SIZE;
    let mut mask = [u64::MAX; WORDS];
    for e in info.free_entries() {
        let start = align_up(e.base.as_u64(), FRAME_SIZE).max(lo);
        let end = align_down(e.end().as_u64(), FRAME_SIZE).min(hi);
        let mut pa = start;
        while pa < end {
            let f = ((pa - lo) / FRAME_SIZE) as usize;
            mask[f / 64] &= !(1 << (f % 64));
            pa += FRAME_SIZE;
        }
    }
    if s == 0 {
        mask[0] |= 1;
    }
    mask
}

/// Reserve every managed frame overlapping `[start, end)`. Returns how many
/// usable frames were newly reserved.
fn pin(regions: &mut [RegionInfo], start: u64, end: u64) -> u64 {
    let mut pinned = 0;
    let mut pa = align_down(start, FRAME_SIZE);
    while pa < end {
        let base = align_down(pa, REGION_SIZE);
        if let Ok(r) = regions.binary_search_by_key(&base, |r| r.base.as_u64()) {
            let f = ((pa - base) / FRAME_SIZE) as usize;
            let region = &mut regions[r];
            if !region.is_reserved(f) {
                region.reserved[f / 64] |= 1 << (f % 64);
                pinned += 1;
            }
        }
        pa += FRAME_SIZE;
    }
    pinned
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{MemoryKind, MemoryMapEntry};
    use kernel_memory_addresses::VirtualAddress;
    use kernel_vmem::testing::TestPhys;

    const MIB: u64 = 1024 * 1024;

    fn map(len: u64) -> [MemoryMapEntry; 2] {
        [
            MemoryMapEntry::new(0, MIB, MemoryKind::Reserved),
            MemoryMapEntry::new(MIB, len - MIB, MemoryKind::Free),
        ]
    }

    fn info(entries: &[MemoryMapEntry]) -> BootMemoryInfo<'_> {
        BootMemoryInfo {
            entries,
            kernel_phys_start: PhysicalAddress::new(MIB),
            kernel_phys_end: PhysicalAddress::new(2 * MIB),
            kernel_virt_start: VirtualAddress::new(kernel_info::memory::KERNEL_BASE),
            kernel_virt_end: VirtualAddress::new(kernel_info::memory::KERNEL_BASE + MIB),
            max_phys: entries.last().map_or(PhysicalAddress::zero(), MemoryMapEntry::end),
        }
    }

    fn allocator<'a>(phys: &'a TestPhys, entries: &[MemoryMapEntry]) -> FrameAllocator<'a> {
        let info = info(entries);
        FrameAllocator::new(&info, BootFrameAllocator::new(info), phys).expect("frame allocator")
    }

    /// Frames taken at init: the 1 MiB kernel image plus one frame each for
    /// the region table, region states and reference counts.
    const PINNED: u64 = 256 + 3;

    #[test]
    fn boot_allocator_skips_kernel_image() {
        let entries = map(8 * MIB);
        let mut boot = BootFrameAllocator::new(info(&entries));
        assert_eq!(boot.alloc(1).unwrap().as_u64(), 2 * MIB);
        assert_eq!(boot.alloc(0x1800).unwrap().as_u64(), 2 * MIB + 0x1000);
        assert_eq!(boot.consumed(), &[(2 * MIB, 2 * MIB + 0x3000)]);
        assert_eq!(boot.alloc(0), Err(FrameError::InvalidArg));
        assert_eq!(boot.alloc(64 * MIB), Err(FrameError::OutOfMemory));
    }

    #[test]
    fn init_accounts_for_kernel_and_metadata() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);
        assert_eq!(frames.region_count(), 2);

        let stats = frames.stats();
        assert_eq!(stats.total_bytes, 7 * MIB);
        assert_eq!(stats.used_bytes, PINNED * FRAME_SIZE);
        assert_eq!(stats.free_bytes, stats.total_bytes - stats.used_bytes);
        assert_eq!(stats.allocations, 0);
    }

    #[test]
    fn single_frame_round_trip() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);
        let before = frames.stats();

        let pa = frames.alloc_single().unwrap();
        assert_eq!(pa.as_u64(), 2 * MIB + 0x3000);
        assert_eq!(frames.references(pa), 1);
        assert_eq!(frames.stats().used_bytes, before.used_bytes + FRAME_SIZE);

        frames.dereference_single(pa).unwrap();
        assert_eq!(frames.references(pa), 0);
        assert_eq!(frames.stats().used_bytes, before.used_bytes);
        assert_eq!(frames.region_free_frames() * FRAME_SIZE, before.free_bytes);
    }

    #[test]
    fn contiguous_run_spans_adjacent_regions() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let pa = frames.alloc_contiguous(1024).unwrap();
        assert_eq!(pa.as_u64(), 2 * MIB + 0x3000);
        let last = pa + 1023 * FRAME_SIZE;
        assert!(last.as_u64() >= REGION_SIZE);
        assert_eq!(frames.references(last), 1);

        frames.dereference_contiguous(pa, 1024).unwrap();
        assert_eq!(frames.references(last), 0);
        assert_eq!(frames.stats().used_bytes, PINNED * FRAME_SIZE);
    }

    #[test]
    fn aligned_run_starts_on_boundary() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let pa = frames.alloc_contiguous_aligned(512, 2 * MIB).unwrap();
        assert_eq!(pa.as_u64(), 4 * MIB);
        assert_eq!(frames.alloc_contiguous_aligned(1, 3000), Err(FrameError::InvalidArg));
        assert_eq!(frames.alloc_contiguous(0), Err(FrameError::InvalidArg));
    }

    #[test]
    fn reference_counts_saturate() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let pa = frames.reference_single(None).unwrap();
        for _ in 1..MAX_REFERENCES {
            frames.reference_single(Some(pa)).unwrap();
        }
        assert_eq!(frames.references(pa), MAX_REFERENCES);
        assert_eq!(
            frames.reference_single(Some(pa)),
            Err(FrameError::TooManyReferences)
        );
        assert_eq!(frames.references(pa), MAX_REFERENCES);
    }

    #[test]
    fn referencing_a_free_frame_claims_it() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);
        let pa = PhysicalAddress::new(6 * MIB);

        let used = frames.stats().used_bytes;
        frames.reference_single(Some(pa)).unwrap();
        assert_eq!(frames.references(pa), 1);
        assert_eq!(frames.stats().used_bytes, used + FRAME_SIZE);
    }

    #[test]
    fn double_free_is_a_no_op() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let pa = frames.alloc_single().unwrap();
        frames.dereference_single(pa).unwrap();
        let stats = frames.stats();
        frames.dereference_single(pa).unwrap();
        assert_eq!(frames.stats(), stats);
    }

    #[test]
    fn rejects_bad_addresses() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let misaligned = PhysicalAddress::new(2 * MIB + 0x3010);
        let kernel = PhysicalAddress::new(MIB + 0x1000);
        let unmanaged = PhysicalAddress::new(64 * MIB);
        for pa in [misaligned, kernel, unmanaged, PhysicalAddress::zero()] {
            assert_eq!(frames.reference_single(Some(pa)), Err(FrameError::InvalidArg));
            assert_eq!(frames.dereference_single(pa), Err(FrameError::InvalidArg));
            assert_eq!(frames.references(pa), 0);
        }
    }

    #[test]
    fn non_contiguous_rolls_back() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let free = frames.region_free_frames();
        let mut hog = Vec::new();
        for _ in 0..free - 2 {
            hog.push(frames.alloc_single().unwrap());
        }
        let mut out = [PhysicalAddress::zero(); 3];
        assert_eq!(
            frames.alloc_non_contiguous(&mut out),
            Err(FrameError::OutOfMemory)
        );
        assert_eq!(frames.region_free_frames(), 2);

        let mut out = [PhysicalAddress::zero(); 2];
        frames.alloc_non_contiguous(&mut out).unwrap();
        assert_eq!(frames.alloc_single(), Err(FrameError::OutOfMemory));
        frames.dereference_non_contiguous(&out).unwrap();
        frames.dereference_non_contiguous(&hog).unwrap();
        assert_eq!(frames.region_free_frames(), free);
    }

    #[test]
    fn reference_non_contiguous_is_all_or_nothing() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let a = frames.alloc_single().unwrap();
        let b = frames.alloc_single().unwrap();
        let bad = PhysicalAddress::new(MIB);
        assert_eq!(
            frames.reference_non_contiguous(&[a, b, bad]),
            Err(FrameError::InvalidArg)
        );
        assert_eq!((frames.references(a), frames.references(b)), (1, 1));

        frames.reference_non_contiguous(&[a, b]).unwrap();
        assert_eq!((frames.references(a), frames.references(b)), (2, 2));
    }

    #[test]
    fn frame_alloc_trait_drops_one_reference() {
        let phys = TestPhys::with_frames(2048);
        let entries = map(8 * MIB);
        let frames = allocator(&phys, &entries);

        let pa = frames.alloc_4k().unwrap();
        frames.reference_single(Some(pa)).unwrap();
        frames.free_4k(pa);
        assert_eq!(frames.references(pa), 1);
        frames.free_4k(pa);
        assert_eq!(frames.references(pa), 0);
    }
}
