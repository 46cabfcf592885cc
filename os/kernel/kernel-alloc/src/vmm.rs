//! # Virtual Memory Manager
//!
//! [`Vmm`] ties the frame allocator and the page-table [`Mapper`] to the
//! per-space [`RegionTracker`]s. It is what process creation, the ELF loader
//! and device drivers talk to:
//!
//! - [`Vmm::create_space`] / [`Vmm::destroy_space`] for process lifetime,
//! - [`Vmm::allocate`] / [`Vmm::free`] (and their kernel variants) for
//!   anonymous memory, eager or allocate-on-reference,
//! - [`Vmm::map_file`] / [`Vmm::map_custom`] for demand-paged file and device
//!   regions,
//! - [`Vmm::fork_region`] to share a region copy-on-write,
//! - [`Vmm::handle_page_fault`] to resolve faults against all of the above.
//!
//! Lock order: a space's region lock is taken before any page-table lock.

pub mod fault;
pub mod regions;

use crate::MemoryError;
use crate::frame_alloc::FrameAllocator;
use crate::heap::{HeapBackend, HeapError};
use alloc::sync::Arc;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M, Size4K, VirtualAddress};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::info::USERSPACE_END;
use kernel_vmem::{AddressSpace, MapError, MapFlags, Mapper, Mmu, PhysMapper};
use log::{debug, trace, warn};
use regions::{BackingFile, PagePopulator, RegionBacking, RegionTracker, VirtualRegion};

/// Frames behind one 2 MiB leaf.
const FRAMES_PER_HUGE: usize = (Size2M::SIZE / Size4K::SIZE) as usize;

/// A user address space together with its regions.
pub struct VmSpace {
    aspace: AddressSpace,
    regions: SpinLock<RegionTracker>,
}

impl VmSpace {
    #[inline]
    pub const fn address_space(&self) -> &AddressSpace {
        &self.aspace
    }

    /// Take the region lock of this space.
    pub fn regions(&self) -> SpinLockGuard<'_, RegionTracker> {
        self.regions.lock()
    }
}

impl core::fmt::Debug for VmSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmSpace")
            .field("aspace", &self.aspace)
            .finish_non_exhaustive()
    }
}

pub struct Vmm<'m, M: PhysMapper, U: Mmu> {
    frames: &'m FrameAllocator<'m>,
    mapper: Mapper<'m, M, FrameAllocator<'m>, U>,
    kernel_regions: SpinLock<RegionTracker>,
}

impl<'m, M: PhysMapper, U: Mmu> Vmm<'m, M, U> {
    /// Build a fresh kernel address space.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the kernel half cannot be populated.
    pub fn new(phys: &'m M, frames: &'m FrameAllocator<'m>, mmu: &'m U) -> Result<Self, MemoryError> {
        let mapper = Mapper::new(phys, frames, mmu)?;
        Ok(Self::with_mapper(frames, mapper))
    }

    /// Take over the page tables rooted at `root` (e.g. the boot tables).
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the kernel half cannot be populated.
    pub fn adopt(
        phys: &'m M,
        frames: &'m FrameAllocator<'m>,
        mmu: &'m U,
        root: PhysicalAddress,
    ) -> Result<Self, MemoryError> {
        let mapper = Mapper::adopt(phys, frames, mmu, root)?;
        Ok(Self::with_mapper(frames, mapper))
    }

    const fn with_mapper(frames: &'m FrameAllocator<'m>, mapper: Mapper<'m, M, FrameAllocator<'m>, U>) -> Self {
        Self {
            frames,
            mapper,
            kernel_regions: SpinLock::new(RegionTracker::new()),
        }
    }

    #[inline]
    pub const fn frames(&self) -> &'m FrameAllocator<'m> {
        self.frames
    }

    #[inline]
    pub const fn mapper(&self) -> &Mapper<'m, M, FrameAllocator<'m>, U> {
        &self.mapper
    }

    #[inline]
    pub const fn kernel_space(&self) -> &AddressSpace {
        self.mapper.kernel()
    }

    /// Take the region lock of the kernel space.
    pub fn kernel_regions(&self) -> SpinLockGuard<'_, RegionTracker> {
        self.kernel_regions.lock()
    }

    /// Create an empty user address space sharing the kernel half.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if no frame is left for the root.
    pub fn create_space(&self) -> Result<VmSpace, MemoryError> {
        Ok(VmSpace {
            aspace: self.mapper.create_address_space()?,
            regions: SpinLock::new(RegionTracker::new()),
        })
    }

    /// Release every region of `space`, then its page tables.
    ///
    /// The space must not be active on any CPU.
    pub fn destroy_space(&self, space: VmSpace) {
        let VmSpace { aspace, regions } = space;
        let mut regions = regions.into_inner();
        let starts: alloc::vec::Vec<_> = regions.iter().map(|r| r.start).collect();
        for start in starts {
            if let Some(region) = regions.remove(start) {
                self.release(&aspace, &region);
            }
        }
        self.mapper.free_address_space(aspace);
    }

    /// Make `next` the active space of this CPU.
    ///
    /// # Safety
    /// See [`Mapper::switch_to`].
    pub unsafe fn switch_to(&self, prev: Option<&VmSpace>, next: &VmSpace) {
        // SAFETY: forwarded.
        unsafe {
            self.mapper
                .switch_to(prev.map(VmSpace::address_space), &next.aspace);
        }
    }

    /// Reserve `[va, va + size)` in the user half of `space`.
    ///
    /// Without [`MapFlags::ALLOCATE_ON_REFERENCE`] every page is backed by a
    /// zeroed frame right away; with it, pages are backed on first touch.
    /// [`MapFlags::HUGE`] backs the range with 2 MiB leaves.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArg`] for a misaligned, empty or non-user range.
    /// - [`MemoryError::Unsupported`] for a huge range not 2 MiB aligned, or
    ///   a huge allocate-on-reference range.
    /// - [`MemoryError::AlreadyMapped`] if the range overlaps a region.
    /// - [`MemoryError::OutOfMemory`]; nothing stays mapped in that case.
    pub fn allocate(
        &self,
        space: &VmSpace,
        va: VirtualAddress,
        size: u64,
        flags: MapFlags,
    ) -> Result<(), MemoryError> {
        check_user_range(va, size)?;
        self.allocate_in(&space.aspace, &space.regions, VirtualRegion::new(va, size, flags))
    }

    /// Reserve `[va, va + size)` in the kernel half; see [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate); [`MapFlags::USER`] is
    /// [`MemoryError::InvalidArg`].
    pub fn allocate_kernel(&self, va: VirtualAddress, size: u64, flags: MapFlags) -> Result<(), MemoryError> {
        check_kernel_range(va, size, flags)?;
        let region = VirtualRegion::new(va, size, flags);
        self.allocate_in(self.kernel_space(), &self.kernel_regions, region)
    }

    fn allocate_in(
        &self,
        aspace: &AddressSpace,
        regions: &SpinLock<RegionTracker>,
        region: VirtualRegion,
    ) -> Result<(), MemoryError> {
        let flags = region.flags;
        if flags.contains(MapFlags::HUGE) {
            if flags.contains(MapFlags::ALLOCATE_ON_REFERENCE) {
                return Err(MemoryError::Unsupported);
            }
            if !region.start.is_aligned::<Size2M>() || !region.size.is_multiple_of(Size2M::SIZE) {
                return Err(MemoryError::Unsupported);
            }
        }

        let mut regions = regions.lock();
        let (start, end) = (region.start, region.end());
        regions.insert(region)?;
        if flags.contains(MapFlags::ALLOCATE_ON_REFERENCE) {
            debug!("Reserved {start}..{end} for allocation on reference");
            return Ok(());
        }

        let leaf = (flags | MapFlags::PRESENT).difference(MapFlags::COPY_ON_WRITE);
        let mut va = start;
        while va < end {
            if let Err(e) = self.back_page(aspace, va, leaf) {
                warn!("Allocating {start}..{end} failed at {va}: {e}");
                if let Some(region) = regions.remove(start) {
                    self.release(aspace, &region);
                }
                return Err(e);
            }
            va += if flags.contains(MapFlags::HUGE) {
                Size2M::SIZE
            } else {
                Size4K::SIZE
            };
        }
        debug!("Allocated {start}..{end} ({flags:?})");
        Ok(())
    }

    /// Map zeroed memory at `va`: one frame, or a 2 MiB run for huge leaves.
    fn back_page(&self, aspace: &AddressSpace, va: VirtualAddress, flags: MapFlags) -> Result<(), MemoryError> {
        if flags.contains(MapFlags::HUGE) {
            let pa = self
                .frames
                .alloc_contiguous_aligned(FRAMES_PER_HUGE, Size2M::SIZE)?;
            let mapped = (0..FRAMES_PER_HUGE as u64)
                .try_for_each(|i| self.mapper.zero_frame(pa + i * Size4K::SIZE))
                .and_then(|()| self.mapper.map(aspace, va, pa, flags));
            if let Err(e) = mapped {
                if let Err(err) = self.frames.dereference_contiguous(pa, FRAMES_PER_HUGE) {
                    warn!("Dropping huge page {pa} failed: {err}");
                }
                return Err(e.into());
            }
        } else {
            let pa = self.frames.reference_single(None)?;
            let mapped = self
                .mapper
                .zero_frame(pa)
                .and_then(|()| self.mapper.map(aspace, va, pa, flags));
            if let Err(e) = mapped {
                self.unwind_frame(pa);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Release the user region that starts at `va` and spans exactly `size`
    /// bytes, dropping the references its pages held.
    ///
    /// # Errors
    /// [`MemoryError::NotMapped`] if no region starts at `va`,
    /// [`MemoryError::InvalidArg`] if its size differs.
    pub fn free(&self, space: &VmSpace, va: VirtualAddress, size: u64) -> Result<(), MemoryError> {
        check_user_range(va, size)?;
        self.free_in(&space.aspace, &space.regions, va, size)
    }

    /// Kernel-half counterpart of [`free`](Self::free).
    ///
    /// # Errors
    /// As [`free`](Self::free).
    pub fn free_kernel(&self, va: VirtualAddress, size: u64) -> Result<(), MemoryError> {
        check_kernel_range(va, size, MapFlags::empty())?;
        self.free_in(self.kernel_space(), &self.kernel_regions, va, size)
    }

    fn free_in(
        &self,
        aspace: &AddressSpace,
        regions: &SpinLock<RegionTracker>,
        va: VirtualAddress,
        size: u64,
    ) -> Result<(), MemoryError> {
        let mut regions = regions.lock();
        let found = regions.find_exact(va).ok_or(MemoryError::NotMapped)?;
        if found.size != size {
            return Err(MemoryError::InvalidArg);
        }
        let Some(region) = regions.remove(va) else {
            return Err(MemoryError::NotMapped);
        };
        self.release(aspace, &region);
        debug!("Freed {region}");
        Ok(())
    }

    /// Unmap every page of `region`. Frames lent by a device populator are
    /// left alone; all others lose one reference.
    /// Drop the reference a failed operation took on frame `pa`.
    fn unwind_frame(&self, pa: PhysicalAddress) {
        if let Err(e) = self.frames.dereference_single(pa) {
            warn!("Dropping frame {pa} failed: {e}");
        }
    }

    fn release(&self, aspace: &AddressSpace, region: &VirtualRegion) {
        let huge = region.flags.contains(MapFlags::HUGE);
        let step = if huge { Size2M::SIZE } else { Size4K::SIZE };
        let mut va = region.start;
        while va < region.end() {
            match self.mapper.unmap(aspace, va) {
                Ok((pa, flags)) if flags.contains(MapFlags::PRESENT) => {
                    let offset = va.as_u64() - region.start.as_u64();
                    if region_lends(region, offset) == Some(pa) {
                        trace!("Left device frame {pa} at {va}");
                    } else if flags.contains(MapFlags::HUGE) {
                        if let Err(e) = self.frames.dereference_contiguous(pa, FRAMES_PER_HUGE) {
                            warn!("Releasing huge page {pa} at {va} failed: {e}");
                        }
                    } else if let Err(e) = self.frames.dereference_single(pa) {
                        warn!("Releasing frame {pa} at {va} failed: {e}");
                    }
                }
                Ok(_) | Err(MapError::NotMapped) => {}
                Err(e) => warn!("Unmapping {va} failed: {e}"),
            }
            va += step;
        }
    }

    /// Register `[va, va + size)` of `space` as a demand-paged view of
    /// `file` starting at byte `offset`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArg`] for a misaligned or non-user range,
    /// [`MemoryError::Unsupported`] for huge or copy-on-write flags,
    /// [`MemoryError::AlreadyMapped`] on overlap.
    #[allow(clippy::too_many_arguments)]
    pub fn map_file(
        &self,
        space: &VmSpace,
        va: VirtualAddress,
        size: u64,
        flags: MapFlags,
        file: Arc<dyn BackingFile>,
        offset: u64,
        name: Option<&str>,
    ) -> Result<(), MemoryError> {
        let backing = RegionBacking::File { file, offset };
        self.map_backed(space, va, size, flags, backing, name)
    }

    /// Register `[va, va + size)` of `space` as populated by `populator` on
    /// first touch.
    ///
    /// # Errors
    /// As [`map_file`](Self::map_file).
    pub fn map_custom(
        &self,
        space: &VmSpace,
        va: VirtualAddress,
        size: u64,
        flags: MapFlags,
        populator: Arc<dyn PagePopulator>,
        name: Option<&str>,
    ) -> Result<(), MemoryError> {
        self.map_backed(space, va, size, flags, RegionBacking::Custom(populator), name)
    }

    fn map_backed(
        &self,
        space: &VmSpace,
        va: VirtualAddress,
        size: u64,
        flags: MapFlags,
        backing: RegionBacking,
        name: Option<&str>,
    ) -> Result<(), MemoryError> {
        check_user_range(va, size)?;
        if flags.intersects(MapFlags::HUGE | MapFlags::COPY_ON_WRITE) {
            return Err(MemoryError::Unsupported);
        }
        let region = VirtualRegion::new(va, size, flags.difference(MapFlags::ALLOCATE_ON_REFERENCE))
            .backed_by(backing)
            .named(name);
        trace!("Registered {region} ({:?})", region.backing);
        space.regions.lock().insert(region)
    }

    /// Share the region starting at `va` of `src` with `dst`.
    ///
    /// Present pages end up mapped in both spaces; writable ones become
    /// read-only and copy-on-write in both, so the first write on either side
    /// forks a private copy. Pages not yet backed are backed independently
    /// on each side.
    ///
    /// # Errors
    /// - [`MemoryError::NotMapped`] if `src` has no region at `va`.
    /// - [`MemoryError::Unsupported`] for huge or device-populated regions.
    /// - [`MemoryError::AlreadyMapped`] if `dst` overlaps the region.
    /// - [`MemoryError::OutOfMemory`]; `dst` is left without the region.
    pub fn fork_region(&self, src: &VmSpace, dst: &VmSpace, va: VirtualAddress) -> Result<(), MemoryError> {
        if core::ptr::eq(src, dst) {
            return Err(MemoryError::InvalidArg);
        }
        // Region locks in address order.
        let (src_regions, mut dst_regions) = if core::ptr::from_ref(src) < core::ptr::from_ref(dst) {
            let s = src.regions.lock();
            (s, dst.regions.lock())
        } else {
            let d = dst.regions.lock();
            (src.regions.lock(), d)
        };
        let region = src_regions.find_exact(va).ok_or(MemoryError::NotMapped)?.clone();
        if region.flags.contains(MapFlags::HUGE) || matches!(region.backing, RegionBacking::Custom(_)) {
            return Err(MemoryError::Unsupported);
        }
        dst_regions.insert(region.clone())?;

        let mut page = region.start;
        while page < region.end() {
            if let Err(e) = self.share_page(&src.aspace, &dst.aspace, page) {
                warn!("Forking {region} failed at {page}: {e}");
                if let Some(r) = dst_regions.remove(region.start) {
                    self.release(&dst.aspace, &r);
                }
                return Err(e);
            }
            page += Size4K::SIZE;
        }
        debug!("Forked {region} from {} to {}", src.aspace.root(), dst.aspace.root());
        Ok(())
    }

    fn share_page(&self, src: &AddressSpace, dst: &AddressSpace, page: VirtualAddress) -> Result<(), MemoryError> {
        let (pa, flags) = match self.mapper.query(src, page) {
            Ok(found) => found,
            Err(MapError::NotMapped) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !flags.contains(MapFlags::PRESENT) {
            return Ok(());
        }
        let shared = if flags.intersects(MapFlags::WRITABLE | MapFlags::COPY_ON_WRITE) {
            flags.difference(MapFlags::WRITABLE) | MapFlags::COPY_ON_WRITE
        } else {
            flags
        };
        if shared != flags {
            self.mapper.remap(src, page, pa, shared)?;
        }
        self.frames.reference_single(Some(pa))?;
        if let Err(e) = self.mapper.map(dst, page, pa, shared) {
            self.unwind_frame(pa);
            return Err(e.into());
        }
        Ok(())
    }
}

/// The frame a device populator lends for byte `offset` of `region`.
fn region_lends(region: &VirtualRegion, offset: u64) -> Option<PhysicalAddress> {
    match &region.backing {
        RegionBacking::Custom(p) => p.physical_frame(offset),
        _ => None,
    }
}

fn check_user_range(va: VirtualAddress, size: u64) -> Result<(), MemoryError> {
    let end = va.as_u64().checked_add(size).ok_or(MemoryError::InvalidArg)?;
    if size == 0 || !va.is_aligned::<Size4K>() || !size.is_multiple_of(Size4K::SIZE) || end > USERSPACE_END {
        return Err(MemoryError::InvalidArg);
    }
    Ok(())
}

fn check_kernel_range(va: VirtualAddress, size: u64, flags: MapFlags) -> Result<(), MemoryError> {
    va.as_u64().checked_add(size).ok_or(MemoryError::InvalidArg)?;
    if size == 0
        || !va.is_aligned::<Size4K>()
        || !size.is_multiple_of(Size4K::SIZE)
        || !va.is_higher_half()
        || flags.contains(MapFlags::USER)
    {
        return Err(MemoryError::InvalidArg);
    }
    Ok(())
}

/// Backs the kernel heap window with frames mapped into the kernel space.
pub struct VmmHeapBackend<'v, 'm, M: PhysMapper, U: Mmu> {
    vmm: &'v Vmm<'m, M, U>,
    window: VirtualAddress,
}

impl<'v, 'm, M: PhysMapper, U: Mmu> VmmHeapBackend<'v, 'm, M, U> {
    #[must_use]
    pub const fn new(vmm: &'v Vmm<'m, M, U>, window: VirtualAddress) -> Self {
        Self { vmm, window }
    }
}

impl<M: PhysMapper, U: Mmu> HeapBackend for VmmHeapBackend<'_, '_, M, U> {
    fn map_page(&self, offset: usize) -> Result<(), HeapError> {
        let va = self.window + offset as u64;
        let pa = self
            .vmm
            .frames
            .reference_single(None)
            .map_err(|_| HeapError::OutOfMemory)?;
        if let Err(e) = self.vmm.mapper.map(self.vmm.kernel_space(), va, pa, MapFlags::KERNEL_RW) {
            warn!("Backing heap page {va} failed: {e}");
            self.vmm.unwind_frame(pa);
            return Err(HeapError::OutOfMemory);
        }
        Ok(())
    }

    fn unmap_page(&self, offset: usize) {
        let va = self.window + offset as u64;
        match self.vmm.mapper.unmap(self.vmm.kernel_space(), va) {
            Ok((pa, _)) => {
                if let Err(e) = self.vmm.frames.dereference_single(pa) {
                    warn!("Releasing heap frame {pa} failed: {e}");
                }
            }
            Err(e) => warn!("Unmapping heap page {va} failed: {e}"),
        }
    }
}
