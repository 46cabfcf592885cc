//! # Page-Table Mapper
//!
//! [`Mapper`] translates map/unmap/query requests into page-table writes.
//! It owns the kernel [`AddressSpace`]; every operation on an upper-half
//! address is redirected to it (and to its lock), whichever space the caller
//! passed, since the kernel half is shared by all spaces.
//!
//! Missing intermediate levels are allocated from the [`FrameAlloc`] and
//! zeroed on the way down. Clearing or replacing a present leaf is followed
//! by a TLB shoot-down on every CPU that may cache the translation.

use crate::address_space::cpu_bit;
use crate::info::{KERNEL_PML4_START, TEMP_MAP_BASE, TEMP_MAP_SLOTS};
use crate::table::{ENTRIES, Level, PageTable, WALK};
use crate::{AddressSpace, FrameAlloc, MapError, MapFlags, Mmu, PageEntryBits, PhysMapper, Tables};
use core::fmt;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};
use kernel_sync::{Backoff, SpinLock, SpinLockGuard};
use log::{debug, trace, warn};

/// Frames covered by one 2 MiB leaf.
const FRAMES_PER_HUGE: usize = 512;

pub struct Mapper<'m, M: PhysMapper, A: FrameAlloc, U: Mmu> {
    phys: &'m M,
    frames: &'m A,
    mmu: &'m U,
    kernel: AddressSpace,
    temp_slots: [SpinLock<()>; TEMP_MAP_SLOTS],
}

impl<'m, M: PhysMapper, A: FrameAlloc, U: Mmu> Mapper<'m, M, A, U> {
    /// Build a fresh kernel address space.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the root or the kernel-half tables
    /// cannot be allocated.
    pub fn new(phys: &'m M, frames: &'m A, mmu: &'m U) -> Result<Self, MapError> {
        let root = frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
        // SAFETY: a freshly allocated frame is ours alone.
        unsafe { phys.phys_to_mut::<PageTable>(root) }.zero();
        Self::adopt(phys, frames, mmu, root)
    }

    /// Adopt an existing root (e.g. the boot page tables) as the kernel
    /// address space. Missing kernel-half PML4 slots are populated.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a kernel-half table cannot be allocated.
    pub fn adopt(
        phys: &'m M,
        frames: &'m A,
        mmu: &'m U,
        root: PhysicalAddress,
    ) -> Result<Self, MapError> {
        let mapper = Self {
            phys,
            frames,
            mmu,
            kernel: AddressSpace::from_root(root),
            temp_slots: [const { SpinLock::new(()) }; TEMP_MAP_SLOTS],
        };
        mapper.prepare_kernel_half()?;
        debug!(
            "Kernel address space at {} with {} tables",
            root,
            mapper.kernel.table_count()
        );
        Ok(mapper)
    }

    /// The shared kernel address space.
    #[inline]
    pub const fn kernel(&self) -> &AddressSpace {
        &self.kernel
    }

    #[inline]
    pub const fn frames(&self) -> &'m A {
        self.frames
    }

    #[inline]
    pub const fn phys(&self) -> &'m M {
        self.phys
    }

    #[inline]
    pub const fn mmu(&self) -> &'m U {
        self.mmu
    }

    fn prepare_kernel_half(&self) -> Result<(), MapError> {
        let mut tables = self.kernel.lock();
        let pml4 = self.table(self.kernel.root());
        for i in KERNEL_PML4_START..ENTRIES {
            if !pml4.get(i).present() {
                let t = self.new_table()?;
                pml4.set(i, PageEntryBits::table_link(t, false));
                tables.count += 1;
            }
        }

        // The temporary-mapping slots share one page table; create it now so
        // installing a slot never needs a table frame.
        let base = VirtualAddress::new(TEMP_MAP_BASE);
        self.walk_create(self.kernel.root(), &mut tables, base, Level::Pt)?;
        Ok(())
    }

    /// View the table node at `pa`.
    #[allow(clippy::mut_from_ref)]
    fn table<'t>(&self, pa: PhysicalAddress) -> &'t mut PageTable {
        // SAFETY: only frames linked below a root (or freshly allocated for
        // that purpose) are viewed as tables, and every caller holds the lock
        // of the owning address space.
        unsafe { self.phys.phys_to_mut::<PageTable>(pa) }
    }

    fn new_table(&self) -> Result<PhysicalAddress, MapError> {
        let pa = self.frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
        self.table(pa).zero();
        Ok(pa)
    }

    /// Upper-half addresses always resolve through the kernel space.
    #[inline]
    fn space_for<'s>(&'s self, space: &'s AddressSpace, va: VirtualAddress) -> &'s AddressSpace {
        if va.is_higher_half() {
            &self.kernel
        } else {
            space
        }
    }

    fn check_leaf(va: VirtualAddress, pa: PhysicalAddress, huge: bool) -> Result<(), MapError> {
        Self::check_va(va)?;
        if !pa.is_aligned::<Size4K>() {
            return Err(MapError::InvalidArg);
        }
        if huge && !(va.is_aligned::<Size2M>() && pa.is_aligned::<Size2M>()) {
            return Err(MapError::Unsupported);
        }
        Ok(())
    }

    fn check_va(va: VirtualAddress) -> Result<(), MapError> {
        if va.is_canonical() && va.is_aligned::<Size4K>() {
            Ok(())
        } else {
            Err(MapError::InvalidArg)
        }
    }

    /// Walk from `root` to the table holding the `leaf`-level entry of `va`,
    /// creating missing levels.
    fn walk_create<'t>(
        &self,
        root: PhysicalAddress,
        tables: &mut Tables,
        va: VirtualAddress,
        leaf: Level,
    ) -> Result<&'t mut PageTable, MapError> {
        let user = !va.is_higher_half();
        let mut table = self.table(root);
        for level in WALK {
            if level == leaf {
                return Ok(table);
            }
            let i = level.index_of(va);
            let e = table.get(i);
            let next = if e.present() {
                if e.large_page() {
                    return Err(MapError::AlreadyMapped);
                }
                e.physical_address()
            } else if e.allocate_on_reference() {
                return Err(MapError::AlreadyMapped);
            } else {
                let t = self.new_table()?;
                table.set(i, PageEntryBits::table_link(t, user));
                tables.count += 1;
                trace!("Created {} table {} for {}", level.lower().name(), t, va);
                t
            };
            table = self.table(next);
        }
        Ok(table)
    }

    /// Locate the leaf entry of `va`: the PTE, or a PD/PDPT entry when a
    /// large page terminates the walk early. `None` if a level is missing.
    fn walk_find<'t>(
        &self,
        root: PhysicalAddress,
        va: VirtualAddress,
    ) -> Option<(&'t mut PageEntryBits, Level)> {
        let mut table = self.table(root);
        for level in WALK {
            let i = level.index_of(va);
            let e = table.get(i);
            if level == Level::Pt || (level != Level::Pml4 && e.large_page() && e.is_occupied()) {
                return Some((table.entry_mut(i), level));
            }
            if !e.present() {
                return None;
            }
            table = self.table(e.physical_address());
        }
        None
    }

    fn shootdown(&self, space: &AddressSpace, va: VirtualAddress) {
        let me = cpu_bit(self.mmu.current_cpu());
        let kernel = va.is_higher_half();
        let targets = if kernel { u64::MAX } else { space.active_cpus() };
        if kernel || targets & me != 0 {
            self.mmu.flush_local(va);
        }
        let remote = targets & !me;
        if remote != 0 {
            trace!("Shoot-down of {} on CPUs {:#x}", va, remote);
            self.mmu.shootdown(remote, va);
        }
    }

    /// Map one page at `va → pa`.
    ///
    /// With [`MapFlags::ALLOCATE_ON_REFERENCE`] a non-present placeholder
    /// that keeps the permissions is installed instead and `pa` is ignored.
    ///
    /// # Errors
    /// - [`MapError::InvalidArg`] for misaligned or non-canonical addresses.
    /// - [`MapError::Unsupported`] for a [`MapFlags::HUGE`] request not aligned
    ///   to 2 MiB, or a huge placeholder.
    /// - [`MapError::AlreadyMapped`] if the leaf is in use.
    /// - [`MapError::OutOfMemory`] if a table level cannot be allocated.
    pub fn map(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let huge = flags.contains(MapFlags::HUGE);
        Self::check_leaf(va, pa, huge)?;
        if huge && flags.contains(MapFlags::ALLOCATE_ON_REFERENCE) {
            return Err(MapError::Unsupported);
        }
        self.install(space, va, pa, flags, false)
    }

    /// Back a page that is either unmapped or an allocate-on-reference
    /// placeholder. Used by the fault engine.
    ///
    /// # Errors
    /// As [`map`](Self::map); a present leaf yields [`MapError::AlreadyMapped`].
    pub fn populate(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let flags = flags.difference(MapFlags::ALLOCATE_ON_REFERENCE | MapFlags::HUGE);
        Self::check_leaf(va, pa, false)?;
        self.install(space, va, pa, flags, true)
    }

    fn install(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
        over_placeholder: bool,
    ) -> Result<(), MapError> {
        let space = self.space_for(space, va);
        let leaf = if flags.contains(MapFlags::HUGE) {
            Level::Pd
        } else {
            Level::Pt
        };
        let mut tables = space.lock();
        let table = self.walk_create(space.root(), &mut tables, va, leaf)?;
        let i = leaf.index_of(va);
        let e = table.get(i);
        if e.present() || (e.is_occupied() && !over_placeholder) {
            return Err(MapError::AlreadyMapped);
        }
        table.set(i, PageEntryBits::leaf(pa, flags));
        trace!("Mapped {} -> {} ({:?})", va, pa, flags);
        Ok(())
    }

    /// Clear the leaf of `va` and shoot down its translation.
    ///
    /// Returns the physical page and flags that were mapped. For an
    /// allocate-on-reference placeholder the address is null and the flags
    /// lack [`MapFlags::PRESENT`]. Frame ownership stays with the caller.
    ///
    /// # Errors
    /// [`MapError::InvalidArg`] for misaligned addresses,
    /// [`MapError::NotMapped`] if nothing is mapped at `va`.
    pub fn unmap(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
    ) -> Result<(PhysicalAddress, MapFlags), MapError> {
        Self::check_va(va)?;
        let space = self.space_for(space, va);
        let old = {
            let _tables = space.lock();
            let (entry, level) = self
                .walk_find(space.root(), va)
                .ok_or(MapError::NotMapped)?;
            if !entry.is_occupied() {
                return Err(MapError::NotMapped);
            }
            match level {
                Level::Pd if !va.is_aligned::<Size2M>() => return Err(MapError::InvalidArg),
                Level::Pdpt => return Err(MapError::Unsupported),
                _ => {}
            }
            let old = *entry;
            *entry = PageEntryBits::new();
            old
        };
        if old.present() {
            self.shootdown(space, va);
            trace!("Unmapped {} (was {})", va, old.physical_address());
            Ok((old.physical_address(), old.map_flags()))
        } else {
            Ok((PhysicalAddress::zero(), old.map_flags()))
        }
    }

    /// Replace the present leaf of `va` with `pa`/`flags` and shoot down the
    /// old translation. Returns what was mapped before.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if no present leaf exists at `va`.
    pub fn remap(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(PhysicalAddress, MapFlags), MapError> {
        Self::check_leaf(va, pa, false)?;
        let space = self.space_for(space, va);
        let old = {
            let _tables = space.lock();
            let (entry, level) = self
                .walk_find(space.root(), va)
                .ok_or(MapError::NotMapped)?;
            if !entry.present() {
                return Err(MapError::NotMapped);
            }
            if level != Level::Pt {
                return Err(MapError::Unsupported);
            }
            let old = *entry;
            *entry = PageEntryBits::leaf(pa, flags.difference(MapFlags::ALLOCATE_ON_REFERENCE));
            old
        };
        self.shootdown(space, va);
        trace!("Remapped {} {} -> {}", va, old.physical_address(), pa);
        Ok((old.physical_address(), old.map_flags()))
    }

    /// Translate `va` and report the leaf's flags.
    ///
    /// For an allocate-on-reference placeholder the address is null and the
    /// flags lack [`MapFlags::PRESENT`].
    ///
    /// # Errors
    /// [`MapError::InvalidArg`] for a non-canonical address,
    /// [`MapError::NotMapped`] otherwise.
    pub fn query(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
    ) -> Result<(PhysicalAddress, MapFlags), MapError> {
        if !va.is_canonical() {
            return Err(MapError::InvalidArg);
        }
        let space = self.space_for(space, va);
        let _tables = space.lock();
        let (entry, level) = self
            .walk_find(space.root(), va)
            .ok_or(MapError::NotMapped)?;
        let e = *entry;
        if !e.is_occupied() {
            return Err(MapError::NotMapped);
        }
        if !e.present() {
            return Ok((PhysicalAddress::zero(), e.map_flags()));
        }
        let offset = match level {
            Level::Pt => va.offset::<Size4K>(),
            Level::Pd => va.offset::<Size2M>(),
            Level::Pdpt => va.offset::<Size1G>(),
            Level::Pml4 => 0,
        };
        Ok((e.physical_address() + offset, e.map_flags()))
    }

    /// Diagnostic walk of `va`, one entry per level visited.
    pub fn walk(&self, space: &AddressSpace, va: VirtualAddress) -> Walk {
        let space = self.space_for(space, va);
        let _tables = space.lock();
        let mut walk = Walk {
            va,
            root: space.root(),
            entries: [None; 4],
        };
        let mut table = self.table(space.root());
        for (k, level) in WALK.into_iter().enumerate() {
            let e = table.get(level.index_of(va));
            walk.entries[k] = Some(e);
            if !e.present() || level == Level::Pt || (level != Level::Pml4 && e.large_page()) {
                break;
            }
            table = self.table(e.physical_address());
        }
        walk
    }

    /// Map `pa` at one of the temporary kernel slots with the permissions
    /// in `flags`. The slot is released when the returned guard drops.
    ///
    /// A caller must not request a second temporary mapping while holding
    /// one; use [`map_temporary_pair`](Self::map_temporary_pair) instead.
    ///
    /// # Errors
    /// [`MapError::InvalidArg`] for a misaligned frame, or for `flags`
    /// asking for user access or anything beyond page permissions.
    pub fn map_temporary(
        &self,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<TemporaryMapping<'_, M, A, U>, MapError> {
        let flags = temporary_flags(flags)?;
        let mut backoff = Backoff::new();
        loop {
            for (slot, lock) in self.temp_slots.iter().enumerate() {
                if let Some(guard) = lock.try_lock() {
                    return self.install_temporary(slot, guard, pa, flags);
                }
            }
            backoff.spin();
        }
    }

    /// Map two frames at once (e.g. source and target of a page copy):
    /// `from` read-only, `to` writable.
    ///
    /// # Errors
    /// [`MapError::InvalidArg`] for a misaligned frame.
    pub fn map_temporary_pair(
        &self,
        from: PhysicalAddress,
        to: PhysicalAddress,
    ) -> Result<(TemporaryMapping<'_, M, A, U>, TemporaryMapping<'_, M, A, U>), MapError> {
        // Fixed slot order; single mappings never wait while holding a slot.
        let g0 = self.temp_slots[0].lock();
        let g1 = self.temp_slots[1].lock();
        let a = self.install_temporary(0, g0, from, MapFlags::PRESENT)?;
        let b = self.install_temporary(1, g1, to, MapFlags::KERNEL_RW)?;
        Ok((a, b))
    }

    fn install_temporary<'a>(
        &'a self,
        slot: usize,
        guard: SpinLockGuard<'a, ()>,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<TemporaryMapping<'a, M, A, U>, MapError> {
        let va = VirtualAddress::new(TEMP_MAP_BASE + (slot as u64) * Size4K::SIZE);
        self.map(&self.kernel, va, pa, flags)?;
        Ok(TemporaryMapping {
            mapper: self,
            va,
            pa,
            flags,
            _slot: guard,
        })
    }

    /// Fill the frame at `pa` with zeros.
    ///
    /// # Errors
    /// See [`map_temporary`](Self::map_temporary).
    pub fn zero_frame(&self, pa: PhysicalAddress) -> Result<(), MapError> {
        let mut m = self.map_temporary(pa, MapFlags::KERNEL_RW)?;
        m.bytes_mut().fill(0);
        Ok(())
    }

    /// Copy the contents of frame `src` into frame `dst`.
    ///
    /// # Errors
    /// See [`map_temporary_pair`](Self::map_temporary_pair).
    pub fn copy_frame(&self, src: PhysicalAddress, dst: PhysicalAddress) -> Result<(), MapError> {
        let (from, mut to) = self.map_temporary_pair(src, dst)?;
        to.bytes_mut().copy_from_slice(from.bytes());
        Ok(())
    }

    /// Create a new address space sharing the kernel half.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for the root.
    pub fn create_address_space(&self) -> Result<AddressSpace, MapError> {
        let root = self.new_table()?;
        let src = self.table(self.kernel.root());
        let dst = self.table(root);
        {
            let _kernel = self.kernel.lock();
            for i in KERNEL_PML4_START..ENTRIES {
                dst.set(i, src.get(i));
            }
        }
        debug!("Created address space {}", root);
        Ok(AddressSpace::from_root(root))
    }

    /// Tear down a user address space: drop one reference to every present
    /// user leaf, then free the user-half tables and the root.
    ///
    /// The space must not be active on any CPU.
    pub fn free_address_space(&self, space: AddressSpace) {
        debug_assert!(!space.is_active(), "freeing an active address space");
        let mut released = Released::default();
        {
            let _tables = space.lock();
            let pml4 = self.table(space.root());
            for i in 0..KERNEL_PML4_START {
                let e = pml4.get(i);
                if e.present() {
                    self.free_subtree(e.physical_address(), Level::Pdpt, &mut released);
                    pml4.set(i, PageEntryBits::new());
                }
            }
        }
        self.frames.free_4k(space.root());
        debug!(
            "Freed address space {}: {} frames, {} tables",
            space.root(),
            released.frames,
            released.tables + 1
        );
    }

    fn free_subtree(&self, table_pa: PhysicalAddress, level: Level, released: &mut Released) {
        let table = self.table(table_pa);
        for i in 0..ENTRIES {
            let e = table.get(i);
            if !e.present() {
                continue;
            }
            match level {
                Level::Pt => {
                    self.frames.free_4k(e.physical_address());
                    released.frames += 1;
                }
                Level::Pd if e.large_page() => {
                    self.frames.free_contiguous(e.physical_address(), FRAMES_PER_HUGE);
                    released.frames += FRAMES_PER_HUGE;
                }
                Level::Pdpt if e.large_page() => {
                    warn!("Leaving 1 GiB leaf at {} in place", e.physical_address());
                }
                _ => self.free_subtree(e.physical_address(), level.lower(), released),
            }
        }
        self.frames.free_4k(table_pa);
        released.tables += 1;
    }

    /// Make `next` the active space of this CPU.
    ///
    /// # Safety
    /// `next` must have been created by this mapper (so its kernel half maps
    /// the executing code) and must outlive its activation.
    pub unsafe fn switch_to(&self, prev: Option<&AddressSpace>, next: &AddressSpace) {
        let cpu = self.mmu.current_cpu();
        if let Some(prev) = prev {
            if core::ptr::eq(prev, next) {
                return;
            }
            prev.mark_inactive(cpu);
        }
        next.mark_active(cpu);
        // SAFETY: forwarded from the caller.
        unsafe { self.mmu.load_root(next.root()) };
        trace!("CPU {} switched to {}", cpu, next.root());
    }
}

/// Leaf flags for a temporary slot: kernel only, permissions only.
fn temporary_flags(flags: MapFlags) -> Result<MapFlags, MapError> {
    let extra = flags.difference(MapFlags::PRESENT.union(flags.permissions()));
    if flags.contains(MapFlags::USER) || !extra.is_empty() {
        return Err(MapError::InvalidArg);
    }
    Ok(flags.permissions() | MapFlags::PRESENT)
}

#[derive(Default)]
struct Released {
    frames: usize,
    tables: usize,
}

/// A frame mapped at a temporary kernel slot; unmapped on drop.
pub struct TemporaryMapping<'a, M: PhysMapper, A: FrameAlloc, U: Mmu> {
    mapper: &'a Mapper<'a, M, A, U>,
    va: VirtualAddress,
    pa: PhysicalAddress,
    flags: MapFlags,
    _slot: SpinLockGuard<'a, ()>,
}

impl<M: PhysMapper, A: FrameAlloc, U: Mmu> TemporaryMapping<'_, M, A, U> {
    #[inline]
    pub const fn va(&self) -> VirtualAddress {
        self.va
    }

    #[inline]
    pub const fn pa(&self) -> PhysicalAddress {
        self.pa
    }

    pub fn bytes(&self) -> &[u8] {
        let ptr = self.mapper.phys.mapped_ptr(self.va, self.pa);
        // SAFETY: the slot maps exactly one frame and is exclusively ours.
        unsafe { core::slice::from_raw_parts(ptr, Size4K::SIZE as usize) }
    }

    #[inline]
    pub const fn flags(&self) -> MapFlags {
        self.flags
    }

    /// # Panics
    /// If the slot was mapped without [`MapFlags::WRITABLE`].
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        assert!(
            self.flags.contains(MapFlags::WRITABLE),
            "temporary mapping {} is read-only",
            self.va
        );
        let ptr = self.mapper.phys.mapped_ptr(self.va, self.pa);
        // SAFETY: as above; `&mut self` rules out a second view.
        unsafe { core::slice::from_raw_parts_mut(ptr, Size4K::SIZE as usize) }
    }
}

impl<M: PhysMapper, A: FrameAlloc, U: Mmu> Drop for TemporaryMapping<'_, M, A, U> {
    fn drop(&mut self) {
        if let Err(e) = self.mapper.unmap(&self.mapper.kernel, self.va) {
            warn!("Releasing temporary mapping {} failed: {}", self.va, e);
        }
    }
}

/// Entries visited while translating one address.
#[derive(Copy, Clone, Debug)]
pub struct Walk {
    pub va: VirtualAddress,
    pub root: PhysicalAddress,
    /// PML4E, PDPTE, PDE, PTE; `None` below where the walk stopped.
    pub entries: [Option<PageEntryBits>; 4],
}

impl fmt::Display for Walk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "walk {} (root {})", self.va, self.root)?;
        for (level, entry) in WALK.iter().zip(self.entries.iter()) {
            let Some(e) = entry else { break };
            write!(
                f,
                " {}[{}]={:#018x}",
                level.name(),
                level.index_of(self.va),
                e.into_bits()
            )?;
        }
        Ok(())
    }
}
