//! # Virtual Regions
//!
//! Each address space records the ranges it handed out as [`VirtualRegion`]s
//! in a [`RegionTracker`], an ordered map keyed by start address. The fault
//! handler looks regions up by containing address; explicit frees look them
//! up by exact start.

use crate::MemoryError;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::MapFlags;

/// Source of file contents for demand-paged file mappings.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; fewer than requested means end of file.
    ///
    /// # Errors
    /// Whatever the file system reports.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, MemoryError>;
}

/// Device-specific population of a region's pages.
pub trait PagePopulator: Send + Sync {
    /// A frame to map as-is for the page at byte `offset` of the region.
    ///
    /// Such frames belong to the device: they are not referenced when mapped
    /// nor dereferenced when unmapped.
    fn physical_frame(&self, _offset: u64) -> Option<PhysicalAddress> {
        None
    }

    /// Fill a freshly allocated page for byte `offset` of the region.
    ///
    /// # Errors
    /// Device-specific.
    fn fill(&self, _offset: u64, page: &mut [u8]) -> Result<(), MemoryError> {
        page.fill(0);
        Ok(())
    }
}

/// Pages read as zero on first touch.
#[derive(Debug, Default, Copy, Clone)]
pub struct ZeroFill;

impl PagePopulator for ZeroFill {}

/// Pages map straight onto a window of physical memory, e.g. a framebuffer.
#[derive(Debug, Copy, Clone)]
pub struct PhysicalWindow {
    pub base: PhysicalAddress,
}

impl PagePopulator for PhysicalWindow {
    fn physical_frame(&self, offset: u64) -> Option<PhysicalAddress> {
        self.base.checked_add(offset)
    }
}

/// How the pages of a region come into existence.
#[derive(Clone, Default)]
pub enum RegionBacking {
    /// Anonymous memory, allocated eagerly or on reference.
    #[default]
    Plain,
    File {
        file: Arc<dyn BackingFile>,
        /// File offset of the region's first byte.
        offset: u64,
    },
    Custom(Arc<dyn PagePopulator>),
}

impl fmt::Debug for RegionBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("Plain"),
            Self::File { offset, .. } => f.debug_struct("File").field("offset", offset).finish_non_exhaustive(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VirtualRegion {
    pub start: VirtualAddress,
    /// Length in bytes.
    pub size: u64,
    pub flags: MapFlags,
    pub backing: RegionBacking,
    pub name: Option<String>,
}

impl VirtualRegion {
    #[must_use]
    pub const fn new(start: VirtualAddress, size: u64, flags: MapFlags) -> Self {
        Self {
            start,
            size,
            flags,
            backing: RegionBacking::Plain,
            name: None,
        }
    }

    #[must_use]
    pub fn backed_by(mut self, backing: RegionBacking) -> Self {
        self.backing = backing;
        self
    }

    #[must_use]
    pub fn named(mut self, name: Option<&str>) -> Self {
        self.name = name.map(String::from);
        self
    }

    /// First address past the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64().saturating_add(self.size))
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end()
    }
}

impl fmt::Display for VirtualRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{} {:?} {}",
            self.start,
            self.end(),
            self.flags,
            self.name.as_deref().unwrap_or("<anon>")
        )
    }
}

/// Non-overlapping regions of one address space.
#[derive(Debug, Default)]
pub struct RegionTracker {
    regions: BTreeMap<u64, VirtualRegion>,
}

impl RegionTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Record `region`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArg`] for an empty or wrapping region,
    /// [`MemoryError::AlreadyMapped`] if it overlaps a recorded one.
    pub fn insert(&mut self, region: VirtualRegion) -> Result<(), MemoryError> {
        let start = region.start.as_u64();
        let end = start
            .checked_add(region.size)
            .filter(|_| region.size != 0)
            .ok_or(MemoryError::InvalidArg)?;
        if let Some((_, prev)) = self.regions.range(..=start).next_back()
            && prev.end().as_u64() > start
        {
            return Err(MemoryError::AlreadyMapped);
        }
        if let Some((&next, _)) = self.regions.range(start..).next()
            && next < end
        {
            return Err(MemoryError::AlreadyMapped);
        }
        self.regions.insert(start, region);
        Ok(())
    }

    /// The region covering `va`.
    pub fn find_containing(&self, va: VirtualAddress) -> Option<&VirtualRegion> {
        self.regions
            .range(..=va.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(va))
    }

    /// The region starting exactly at `va`.
    pub fn find_exact(&self, va: VirtualAddress) -> Option<&VirtualRegion> {
        self.regions.get(&va.as_u64())
    }

    pub fn remove(&mut self, va: VirtualAddress) -> Option<VirtualRegion> {
        self.regions.remove(&va.as_u64())
    }

    /// Regions in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &VirtualRegion> + '_ {
        self.regions.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, size: u64) -> VirtualRegion {
        VirtualRegion::new(VirtualAddress::new(start), size, MapFlags::USER_RW)
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut t = RegionTracker::new();
        t.insert(region(0x10_000, 0x4000)).unwrap();

        for (start, size) in [(0x10_000, 0x1000), (0xF_000, 0x2000), (0x13_000, 0x1000), (0x8_000, 0x20_000)] {
            assert_eq!(t.insert(region(start, size)), Err(MemoryError::AlreadyMapped));
        }
        t.insert(region(0xF_000, 0x1000)).unwrap();
        t.insert(region(0x14_000, 0x1000)).unwrap();
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn empty_or_wrapping_regions_are_invalid() {
        let mut t = RegionTracker::new();
        assert_eq!(t.insert(region(0x1000, 0)), Err(MemoryError::InvalidArg));
        assert_eq!(t.insert(region(u64::MAX - 0xFFF, 0x2000)), Err(MemoryError::InvalidArg));
        assert!(t.is_empty());
    }

    #[test]
    fn lookups() {
        let mut t = RegionTracker::new();
        t.insert(region(0x40_0000, 0x3000).named(Some("text"))).unwrap();
        t.insert(region(0x80_0000, 0x1000)).unwrap();

        let hit = t.find_containing(VirtualAddress::new(0x40_2FFF)).unwrap();
        assert_eq!(hit.name.as_deref(), Some("text"));
        assert!(t.find_containing(VirtualAddress::new(0x40_3000)).is_none());
        assert!(t.find_containing(VirtualAddress::new(0x3F_FFFF)).is_none());

        assert!(t.find_exact(VirtualAddress::new(0x40_1000)).is_none());
        assert!(t.find_exact(VirtualAddress::new(0x80_0000)).is_some());

        let starts: Vec<u64> = t.iter().map(|r| r.start.as_u64()).collect();
        assert_eq!(starts, [0x40_0000, 0x80_0000]);
        assert!(t.remove(VirtualAddress::new(0x40_0000)).is_some());
        assert!(t.find_containing(VirtualAddress::new(0x40_0000)).is_none());
    }

    #[test]
    fn physical_window_offsets_frames() {
        let fb = PhysicalWindow {
            base: PhysicalAddress::new(0xE000_0000),
        };
        assert_eq!(fb.physical_frame(0x2000), Some(PhysicalAddress::new(0xE000_2000)));
        let mut page = [0xFFu8; 16];
        ZeroFill.fill(0, &mut page).unwrap();
        assert_eq!(page, [0; 16]);
    }
}
