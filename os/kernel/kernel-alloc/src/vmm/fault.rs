//! # Page-Fault Resolution
//!
//! [`Vmm::handle_page_fault`] decides, in a fixed order, whether a fault is
//! a legitimate first touch or a violation:
//!
//! 1. user-mode access to a kernel-only page is fatal;
//! 2. a missing page of a file or device region is populated from it;
//! 3. a missing page of an allocate-on-reference region (or placeholder) is
//!    backed by a zeroed frame;
//! 4. a write to a present copy-on-write page gets a private frame, or the
//!    existing one if nothing else references it;
//! 5. everything else is fatal.
//!
//! The region lock of the faulting space is held for the whole resolution.

use super::regions::{RegionBacking, VirtualRegion};
use super::{VmSpace, Vmm};
use crate::MemoryError;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, MapError, MapFlags, Mmu, PhysMapper};
use log::{error, trace};
use thiserror::Error;

/// x86-64 page-fault error code.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped or not yet backed)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// What the CPU reported: the faulting address (CR2) and the error code.
#[derive(Copy, Clone, Debug)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, error: PageFaultError) -> Self {
        Self { address, error }
    }
}

/// Register snapshot taken by the trap entry code.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
#[allow(missing_docs)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RIP={:#018x} CS={:#06x} RFLAGS={:#018x}", self.rip, self.cs, self.rflags)?;
        writeln!(f, "RSP={:#018x} SS={:#06x} RBP={:#018x}", self.rsp, self.ss, self.rbp)?;
        writeln!(f, "RAX={:#018x} RBX={:#018x} RCX={:#018x}", self.rax, self.rbx, self.rcx)?;
        writeln!(f, "RDX={:#018x} RSI={:#018x} RDI={:#018x}", self.rdx, self.rsi, self.rdi)?;
        writeln!(f, "R8 ={:#018x} R9 ={:#018x} R10={:#018x}", self.r8, self.r9, self.r10)?;
        writeln!(f, "R11={:#018x} R12={:#018x} R13={:#018x}", self.r11, self.r12, self.r13)?;
        write!(f, "R14={:#018x} R15={:#018x}", self.r14, self.r15)
    }
}

/// How a fault was resolved; the faulting instruction can be retried.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultResolution {
    /// A zeroed frame now backs the page.
    DemandZero,
    /// The page was read from the region's file.
    FilePopulated,
    /// The region's populator provided the page.
    CustomPopulated,
    /// The page is writable again; `copied` if a private frame was made.
    CopyOnWrite { copied: bool },
    /// Another CPU resolved the fault first.
    AlreadyResolved,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultDisposition {
    /// The faulting user process must not continue.
    TerminateProcess,
    /// A kernel-mode fault could not be resolved.
    HaltSystem,
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("unresolvable page fault: {reason}")]
pub struct FatalFault {
    pub disposition: FaultDisposition,
    pub reason: &'static str,
}

impl<M: PhysMapper, U: Mmu> Vmm<'_, M, U> {
    /// Resolve a page fault against the regions of `current` (the user space
    /// running on this CPU, if any) or of the kernel.
    ///
    /// # Errors
    /// [`FatalFault`] when the access is a violation or cannot be served;
    /// a diagnostic has been logged by then.
    pub fn handle_page_fault(
        &self,
        current: Option<&VmSpace>,
        fault: &PageFault,
        regs: &TrapFrame,
    ) -> Result<FaultResolution, FatalFault> {
        let resolved = self.resolve(current, fault);
        match resolved {
            Ok(how) => {
                trace!("Resolved fault at {} as {:?}", fault.address, how);
                Ok(how)
            }
            Err(reason) => {
                self.report(current, fault, regs, reason);
                Err(FatalFault {
                    disposition: if fault.error.user() {
                        FaultDisposition::TerminateProcess
                    } else {
                        FaultDisposition::HaltSystem
                    },
                    reason,
                })
            }
        }
    }

    fn resolve(&self, current: Option<&VmSpace>, fault: &PageFault) -> Result<FaultResolution, &'static str> {
        let addr = fault.address;
        let error = fault.error;
        if !addr.is_canonical() {
            return Err("non-canonical address");
        }
        if error.reserved_bit() {
            return Err("reserved bit set in a paging structure");
        }
        if error.user() && addr.is_higher_half() {
            return Err("user access to kernel address");
        }

        let (aspace, regions) = if addr.is_higher_half() {
            (self.kernel_space(), &self.kernel_regions)
        } else {
            let space = current.ok_or("user address without an address space")?;
            (&space.aspace, &space.regions)
        };
        let regions = regions.lock();
        let region = regions.find_containing(addr);
        let page = addr.align_down::<Size4K>();
        let entry = match self.mapper.query(aspace, page) {
            Ok(found) => Some(found),
            Err(MapError::NotMapped) => None,
            Err(_) => return Err("page-table walk failed"),
        };

        if error.user() {
            if entry.is_some_and(|(_, f)| !f.contains(MapFlags::USER)) {
                return Err("user access to supervisor page");
            }
            if region.is_some_and(|r| !r.flags.contains(MapFlags::USER)) {
                return Err("user access to kernel-only region");
            }
        }

        match entry {
            Some((pa, flags)) if flags.contains(MapFlags::PRESENT) => self.resolve_present(fault, aspace, page, pa, flags),
            _ => self.resolve_missing(fault, aspace, region, page, entry.map(|(_, f)| f)),
        }
    }

    fn resolve_missing(
        &self,
        fault: &PageFault,
        aspace: &AddressSpace,
        region: Option<&VirtualRegion>,
        page: VirtualAddress,
        placeholder: Option<MapFlags>,
    ) -> Result<FaultResolution, &'static str> {
        let flags = match (region, placeholder) {
            (Some(r), _) => r.flags,
            (None, Some(f)) => f,
            (None, None) => return Err("access to unmapped address"),
        };
        if fault.error.write() && !flags.contains(MapFlags::WRITABLE) {
            return Err("write to non-writable region");
        }
        if fault.error.instruction_fetch() && !flags.contains(MapFlags::EXECUTABLE) {
            return Err("instruction fetch from non-executable region");
        }
        let leaf = flags.permissions() | MapFlags::PRESENT;

        if let Some(r) = region {
            let offset = page.as_u64() - r.start.as_u64();
            match &r.backing {
                RegionBacking::File { file, offset: base } => {
                    let pa = self.fresh_frame(|bytes| {
                        let n = file.read_at(base + offset, bytes)?;
                        let n = n.min(bytes.len());
                        bytes[n..].fill(0);
                        Ok(())
                    })?;
                    return self.install(aspace, page, pa, leaf, true, FaultResolution::FilePopulated);
                }
                RegionBacking::Custom(populator) => {
                    if let Some(pa) = populator.physical_frame(offset) {
                        return self.install(aspace, page, pa, leaf, false, FaultResolution::CustomPopulated);
                    }
                    let pa = self.fresh_frame(|bytes| populator.fill(offset, bytes))?;
                    return self.install(aspace, page, pa, leaf, true, FaultResolution::CustomPopulated);
                }
                RegionBacking::Plain => {}
            }
        }

        if flags.contains(MapFlags::ALLOCATE_ON_REFERENCE) {
            let pa = self
                .frames
                .reference_single(None)
                .map_err(|_| "out of memory")?;
            if self.mapper.zero_frame(pa).is_err() {
                self.unwind_frame(pa);
                return Err("cannot zero frame");
            }
            return self.install(aspace, page, pa, leaf, true, FaultResolution::DemandZero);
        }
        Err("access to unmapped page")
    }

    /// A referenced frame filled by `fill` through a temporary mapping.
    fn fresh_frame(
        &self,
        fill: impl FnOnce(&mut [u8]) -> Result<(), MemoryError>,
    ) -> Result<PhysicalAddress, &'static str> {
        let pa = self
            .frames
            .reference_single(None)
            .map_err(|_| "out of memory")?;
        let filled = match self.mapper.map_temporary(pa, MapFlags::KERNEL_RW) {
            Ok(mut window) => fill(window.bytes_mut()).map_err(|_| "populating the page failed"),
            Err(_) => Err("cannot map frame"),
        };
        if let Err(reason) = filled {
            self.unwind_frame(pa);
            return Err(reason);
        }
        Ok(pa)
    }

    fn install(
        &self,
        aspace: &AddressSpace,
        page: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
        owned: bool,
        how: FaultResolution,
    ) -> Result<FaultResolution, &'static str> {
        let result = self.mapper.populate(aspace, page, pa, flags);
        if result.is_err() && owned {
            self.unwind_frame(pa);
        }
        match result {
            Ok(()) => Ok(how),
            Err(MapError::AlreadyMapped) => Ok(FaultResolution::AlreadyResolved),
            Err(_) => Err("cannot map page"),
        }
    }

    fn resolve_present(
        &self,
        fault: &PageFault,
        aspace: &AddressSpace,
        page: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<FaultResolution, &'static str> {
        if !fault.error.present() {
            return Ok(FaultResolution::AlreadyResolved);
        }
        if !fault.error.write() {
            return Err("protection violation");
        }
        if flags.contains(MapFlags::WRITABLE) {
            return Ok(FaultResolution::AlreadyResolved);
        }
        if !flags.contains(MapFlags::COPY_ON_WRITE) {
            return Err("write to read-only page");
        }

        let writable = flags.difference(MapFlags::COPY_ON_WRITE) | MapFlags::WRITABLE;
        if self.frames.references(pa) == 1 {
            self.mapper
                .remap(aspace, page, pa, writable)
                .map_err(|_| "cannot remap page")?;
            return Ok(FaultResolution::CopyOnWrite { copied: false });
        }

        let copy = self
            .frames
            .reference_single(None)
            .map_err(|_| "out of memory")?;
        let forked = self
            .mapper
            .copy_frame(pa, copy)
            .and_then(|()| self.mapper.remap(aspace, page, copy, writable));
        if forked.is_err() {
            self.unwind_frame(copy);
            return Err("cannot copy page");
        }
        self.unwind_frame(pa);
        Ok(FaultResolution::CopyOnWrite { copied: true })
    }

    fn report(&self, current: Option<&VmSpace>, fault: &PageFault, regs: &TrapFrame, reason: &str) {
        let aspace = current.map_or(self.kernel_space(), VmSpace::address_space);
        error!(
            "PAGE FAULT at {} ({} mode): {}",
            fault.address,
            if fault.error.user() { "user" } else { "kernel" },
            reason
        );
        error!(
            "error code {:#x}: {}",
            fault.error.into_bits(),
            fault.error.explain()
        );
        error!("{:?}", fault.error);
        error!("{}", self.mapper.walk(aspace, fault.address));
        error!("{regs}");
    }
}
