//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the frame
//! allocator, the page-table mapper and the heap.
//!
//! | Type | Meaning |
//! |----------|----------|
//! | [`PhysicalAddress`] | An address in physical memory (frames, page tables, MMIO). |
//! | [`VirtualAddress`] | An address translated by the page tables. |
//!
//! Both are `#[repr(transparent)]` over `u64`, so mixing them up is a
//! compile-time error while staying zero-cost.
//!
//! ## Page Sizes
//!
//! Alignment helpers are generic over a [`PageSize`] marker:
//!
//! - [`Size4K`]: 4 KiB pages (base granularity, one frame)
//! - [`Size2M`]: 2 MiB huge pages
//! - [`Size1G`]: 1 GiB giant pages
//!
//! ```ignore
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert_eq!(va.align_down::<Size4K>().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

use core::fmt;
use core::hash::Hash;
use core::ops::{Add, AddAssign, Sub};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize: sealed::Sealed + Copy + Eq + Ord + Hash + fmt::Debug {
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
}

/// 2 MiB page (`2_097_152` bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;
}

/// 1 GiB page (`1_073_741_824` bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;
impl sealed::Sealed for Size1G {}
impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;
}

/// Size of one physical frame / base page.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Round `x` up to a multiple of `a` (power of two).
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Round `x` down to a multiple of `a` (power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline(always)]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            #[inline(always)]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline(always)]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline(always)]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Whether the address is aligned to the page size `S`.
            #[inline(always)]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.0 & (S::SIZE - 1) == 0
            }

            /// Base of the `S`-sized page containing this address.
            #[inline(always)]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(align_down(self.0, S::SIZE))
            }

            /// Next `S` boundary at or above this address.
            #[inline(always)]
            #[must_use]
            pub const fn align_up<S: PageSize>(self) -> Self {
                Self(align_up(self.0, S::SIZE))
            }

            /// Offset of this address inside its `S`-sized page.
            #[inline(always)]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> u64 {
                self.0 & (S::SIZE - 1)
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Distance in bytes from `base` to `self`; `None` if `self < base`.
            #[inline]
            #[must_use]
            pub const fn checked_offset_from(self, base: Self) -> Option<u64> {
                self.0.checked_sub(base.0)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline(always)]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline(always)]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<u64> for $name {
            type Output = Self;

            #[inline(always)]
            fn sub(self, rhs: u64) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}0x{:016X}", $prefix, self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{:016X})", stringify!($name), self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

address_type!(
    /// Physical memory address: a frame base, a page table, or an MMIO window.
    PhysicalAddress,
    "pa:"
);

address_type!(
    /// Virtual memory address, translated through the active page tables.
    ///
    /// No canonicality is enforced on construction; use
    /// [`is_canonical`](Self::is_canonical) where it matters.
    VirtualAddress,
    "va:"
);

impl PhysicalAddress {
    /// Index of the 4 KiB frame containing this address.
    #[inline(always)]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0 >> Size4K::SHIFT
    }

    #[inline(always)]
    #[must_use]
    pub const fn from_frame_number(frame: u64) -> Self {
        Self(frame << Size4K::SHIFT)
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    /// Whether bits 63..=48 are a sign extension of bit 47 (48-bit paging).
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_FFFF
    }

    /// Whether the address lies in the upper (kernel) half.
    #[inline]
    #[must_use]
    pub const fn is_higher_half(self) -> bool {
        self.0 & (1 << 63) != 0
    }
}
