use crate::{PageSize, PhysicalPage, Size4K, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Operations shared by both address spaces.
macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $page:ident, $tag:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// The page of size `S` containing this address.
            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page::containing_address(self)
            }

            /// Byte offset into the containing page of size `S`.
            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> u64 {
                self.0 & S::MASK
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.0 & S::MASK == 0
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, bytes: u64) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(raw) => Some(Self(raw)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn checked_sub(self, bytes: u64) -> Option<Self> {
                match self.0.checked_sub(bytes) {
                    Some(raw) => Some(Self(raw)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({:#018x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, bytes: u64) -> Self {
                Self(self.0 + bytes)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, bytes: u64) {
                self.0 += bytes;
            }
        }

        /// Distance in bytes.
        impl Sub for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: Self) -> u64 {
                self.0 - rhs.0
            }
        }
    };
}

address_type!(
    /// A physical memory address.
    ///
    /// Only the frame allocator, the page-table walker and the physical mapper
    /// should ever need to look at one of these.
    PhysicalAddress,
    PhysicalPage,
    "pa"
);

address_type!(
    /// A virtual memory address.
    ///
    /// Canonical form is not enforced on construction. Code that accepts
    /// addresses from outside (fault handlers, map hints) checks
    /// [`is_canonical`](Self::is_canonical) itself.
    VirtualAddress,
    VirtualPage,
    "va"
);

impl PhysicalAddress {
    /// Index of the 4 KiB frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> u64 {
        self.0 >> Size4K::SHIFT
    }
}

impl VirtualAddress {
    /// Number of implemented address bits with 4-level paging.
    pub const BITS: u32 = 48;

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Bits 63..48 replicate bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.canonicalize().0 == self.0
    }

    /// Sign-extend bit 47 into the upper bits.
    #[inline]
    #[must_use]
    pub const fn canonicalize(self) -> Self {
        let shift = u64::BITS - Self::BITS;
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let raw = (((self.0 << shift) as i64) >> shift) as u64;
        Self(raw)
    }

    /// Whether the address lies in the upper (kernel) half.
    #[inline]
    #[must_use]
    pub const fn is_upper_half(self) -> bool {
        self.0 >> (Self::BITS - 1) != 0
    }
}
