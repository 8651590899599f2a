use crate::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

macro_rules! page_type {
    ($(#[$meta:meta])* $name:ident, $addr:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name<S: PageSize> {
            base: $addr,
            size: PhantomData<S>,
        }

        impl<S: PageSize> $name<S> {
            /// The page containing `addr`.
            #[inline]
            #[must_use]
            pub const fn containing_address(addr: $addr) -> Self {
                Self {
                    base: $addr::new(addr.as_u64() & !S::MASK),
                    size: PhantomData,
                }
            }

            /// `None` unless `addr` is a page boundary.
            #[inline]
            #[must_use]
            pub const fn from_base(addr: $addr) -> Option<Self> {
                if addr.is_aligned::<S>() {
                    Some(Self::containing_address(addr))
                } else {
                    None
                }
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                self.base
            }

            /// One past the last byte of the page.
            #[inline]
            #[must_use]
            pub const fn end(self) -> $addr {
                $addr::new(self.base.as_u64() + S::SIZE)
            }

            /// The page `n` pages further up.
            #[inline]
            #[must_use]
            pub const fn add(self, n: u64) -> Self {
                Self::containing_address($addr::new(self.base.as_u64() + n * S::SIZE))
            }

            /// Pages from `earlier` up to this one.
            #[inline]
            #[must_use]
            pub const fn pages_since(self, earlier: Self) -> u64 {
                (self.base.as_u64() - earlier.base.as_u64()) >> S::SHIFT
            }
        }

        impl<S: PageSize> fmt::Debug for $name<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "{}({:#x})"), S::NAME, self.base.as_u64())
            }
        }
    };
}

page_type!(
    /// A physical frame of size `S`.
    PhysicalPage,
    PhysicalAddress,
    "Frame"
);

page_type!(
    /// A virtual page of size `S`.
    VirtualPage,
    VirtualAddress,
    "Page"
);

/// Frames are also addressed by index, the unit of the frame bitmap.
impl PhysicalPage<Size4K> {
    #[inline]
    #[must_use]
    pub const fn from_frame_index(index: u64) -> Self {
        Self::containing_address(PhysicalAddress::new(index << Size4K::SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> u64 {
        self.base.frame_index()
    }
}
