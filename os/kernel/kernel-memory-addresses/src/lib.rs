//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses, page bases and address ranges
//! used by the frame allocator, the page-table code and the heap.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory, MMIO and page-table frames. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated addresses. |
//! | [`PhysicalRange`] / [`VirtualRange`] | Half-open `[start, end)` byte ranges. |
//!
//! The page size is carried at the type level by [`Size4K`] or [`Size2M`],
//! so a 4 KiB frame can never be confused with a 2 MiB one.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert_eq!(page.base() + va.offset::<Size4K>(), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod address;
mod page;
mod page_size;
mod range;

pub use address::{PhysicalAddress, VirtualAddress};
pub use page::{PhysicalPage, VirtualPage};
pub use page_size::{PageSize, Size2M, Size4K};
pub use range::{PhysicalRange, VirtualRange};

/// Round `v` down to a multiple of `align` (a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    v & !(align - 1)
}

/// Round `v` up to a multiple of `align` (a power of two), `None` on overflow.
#[inline(always)]
#[must_use]
pub const fn align_up(v: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match v.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let va = VirtualAddress::new(0x1234_5678_9ABC);
        let page = va.page::<Size4K>();
        assert_eq!(page.base().as_u64(), 0x1234_5678_9000);
        assert_eq!(va.offset::<Size4K>(), 0xABC);
        assert_eq!(page.base() + va.offset::<Size4K>(), va);
    }

    #[test]
    fn split_and_join_2m() {
        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        let page = pa.page::<Size2M>();
        assert_eq!(page.base().as_u64() & (Size2M::SIZE - 1), 0);
        assert_eq!(page.base() + pa.offset::<Size2M>(), pa);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x2000, 0x1000), Some(0x2000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
    }

    #[test]
    fn frame_index_round_trip() {
        let pa = PhysicalAddress::new(0x10_3000);
        assert_eq!(pa.frame_index(), 0x103);
        assert_eq!(PhysicalPage::<Size4K>::from_frame_index(0x103).base(), pa);
    }
}
