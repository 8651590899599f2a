use core::fmt::Debug;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// A page size supported by the page-table code.
///
/// Only [`Size4K`] and [`Size2M`] implement it.
pub trait PageSize: sealed::Sealed + Copy + Ord + Hash + Debug {
    /// log2 of the size in bytes.
    const SHIFT: u32;
    const SIZE: u64 = 1 << Self::SHIFT;
    /// The in-page offset bits.
    const MASK: u64 = Self::SIZE - 1;
    /// How many 4 KiB frames one page spans.
    const FRAMES: u64 = Self::SIZE >> Size4K::SHIFT;
    /// Short name used in `Debug` output.
    const NAME: &'static str;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;

/// Large page mapped by a PD entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;

impl sealed::Sealed for Size4K {}
impl sealed::Sealed for Size2M {}

impl PageSize for Size4K {
    const SHIFT: u32 = 12;
    const NAME: &'static str = "4K";
}

impl PageSize for Size2M {
    const SHIFT: u32 = 21;
    const NAME: &'static str = "2M";
}

const _: () = assert!(Size2M::FRAMES == 512 && Size4K::SIZE == 4096);
