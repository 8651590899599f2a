//! # HHDM-based PhysMapper
//!
//! With a higher-half direct map every physical address `pa` is visible at
//! `offset + pa`, so reaching a page table or a fresh frame is one addition.
//! The offset defaults to [`HHDM_BASE`]; bootloaders that choose their own
//! (Limine reports it at runtime) go through [`HhdmPhysMapper::with_offset`].

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// The HHDM must cover every physical address handed to it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl HhdmPhysMapper {
    /// Mapper for the compile-time [`HHDM_BASE`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_offset(HHDM_BASE)
    }

    #[must_use]
    pub const fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Virtual address of `pa` inside the direct map.
    #[inline]
    #[must_use]
    pub const fn virtual_address(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        self.virtual_address(pa).as_mut_ptr()
    }
}
