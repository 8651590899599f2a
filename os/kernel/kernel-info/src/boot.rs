//! # Boot Memory Map
//!
//! The platform collaborator translates whatever the firmware reported (UEFI
//! descriptors, a BootBoot record, an e820 list) into a slice of
//! [`MemoryMapEntry`] before memory management starts.

use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// Classification of a physical range.
///
/// Only [`Usable`](Self::Usable) memory is ever handed out by the frame
/// allocator.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    Usable = 0,
    Reserved = 1,
    /// ACPI tables; reclaimable once the platform code is done with them.
    AcpiReclaimable = 2,
    /// Reported faulty by the firmware.
    Defective = 3,
    /// Occupied by the loaded kernel image.
    KernelImage = 4,
    /// Boot-time structures still in use (boot record, initial page tables).
    BootData = 5,
}

impl MemoryKind {
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "acpi-reclaimable",
            Self::Defective => "defective",
            Self::KernelImage => "kernel",
            Self::BootData => "boot-data",
        }
    }
}

/// One contiguous physical range with a single classification.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::from_len(PhysicalAddress::new(self.base), self.length)
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Highest physical address (exclusive) covered by a usable entry.
#[must_use]
pub fn usable_end(map: &[MemoryMapEntry]) -> u64 {
    map.iter()
        .filter(|e| e.kind.is_usable())
        .map(MemoryMapEntry::end)
        .max()
        .unwrap_or(0)
}
