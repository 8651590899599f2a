//! # Kernel Memory Layout and Boot Memory Map
//!
//! Single source of truth for the virtual address-space layout shared by the
//! frame allocator, the address-space code and the kernel heap, plus the
//! memory-map types the boot collaborator hands over once at initialization.
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Unmapped (null guard, < 2 MiB) │
//! USER_SPACE_START      ├─────────────────────────────────┤ 0x0000_0000_0020_0000
//!                       │          User Space             │
//! USER_SPACE_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  Non-canonical hole             │
//! KERNEL_HALF_START     ├─────────────────────────────────┤ 0xffff_8000_0000_0000 (PML4[256])
//!                       │          (unused)               │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │  Higher Half Direct Mapping     │
//! KERNEL_HEAP_START     ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │  Kernel heap reserve            │
//! KERNEL_VM_START       ├─────────────────────────────────┤ 0xffff_c000_4000_0000
//!                       │  Kernel VM window (map/unmap)   │
//! KERNEL_VM_END         ├─────────────────────────────────┤ 0xffff_ff80_0000_0000
//!                       │  Kernel text & data             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything at or above [`KERNEL_HALF_START`](memory::KERNEL_HALF_START)
//! lives behind PML4 entries 256..511, which every address space shares.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
