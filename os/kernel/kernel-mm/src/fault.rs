//! # Page-fault routing
//!
//! The interrupt stub reads CR2 and the error code the CPU pushed and calls
//! [`handle_page_fault`]. Kernel-half addresses go to the kernel address
//! space, everything else to the user space of the interrupted task.
//!
//! An unresolvable fault taken in kernel mode on kernel memory is a kernel
//! bug and panics (after every lock has been released). Any other fatal
//! fault is handed back as [`FaultOutcome::Terminate`] so the caller can
//! kill the offending task.

use crate::UserSpace;
use bitfield_struct::bitfield;
use kernel_info::memory::KERNEL_HALF_START;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AccessKind, FatalFault, FaultAccess, FaultReason, Resolved};

/// Page-fault error code (Intel SDM Vol. 3A, §6.15, "Page-Fault Exception").
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read, 1 = write.
    pub write: bool,
    /// The access was made in ring 3.
    pub user: bool,
    /// A paging-structure entry had a reserved bit set.
    pub reserved_bit: bool,
    /// Instruction fetch (NX violation or SMEP).
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultErrorCode {
    /// The access the faulting instruction attempted.
    #[must_use]
    pub const fn access(&self) -> FaultAccess {
        let kind = if self.instruction_fetch() {
            AccessKind::Execute
        } else if self.write() {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        FaultAccess {
            kind,
            user: self.user(),
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "reserved bit set in a paging structure"
        } else if !self.present() {
            "non-present page"
        } else if self.instruction_fetch() {
            "instruction fetch on a protected page"
        } else if self.write() {
            "write to a protected page"
        } else {
            "read of a protected page"
        }
    }
}

/// What the interrupted context should do next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The page is mapped; retry the instruction.
    Resolved(Resolved),
    /// The task that faulted must be terminated.
    Terminate(FatalFault),
}

/// Resolve a page fault at `cr2`.
///
/// `user` is the address space of the interrupted task, if it has one.
///
/// # Panics
/// If a kernel-mode access to kernel memory (or to user memory while no user
/// space is active) cannot be resolved.
pub fn handle_page_fault(cr2: u64, code: PageFaultErrorCode, user: Option<&UserSpace>) -> FaultOutcome {
    let address = VirtualAddress::new(cr2);
    let access = code.access();

    let in_kernel_half = cr2 >= KERNEL_HALF_START;
    let result = if code.reserved_bit() {
        Err(FatalFault {
            address,
            access,
            reason: FaultReason::AccessViolation,
        })
    } else if in_kernel_half {
        crate::resolve_kernel_fault(address, access)
    } else if let Some(space) = user {
        space.handle_fault(address, access)
    } else {
        Err(FatalFault {
            address,
            access,
            reason: FaultReason::NoRegion,
        })
    };

    match result {
        Ok(resolved) => FaultOutcome::Resolved(resolved),
        Err(fatal) if access.user || (!in_kernel_half && user.is_some()) => {
            log::warn!("terminating task: {fatal} ({})", code.explain());
            FaultOutcome::Terminate(fatal)
        }
        Err(fatal) => {
            log::error!("kernel page fault: {fatal} ({}, code {:#x})", code.explain(), code.into_bits());
            panic!("unrecoverable kernel page fault at {address:?}: {}", fatal.reason);
        }
    }
}
