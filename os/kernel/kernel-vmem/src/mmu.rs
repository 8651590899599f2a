//! The hardware seam: loading a root into CR3 and invalidating TLBs.
//!
//! Address spaces never execute privileged instructions themselves; they go
//! through an [`Mmu`], which lets the page-table logic run unchanged in
//! hosted tests against a recording double.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualRange};

/// Which CPUs must drop cached translations for a range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShootdownTarget {
    /// Only the calling CPU.
    Local,
    /// Every CPU; used for the kernel half, which all roots share.
    AllCpus,
    /// Every CPU whose active root is this PML4.
    CpusUsing(PhysicalPage<Size4K>),
}

/// CPU memory-management operations the address-space code depends on.
pub trait Mmu: Sync {
    /// Make `root` the active PML4 on the calling CPU.
    ///
    /// # Safety
    /// `root` must map the currently executing kernel code, data and stack,
    /// i.e. share the kernel half with the kernel address space.
    unsafe fn load_root(&self, root: PhysicalPage<Size4K>);

    /// The PML4 currently active on the calling CPU.
    fn active_root(&self) -> PhysicalPage<Size4K>;

    /// Invalidate cached translations for `range` on the CPUs selected by
    /// `target`. Returns once every targeted CPU has done so.
    fn invalidate(&self, target: ShootdownTarget, range: VirtualRange);
}

/// The CR3 register without PCIDs: the active PML4 and its cache policy.
#[bitfield(u64)]
pub struct Cr3 {
    #[bits(3)]
    pub reserved_low: u8,
    pub pwt: bool,
    pub pcd: bool,
    #[bits(7)]
    pub reserved_mid: u8,
    #[bits(40)]
    pml4_base_4k: u64,

    #[bits(12)]
    pub reserved_high: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with write-back PML4 accesses.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_pml4_base_4k(root.base().as_u64() >> 12)
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing_address(PhysicalAddress::new(self.pml4_base_4k() << 12))
    }
}

#[cfg(target_arch = "x86_64")]
pub use x86::{RemoteShootdown, X86Mmu};

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::{Cr3, Mmu, ShootdownTarget};
    use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualRange};
    use kernel_sync::SyncOnceCell;

    /// Delivers an invalidation to other CPUs and waits for their
    /// acknowledgement. Installed by the interrupt code once IPIs work.
    pub type RemoteShootdown = fn(ShootdownTarget, VirtualRange);

    /// The real MMU: `mov cr3`, `invlpg`, plus a pluggable IPI hook.
    pub struct X86Mmu {
        remote: SyncOnceCell<RemoteShootdown>,
    }

    impl Default for X86Mmu {
        fn default() -> Self {
            Self::new()
        }
    }

    impl X86Mmu {
        #[must_use]
        pub const fn new() -> Self {
            Self {
                remote: SyncOnceCell::new(),
            }
        }

        /// Register the cross-CPU invalidation path. Until this is called
        /// only the local TLB is flushed, which is correct while a single
        /// CPU runs.
        ///
        /// # Errors
        /// Returns the hook back if one was already registered.
        pub fn set_remote_shootdown(&self, hook: RemoteShootdown) -> Result<(), RemoteShootdown> {
            self.remote.set(hook).map(|_| ())
        }

        /// Longer ranges are flushed wholesale instead of page by page.
        const INVLPG_LIMIT: u64 = 64;

        fn flush(range: VirtualRange) {
            if range.pages() > Self::INVLPG_LIMIT {
                Self::flush_all();
            } else {
                Self::invlpg(range);
            }
        }

        /// Toggle `CR4.PGE` twice; any change to it drops every TLB entry,
        /// global ones included.
        fn flush_all() {
            const PGE: u64 = 1 << 7;
            let cr4: u64;
            unsafe {
                core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
                core::arch::asm!("mov cr4, {}", in(reg) cr4 ^ PGE, options(nostack, preserves_flags));
                core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
            }
        }

        #[inline]
        fn invlpg(range: VirtualRange) {
            for page in range.iter_pages() {
                unsafe {
                    core::arch::asm!(
                        "invlpg [{}]",
                        in(reg) page.base().as_u64(),
                        options(nostack, preserves_flags)
                    );
                }
            }
        }
    }

    impl Mmu for X86Mmu {
        unsafe fn load_root(&self, root: PhysicalPage<Size4K>) {
            let cr3 = Cr3::from_root(root).into_bits();
            unsafe {
                core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
            }
        }

        fn active_root(&self) -> PhysicalPage<Size4K> {
            let cr3: u64;
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            }
            Cr3::from_bits(cr3).root()
        }

        fn invalidate(&self, target: ShootdownTarget, range: VirtualRange) {
            match target {
                ShootdownTarget::Local => Self::flush(range),
                ShootdownTarget::AllCpus => {
                    Self::flush(range);
                    if let Some(remote) = self.remote.get() {
                        remote(target, range);
                    }
                }
                ShootdownTarget::CpusUsing(root) => {
                    if self.active_root() == root {
                        Self::flush(range);
                    }
                    if let Some(remote) = self.remote.get() {
                        remote(target, range);
                    }
                }
            }
        }
    }
}
