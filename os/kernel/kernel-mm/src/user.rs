use crate::{frames, kernel_space, mmu, not_initialized};
use kernel_alloc::HhdmPhysMapper;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinMutex;
use kernel_vmem::{
    AddressSpace, FatalFault, FaultAccess, Permissions, Placement, Resolved, VmError, VmObject,
};

/// The address space of one task.
///
/// Shares the kernel half with the kernel address space. Every region and
/// page table of the user half is returned when the value is dropped, which
/// must not happen while it is active on any CPU.
pub struct UserSpace {
    space: SpinMutex<AddressSpace<HhdmPhysMapper>>,
}

impl UserSpace {
    /// # Errors
    /// - [`VmError::OutOfMemory`] if the root table cannot be allocated.
    /// - [`VmError::InvalidArgument`] before [`init`](crate::init).
    pub fn new() -> Result<Self, VmError> {
        let (kernel, mut frames) = kernel_space().zip(frames()).ok_or_else(not_initialized)?;
        let window = crate::layout().user_window;
        let space = AddressSpace::new_user(&*kernel.lock_irq(), window, &mut frames)?;
        Ok(Self {
            space: SpinMutex::new(space),
        })
    }

    #[must_use]
    pub fn root(&self) -> PhysicalPage<Size4K> {
        self.space.lock_irq().root()
    }

    /// Map `pages` pages of `object`. See [`AddressSpace::map`].
    ///
    /// The region is always accessible from ring 3.
    ///
    /// # Errors
    /// As [`AddressSpace::map`].
    pub fn map(
        &self,
        placement: Placement,
        pages: u64,
        perms: Permissions,
        object: VmObject,
    ) -> Result<VirtualAddress, VmError> {
        let mut frames = frames().ok_or_else(not_initialized)?;
        self.space
            .lock_irq()
            .map(placement, pages, perms.with_user(true), object, &mut frames)
    }

    /// # Errors
    /// As [`AddressSpace::unmap`].
    pub fn unmap(&self, base: VirtualAddress) -> Result<(), VmError> {
        let (mut frames, mmu) = frames().zip(mmu()).ok_or_else(not_initialized)?;
        self.space.lock_irq().unmap(base, &mut frames, mmu)
    }

    /// Load this space on the calling CPU.
    pub fn switch_to(&self) {
        if let Some(mmu) = mmu() {
            self.space.lock_irq().switch_to(mmu);
        }
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.lock_irq().translate(va)
    }

    pub(crate) fn handle_fault(&self, va: VirtualAddress, access: FaultAccess) -> Result<Resolved, FatalFault> {
        let Some(mut frames) = frames() else {
            return Err(FatalFault {
                address: va,
                access,
                reason: kernel_vmem::FaultReason::OutOfMemory,
            });
        };
        self.space.lock_irq().handle_page_fault(va, access, &mut frames)
    }
}

impl Drop for UserSpace {
    fn drop(&mut self) {
        let Some((mut frames, mmu)) = frames().zip(mmu()) else {
            return;
        };
        if let Err(e) = self.space.get_mut().destroy(&mut frames, mmu) {
            log::warn!("user address space teardown failed: {e}");
        }
    }
}
