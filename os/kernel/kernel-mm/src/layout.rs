use kernel_info::memory::{KERNEL_HEAP_GROWTH, kernel_heap_reserve, kernel_window, user_window};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualRange};
use utils_accessors_derive::Setters;

/// Where the kernel heap gets its memory from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeapSource {
    /// A reserved range of the kernel half. Pages are mapped into the kernel
    /// address space as the heap grows.
    OnDemand(VirtualRange),
    /// Memory that is already mapped and owned by the heap, e.g. a static
    /// `.bss` arena. Growth only moves the committed mark.
    Premapped(VirtualRange),
}

impl HeapSource {
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        match self {
            Self::OnDemand(r) | Self::Premapped(r) => *r,
        }
    }
}

/// Runtime layout handed to [`init`](crate::init).
///
/// [`Default`] matches the compile-time layout in `kernel_info::memory`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Setters)]
pub struct KernelLayout {
    /// Window for [`map_kernel`](crate::map_kernel) without a fixed address.
    pub kernel_window: VirtualRange,
    /// Window of every [`UserSpace`](crate::UserSpace).
    pub user_window: VirtualRange,
    pub heap: HeapSource,
    /// Minimum number of bytes the heap commits when it grows.
    pub heap_growth: u64,
    /// PML4 to adopt as the kernel root instead of building a fresh one,
    /// usually the one the loader left in CR3.
    #[setters(into)]
    pub adopt_root: Option<PhysicalPage<Size4K>>,
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelLayout {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kernel_window: kernel_window(),
            user_window: user_window(),
            heap: HeapSource::OnDemand(kernel_heap_reserve()),
            heap_growth: KERNEL_HEAP_GROWTH,
            adopt_root: None,
        }
    }
}
