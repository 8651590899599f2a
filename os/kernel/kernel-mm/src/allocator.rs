//! The kernel's `GlobalAlloc`, backed by the growable heap.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut};

/// Routes `alloc`/`dealloc` to the kernel heap.
///
/// Returns null until [`init`](crate::init) has run and whenever the heap
/// cannot grow any further.
pub struct KernelAllocator;

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        crate::allocate(layout.size(), layout.align()).map_or(null_mut(), ptr::NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let result = unsafe { crate::free(ptr) };
        debug_assert!(result.is_ok(), "invalid dealloc of {ptr:p}");
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}
