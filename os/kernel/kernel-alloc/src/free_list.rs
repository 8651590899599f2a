use core::ptr::{self, null_mut};

/// Every block address and size is a multiple of this.
pub(crate) const GRANULE: usize = 16;

/// Header stored at the beginning of every **free** block.
///
/// ```text
/// +----------------------+-------------------------+
/// | ListNode             |      rest of the block  |
/// +----------------------+-------------------------+
/// ^ block                                          ^ block + size
/// ```
///
/// - `size` is the size of the whole block, node included.
/// - `next` links to the next free block. Free blocks are kept **sorted by
///   address** to enable coalescing.
#[repr(C)]
struct ListNode {
    size: usize,
    next: *mut ListNode,
}

const _: () = assert!(size_of::<ListNode>() == GRANULE);

/// A carved-out block, see [`FreeList::take`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Block {
    /// First byte owned by the allocation (header included).
    pub start: usize,
    /// Aligned address handed to the caller.
    pub payload: usize,
    /// One past the last byte owned by the allocation.
    pub end: usize,
}

/// Align `addr` upwards to `align` (a power of two), `None` on overflow.
#[inline]
pub(crate) const fn align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// A first-fit, split-and-coalesce free list.
///
/// # Invariants
/// - All free blocks are non-overlapping, sorted by address and
///   [`GRANULE`]-aligned in both address and size.
/// - `head` is a sentinel; the first real block is at `head.next`.
pub(crate) struct FreeList {
    head: ListNode,
    free_bytes: usize,
}

// Safety: the list is only reached through the heap lock; the raw pointers
// are never shared outside it.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ListNode {
                size: 0,
                next: null_mut(),
            },
            free_bytes: 0,
        }
    }

    pub(crate) const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// `(address, size)` of every free block, lowest address first.
    fn blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut node = self.head.next;
        core::iter::from_fn(move || {
            if node.is_null() {
                return None;
            }
            let block = unsafe { &*node };
            let item = (node as usize, block.size);
            node = block.next;
            Some(item)
        })
    }

    /// Number of free blocks.
    pub(crate) fn len(&self) -> usize {
        self.blocks().count()
    }

    /// Whether any free block intersects `[start, end)`.
    pub(crate) fn overlaps(&self, start: usize, end: usize) -> bool {
        self.blocks()
            .take_while(|&(block, _)| block < end)
            .any(|(block, size)| block + size > start)
    }

    /// Insert the free region `[addr, addr + size)` in address order and
    /// coalesce it with adjacent free blocks.
    ///
    /// # Safety
    /// - The range must be valid, writable memory not otherwise in use.
    /// - `addr` and `size` must be [`GRANULE`] multiples.
    pub(crate) unsafe fn insert(&mut self, addr: usize, size: usize) {
        debug_assert!(addr % GRANULE == 0 && size % GRANULE == 0);
        if size < size_of::<ListNode>() {
            return;
        }
        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }
        let new = addr as *mut ListNode;
        unsafe {
            ptr::write(new, ListNode { size, next: current });
            (*prev).next = new;
        }
        self.free_bytes += size;
        unsafe {
            self.coalesce(prev);
        }
    }

    /// Merge the node after `prev` with its successor and then with `prev`,
    /// wherever they touch.
    ///
    /// # Safety
    /// The list invariants must hold and `prev` must be the head or a node.
    unsafe fn coalesce(&mut self, prev: *mut ListNode) {
        let node = unsafe { (*prev).next };
        if node.is_null() {
            return;
        }
        unsafe { Self::absorb_next(node) };
        if !ptr::eq(prev, &raw const self.head) {
            unsafe { Self::absorb_next(prev) };
        }
    }

    /// Fold `node.next` into `node` if the two are adjacent.
    ///
    /// # Safety
    /// `node` must be a live node of the list.
    unsafe fn absorb_next(node: *mut ListNode) {
        let n = unsafe { &mut *node };
        if n.next.is_null() || node as usize + n.size != n.next as usize {
            return;
        }
        let next = unsafe { &*n.next };
        n.size += next.size;
        n.next = next.next;
    }

    /// Carve the first block that can hold `header` bytes followed by a
    /// `size`-byte payload aligned to `align`.
    ///
    /// Leftovers in front of the header and behind the payload go back on
    /// the list.
    ///
    /// # Safety
    /// The free-list invariants must hold.
    pub(crate) unsafe fn take(&mut self, size: usize, align: usize, header: usize) -> Option<Block> {
        let align = align.max(GRANULE);
        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() {
            let region_start = current as usize;
            let region_end = region_start + unsafe { (*current).size };
            let payload = align_up(region_start.checked_add(header)?, align)?;
            let alloc_end = align_up(payload.checked_add(size)?, GRANULE)?;
            if alloc_end <= region_end {
                unsafe {
                    (*prev).next = (*current).next;
                }
                self.free_bytes -= region_end - region_start;

                let start = payload - header;
                let head_remainder = start - region_start;
                let tail_remainder = region_end - alloc_end;

                if tail_remainder > 0 {
                    unsafe { self.insert(alloc_end, tail_remainder) };
                }
                if head_remainder > 0 {
                    unsafe { self.insert(region_start, head_remainder) };
                }

                return Some(Block {
                    start,
                    payload,
                    end: alloc_end,
                });
            }
            prev = current;
            current = unsafe { (*current).next };
        }
        None
    }
}
