use crate::{FrameAlloc, PhysMapper, VmError, alloc_zeroed};
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Largest object a [`FrameTable`] can describe: two levels of 512 slots.
pub const MAX_OBJECT_PAGES: u64 = (ENTRIES_PER_TABLE * ENTRIES_PER_TABLE) as u64;

const SLOTS: u64 = ENTRIES_PER_TABLE as u64;
const PRESENT: u64 = 1;

type Slots = [u64; ENTRIES_PER_TABLE];

/// Offset → frame cache of an anonymous object.
///
/// A small radix tree kept in frames from the frame allocator, so objects
/// work before the heap exists (the heap itself is built on them). Objects
/// of up to 512 pages use a single table frame, larger ones a root of leaf
/// tables. Slots hold `frame | 1`; zero is empty.
#[derive(Debug)]
pub struct FrameTable {
    root: Option<PhysicalPage<Size4K>>,
    two_level: bool,
    populated: u64,
}

impl FrameTable {
    #[must_use]
    pub const fn new(pages: u64) -> Self {
        Self {
            root: None,
            two_level: pages > SLOTS,
            populated: 0,
        }
    }

    /// Number of data frames currently cached.
    #[must_use]
    pub const fn populated(&self) -> u64 {
        self.populated
    }

    /// Whether no frame (data or table) is held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// # Safety
    /// `frame` must be a table frame owned by this tree.
    unsafe fn slots<'a, M: PhysMapper + ?Sized>(mapper: &M, frame: PhysicalPage<Size4K>) -> &'a mut Slots {
        unsafe { &mut *mapper.phys_to_ptr(frame.base()).cast::<Slots>() }
    }

    const fn decode(slot: u64) -> Option<PhysicalPage<Size4K>> {
        if slot & PRESENT == 0 {
            None
        } else {
            Some(PhysicalPage::containing_address(PhysicalAddress::new(slot & !0xFFF)))
        }
    }

    const fn encode(frame: PhysicalPage<Size4K>) -> u64 {
        frame.base().as_u64() | PRESENT
    }

    const fn split(&self, offset: u64) -> (usize, usize) {
        if self.two_level {
            ((offset / SLOTS) as usize, (offset % SLOTS) as usize)
        } else {
            (0, offset as usize)
        }
    }

    pub fn get<M: PhysMapper + ?Sized>(&self, mapper: &M, offset: u64) -> Option<PhysicalPage<Size4K>> {
        let root = self.root?;
        let (hi, lo) = self.split(offset);
        let leaf = if self.two_level {
            Self::decode(unsafe { Self::slots(mapper, root) }[hi])?
        } else {
            root
        };
        Self::decode(unsafe { Self::slots(mapper, leaf) }[lo])
    }

    /// Record `frame` for `offset`. The slot must be empty.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a table frame could not be allocated; the
    /// caller still owns `frame` in that case.
    pub fn insert<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        offset: u64,
        frame: PhysicalPage<Size4K>,
    ) -> Result<(), VmError> {
        let root = match self.root {
            Some(root) => root,
            None => {
                let root = alloc_zeroed(mapper, alloc)?;
                self.root = Some(root);
                root
            }
        };
        let (hi, lo) = self.split(offset);
        let leaf = if self.two_level {
            let top = unsafe { Self::slots(mapper, root) };
            match Self::decode(top[hi]) {
                Some(leaf) => leaf,
                None => {
                    let leaf = alloc_zeroed(mapper, alloc)?;
                    top[hi] = Self::encode(leaf);
                    leaf
                }
            }
        } else {
            root
        };
        let slots = unsafe { Self::slots(mapper, leaf) };
        debug_assert_eq!(slots[lo], 0, "frame table slot {offset} already populated");
        slots[lo] = Self::encode(frame);
        self.populated += 1;
        Ok(())
    }

    /// Free every data frame and every table frame. Returns the number of
    /// data frames freed.
    pub fn drain<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(&mut self, mapper: &M, alloc: &mut A) -> u64 {
        self.drain_with(mapper, alloc, |alloc, frame| alloc.free_4k(frame))
    }

    /// As [`drain`](Self::drain), handing each data frame to `release`
    /// instead of [`FrameAlloc::free_4k`]. Table frames are always 4 KiB.
    pub fn drain_with<M, A, F>(&mut self, mapper: &M, alloc: &mut A, mut release: F) -> u64
    where
        M: PhysMapper + ?Sized,
        A: FrameAlloc + ?Sized,
        F: FnMut(&mut A, PhysicalPage<Size4K>),
    {
        let Some(root) = self.root.take() else {
            return 0;
        };
        let mut freed = 0;
        let mut free_leaf = |leaf: PhysicalPage<Size4K>, alloc: &mut A| {
            for slot in unsafe { Self::slots(mapper, leaf) }.iter_mut() {
                if let Some(frame) = Self::decode(*slot) {
                    release(alloc, frame);
                    *slot = 0;
                    freed += 1;
                }
            }
            alloc.free_4k(leaf);
        };
        if self.two_level {
            for slot in unsafe { Self::slots(mapper, root) }.iter_mut() {
                if let Some(leaf) = Self::decode(*slot) {
                    free_leaf(leaf, alloc);
                    *slot = 0;
                }
            }
            alloc.free_4k(root);
        } else {
            free_leaf(root, alloc);
        }
        debug_assert_eq!(freed, self.populated);
        self.populated = 0;
        freed
    }
}
