use crate::object::CachePolicy;
use crate::permissions::Permissions;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K};

/// One 64-bit entry of any paging level (PML4E, PDPTE, PDE or PTE).
///
/// ```text
///  63  62..59  58..52  51..12       11..9  8  7   6  5  4    3    2   1   0
///  NX  PKEY    avl     frame        avl    G  PS  D  A  PCD  PWT  US  RW  P
/// ```
///
/// `RW` and `US` on a table entry bound what the leaves below it may grant,
/// so table entries set both and leave the decision to the leaf.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    /// Reachable from ring 3.
    pub user: bool,
    pub pwt: bool,
    /// With the default PAT, `PCD` alone is UC- and `PCD|PWT` is strong UC.
    pub pcd: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// `PS`: a 1 GiB or 2 MiB leaf in a PDPTE or PDE.
    pub huge: bool,
    /// Kept across CR3 loads.
    pub global: bool,
    #[bits(3)]
    pub available: u8,
    #[bits(40)]
    frame_number: u64,
    #[bits(7)]
    pub available_high: u8,
    #[bits(4)]
    pub pkey: u8,
    /// Requires `EFER.NXE`.
    pub nx: bool,
}

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.frame().base()
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_index(self.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalPage<Size4K>) -> Self {
        self.with_frame_number(frame.frame_index())
    }

    /// Entry of a non-leaf level pointing at the next table.
    #[inline]
    #[must_use]
    pub const fn table(next: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(next)
    }

    /// 4 KiB leaf for `frame`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, perms: Permissions, cache: CachePolicy, global: bool) -> Self {
        let entry = Self::new()
            .with_present(true)
            .with_writable(perms.write())
            .with_user(perms.user())
            .with_nx(!perms.execute())
            .with_global(global)
            .with_frame(frame);
        cache.apply(entry)
    }

    /// 2 MiB leaf for a page directory. Bit 12 is `PAT` here and stays clear
    /// because the frame is 2 MiB aligned.
    #[inline]
    #[must_use]
    pub const fn large_leaf(frame: PhysicalPage<Size2M>, perms: Permissions, cache: CachePolicy, global: bool) -> Self {
        let first = PhysicalPage::<Size4K>::containing_address(frame.base());
        Self::leaf(first, perms, cache, global).with_huge(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_occupies_bits_12_to_51() {
        let top = PhysicalPage::from_frame_index((1 << 40) - 1);
        let e = PageTableEntry::new().with_present(true).with_frame(top);
        assert_eq!(e.physical_address().as_u64(), 0x000F_FFFF_FFFF_F000);
        assert_eq!(e.into_bits(), 0x000F_FFFF_FFFF_F001);
    }

    #[test]
    fn leaves_follow_the_permissions() {
        let frame = PhysicalPage::from_frame_index(0x42);
        let kernel_data = PageTableEntry::leaf(frame, Permissions::RW, CachePolicy::WriteBack, true);
        assert!(kernel_data.writable() && kernel_data.nx() && kernel_data.global());
        assert!(!kernel_data.user() && !kernel_data.pcd());
        assert_eq!(kernel_data.frame(), frame);

        let user_text = PageTableEntry::leaf(frame, Permissions::USER_RX, CachePolicy::WriteBack, false);
        assert!(user_text.user() && !user_text.nx() && !user_text.writable());
    }

    #[test]
    fn table_entries_leave_permissions_to_the_leaf() {
        let e = PageTableEntry::table(PhysicalPage::from_frame_index(9), true);
        assert!(e.present() && e.writable() && e.user() && !e.nx());
        assert_eq!(e.into_bits(), 0x9007);
    }

    #[test]
    fn large_leaves_set_ps_and_keep_pat_clear() {
        let frame = PhysicalPage::<Size2M>::containing_address(PhysicalAddress::new(0x4020_0000));
        let e = PageTableEntry::large_leaf(frame, Permissions::RW, CachePolicy::Uncacheable, false);
        assert!(e.present() && e.huge() && e.writable() && e.pcd() && !e.pwt());
        assert_eq!(e.physical_address().as_u64(), 0x4020_0000);
        assert_eq!(e.into_bits() & 0x1000, 0);
    }

    #[test]
    fn strong_uncacheable_sets_pcd_and_pwt() {
        let frame = PhysicalPage::from_frame_index(1);
        let e = PageTableEntry::leaf(frame, Permissions::RW, CachePolicy::StrongUncacheable, false);
        assert!(e.pcd() && e.pwt());
        assert_eq!(e.into_bits() & 0x18, 0x18);
    }
}
