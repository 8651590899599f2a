use bitfield_struct::bitfield;

/// Access rights of a region.
///
/// x86 cannot express a present page that is not readable, so every mapping
/// must carry `read`.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Accessible from ring 3.
    pub user: bool,
    #[bits(4)]
    __: u8,
}

impl Permissions {
    pub const R: Self = Self::new().with_read(true);
    pub const RW: Self = Self::R.with_write(true);
    pub const RX: Self = Self::R.with_execute(true);
    pub const USER_R: Self = Self::R.with_user(true);
    pub const USER_RW: Self = Self::RW.with_user(true);
    pub const USER_RX: Self = Self::RX.with_user(true);

    /// Whether an access of the given kind is allowed by these permissions.
    #[must_use]
    pub const fn allows(self, access: FaultAccess) -> bool {
        if access.user && !self.user() {
            return false;
        }
        match access.kind {
            AccessKind::Read => self.read(),
            AccessKind::Write => self.write(),
            AccessKind::Execute => self.execute(),
        }
    }
}

/// What the faulting instruction tried to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Access kind plus the privilege level it was made from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FaultAccess {
    pub kind: AccessKind,
    /// The access came from ring 3.
    pub user: bool,
}

impl FaultAccess {
    #[must_use]
    pub const fn kernel(kind: AccessKind) -> Self {
        Self { kind, user: false }
    }

    #[must_use]
    pub const fn user(kind: AccessKind) -> Self {
        Self { kind, user: true }
    }
}
