//! Page permission bits.
//!
//! `PageFlags` is the hardware-format view of a mapping's permissions.
//! `COPY_ON_WRITE` is a software-defined bit carved out of the range
//! reserved for system software; the paging hardware ignores it.
//!
//! Core logic should reason about permissions through the tagged
//! [`Perm`] type and translate to `PageFlags` only at the boundary
//! that talks to the mapping primitives.

use bitflags::bitflags;

bitflags! {
    /// Hardware-format permission bits of a single page mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Mapping is present.
        const PRESENT = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode.
        const USER_ACCESSIBLE = 1 << 2;
        /// Software-defined: frame is shared copy-on-write.
        const COPY_ON_WRITE = 1 << 9;

        /// Bits a user request may carry into a mapping primitive.
        const SHARE_MASK = Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::USER_ACCESSIBLE.bits()
            | Self::COPY_ON_WRITE.bits();
    }
}

bitflags! {
    /// Error-code bitfield delivered with a page-fault upcall.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCause: u32 {
        /// The faulting mapping was present (protection violation).
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The fault occurred in user mode.
        const USER = 1 << 2;
    }
}

/// Access mode of a page, with the copy-on-write state made explicit.
///
/// `Writable` and `CopyOnWrite` are mutually exclusive: a COW page must
/// have its writable bit clear until the fault path makes a private copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only, not subject to copy-on-write.
    ReadOnly,
    /// Privately owned and writable.
    Writable,
    /// Shared read-only until the first write.
    CopyOnWrite,
}

/// Tagged permission type used by the core logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perm {
    /// Access mode.
    pub access: Access,
    /// Page is reachable from user mode.
    pub user: bool,
}

impl Perm {
    /// Translate to the hardware bit format.
    pub fn to_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        match self.access {
            Access::ReadOnly => {}
            Access::Writable => flags |= PageFlags::WRITABLE,
            Access::CopyOnWrite => flags |= PageFlags::COPY_ON_WRITE,
        }
        if self.user {
            flags |= PageFlags::USER_ACCESSIBLE;
        }
        flags
    }

    /// Translate from the hardware bit format.
    ///
    /// Returns `None` for patterns that do not describe a present
    /// mapping, and for the contradictory `WRITABLE | COPY_ON_WRITE`
    /// combination.
    pub fn from_flags(flags: PageFlags) -> Option<Perm> {
        if !flags.contains(PageFlags::PRESENT) {
            return None;
        }
        let access = match (
            flags.contains(PageFlags::WRITABLE),
            flags.contains(PageFlags::COPY_ON_WRITE),
        ) {
            (false, false) => Access::ReadOnly,
            (true, false) => Access::Writable,
            (false, true) => Access::CopyOnWrite,
            (true, true) => return None,
        };
        Some(Perm {
            access,
            user: flags.contains(PageFlags::USER_ACCESSIBLE),
        })
    }
}
