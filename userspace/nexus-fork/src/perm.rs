// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page permissions as seen by userland.
//!
//! The kernel enforces [`PageBits`]; copy-on-write is a userland convention carried in a
//! separate tag. The two only meet when converting to raw [`PteBits`] at the ABI boundary.

use core::fmt;

use bitflags::bitflags;
use nexus_abi::PteBits;

bitflags! {
    /// Kernel-enforced permission bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageBits: u8 {
        /// Entry maps a frame.
        const PRESENT = 1 << 0;
        /// Frame is writable.
        const WRITABLE = 1 << 1;
        /// Frame is reachable from user mode.
        const USER = 1 << 2;
    }
}

/// Permissions of one page entry: kernel bits plus the copy-on-write tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PermissionSet {
    bits: PageBits,
    cow: bool,
}

impl PermissionSet {
    /// Builds a permission set from kernel bits and the COW tag.
    pub const fn new(bits: PageBits, cow: bool) -> Self {
        Self { bits, cow }
    }

    /// Present, user, not writable, COW-tagged.
    pub const fn cow_shared() -> Self {
        Self::new(PageBits::PRESENT.union(PageBits::USER), true)
    }

    /// Present, user, not writable, untagged. Shared for good.
    pub const fn read_shared() -> Self {
        Self::new(PageBits::PRESENT.union(PageBits::USER), false)
    }

    /// Present, user, writable, untagged.
    pub const fn private_rw() -> Self {
        Self::new(PageBits::PRESENT.union(PageBits::USER).union(PageBits::WRITABLE), false)
    }

    /// Kernel-enforced bits.
    pub const fn bits(self) -> PageBits {
        self.bits
    }

    /// Entry maps a frame.
    pub const fn is_present(self) -> bool {
        self.bits.contains(PageBits::PRESENT)
    }

    /// Writes go straight through.
    pub const fn is_writable(self) -> bool {
        self.bits.contains(PageBits::WRITABLE)
    }

    /// Reachable from user mode.
    pub const fn is_user(self) -> bool {
        self.bits.contains(PageBits::USER)
    }

    /// Carries the copy-on-write tag.
    pub const fn is_cow(self) -> bool {
        self.cow
    }

    /// Duplication must go through copy-on-write: the page is writable or already COW.
    pub const fn needs_cow(self) -> bool {
        self.is_writable() || self.cow
    }

    /// Decodes raw entry bits; unknown bits are dropped.
    pub fn from_pte(raw: PteBits) -> Self {
        let mut bits = PageBits::empty();
        bits.set(PageBits::PRESENT, raw.contains(PteBits::PRESENT));
        bits.set(PageBits::WRITABLE, raw.contains(PteBits::WRITABLE));
        bits.set(PageBits::USER, raw.contains(PteBits::USER));
        Self::new(bits, raw.contains(PteBits::AVAIL_COW))
    }

    /// Encodes into raw entry bits for a syscall.
    pub fn to_pte(self) -> PteBits {
        let mut raw = PteBits::empty();
        raw.set(PteBits::PRESENT, self.is_present());
        raw.set(PteBits::WRITABLE, self.is_writable());
        raw.set(PteBits::USER, self.is_user());
        raw.set(PteBits::AVAIL_COW, self.cow);
        raw
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(self.is_present(), 'P'),
            flag(self.is_user(), 'U'),
            flag(self.is_writable(), 'W'),
            if self.cow { "+cow" } else { "" }
        )
    }
}
