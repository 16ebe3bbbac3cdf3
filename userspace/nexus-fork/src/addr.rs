// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual addresses and page indices.

use core::fmt;

use nexus_abi::{PAGE_SIZE, PTSIZE};
use serde::de::{Deserialize, Deserializer, Error as _};

/// User virtual address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Wraps a raw address.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw address.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Rounds down to the containing page boundary.
    pub const fn round_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Returns `true` when the address sits on a page boundary.
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Index of the page containing this address.
    pub const fn page_index(self) -> PageIndex {
        PageIndex(self.0 / PAGE_SIZE)
    }

    /// Index of the page-directory entry covering this address.
    pub const fn directory_index(self) -> usize {
        self.0 / PTSIZE
    }

    /// First address covered by the next page-directory entry.
    pub fn next_table_boundary(self) -> Option<Self> {
        (self.directory_index() + 1).checked_mul(PTSIZE).map(Self)
    }

    /// Adds `bytes`, returning `None` on overflow.
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtracts `bytes`, returning `None` on underflow.
    pub fn checked_sub(self, bytes: usize) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Byte offset of this address within its page.
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }
}

impl From<usize> for VirtAddr {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl<'de> Deserialize<'de> for VirtAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(value) => usize::try_from(value)
                .map(Self)
                .map_err(|_| D::Error::custom(format!("address {value:#x} out of range"))),
            Raw::Text(text) => parse_addr(&text)
                .map(Self)
                .ok_or_else(|| D::Error::custom(format!("invalid address `{text}`"))),
        }
    }
}

fn parse_addr(text: &str) -> Option<usize> {
    let cleaned: String = text.trim().chars().filter(|c| *c != '_').collect();
    match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => cleaned.parse().ok(),
    }
}

/// Index of a virtual page (`address / PAGE_SIZE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(usize);

impl PageIndex {
    /// Wraps a raw page index.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw index.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// First address of the page.
    pub const fn base(self) -> VirtAddr {
        VirtAddr(self.0 * PAGE_SIZE)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_and_indices() {
        let va = VirtAddr::new(0x0080_1abc);
        assert_eq!(va.round_down(), VirtAddr::new(0x0080_1000));
        assert_eq!(va.page_offset(), 0xabc);
        assert_eq!(va.page_index(), PageIndex::new(0x801));
        assert_eq!(va.page_index().base(), va.round_down());
        assert_eq!(va.directory_index(), 2);
        assert_eq!(va.next_table_boundary(), Some(VirtAddr::new(3 * PTSIZE)));
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_addr("0x0080_0000"), Some(0x0080_0000));
        assert_eq!(parse_addr("4096"), Some(4096));
        assert_eq!(parse_addr("0xzz"), None);
    }
}
