// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space layout consumed by fork and the fault handler.
//!
//! Defaults mirror the kernel constants in `nexus-abi`. A layout may also be loaded from
//! TOML for host runs:
//!
//! ```toml
//! user_text = "0x0080_0000"
//! exception_stack_top = "0xeec0_0000"
//! scratch = "0x007f_f000"
//! ```

use core::ops::Range;
use std::path::Path;

use nexus_abi::{PAGE_SIZE, PFTEMP, UTEXT, UTOP, UXSTACKTOP};
use serde::Deserialize;

use crate::addr::VirtAddr;
use crate::error::LayoutError;

/// Fixed layout points of a user address space.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Layout {
    /// First address duplicated by fork.
    pub user_text: VirtAddr,
    /// Top of the one-page exception stack; the stack page sits just below it.
    pub exception_stack_top: VirtAddr,
    /// Page the fault handler uses as a temporary mapping.
    pub scratch: VirtAddr,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            user_text: VirtAddr::new(UTEXT),
            exception_stack_top: VirtAddr::new(UXSTACKTOP),
            scratch: VirtAddr::new(PFTEMP),
        }
    }
}

impl Layout {
    /// Parses and validates a TOML layout; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, LayoutError> {
        let layout: Self = toml::from_str(text).map_err(|err| LayoutError::Parse(err.to_string()))?;
        layout.validate()?;
        Ok(layout)
    }

    /// Reads, parses and validates a TOML layout file.
    pub fn load(path: &Path) -> Result<Self, LayoutError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| LayoutError::Io(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks alignment, ordering, and that the scratch page can never be copy-on-write.
    pub fn validate(&self) -> Result<(), LayoutError> {
        for (field, va) in [
            ("user_text", self.user_text),
            ("exception_stack_top", self.exception_stack_top),
            ("scratch", self.scratch),
        ] {
            if !va.is_page_aligned() {
                return Err(LayoutError::Unaligned { field, va });
            }
            if va.as_usize() > UTOP {
                return Err(LayoutError::AboveUserTop { field, va });
            }
        }
        if self.scratch.as_usize() == UTOP {
            return Err(LayoutError::AboveUserTop { field: "scratch", va: self.scratch });
        }
        let stack = self.exception_stack_bottom();
        if self.exception_stack_top.as_usize() < PAGE_SIZE || self.user_text >= stack {
            return Err(LayoutError::Inverted { user_text: self.user_text, stack });
        }
        if self.scratch >= self.user_text && self.scratch < self.exception_stack_top {
            return Err(LayoutError::ScratchInScanRange(self.scratch));
        }
        Ok(())
    }

    /// Base of the exception stack page.
    pub fn exception_stack_bottom(&self) -> VirtAddr {
        VirtAddr::new(self.exception_stack_top.as_usize().saturating_sub(PAGE_SIZE))
    }

    /// Range walked by fork: user text up to, excluding, the exception stack page.
    pub fn scan_range(&self) -> Range<VirtAddr> {
        self.user_text..self.exception_stack_bottom()
    }

    /// Returns `true` for pages on the fault path that must never be copy-on-write.
    pub fn is_cow_exempt(&self, va: VirtAddr) -> bool {
        let page = va.round_down();
        page == self.scratch || page == self.exception_stack_bottom()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        let layout = Layout::default();
        layout.validate().expect("default layout");
        assert_eq!(layout.exception_stack_bottom(), VirtAddr::new(UXSTACKTOP - PAGE_SIZE));
        assert!(layout.is_cow_exempt(VirtAddr::new(PFTEMP + 12)));
        assert!(!layout.is_cow_exempt(VirtAddr::new(UTEXT)));
    }

    #[test]
    fn rejects_scratch_inside_scan_range() {
        let layout = Layout { scratch: VirtAddr::new(UTEXT + PAGE_SIZE), ..Layout::default() };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::ScratchInScanRange(VirtAddr::new(UTEXT + PAGE_SIZE)))
        );
    }

    #[test]
    fn rejects_scratch_on_exception_stack() {
        let layout = Layout { scratch: Layout::default().exception_stack_bottom(), ..Layout::default() };
        assert!(matches!(layout.validate(), Err(LayoutError::ScratchInScanRange(_))));
    }

    #[test]
    fn rejects_unaligned_and_inverted() {
        let unaligned = Layout { user_text: VirtAddr::new(UTEXT + 1), ..Layout::default() };
        assert!(matches!(unaligned.validate(), Err(LayoutError::Unaligned { field: "user_text", .. })));

        let inverted = Layout { user_text: VirtAddr::new(UXSTACKTOP - PAGE_SIZE), ..Layout::default() };
        assert!(matches!(inverted.validate(), Err(LayoutError::Inverted { .. })));

        let high = Layout { exception_stack_top: VirtAddr::new(UTOP + PAGE_SIZE), ..Layout::default() };
        assert!(matches!(high.validate(), Err(LayoutError::AboveUserTop { .. })));
    }

    #[test]
    fn parses_toml_with_defaults() {
        let layout = Layout::from_toml_str("exception_stack_top = \"0x0200_0000\"\n").expect("parse");
        assert_eq!(layout.exception_stack_top, VirtAddr::new(0x0200_0000));
        assert_eq!(layout.user_text, VirtAddr::new(UTEXT));

        let numeric = Layout::from_toml_str("scratch = 4096\n").expect("parse");
        assert_eq!(numeric.scratch, VirtAddr::new(4096));
    }

    #[test]
    fn toml_errors_are_reported() {
        assert!(matches!(Layout::from_toml_str("bogus = 1\n"), Err(LayoutError::Parse(_))));
        assert!(matches!(
            Layout::from_toml_str("scratch = \"0x0080_1000\"\n"),
            Err(LayoutError::ScratchInScanRange(_))
        ));
    }
}
