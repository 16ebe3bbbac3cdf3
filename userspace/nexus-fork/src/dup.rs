// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Replicates one page mapping of the calling process into a child.

use core::ops::Range;

use log::{debug, warn};
use nexus_abi::{Pid, PID_SELF};

use crate::addr::{PageIndex, VirtAddr};
use crate::env::UserEnv;
use crate::error::DupError;
use crate::layout::Layout;
use crate::perm::PermissionSet;

/// Policy applied to a duplicated page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Both sides now map the frame read-only and COW-tagged.
    CopyOnWrite,
    /// Read-only page shared as is; it will never fault.
    ReadShared,
}

/// Pages that must never be COW-tagged: the fault path's own scratch and stack pages, plus
/// any ranges pinned for the handler's code and data.
#[derive(Clone, Copy, Debug)]
pub struct CowExemptions<'a> {
    layout: &'a Layout,
    pinned: &'a [Range<VirtAddr>],
}

impl<'a> CowExemptions<'a> {
    /// Combines the layout's fault-path pages with `pinned` handler ranges.
    pub fn new(layout: &'a Layout, pinned: &'a [Range<VirtAddr>]) -> Self {
        Self { layout, pinned }
    }

    /// Returns `true` when `va` must never be COW-tagged.
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.layout.is_cow_exempt(va) || self.pinned.iter().any(|range| range.contains(&va))
    }
}

/// Maps `page` of the calling process into `child` at the same address.
///
/// Writable or COW pages become COW in both processes; the caller's own entry is demoted
/// too since the frame now has two owners. Read-only pages are shared untagged.
pub fn duplicate_page<E>(
    env: &mut E,
    exempt: &CowExemptions<'_>,
    child: Pid,
    page: PageIndex,
) -> Result<Sharing, DupError>
where
    E: UserEnv + ?Sized,
{
    let va = page.base();
    let perm = env.permissions_of(page).ok_or(DupError::NotMapped { va })?;

    if !perm.needs_cow() {
        env.page_map(PID_SELF, va, child, va, PermissionSet::read_shared())
            .map_err(|err| DupError::MapChild { va, err })?;
        return Ok(Sharing::ReadShared);
    }

    if exempt.contains(va) {
        warn!("dup: refusing to COW-tag handler page {va}");
        return Err(DupError::Reentrancy { va });
    }
    env.page_map(PID_SELF, va, child, va, PermissionSet::cow_shared())
        .map_err(|err| DupError::MapChild { va, err })?;
    env.page_map(PID_SELF, va, PID_SELF, va, PermissionSet::cow_shared())
        .map_err(|err| DupError::RemapSelf { va, err })?;
    debug!("dup: {va} {perm} -> cow");
    Ok(Sharing::CopyOnWrite)
}

#[cfg(test)]
mod tests {
    use nexus_abi::{PAGE_SIZE, UTEXT};

    use super::*;
    use crate::env::recording::{Call, RecordingEnv};

    const CHILD: Pid = 7;

    #[test]
    fn writable_page_maps_child_before_demoting_self() {
        let va = VirtAddr::new(UTEXT);
        let mut env = RecordingEnv::new().with_page(va, PermissionSet::private_rw());
        let layout = Layout::default();
        let exempt = CowExemptions::new(&layout, &[]);

        let sharing = duplicate_page(&mut env, &exempt, CHILD, va.page_index()).expect("dup");
        assert_eq!(sharing, Sharing::CopyOnWrite);
        let cow = PermissionSet::cow_shared();
        assert_eq!(
            env.calls,
            vec![Call::Map(PID_SELF, va, CHILD, va, cow), Call::Map(PID_SELF, va, PID_SELF, va, cow)]
        );
    }

    #[test]
    fn read_only_page_is_shared_once() {
        let va = VirtAddr::new(UTEXT + PAGE_SIZE);
        let mut env = RecordingEnv::new().with_page(va, PermissionSet::read_shared());
        let layout = Layout::default();
        let exempt = CowExemptions::new(&layout, &[]);

        let sharing = duplicate_page(&mut env, &exempt, CHILD, va.page_index()).expect("dup");
        assert_eq!(sharing, Sharing::ReadShared);
        assert_eq!(env.calls, vec![Call::Map(PID_SELF, va, CHILD, va, PermissionSet::read_shared())]);
    }

    #[test]
    fn exempt_pages_issue_no_syscalls() {
        let layout = Layout::default();
        let pinned = [VirtAddr::new(UTEXT)..VirtAddr::new(UTEXT + PAGE_SIZE)];
        let exempt = CowExemptions::new(&layout, &pinned);
        for va in [VirtAddr::new(UTEXT), layout.scratch, layout.exception_stack_bottom()] {
            let mut env = RecordingEnv::new().with_page(va, PermissionSet::private_rw());
            let err = duplicate_page(&mut env, &exempt, CHILD, va.page_index()).expect_err("exempt");
            assert_eq!(err, DupError::Reentrancy { va });
            assert!(env.calls.is_empty());
        }
    }

    #[test]
    fn unmapped_page_is_reported() {
        let mut env = RecordingEnv::new();
        let layout = Layout::default();
        let exempt = CowExemptions::new(&layout, &[]);
        let va = VirtAddr::new(UTEXT);
        assert_eq!(
            duplicate_page(&mut env, &exempt, CHILD, va.page_index()),
            Err(DupError::NotMapped { va })
        );
    }
}
