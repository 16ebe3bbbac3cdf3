// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fault handler.
//!
//! The kernel delivers a protection fault through the registered upcall. A write to a
//! COW page is resolved by allocating a fresh frame at the scratch page, copying the shared
//! contents into it, and mapping that frame over the faulting page as private read/write.
//! Anything else is a protocol violation.

use log::trace;
use nexus_abi::{FaultCause, UTrapFrame, PID_SELF};

use crate::addr::VirtAddr;
use crate::env::{AddressSpaceView, UserEnv};
use crate::error::FaultError;
use crate::layout::Layout;
use crate::perm::PermissionSet;

/// Validates that `frame` is a write fault on a present COW page.
///
/// Returns the page-aligned faulting address.
pub fn check_cow_fault<E>(env: &E, frame: &UTrapFrame) -> Result<VirtAddr, FaultError>
where
    E: AddressSpaceView + ?Sized,
{
    let va = VirtAddr::new(frame.fault_va);
    let cause = frame.cause();
    if !cause.contains(FaultCause::WRITE) {
        return Err(FaultError::NotWrite { va, cause });
    }
    if !env.directory_present(va) {
        return Err(FaultError::DirectoryNotPresent { va });
    }
    match env.permissions_of(va.page_index()) {
        None => Err(FaultError::PageNotPresent { va }),
        Some(perm) if !perm.is_present() => Err(FaultError::PageNotPresent { va }),
        Some(perm) if !perm.is_cow() => Err(FaultError::NotCopyOnWrite { va, perm }),
        Some(_) => Ok(va.round_down()),
    }
}

/// Resolves a copy-on-write fault with a private writable copy of the page.
///
/// Issues one page allocation, one page copy and one remap. The old COW entry is
/// superseded by the remap; no unmap is needed.
pub fn handle_cow_fault<E>(env: &mut E, layout: &Layout, frame: &UTrapFrame) -> Result<(), FaultError>
where
    E: UserEnv + ?Sized,
{
    let page = check_cow_fault(env, frame)?;
    let scratch = layout.scratch;

    env.page_alloc(PID_SELF, scratch, PermissionSet::private_rw())
        .map_err(|err| FaultError::Syscall { op: "page_alloc", err })?;
    env.copy_page(scratch, page)
        .map_err(|err| FaultError::Syscall { op: "copy_page", err })?;
    env.page_map(PID_SELF, scratch, PID_SELF, page, PermissionSet::private_rw())
        .map_err(|err| FaultError::Syscall { op: "page_map", err })?;

    trace!("cow: privatized {page}");
    Ok(())
}
