// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Backend that issues the real syscalls through `nexus-abi`.
//!
//! Off-target builds compile but every syscall reports `Unsupported` and the page-table
//! views observe an empty address space.

use log::error;
use nexus_abi::{self as abi, FaultUpcall, Pid, ProcStatus, PteBits, SysResult, UTrapFrame};

use crate::addr::{PageIndex, VirtAddr};
use crate::env::{AddressSpaceView, ExoFork, PageCopy, Syscalls};
use crate::error::ForkError;
use crate::fault::handle_cow_fault;
use crate::fork::ProcessContext;
use crate::layout::Layout;
use crate::perm::PermissionSet;

/// Calling process as seen through the kernel ABI.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl Syscalls for OsEnv {
    type Upcall = FaultUpcall;

    fn getpid(&mut self) -> SysResult<Pid> {
        abi::getpid()
    }

    fn exofork(&mut self) -> SysResult<ExoFork> {
        match abi::exofork()? {
            0 => Ok(ExoFork::Child),
            child => Ok(ExoFork::Parent(child)),
        }
    }

    fn page_alloc(&mut self, pid: Pid, va: VirtAddr, perm: PermissionSet) -> SysResult<()> {
        abi::page_alloc(pid, va.as_usize(), perm.to_pte())
    }

    fn page_map(
        &mut self,
        src: Pid,
        src_va: VirtAddr,
        dst: Pid,
        dst_va: VirtAddr,
        perm: PermissionSet,
    ) -> SysResult<()> {
        abi::page_map(src, src_va.as_usize(), dst, dst_va.as_usize(), perm.to_pte())
    }

    fn set_fault_upcall(&mut self, pid: Pid, entry: FaultUpcall) -> SysResult<()> {
        abi::set_fault_upcall(pid, entry)
    }

    fn set_runnable(&mut self, pid: Pid) -> SysResult<()> {
        abi::set_status(pid, ProcStatus::Runnable)
    }
}

impl AddressSpaceView for OsEnv {
    fn directory_present(&self, va: VirtAddr) -> bool {
        PteBits::from_entry(abi::vpd(va.directory_index())).contains(PteBits::PRESENT)
    }

    fn permissions_of(&self, page: PageIndex) -> Option<PermissionSet> {
        let raw = PteBits::from_entry(abi::vpt(page.as_usize()));
        raw.contains(PteBits::PRESENT).then(|| PermissionSet::from_pte(raw))
    }
}

impl PageCopy for OsEnv {
    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> SysResult<()> {
        abi::page_copy(dst.as_usize(), src.as_usize())
    }
}

/// Fault upcall registered for processes running on the real kernel.
///
/// Returning resumes the faulting instruction; an unresolvable fault terminates the process.
pub extern "C" fn os_fault_upcall(frame: &UTrapFrame) {
    let mut env = OsEnv;
    if let Err(err) = handle_cow_fault(&mut env, &Layout::default(), frame) {
        error!("cow: fatal fault: {err}");
        panic!("cow: fatal fault: {err}");
    }
}

/// Fork context for the calling process with the default layout.
pub fn context() -> Result<ProcessContext<OsEnv>, ForkError> {
    ProcessContext::new(OsEnv, Layout::default(), os_fault_upcall as FaultUpcall)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_build_observes_empty_tables() {
        let env = OsEnv;
        assert!(!env.directory_present(VirtAddr::new(nexus_abi::UTEXT)));
        assert_eq!(env.permissions_of(VirtAddr::new(nexus_abi::UTEXT).page_index()), None);
    }

    #[test]
    fn context_reports_unsupported_off_target() {
        let err = context().err().expect("getpid unsupported");
        assert_eq!(err, ForkError::Identity(nexus_abi::AbiError::Unsupported));
    }
}
