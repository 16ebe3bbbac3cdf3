// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Seams between the fork logic and the kernel it runs on.
//!
//! Pids follow the ABI convention: [`nexus_abi::PID_SELF`] names the calling process.

use nexus_abi::{Pid, SysResult};

use crate::addr::{PageIndex, VirtAddr};
use crate::perm::PermissionSet;

/// Result of [`Syscalls::exofork`] as observed by the calling execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExoFork {
    /// Caller is the parent; the child shell has this pid.
    Parent(Pid),
    /// Caller is now running as the child.
    Child,
}

/// Process-lifecycle and address-space syscalls consumed by fork.
pub trait Syscalls {
    /// Entry point registered with [`Syscalls::set_fault_upcall`].
    type Upcall: Clone;

    /// Pid of the calling process.
    fn getpid(&mut self) -> SysResult<Pid>;

    /// Creates a not-runnable child shell with an empty user address space.
    fn exofork(&mut self) -> SysResult<ExoFork>;

    /// Allocates a zeroed page and maps it at `va` in `pid`, replacing any mapping there.
    fn page_alloc(&mut self, pid: Pid, va: VirtAddr, perm: PermissionSet) -> SysResult<()>;

    /// Shares the frame at `src_va` in `src` at `dst_va` in `dst`, replacing any mapping there.
    fn page_map(
        &mut self,
        src: Pid,
        src_va: VirtAddr,
        dst: Pid,
        dst_va: VirtAddr,
        perm: PermissionSet,
    ) -> SysResult<()>;

    /// Routes faults of `pid` into `entry`.
    fn set_fault_upcall(&mut self, pid: Pid, entry: Self::Upcall) -> SysResult<()>;

    /// Makes `pid` eligible for scheduling.
    fn set_runnable(&mut self, pid: Pid) -> SysResult<()>;
}

/// Read-only view of the calling process's own page tables.
pub trait AddressSpaceView {
    /// Returns `true` when a page table covers `va`.
    fn directory_present(&self, va: VirtAddr) -> bool;

    /// Permissions of a present page; `None` when nothing is mapped there.
    ///
    /// Only meaningful when [`AddressSpaceView::directory_present`] holds for the page.
    fn permissions_of(&self, page: PageIndex) -> Option<PermissionSet>;
}

/// Memory copy within the calling process.
pub trait PageCopy {
    /// Copies one full page from `src` to `dst`; both must be mapped, `dst` writable.
    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> SysResult<()>;
}

/// Everything fork and the fault handler need from the running process.
pub trait UserEnv: Syscalls + AddressSpaceView + PageCopy {}

impl<T: Syscalls + AddressSpaceView + PageCopy> UserEnv for T {}
