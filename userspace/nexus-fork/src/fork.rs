// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fork orchestration over a per-process context.
//!
//! [`ProcessContext`] holds what a process needs to fork: its environment, layout, the
//! fault upcall it registers, handler-pinned ranges, its own pid, and whether the fault
//! handler is installed yet.

use core::ops::Range;

use log::{debug, error, info};
use nexus_abi::{Pid, PAGE_SIZE, PID_SELF};

use crate::addr::VirtAddr;
use crate::dup::{duplicate_page, CowExemptions, Sharing};
use crate::env::{ExoFork, Syscalls, UserEnv};
use crate::error::ForkError;
use crate::layout::Layout;
use crate::perm::PermissionSet;

/// Outcome of [`ProcessContext::fork`] in the observing execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Running as the parent; `child` is runnable.
    Parent {
        /// Pid of the new child.
        child: Pid,
        /// What the address-space walk did.
        stats: ForkStats,
    },
    /// Running as the child.
    Child,
}

impl ForkOutcome {
    /// Child pid when observed by the parent.
    pub fn child(&self) -> Option<Pid> {
        match self {
            Self::Parent { child, .. } => Some(*child),
            Self::Child => None,
        }
    }
}

/// Counters collected while walking the parent's address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForkStats {
    /// Pages now copy-on-write in both processes.
    pub cow_pages: usize,
    /// Read-only pages shared untagged.
    pub shared_pages: usize,
    /// Page-directory entries skipped because no table was present.
    pub skipped_tables: usize,
}

/// Per-process fork state.
pub struct ProcessContext<E: Syscalls> {
    env: E,
    layout: Layout,
    upcall: E::Upcall,
    pinned: Vec<Range<VirtAddr>>,
    this: Pid,
    handler_installed: bool,
}

impl<E: UserEnv> ProcessContext<E> {
    /// Creates the context for the process behind `env`.
    pub fn new(mut env: E, layout: Layout, upcall: E::Upcall) -> Result<Self, ForkError> {
        layout.validate()?;
        let this = env.getpid().map_err(ForkError::Identity)?;
        Ok(Self { env, layout, upcall, pinned: Vec::new(), this, handler_installed: false })
    }

    /// Builds the child's view of this context, standing in for the memory image the child
    /// inherits. The self pid stays stale until the child's `fork` returns.
    pub fn inherit(&self, env: E) -> Self {
        Self {
            env,
            layout: self.layout.clone(),
            upcall: self.upcall.clone(),
            pinned: self.pinned.clone(),
            this: self.this,
            handler_installed: self.handler_installed,
        }
    }

    /// Pid of the process this context describes.
    pub fn pid(&self) -> Pid {
        self.this
    }

    /// Layout in use.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Borrows the environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Mutably borrows the environment.
    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    /// Returns `true` once the fault handler is installed for this process.
    pub fn handler_installed(&self) -> bool {
        self.handler_installed
    }

    /// Marks `range` as fault-handler code or data. Writable pages in it are refused by
    /// fork instead of becoming copy-on-write.
    pub fn pin(&mut self, range: Range<VirtAddr>) {
        self.pinned.push(range);
    }

    /// Installs the copy-on-write fault handler for the calling process.
    ///
    /// The first call allocates the caller's exception stack and registers the upcall;
    /// later calls are no-ops.
    pub fn install_fault_handler(&mut self) -> Result<(), ForkError> {
        if self.handler_installed {
            return Ok(());
        }
        let stack = self.layout.exception_stack_bottom();
        self.env
            .page_alloc(PID_SELF, stack, PermissionSet::private_rw())
            .map_err(|err| ForkError::InstallHandler { op: "page_alloc", err })?;
        self.env
            .set_fault_upcall(PID_SELF, self.upcall.clone())
            .map_err(|err| ForkError::InstallHandler { op: "set_fault_upcall", err })?;
        self.handler_installed = true;
        debug!("fork: fault handler installed for pid {}", self.this);
        Ok(())
    }

    /// Duplicates the calling process with copy-on-write sharing.
    ///
    /// Returns [`ForkOutcome::Parent`] in the parent and [`ForkOutcome::Child`] in the child.
    /// On error nothing is rolled back: pages already shared with the child stay shared and
    /// the child is never marked runnable.
    pub fn fork(&mut self) -> Result<ForkOutcome, ForkError> {
        self.install_fault_handler()?;

        let child = match self.env.exofork().map_err(ForkError::Exofork)? {
            ExoFork::Child => {
                self.this = self.env.getpid().map_err(ForkError::Identity)?;
                debug!("fork: running as child {}", self.this);
                return Ok(ForkOutcome::Child);
            }
            ExoFork::Parent(child) => child,
        };

        let stats = self.duplicate_address_space(child)?;

        let stack = self.layout.exception_stack_bottom();
        self.env
            .page_alloc(child, stack, PermissionSet::private_rw())
            .map_err(ForkError::ExceptionStack)?;
        self.env
            .set_fault_upcall(child, self.upcall.clone())
            .map_err(ForkError::SetUpcall)?;
        self.env.set_runnable(child).map_err(ForkError::SetRunnable)?;

        info!(
            "fork: {} -> {child}: {} cow, {} shared, {} tables skipped",
            self.this, stats.cow_pages, stats.shared_pages, stats.skipped_tables
        );
        Ok(ForkOutcome::Parent { child, stats })
    }

    /// [`ProcessContext::fork`], terminating the process with a diagnostic on failure.
    pub fn fork_or_abort(&mut self) -> ForkOutcome {
        match self.fork() {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("fork: {} step failed: {err}", err.step());
                panic!("fork: {} step failed: {err}", err.step());
            }
        }
    }

    /// Shared-memory fork. Not implemented.
    pub fn sfork(&mut self) -> Result<ForkOutcome, ForkError> {
        Err(ForkError::Unsupported("sfork"))
    }

    fn duplicate_address_space(&mut self, child: Pid) -> Result<ForkStats, ForkError> {
        let exempt = CowExemptions::new(&self.layout, &self.pinned);
        let Range { start, end } = self.layout.scan_range();
        let mut stats = ForkStats::default();

        let mut va = start;
        while va < end {
            if !self.env.directory_present(va) {
                stats.skipped_tables += 1;
                va = va.next_table_boundary().map_or(end, |next| next.min(end));
                continue;
            }
            let page = va.page_index();
            if let Some(perm) = self.env.permissions_of(page) {
                if perm.is_present() && perm.is_user() {
                    let sharing = duplicate_page(&mut self.env, &exempt, child, page)
                        .map_err(|source| ForkError::Duplicate { va, source })?;
                    match sharing {
                        Sharing::CopyOnWrite => stats.cow_pages += 1,
                        Sharing::ReadShared => stats.shared_pages += 1,
                    }
                }
            }
            va = va.checked_add(PAGE_SIZE).unwrap_or(end);
        }
        Ok(stats)
    }
}
