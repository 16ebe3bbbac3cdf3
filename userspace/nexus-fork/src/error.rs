// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types. Every variant is fatal for the calling process; callers report and abort.

use nexus_abi::{AbiError, FaultCause};
use thiserror::Error;

use crate::addr::VirtAddr;
use crate::perm::PermissionSet;

/// A delivered fault the copy-on-write handler refuses or fails to resolve.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FaultError {
    /// Faulting access was not a write.
    #[error("fault at {va} is not a write (cause {cause:?})")]
    NotWrite {
        /// Faulting address.
        va: VirtAddr,
        /// Decoded cause bits.
        cause: FaultCause,
    },
    /// No page table covers the faulting address.
    #[error("fault at {va}: page directory entry not present")]
    DirectoryNotPresent {
        /// Faulting address.
        va: VirtAddr,
    },
    /// Faulting page is not mapped.
    #[error("fault at {va}: page not present")]
    PageNotPresent {
        /// Faulting address.
        va: VirtAddr,
    },
    /// Faulting page is mapped but not copy-on-write.
    #[error("fault at {va}: page is not copy-on-write ({perm})")]
    NotCopyOnWrite {
        /// Faulting address.
        va: VirtAddr,
        /// Permissions found on the page.
        perm: PermissionSet,
    },
    /// A kernel call on the copy path failed.
    #[error("fault handler {op} failed: {err}")]
    Syscall {
        /// Failing operation.
        op: &'static str,
        /// Kernel error.
        err: AbiError,
    },
}

/// Failure while replicating one page mapping into a child.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DupError {
    /// Page is not mapped in the calling process.
    #[error("page {va} is not mapped")]
    NotMapped {
        /// Page address.
        va: VirtAddr,
    },
    /// Page belongs to the fault path and must never become copy-on-write.
    #[error("page {va} is reserved for fault handling and cannot be copy-on-write")]
    Reentrancy {
        /// Page address.
        va: VirtAddr,
    },
    /// Mapping the frame into the child failed.
    #[error("mapping {va} into child failed: {err}")]
    MapChild {
        /// Page address.
        va: VirtAddr,
        /// Kernel error.
        err: AbiError,
    },
    /// Re-marking the caller's own page copy-on-write failed.
    #[error("re-marking {va} copy-on-write failed: {err}")]
    RemapSelf {
        /// Page address.
        va: VirtAddr,
        /// Kernel error.
        err: AbiError,
    },
}

impl DupError {
    /// Kernel error behind this failure, if any.
    pub fn abi_error(&self) -> Option<AbiError> {
        match self {
            Self::MapChild { err, .. } | Self::RemapSelf { err, .. } => Some(*err),
            Self::NotMapped { .. } | Self::Reentrancy { .. } => None,
        }
    }
}

/// Invalid address-space layout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// An address is not page aligned.
    #[error("{field} {va} is not page aligned")]
    Unaligned {
        /// Offending field.
        field: &'static str,
        /// Offending address.
        va: VirtAddr,
    },
    /// An address reaches into the kernel-owned range.
    #[error("{field} {va} is above the user range")]
    AboveUserTop {
        /// Offending field.
        field: &'static str,
        /// Offending address.
        va: VirtAddr,
    },
    /// User text does not start below the exception stack.
    #[error("user text {user_text} must lie below the exception stack at {stack}")]
    Inverted {
        /// Start of user text.
        user_text: VirtAddr,
        /// Base of the exception stack page.
        stack: VirtAddr,
    },
    /// Scratch page lies inside the duplicated range and could become copy-on-write.
    #[error("scratch page {0} lies inside the duplicated range")]
    ScratchInScanRange(VirtAddr),
    /// Layout file could not be read.
    #[error("reading layout failed: {0}")]
    Io(String),
    /// Layout file could not be parsed.
    #[error("parsing layout failed: {0}")]
    Parse(String),
}

/// Fork failure; the variant names the step that failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForkError {
    /// Layout rejected at context construction.
    #[error("invalid layout: {0}")]
    Layout(#[from] LayoutError),
    /// Querying the caller's own pid failed.
    #[error("getpid failed: {0}")]
    Identity(AbiError),
    /// Installing the caller's fault handler failed.
    #[error("installing fault handler failed at {op}: {err}")]
    InstallHandler {
        /// Failing operation.
        op: &'static str,
        /// Kernel error.
        err: AbiError,
    },
    /// Kernel refused to create the child shell.
    #[error("exofork failed: {0}")]
    Exofork(AbiError),
    /// Replicating one page into the child failed.
    #[error("duplicating page {va} failed: {source}")]
    Duplicate {
        /// Page address.
        va: VirtAddr,
        /// Underlying failure.
        #[source]
        source: DupError,
    },
    /// Allocating the child's exception stack failed.
    #[error("allocating child exception stack failed: {0}")]
    ExceptionStack(AbiError),
    /// Registering the child's fault upcall failed.
    #[error("registering child fault upcall failed: {0}")]
    SetUpcall(AbiError),
    /// Marking the child runnable failed.
    #[error("marking child runnable failed: {0}")]
    SetRunnable(AbiError),
    /// Requested fork flavour is not implemented.
    #[error("{0} not implemented")]
    Unsupported(&'static str),
}

impl ForkError {
    /// Short name of the failing step, used in diagnostics.
    pub fn step(&self) -> &'static str {
        match self {
            Self::Layout(_) => "layout",
            Self::Identity(_) => "getpid",
            Self::InstallHandler { .. } => "install-handler",
            Self::Exofork(_) => "exofork",
            Self::Duplicate { .. } => "duplicate",
            Self::ExceptionStack(_) => "exception-stack",
            Self::SetUpcall(_) => "set-upcall",
            Self::SetRunnable(_) => "set-runnable",
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// Kernel error behind this failure, if any.
    pub fn abi_error(&self) -> Option<AbiError> {
        match self {
            Self::Identity(err)
            | Self::Exofork(err)
            | Self::ExceptionStack(err)
            | Self::SetUpcall(err)
            | Self::SetRunnable(err)
            | Self::InstallHandler { err, .. } => Some(*err),
            Self::Duplicate { source, .. } => source.abi_error(),
            Self::Layout(_) | Self::Unsupported(_) => None,
        }
    }
}
