// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-space copy-on-write fork built on the exofork/page_map process ABI
//! OWNERS: @runtime
//! PUBLIC API: ProcessContext (fork, sfork, install_fault_handler), handle_cow_fault, duplicate_page, Layout
//! DEPENDS_ON: nexus-abi, log, thiserror, serde/toml (layout files), parking_lot (host backend)
//! INVARIANTS: Writable pages are shared only as COW in both processes; the scratch page and
//!   exception stack are never COW; a child is marked runnable only after its address space,
//!   exception stack and upcall are in place
//!
//! The fork logic is written against the traits in [`env`]. Two backends implement them:
//! `backend-host` provides an in-memory kernel for tests and the CLI, `backend-os` issues
//! the real syscalls through `nexus-abi`.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod addr;
pub mod dup;
pub mod env;
pub mod error;
pub mod fault;
pub mod fork;
pub mod layout;
pub mod perm;

#[cfg(feature = "backend-host")]
pub mod cli;
#[cfg(feature = "backend-host")]
pub mod host;
#[cfg(feature = "backend-os")]
pub mod os;

pub use addr::{PageIndex, VirtAddr};
pub use dup::{duplicate_page, CowExemptions, Sharing};
pub use env::{AddressSpaceView, ExoFork, PageCopy, Syscalls, UserEnv};
pub use error::{DupError, FaultError, ForkError, LayoutError};
pub use fault::{check_cow_fault, handle_cow_fault};
pub use fork::{ForkOutcome, ForkStats, ProcessContext};
pub use layout::Layout;
pub use perm::{PageBits, PermissionSet};
