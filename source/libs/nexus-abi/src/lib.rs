// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    not(all(target_arch = "riscv64", target_os = "none")),
    forbid(unsafe_code)
)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Process-lifecycle and address-space ABI exposed to userland crates
//! OWNERS: @runtime
//! PUBLIC API: Pid, AbiError, PteBits, FaultCause, UTrapFrame, ProcStatus; OS-only syscalls: exofork, getpid, page_*, set_status, set_fault_upcall, vpd/vpt
//! DEPENDS_ON: no_std (OS), riscv ecall asm (OS), bitflags
//! INVARIANTS: Negative raw returns decode to AbiError; PteBits::AVAIL_COW is stored but never interpreted by the kernel
//! ADR: docs/adr/0016-kernel-libs-architecture.md

use core::fmt;

use bitflags::bitflags;

/// Kernel process identifier.
///
/// In syscall arguments `0` names the calling process. In the [`exofork`] result `0` is
/// the sentinel observed by the freshly created child.
pub type Pid = u32;

/// Pid value that refers to the calling process in syscall arguments.
pub const PID_SELF: Pid = 0;

/// Result returned by the syscall wrappers.
pub type SysResult<T> = core::result::Result<T, AbiError>;

// ——— Memory layout ———

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Page-table entries covered by one page-directory entry.
pub const PAGES_PER_TABLE: usize = 1024;
/// Bytes mapped by one page-directory entry.
pub const PTSIZE: usize = PAGE_SIZE * PAGES_PER_TABLE;
/// Top of the user-accessible range; everything above belongs to the kernel.
pub const UTOP: usize = 0xeec0_0000;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Start of user program text.
pub const UTEXT: usize = 2 * PTSIZE;
/// Base of the temporary-mapping window below user text.
pub const UTEMP: usize = PTSIZE;
/// Scratch page used by the fault handler while copying a page.
pub const PFTEMP: usize = UTEMP + PTSIZE - PAGE_SIZE;
/// Read-only window exposing the caller's own page-table entries.
pub const UVPT: usize = 0xef40_0000;
/// Read-only window exposing the caller's own page-directory entries.
pub const UVPD: usize = UVPT + (UVPT >> 10);

bitflags! {
    /// Raw page-table entry bits as stored by the kernel.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteBits: usize {
        /// Entry maps a frame.
        const PRESENT = 1 << 0;
        /// Frame is writable.
        const WRITABLE = 1 << 1;
        /// Frame is reachable from user mode.
        const USER = 1 << 2;
        /// Copy-on-write tag; one of the bits reserved for userland use.
        const AVAIL_COW = 0x800;
    }
}

impl PteBits {
    /// Bits userland may pass to [`page_alloc`] and [`page_map`].
    pub const SYSCALL_MASK: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::AVAIL_COW);
    /// Bits every user mapping must carry.
    pub const REQUIRED: Self = Self::PRESENT.union(Self::USER);

    /// Extracts the flag portion of a raw page-table entry.
    pub const fn from_entry(entry: usize) -> Self {
        Self::from_bits_truncate(entry)
    }
}

bitflags! {
    /// Fault-cause bits delivered in [`UTrapFrame::err`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FaultCause: u32 {
        /// Fault was a protection violation on a present page.
        const PROTECTION = 1 << 0;
        /// Faulting access was a write.
        const WRITE = 1 << 1;
        /// Fault happened in user mode.
        const USER = 1 << 2;
    }
}

/// Trap frame the kernel pushes onto the user exception stack before invoking the upcall.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapFrame {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Raw [`FaultCause`] bits.
    pub err: u32,
    /// Reserved, keeps the layout 8-byte aligned.
    pub _pad: u32,
    /// Program counter at the time of the fault.
    pub pc: usize,
    /// Stack pointer at the time of the fault.
    pub sp: usize,
}

impl UTrapFrame {
    /// Builds a frame for a fault at `fault_va` with the given cause.
    pub const fn new(fault_va: usize, cause: FaultCause) -> Self {
        Self { fault_va, err: cause.bits(), _pad: 0, pc: 0, sp: 0 }
    }

    /// Decoded fault cause; unknown bits are dropped.
    pub const fn cause(&self) -> FaultCause {
        FaultCause::from_bits_truncate(self.err)
    }
}

/// Low-level entry the kernel jumps to (on the exception stack) when a user fault occurs.
pub type FaultUpcall = extern "C" fn(&UTrapFrame);

/// Scheduling status userland may request for a child it created.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcStatus {
    /// Eligible for scheduling.
    Runnable = 1,
    /// Exists but must not be scheduled.
    NotRunnable = 2,
}

/// Errors surfaced when invoking process and memory syscalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiError {
    /// Kernel reported a failure without further detail.
    Unspecified,
    /// Pid does not exist or the caller may not act on it.
    BadProcess,
    /// Syscall arguments were invalid for the requested operation.
    InvalidArgument,
    /// No physical memory left to satisfy the request.
    NoMemory,
    /// Process table is full.
    NoFreeProcess,
    /// Referenced memory is not mapped.
    Fault,
    /// Operation unsupported on the current build target.
    Unsupported,
}

impl AbiError {
    /// Decodes a raw syscall return; non-negative values are not errors.
    pub fn from_raw(value: isize) -> Option<Self> {
        if value >= 0 {
            return None;
        }
        Some(match -value {
            2 => Self::BadProcess,
            3 => Self::InvalidArgument,
            4 => Self::NoMemory,
            5 => Self::NoFreeProcess,
            6 => Self::Fault,
            38 => Self::Unsupported,
            _ => Self::Unspecified,
        })
    }

    /// Negative code the kernel uses for this error.
    pub const fn code(self) -> isize {
        match self {
            Self::Unspecified => -1,
            Self::BadProcess => -2,
            Self::InvalidArgument => -3,
            Self::NoMemory => -4,
            Self::NoFreeProcess => -5,
            Self::Fault => -6,
            Self::Unsupported => -38,
        }
    }
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unspecified => "unspecified error",
            Self::BadProcess => "bad process",
            Self::InvalidArgument => "invalid argument",
            Self::NoMemory => "out of memory",
            Self::NoFreeProcess => "out of processes",
            Self::Fault => "segmentation fault",
            Self::Unsupported => "unsupported",
        };
        write!(f, "{text} ({})", self.code())
    }
}

/// Syscall numbers understood by the kernel.
pub mod nr {
    /// Returns the caller's pid.
    pub const GETPID: usize = 25;
    /// Creates an empty, not-runnable child shell.
    pub const EXOFORK: usize = 40;
    /// Allocates and maps one zeroed page.
    pub const PAGE_ALLOC: usize = 41;
    /// Shares one frame between two address spaces.
    pub const PAGE_MAP: usize = 42;
    /// Removes one mapping.
    pub const PAGE_UNMAP: usize = 43;
    /// Changes a child's scheduling status.
    pub const SET_STATUS: usize = 44;
    /// Registers the fault upcall of a process.
    pub const SET_FAULT_UPCALL: usize = 45;
}

// ——— Syscall wrappers ———

/// Creates a child shell with an empty user address space.
///
/// Returns the child's pid to the parent and [`PID_SELF`] (`0`) when observed from the
/// child's own execution context.
pub fn exofork() -> SysResult<Pid> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe {
            // SAFETY: no arguments; the kernel duplicates the register file and returns twice.
            ecall0(nr::EXOFORK)
        };
        decode_syscall(raw).map(|pid| pid as Pid)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

/// Returns the calling process's pid.
pub fn getpid() -> SysResult<Pid> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall0(nr::GETPID) };
        decode_syscall(raw).map(|pid| pid as Pid)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

/// Allocates a zero-filled page and maps it at `va` in `pid` with `perm`.
pub fn page_alloc(pid: Pid, va: usize, perm: PteBits) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall3(nr::PAGE_ALLOC, pid as usize, va, perm.bits()) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (pid, va, perm);
        Err(AbiError::Unsupported)
    }
}

/// Maps the frame behind `src_va` in `src` at `dst_va` in `dst` with `perm`.
///
/// Any existing mapping at the destination is replaced.
pub fn page_map(src: Pid, src_va: usize, dst: Pid, dst_va: usize, perm: PteBits) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe {
            // SAFETY: all arguments are plain integers validated by the kernel.
            ecall5(nr::PAGE_MAP, src as usize, src_va, dst as usize, dst_va, perm.bits())
        };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (src, src_va, dst, dst_va, perm);
        Err(AbiError::Unsupported)
    }
}

/// Removes the mapping at `va` in `pid`; unmapping an absent page succeeds.
pub fn page_unmap(pid: Pid, va: usize) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall2(nr::PAGE_UNMAP, pid as usize, va) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (pid, va);
        Err(AbiError::Unsupported)
    }
}

/// Sets the scheduling status of `pid`.
pub fn set_status(pid: Pid, status: ProcStatus) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall2(nr::SET_STATUS, pid as usize, status as usize) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (pid, status);
        Err(AbiError::Unsupported)
    }
}

/// Registers `entry` as the fault upcall of `pid`.
pub fn set_fault_upcall(pid: Pid, entry: FaultUpcall) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall2(nr::SET_FAULT_UPCALL, pid as usize, entry as usize) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (pid, entry);
        Err(AbiError::Unsupported)
    }
}

// ——— Read-only page-table views ———

/// Raw page-directory entry `dir_index` of the calling process.
///
/// Off-target builds observe an empty address space.
pub fn vpd(dir_index: usize) -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        // SAFETY: the kernel maps the caller's directory read-only at UVPD for every process.
        unsafe { core::ptr::read_volatile((UVPD as *const usize).add(dir_index)) }
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = dir_index;
        0
    }
}

/// Raw page-table entry `page_index` of the calling process.
///
/// Only meaningful when the covering directory entry is present.
pub fn vpt(page_index: usize) -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        // SAFETY: the caller checked the directory entry; UVPT exposes the tables read-only.
        unsafe { core::ptr::read_volatile((UVPT as *const usize).add(page_index)) }
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = page_index;
        0
    }
}

/// Copies one page from `src` to `dst` in the caller's own address space.
pub fn page_copy(dst: usize, src: usize) -> SysResult<()> {
    if dst % PAGE_SIZE != 0 || src % PAGE_SIZE != 0 || dst == src {
        return Err(AbiError::InvalidArgument);
    }
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        // SAFETY: both pages are mapped by the caller, page aligned and distinct.
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PAGE_SIZE) };
        Ok(())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn decode_syscall(value: usize) -> SysResult<usize> {
    match AbiError::from_raw(value as isize) {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

// ——— Architecture-specific ecall helpers (riscv64, OS) ———
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall0(n: usize) -> usize {
    let mut r7 = n;
    let r0: usize;
    core::arch::asm!(
        "ecall",
        inout("a7") r7,
        lateout("a0") r0,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall2(n: usize, a0: usize, a1: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall3(n: usize, a0: usize, a1: usize, a2: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r2 = a2;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a2") r2,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall5(n: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r2 = a2;
    let mut r3 = a3;
    let mut r4 = a4;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a2") r2,
        inout("a3") r3,
        inout("a4") r4,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}
