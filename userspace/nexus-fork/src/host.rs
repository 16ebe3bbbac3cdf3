// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory kernel used by host-first tests and the CLI.
//!
//! [`HostKernel`] models the parts of the kernel fork relies on: reference-counted
//! frames, per-process page maps, run status, fault upcalls, and fault delivery on user
//! memory access. [`HostProcess`] is the calling-process handle that implements
//! [`UserEnv`](crate::env::UserEnv); pid `0` in its syscalls names itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use log::{error, trace};
use nexus_abi::{AbiError, FaultCause, Pid, PteBits, SysResult, UTrapFrame, PAGE_SIZE, PID_SELF, UTOP};
use parking_lot::Mutex;
use thiserror::Error;

use crate::addr::{PageIndex, VirtAddr};
use crate::env::{AddressSpaceView, ExoFork, PageCopy, Syscalls};
use crate::error::{FaultError, ForkError};
use crate::fault::handle_cow_fault;
use crate::fork::ProcessContext;
use crate::layout::Layout;
use crate::perm::{PageBits, PermissionSet};

/// Fault upcall as registered with the host kernel.
pub type HostUpcall =
    Arc<dyn Fn(&mut HostProcess, &UTrapFrame) -> Result<(), FaultError> + Send + Sync>;

/// Upcall that runs the copy-on-write handler with `layout`.
pub fn cow_upcall(layout: Layout) -> HostUpcall {
    Arc::new(move |process: &mut HostProcess, frame: &UTrapFrame| {
        handle_cow_fault(process, &layout, frame)
    })
}

/// Host kernel configuration.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Layout shared by every process; the kernel checks the exception stack against it.
    pub layout: Layout,
    /// Physical frames available before allocations fail with `NoMemory`.
    pub frame_budget: usize,
    /// Live processes allowed before `exofork` fails with `NoFreeProcess`.
    pub max_processes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { layout: Layout::default(), frame_budget: 1024, max_processes: 64 }
    }
}

/// Scheduling state tracked per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Created but not yet eligible for scheduling.
    NotRunnable,
    /// Eligible for scheduling.
    Runnable,
    /// Terminated after an unrecoverable fault.
    Dead,
}

/// Syscalls a failpoint can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostSyscall {
    /// `exofork`.
    Exofork,
    /// `page_alloc`.
    PageAlloc,
    /// `page_map`.
    PageMap,
    /// `set_fault_upcall`.
    SetFaultUpcall,
    /// `set_runnable`.
    SetRunnable,
}

/// Opaque physical frame number, for asserting sharing in tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

/// Frame accounting snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Frames referenced by at least one mapping.
    pub frames_in_use: usize,
    /// Frames handed out since boot.
    pub frames_allocated: u64,
}

/// User memory access that could not be completed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// Fault with no upcall registered; the process was killed.
    #[error("unhandled fault at {va} (cause {cause:?})")]
    Unhandled {
        /// Faulting address.
        va: VirtAddr,
        /// Fault cause.
        cause: FaultCause,
    },
    /// Fault delivered without a writable exception stack; the process was killed.
    #[error("fault at {va} with no usable exception stack")]
    NoExceptionStack {
        /// Faulting address.
        va: VirtAddr,
    },
    /// The upcall rejected or failed to resolve the fault; the process was killed.
    #[error("fatal fault at {va}: {source}")]
    Fatal {
        /// Faulting address.
        va: VirtAddr,
        /// Handler failure.
        #[source]
        source: FaultError,
    },
    /// The upcall returned but the access still faults; the process was killed.
    #[error("fault at {va} persisted after the upcall returned")]
    Unresolved {
        /// Faulting address.
        va: VirtAddr,
    },
    /// The process is dead or unknown.
    #[error("process {0} is not alive")]
    NotAlive(Pid),
}

struct Frame {
    data: Box<[u8]>,
    refs: usize,
}

#[derive(Clone, Copy)]
struct Pte {
    frame: usize,
    perm: PermissionSet,
}

struct Proc {
    parent: Option<Pid>,
    pages: BTreeMap<usize, Pte>,
    tables: BTreeSet<usize>,
    state: RunState,
    upcall: Option<HostUpcall>,
}

impl Proc {
    fn new(parent: Option<Pid>, state: RunState) -> Self {
        Self { parent, pages: BTreeMap::new(), tables: BTreeSet::new(), state, upcall: None }
    }
}

struct Failpoint {
    op: HostSyscall,
    skip: usize,
    err: AbiError,
}

struct Machine {
    config: HostConfig,
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
    stats: HostStats,
    procs: BTreeMap<Pid, Proc>,
    next_pid: Pid,
    failpoints: Vec<Failpoint>,
}

enum Probe {
    Hit(usize),
    Fault(FaultCause),
}

impl Machine {
    fn new(config: HostConfig) -> Self {
        Self {
            config,
            frames: Vec::new(),
            free: Vec::new(),
            stats: HostStats::default(),
            procs: BTreeMap::new(),
            next_pid: 0x1000,
            failpoints: Vec::new(),
        }
    }

    fn create_process(&mut self, parent: Option<Pid>, state: RunState) -> SysResult<Pid> {
        let live = self.procs.values().filter(|p| p.state != RunState::Dead).count();
        if live >= self.config.max_processes {
            return Err(AbiError::NoFreeProcess);
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.procs.insert(pid, Proc::new(parent, state));
        Ok(pid)
    }

    fn check_failpoint(&mut self, op: HostSyscall) -> SysResult<()> {
        let Some(index) = self.failpoints.iter().position(|fp| fp.op == op) else {
            return Ok(());
        };
        if self.failpoints[index].skip > 0 {
            self.failpoints[index].skip -= 1;
            return Ok(());
        }
        let fp = self.failpoints.remove(index);
        trace!("host: failpoint {:?} -> {}", fp.op, fp.err);
        Err(fp.err)
    }

    /// Resolves `pid` as named by `caller`: itself, or one of its own children.
    fn resolve(&self, caller: Pid, pid: Pid) -> SysResult<Pid> {
        let target = if pid == PID_SELF { caller } else { pid };
        let proc = self.procs.get(&target).ok_or(AbiError::BadProcess)?;
        if proc.state == RunState::Dead {
            return Err(AbiError::BadProcess);
        }
        if target != caller && proc.parent != Some(caller) {
            return Err(AbiError::BadProcess);
        }
        Ok(target)
    }

    fn alloc_frame(&mut self) -> SysResult<usize> {
        if self.stats.frames_in_use >= self.config.frame_budget {
            return Err(AbiError::NoMemory);
        }
        let frame = Frame { data: vec![0u8; PAGE_SIZE].into_boxed_slice(), refs: 0 };
        let index = match self.free.pop() {
            Some(index) => {
                self.frames[index] = Some(frame);
                index
            }
            None => {
                self.frames.push(Some(frame));
                self.frames.len() - 1
            }
        };
        self.stats.frames_in_use += 1;
        self.stats.frames_allocated += 1;
        Ok(index)
    }

    fn retain(&mut self, frame: usize) {
        if let Some(Some(f)) = self.frames.get_mut(frame) {
            f.refs += 1;
        }
    }

    fn release(&mut self, frame: usize) {
        let Some(slot) = self.frames.get_mut(frame) else { return };
        let Some(f) = slot.as_mut() else { return };
        f.refs -= 1;
        if f.refs == 0 {
            *slot = None;
            self.free.push(frame);
            self.stats.frames_in_use -= 1;
        }
    }

    fn install(&mut self, pid: Pid, va: VirtAddr, frame: usize, perm: PermissionSet) {
        self.retain(frame);
        let old = self.procs.get_mut(&pid).and_then(|proc| {
            proc.tables.insert(va.directory_index());
            proc.pages.insert(va.page_index().as_usize(), Pte { frame, perm })
        });
        if let Some(old) = old {
            self.release(old.frame);
        }
    }

    fn kill(&mut self, pid: Pid) {
        let Some(proc) = self.procs.get_mut(&pid) else { return };
        proc.state = RunState::Dead;
        proc.upcall = None;
        let pages = std::mem::take(&mut proc.pages);
        for pte in pages.values() {
            self.release(pte.frame);
        }
    }

    fn pte(&self, pid: Pid, va: VirtAddr) -> Option<Pte> {
        self.procs.get(&pid)?.pages.get(&va.page_index().as_usize()).copied()
    }

    fn probe(&self, pid: Pid, va: VirtAddr, write: bool) -> Probe {
        let user = FaultCause::USER;
        let access = if write { FaultCause::WRITE } else { FaultCause::empty() };
        match self.pte(pid, va) {
            Some(pte) if pte.perm.is_present() && pte.perm.is_user() => {
                if write && !pte.perm.is_writable() {
                    Probe::Fault(user | access | FaultCause::PROTECTION)
                } else {
                    Probe::Hit(pte.frame)
                }
            }
            Some(_) => Probe::Fault(user | access | FaultCause::PROTECTION),
            None => Probe::Fault(user | access),
        }
    }

    fn frame_data(&mut self, frame: usize) -> Option<&mut [u8]> {
        self.frames.get_mut(frame)?.as_mut().map(|f| &mut f.data[..])
    }
}

fn check_user_va(va: VirtAddr) -> SysResult<()> {
    if va.as_usize() >= UTOP || !va.is_page_aligned() {
        return Err(AbiError::InvalidArgument);
    }
    Ok(())
}

fn check_perm(perm: PermissionSet) -> SysResult<()> {
    let raw = perm.to_pte();
    if !raw.contains(PteBits::REQUIRED) || !PteBits::SYSCALL_MASK.contains(raw) {
        return Err(AbiError::InvalidArgument);
    }
    Ok(())
}

/// Shared simulated machine. Clones refer to the same machine.
#[derive(Clone)]
pub struct HostKernel {
    machine: Arc<Mutex<Machine>>,
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.machine.lock();
        f.debug_struct("HostKernel")
            .field("processes", &m.procs.len())
            .field("stats", &m.stats)
            .finish()
    }
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl HostKernel {
    /// Boots an empty machine.
    pub fn new(config: HostConfig) -> Self {
        Self { machine: Arc::new(Mutex::new(Machine::new(config))) }
    }

    /// Layout the machine was configured with.
    pub fn layout(&self) -> Layout {
        self.machine.lock().config.layout.clone()
    }

    /// Creates a runnable process with an empty address space, as the kernel does at boot.
    pub fn spawn_root(&self) -> SysResult<HostProcess> {
        let pid = self.machine.lock().create_process(None, RunState::Runnable)?;
        Ok(HostProcess { kernel: self.clone(), pid, resumed_child: false })
    }

    /// Schedules `pid` for the first time. Its first `exofork` observes the child sentinel,
    /// as the child's copy of the parent's registers would.
    pub fn resume_as_child(&self, pid: Pid) -> SysResult<HostProcess> {
        let m = self.machine.lock();
        match m.procs.get(&pid).map(|p| p.state) {
            Some(RunState::Runnable) => {}
            Some(_) => return Err(AbiError::InvalidArgument),
            None => return Err(AbiError::BadProcess),
        }
        Ok(HostProcess { kernel: self.clone(), pid, resumed_child: true })
    }

    /// Permissions of the page at `va` in `pid`.
    pub fn mapping(&self, pid: Pid, va: VirtAddr) -> Option<PermissionSet> {
        self.machine.lock().pte(pid, va).map(|pte| pte.perm)
    }

    /// Frame backing the page at `va` in `pid`.
    pub fn frame_of(&self, pid: Pid, va: VirtAddr) -> Option<FrameId> {
        self.machine.lock().pte(pid, va).map(|pte| FrameId(pte.frame))
    }

    /// Every mapped page of `pid`, in address order.
    pub fn mapped_pages(&self, pid: Pid) -> Vec<(VirtAddr, PermissionSet)> {
        let m = self.machine.lock();
        m.procs
            .get(&pid)
            .map(|proc| {
                proc.pages
                    .iter()
                    .map(|(index, pte)| (PageIndex::new(*index).base(), pte.perm))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw bytes of the page at `va` in `pid`, bypassing protection.
    pub fn peek(&self, pid: Pid, va: VirtAddr) -> Option<Vec<u8>> {
        let mut m = self.machine.lock();
        let pte = m.pte(pid, va)?;
        m.frame_data(pte.frame).map(|data| data.to_vec())
    }

    /// Scheduling state of `pid`.
    pub fn state(&self, pid: Pid) -> Option<RunState> {
        self.machine.lock().procs.get(&pid).map(|p| p.state)
    }

    /// Children created by `parent`, oldest first.
    pub fn children(&self, parent: Pid) -> Vec<Pid> {
        let m = self.machine.lock();
        m.procs.iter().filter(|(_, p)| p.parent == Some(parent)).map(|(pid, _)| *pid).collect()
    }

    /// Returns `true` when `pid` has a fault upcall registered.
    pub fn has_upcall(&self, pid: Pid) -> bool {
        self.machine.lock().procs.get(&pid).is_some_and(|p| p.upcall.is_some())
    }

    /// Frame accounting snapshot.
    pub fn stats(&self) -> HostStats {
        self.machine.lock().stats
    }

    /// Maps a fresh kernel-only (non-user) frame at `va` in `pid`.
    pub fn map_kernel_page(&self, pid: Pid, va: VirtAddr) -> SysResult<()> {
        let mut m = self.machine.lock();
        if !m.procs.contains_key(&pid) {
            return Err(AbiError::BadProcess);
        }
        check_user_va(va)?;
        let frame = m.alloc_frame()?;
        let perm = PermissionSet::new(PageBits::PRESENT, false);
        m.install(pid, va, frame, perm);
        Ok(())
    }

    /// Fails the next call of `op`, from any process, with `err`.
    pub fn fail_next(&self, op: HostSyscall, err: AbiError) {
        self.fail_after(op, 0, err);
    }

    /// Lets `skip` calls of `op` succeed, then fails the next one with `err`.
    pub fn fail_after(&self, op: HostSyscall, skip: usize, err: AbiError) {
        self.machine.lock().failpoints.push(Failpoint { op, skip, err });
    }
}

/// Handle through which one simulated process issues syscalls and touches its memory.
pub struct HostProcess {
    kernel: HostKernel,
    pid: Pid,
    resumed_child: bool,
}

impl fmt::Debug for HostProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostProcess").field("pid", &self.pid).finish()
    }
}

impl HostProcess {
    /// Pid of this process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Machine this process runs on.
    pub fn kernel(&self) -> &HostKernel {
        &self.kernel
    }

    /// Wraps this process in a fork context using the machine's layout and the COW upcall.
    pub fn into_context(self) -> Result<ProcessContext<HostProcess>, ForkError> {
        let layout = self.kernel.layout();
        ProcessContext::new(self, layout.clone(), cow_upcall(layout))
    }

    /// Reads `len` bytes starting at `va`, delivering faults like the hardware would.
    pub fn read(&mut self, va: VirtAddr, len: usize) -> Result<Vec<u8>, AccessError> {
        let mut out = Vec::with_capacity(len);
        let mut cursor = va;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(PAGE_SIZE - cursor.page_offset());
            let frame = self.resolve_access(cursor, false)?;
            let mut m = self.kernel.machine.lock();
            let data = m.frame_data(frame).ok_or(AccessError::NotAlive(self.pid))?;
            let offset = cursor.page_offset();
            out.extend_from_slice(&data[offset..offset + chunk]);
            drop(m);
            remaining -= chunk;
            cursor = VirtAddr::new(cursor.as_usize() + chunk);
        }
        Ok(out)
    }

    /// Writes `bytes` starting at `va`, delivering faults like the hardware would.
    pub fn write(&mut self, va: VirtAddr, bytes: &[u8]) -> Result<(), AccessError> {
        let mut cursor = va;
        let mut rest = bytes;
        while !rest.is_empty() {
            let chunk = rest.len().min(PAGE_SIZE - cursor.page_offset());
            let frame = self.resolve_access(cursor, true)?;
            let mut m = self.kernel.machine.lock();
            let data = m.frame_data(frame).ok_or(AccessError::NotAlive(self.pid))?;
            let offset = cursor.page_offset();
            data[offset..offset + chunk].copy_from_slice(&rest[..chunk]);
            drop(m);
            rest = &rest[chunk..];
            cursor = VirtAddr::new(cursor.as_usize() + chunk);
        }
        Ok(())
    }

    /// Probes `va`; on a fault runs the upcall once and probes again.
    fn resolve_access(&mut self, va: VirtAddr, write: bool) -> Result<usize, AccessError> {
        for attempt in 0..2 {
            let probe = {
                let m = self.kernel.machine.lock();
                match m.procs.get(&self.pid) {
                    Some(proc) if proc.state != RunState::Dead => m.probe(self.pid, va, write),
                    _ => return Err(AccessError::NotAlive(self.pid)),
                }
            };
            match probe {
                Probe::Hit(frame) => return Ok(frame),
                Probe::Fault(_) if attempt > 0 => {
                    self.kernel.machine.lock().kill(self.pid);
                    return Err(AccessError::Unresolved { va });
                }
                Probe::Fault(cause) => self.deliver_fault(va, cause)?,
            }
        }
        Err(AccessError::Unresolved { va })
    }

    fn deliver_fault(&mut self, va: VirtAddr, cause: FaultCause) -> Result<(), AccessError> {
        let upcall = {
            let mut m = self.kernel.machine.lock();
            let stack = m.config.layout.exception_stack_bottom();
            let Some(upcall) = m.procs.get(&self.pid).and_then(|p| p.upcall.clone()) else {
                m.kill(self.pid);
                return Err(AccessError::Unhandled { va, cause });
            };
            let stack_ok = m
                .pte(self.pid, stack)
                .is_some_and(|pte| pte.perm.is_writable() && !pte.perm.is_cow());
            if !stack_ok {
                m.kill(self.pid);
                return Err(AccessError::NoExceptionStack { va });
            }
            upcall
        };

        trace!("host: pid {} fault at {va} ({cause:?})", self.pid);
        let frame = UTrapFrame::new(va.as_usize(), cause);
        if let Err(source) = upcall(self, &frame) {
            error!("host: pid {} killed: {source}", self.pid);
            self.kernel.machine.lock().kill(self.pid);
            return Err(AccessError::Fatal { va, source });
        }
        Ok(())
    }
}

impl Syscalls for HostProcess {
    type Upcall = HostUpcall;

    fn getpid(&mut self) -> SysResult<Pid> {
        Ok(self.pid)
    }

    fn exofork(&mut self) -> SysResult<ExoFork> {
        if self.resumed_child {
            self.resumed_child = false;
            return Ok(ExoFork::Child);
        }
        let mut m = self.kernel.machine.lock();
        m.check_failpoint(HostSyscall::Exofork)?;
        m.resolve(self.pid, PID_SELF)?;
        let child = m.create_process(Some(self.pid), RunState::NotRunnable)?;
        trace!("host: exofork {} -> {child}", self.pid);
        Ok(ExoFork::Parent(child))
    }

    fn page_alloc(&mut self, pid: Pid, va: VirtAddr, perm: PermissionSet) -> SysResult<()> {
        let mut m = self.kernel.machine.lock();
        m.check_failpoint(HostSyscall::PageAlloc)?;
        let target = m.resolve(self.pid, pid)?;
        check_user_va(va)?;
        check_perm(perm)?;
        let frame = m.alloc_frame()?;
        m.install(target, va, frame, perm);
        Ok(())
    }

    fn page_map(
        &mut self,
        src: Pid,
        src_va: VirtAddr,
        dst: Pid,
        dst_va: VirtAddr,
        perm: PermissionSet,
    ) -> SysResult<()> {
        let mut m = self.kernel.machine.lock();
        m.check_failpoint(HostSyscall::PageMap)?;
        let src = m.resolve(self.pid, src)?;
        let dst = m.resolve(self.pid, dst)?;
        check_user_va(src_va)?;
        check_user_va(dst_va)?;
        check_perm(perm)?;
        let source = m.pte(src, src_va).ok_or(AbiError::InvalidArgument)?;
        if perm.is_writable() && !source.perm.is_writable() {
            return Err(AbiError::InvalidArgument);
        }
        m.install(dst, dst_va, source.frame, perm);
        Ok(())
    }

    fn set_fault_upcall(&mut self, pid: Pid, entry: HostUpcall) -> SysResult<()> {
        let mut m = self.kernel.machine.lock();
        m.check_failpoint(HostSyscall::SetFaultUpcall)?;
        let target = m.resolve(self.pid, pid)?;
        if let Some(proc) = m.procs.get_mut(&target) {
            proc.upcall = Some(entry);
        }
        Ok(())
    }

    fn set_runnable(&mut self, pid: Pid) -> SysResult<()> {
        let mut m = self.kernel.machine.lock();
        m.check_failpoint(HostSyscall::SetRunnable)?;
        let target = m.resolve(self.pid, pid)?;
        if let Some(proc) = m.procs.get_mut(&target) {
            proc.state = RunState::Runnable;
        }
        Ok(())
    }
}

impl AddressSpaceView for HostProcess {
    fn directory_present(&self, va: VirtAddr) -> bool {
        let m = self.kernel.machine.lock();
        m.procs.get(&self.pid).is_some_and(|p| p.tables.contains(&va.directory_index()))
    }

    fn permissions_of(&self, page: PageIndex) -> Option<PermissionSet> {
        self.kernel.machine.lock().pte(self.pid, page.base()).map(|pte| pte.perm)
    }
}

impl PageCopy for HostProcess {
    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> SysResult<()> {
        if !dst.is_page_aligned() || !src.is_page_aligned() || dst == src {
            return Err(AbiError::InvalidArgument);
        }
        let mut m = self.kernel.machine.lock();
        let src_frame = match m.probe(self.pid, src, false) {
            Probe::Hit(frame) => frame,
            Probe::Fault(_) => return Err(AbiError::Fault),
        };
        let dst_frame = match m.probe(self.pid, dst, true) {
            Probe::Hit(frame) => frame,
            Probe::Fault(_) => return Err(AbiError::Fault),
        };
        if src_frame == dst_frame {
            return Ok(());
        }
        let bytes = m.frame_data(src_frame).ok_or(AbiError::Fault)?.to_vec();
        m.frame_data(dst_frame).ok_or(AbiError::Fault)?.copy_from_slice(&bytes);
        Ok(())
    }
}
