// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for copy-on-write fork on the host kernel
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 11 integration tests
//!
//! TEST_SCOPE:
//!   - Page policy after fork (read-only sharing, COW tagging)
//!   - Write isolation and content preservation across the fault path
//!   - Exception stack independence and hole preservation
//!   - Fault rejection for reads, absent pages and non-COW pages
//!
//! TEST_SCENARIOS:
//!   - child_write_copies_exactly_one_frame(): 0x11/0x22 reference scenario
//!   - read_only_pages_share_the_frame(): read-only pages stay shared and unwritable
//!   - writable_and_cow_pages_become_cow_on_both_sides(): COW tagging in parent and child
//!   - parent_write_leaves_child_unchanged(): isolation in the other direction
//!   - untouched_bytes_survive_the_copy(): only the written bytes change
//!   - exception_stacks_are_private(): parent and child stacks never share a frame
//!   - holes_and_kernel_pages_are_not_copied(): unmapped and kernel-only pages stay out of the child
//!   - absent_directories_are_skipped(): walk skips whole tables
//!   - child_observes_child_outcome(): child side of fork returns the sentinel outcome
//!   - grandchild_fork_from_child(): a child can fork again with COW pages inherited
//!   - rejected_faults_are_fatal_and_copy_nothing(): reads, absent and non-COW pages
//!
//! DEPENDENCIES:
//!   - nexus_fork::host: in-memory kernel
//!   - nexus_fork::ProcessContext: fork orchestration
//!
//! ADR: docs/adr/0016-kernel-libs-architecture.md

use nexus_abi::{FaultCause, UTrapFrame, PAGE_SIZE, PID_SELF, PTSIZE, UTEXT};
use nexus_fork::host::{AccessError, HostKernel, HostProcess, RunState};
use nexus_fork::{
    handle_cow_fault, FaultError, ForkOutcome, Layout, PermissionSet, ProcessContext, Syscalls,
    VirtAddr,
};

fn page(n: usize) -> VirtAddr {
    VirtAddr::new(UTEXT + n * PAGE_SIZE)
}

fn boot() -> (HostKernel, ProcessContext<HostProcess>) {
    let kernel = HostKernel::default();
    let ctx = kernel.spawn_root().expect("root").into_context().expect("context");
    (kernel, ctx)
}

fn map_filled(ctx: &mut ProcessContext<HostProcess>, va: VirtAddr, byte: u8, writable: bool) {
    let env = ctx.env_mut();
    env.page_alloc(PID_SELF, va, PermissionSet::private_rw()).expect("alloc");
    env.write(va, &[byte; PAGE_SIZE]).expect("fill");
    if !writable {
        env.page_map(PID_SELF, va, PID_SELF, va, PermissionSet::read_shared()).expect("demote");
    }
}

fn fork_both(
    kernel: &HostKernel,
    parent: &mut ProcessContext<HostProcess>,
) -> (ProcessContext<HostProcess>, nexus_fork::ForkStats) {
    let ForkOutcome::Parent { child, stats } = parent.fork().expect("fork") else {
        panic!("parent observed child outcome");
    };
    let mut child_ctx = parent.inherit(kernel.resume_as_child(child).expect("resume"));
    assert_eq!(child_ctx.fork().expect("child fork"), ForkOutcome::Child);
    (child_ctx, stats)
}

#[test]
fn child_write_copies_exactly_one_frame() {
    let (kernel, mut parent) = boot();
    let va = page(0);
    map_filled(&mut parent, va, 0x11, true);

    let (mut child, stats) = fork_both(&kernel, &mut parent);
    assert_eq!(stats.cow_pages, 1);

    let before = kernel.stats().frames_allocated;
    child.env_mut().write(va, &[0x22]).expect("child write");
    assert_eq!(kernel.stats().frames_allocated - before, 1);

    let child_view = child.env_mut().read(va, PAGE_SIZE).expect("child read");
    assert_eq!(child_view[0], 0x22);
    assert!(child_view[1..].iter().all(|b| *b == 0x11));

    let parent_view = parent.env_mut().read(va, PAGE_SIZE).expect("parent read");
    assert!(parent_view.iter().all(|b| *b == 0x11));
    assert_eq!(kernel.stats().frames_allocated - before, 1, "parent read must not copy");
}

#[test]
fn read_only_pages_share_the_frame() {
    let (kernel, mut parent) = boot();
    let va = page(3);
    map_filled(&mut parent, va, 0x5a, false);

    let (child, stats) = fork_both(&kernel, &mut parent);
    assert_eq!(stats.shared_pages, 1);
    assert_eq!(stats.cow_pages, 0);

    for pid in [parent.pid(), child.pid()] {
        assert_eq!(kernel.mapping(pid, va), Some(PermissionSet::read_shared()));
    }
    assert_eq!(kernel.frame_of(parent.pid(), va), kernel.frame_of(child.pid(), va));
    assert_eq!(kernel.peek(child.pid(), va), Some(vec![0x5a; PAGE_SIZE]));
}

#[test]
fn writable_and_cow_pages_become_cow_on_both_sides() {
    let (kernel, mut parent) = boot();
    map_filled(&mut parent, page(0), 1, true);
    map_filled(&mut parent, page(1), 2, true);

    // First fork turns page(1) COW in the parent; the second fork must keep it COW.
    let (_first, _) = fork_both(&kernel, &mut parent);
    assert!(kernel.mapping(parent.pid(), page(1)).is_some_and(|p| p.is_cow()));

    let (second, stats) = fork_both(&kernel, &mut parent);
    assert_eq!(stats.cow_pages, 2);
    for pid in [parent.pid(), second.pid()] {
        for va in [page(0), page(1)] {
            let perm = kernel.mapping(pid, va).expect("mapped");
            assert!(perm.is_present() && perm.is_user() && perm.is_cow());
            assert!(!perm.is_writable());
        }
    }
}

#[test]
fn parent_write_leaves_child_unchanged() {
    let (kernel, mut parent) = boot();
    let va = page(0);
    map_filled(&mut parent, va, 0x11, true);
    let (mut child, _) = fork_both(&kernel, &mut parent);

    parent.env_mut().write(va, &[0x33; 16]).expect("parent write");
    assert_eq!(kernel.mapping(parent.pid(), va), Some(PermissionSet::private_rw()));
    assert_eq!(child.env_mut().read(va, 16).expect("child read"), vec![0x11; 16]);
    assert_ne!(kernel.frame_of(parent.pid(), va), kernel.frame_of(child.pid(), va));
}

#[test]
fn untouched_bytes_survive_the_copy() {
    let (kernel, mut parent) = boot();
    let va = page(0);
    parent.env_mut().page_alloc(PID_SELF, va, PermissionSet::private_rw()).expect("alloc");
    let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    parent.env_mut().write(va, &pattern).expect("fill");

    let (mut child, _) = fork_both(&kernel, &mut parent);
    let at = VirtAddr::new(va.as_usize() + 100);
    child.env_mut().write(at, &[0xff, 0xfe]).expect("child write");

    let after = child.env_mut().read(va, PAGE_SIZE).expect("read");
    let mut expected = pattern.clone();
    expected[100] = 0xff;
    expected[101] = 0xfe;
    assert_eq!(after, expected);
    assert_eq!(parent.env_mut().read(va, PAGE_SIZE).expect("parent"), pattern);
}

#[test]
fn exception_stacks_are_private() {
    let (kernel, mut parent) = boot();
    map_filled(&mut parent, page(0), 0, true);
    let (child, _) = fork_both(&kernel, &mut parent);

    let stack = Layout::default().exception_stack_bottom();
    for pid in [parent.pid(), child.pid()] {
        assert_eq!(kernel.mapping(pid, stack), Some(PermissionSet::private_rw()));
        assert!(kernel.has_upcall(pid));
    }
    assert_ne!(kernel.frame_of(parent.pid(), stack), kernel.frame_of(child.pid(), stack));
}

#[test]
fn holes_and_kernel_pages_are_not_copied() {
    let (kernel, mut parent) = boot();
    map_filled(&mut parent, page(0), 1, true);
    map_filled(&mut parent, page(2), 2, true);
    let far = VirtAddr::new(UTEXT + 7 * PTSIZE + 5 * PAGE_SIZE);
    map_filled(&mut parent, far, 3, false);
    kernel.map_kernel_page(parent.pid(), page(4)).expect("kernel page");

    let (child, stats) = fork_both(&kernel, &mut parent);
    assert_eq!(stats.cow_pages, 2);
    assert_eq!(stats.shared_pages, 1);

    let stack = Layout::default().exception_stack_bottom();
    let child_pages: Vec<VirtAddr> =
        kernel.mapped_pages(child.pid()).into_iter().map(|(va, _)| va).collect();
    assert_eq!(child_pages, vec![page(0), page(2), far, stack]);
    assert_eq!(kernel.mapping(child.pid(), page(1)), None);
    assert_eq!(kernel.mapping(child.pid(), page(4)), None);
}

#[test]
fn absent_directories_are_skipped() {
    let (kernel, mut parent) = boot();
    map_filled(&mut parent, page(0), 1, true);
    let (_child, stats) = fork_both(&kernel, &mut parent);

    // Tables 2 (user text) and the exception stack's are present; the rest are skipped.
    let layout = Layout::default();
    let first = layout.user_text.directory_index();
    let last = layout.exception_stack_bottom().directory_index();
    assert_eq!(stats.skipped_tables, last - first - 1);
}

#[test]
fn child_observes_child_outcome() {
    let (kernel, mut parent) = boot();
    let parent_pid = parent.pid();
    map_filled(&mut parent, page(0), 1, true);
    let (child, _) = fork_both(&kernel, &mut parent);

    assert_ne!(child.pid(), parent_pid);
    assert!(child.handler_installed());
    assert_eq!(kernel.state(child.pid()), Some(RunState::Runnable));
}

#[test]
fn grandchild_fork_from_child() {
    let (kernel, mut parent) = boot();
    map_filled(&mut parent, page(0), 0x11, true);
    let (mut child, _) = fork_both(&kernel, &mut parent);
    let (mut grandchild, stats) = fork_both(&kernel, &mut child);
    assert_eq!(stats.cow_pages, 1);

    grandchild.env_mut().write(page(0), &[0x44]).expect("grandchild write");
    assert_eq!(grandchild.env_mut().read(page(0), 1).expect("read"), vec![0x44]);
    assert_eq!(child.env_mut().read(page(0), 1).expect("read"), vec![0x11]);
    assert_eq!(parent.env_mut().read(page(0), 1).expect("read"), vec![0x11]);
}

#[test]
fn rejected_faults_are_fatal_and_copy_nothing() {
    let (kernel, mut parent) = boot();
    map_filled(&mut parent, page(0), 1, true);
    map_filled(&mut parent, page(1), 2, false);
    parent.install_fault_handler().expect("install");
    let layout = Layout::default();
    let before = kernel.stats().frames_allocated;

    let read = UTrapFrame::new(page(0).as_usize(), FaultCause::USER | FaultCause::PROTECTION);
    let absent_table = UTrapFrame::new(UTEXT + 9 * PTSIZE, FaultCause::USER | FaultCause::WRITE);
    let absent_page = UTrapFrame::new(page(5).as_usize(), FaultCause::USER | FaultCause::WRITE);
    let plain = UTrapFrame::new(
        page(0).as_usize() + 8,
        FaultCause::USER | FaultCause::WRITE | FaultCause::PROTECTION,
    );
    let env = parent.env_mut();
    assert!(matches!(handle_cow_fault(env, &layout, &read), Err(FaultError::NotWrite { .. })));
    assert!(matches!(
        handle_cow_fault(env, &layout, &absent_table),
        Err(FaultError::DirectoryNotPresent { .. })
    ));
    assert!(matches!(
        handle_cow_fault(env, &layout, &absent_page),
        Err(FaultError::PageNotPresent { .. })
    ));
    assert!(matches!(
        handle_cow_fault(env, &layout, &plain),
        Err(FaultError::NotCopyOnWrite { .. })
    ));
    assert_eq!(kernel.stats().frames_allocated, before);

    // A write to a read-only, untagged page reaches the handler and kills the process.
    let err = parent.env_mut().write(page(1), &[9]).expect_err("read-only page");
    assert!(matches!(
        err,
        AccessError::Fatal { source: FaultError::NotCopyOnWrite { .. }, .. }
    ));
    assert_eq!(kernel.state(parent.pid()), Some(RunState::Dead));
    assert_eq!(kernel.stats().frames_allocated, before);
}
