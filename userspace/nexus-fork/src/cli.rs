// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host CLI: forks a simulated process and reports what copy-on-write did.

use std::path::Path;

use crate::addr::VirtAddr;
use crate::env::Syscalls;
use crate::fork::ForkOutcome;
use crate::host::{HostConfig, HostKernel};
use crate::layout::Layout;
use crate::perm::PermissionSet;

/// Returns the CLI usage string.
pub fn help() -> &'static str {
    "nexus-fork demonstrates copy-on-write fork on the host kernel. \
     Usage: nexus-fork [--help] [--layout <file.toml>] [--pages <n>]"
}

/// Executes the CLI using provided arguments.
pub fn execute(args: &[&str]) -> String {
    if args.iter().any(|arg| *arg == "--help") {
        return help().to_string();
    }
    match parse(args).and_then(|(layout, pages)| demo(layout, pages)) {
        Ok(report) => report,
        Err(err) => format!("error: {err}"),
    }
}

/// Parses `std::env::args` and prints the execution result.
pub fn run() {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    println!("{}", execute(&refs));
}

fn parse(args: &[&str]) -> Result<(Layout, usize), String> {
    let mut layout = Layout::default();
    let mut pages = 1usize;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "--layout" => {
                let path = iter.next().ok_or("--layout needs a file")?;
                layout = Layout::load(Path::new(path)).map_err(|err| err.to_string())?;
            }
            "--pages" => {
                let value = iter.next().ok_or("--pages needs a count")?;
                pages = value.parse().map_err(|_| format!("invalid page count {value:?}"))?;
                if pages == 0 {
                    return Err("--pages must be at least 1".into());
                }
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok((layout, pages))
}

/// Parent fills `pages` pages with 0x11, forks, the child overwrites the first with 0x22.
fn demo(layout: Layout, pages: usize) -> Result<String, String> {
    let kernel = HostKernel::new(HostConfig { layout, ..HostConfig::default() });
    let mut parent = kernel
        .spawn_root()
        .map_err(|err| err.to_string())?
        .into_context()
        .map_err(|err| err.to_string())?;
    let base = parent.layout().user_text;
    for i in 0..pages {
        let va = VirtAddr::new(base.as_usize() + i * nexus_abi::PAGE_SIZE);
        let env = parent.env_mut();
        env.page_alloc(nexus_abi::PID_SELF, va, PermissionSet::private_rw())
            .map_err(|err| format!("page_alloc {va}: {err}"))?;
        env.write(va, &[0x11; nexus_abi::PAGE_SIZE]).map_err(|err| err.to_string())?;
    }

    let ForkOutcome::Parent { child, stats } = parent.fork().map_err(|err| err.to_string())? else {
        return Err("parent observed the child outcome".into());
    };

    let before = kernel.stats().frames_allocated;
    let mut child_ctx = parent.inherit(kernel.resume_as_child(child).map_err(|err| err.to_string())?);
    if child_ctx.fork().map_err(|err| err.to_string())? != ForkOutcome::Child {
        return Err("child observed the parent outcome".into());
    }
    child_ctx.env_mut().write(base, &[0x22]).map_err(|err| err.to_string())?;
    let copied = kernel.stats().frames_allocated - before;

    let parent_byte = parent.env_mut().read(base, 1).map_err(|err| err.to_string())?;
    let child_byte = child_ctx.env_mut().read(base, 1).map_err(|err| err.to_string())?;

    Ok(format!(
        "forked {} -> {child}: {} cow, {} shared, {} tables skipped; \
         child write copied {copied} frame(s); parent sees {:#04x}, child sees {:#04x}",
        parent.pid(),
        stats.cow_pages,
        stats.shared_pages,
        stats.skipped_tables,
        parent_byte[0],
        child_byte[0],
    ))
}
