//! Runner mode: executes inside the private mount namespace.
//!
//! The process stacks the root overlay onto `merged`, then one overlay per
//! extra mount (shallowest first) at `merged/<relative-mount-point>`. The
//! script itself runs in a child that chroots into `merged`, changes to the
//! requested working directory, drops privileges, and execs a shell with
//! strict-error options. Exit code 2 is reserved for infrastructure
//! failures so callers can tell them apart from script exits.
//!
//! The kernel tears the mounts down when the namespace ends; an explicit
//! detach pass still runs so a lingering namespace cannot pin the stack.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::constants::RUNNER_INFRA_EXIT;
use crate::fs::paths::depth;
use crate::overlay::{load_spec, RunnerSpec};

/// Entry point for `atomic-shell __runner --spec <path>`; returns the
/// process exit code.
pub fn main(args: &[OsString]) -> i32 {
    let spec_path = match parse_args(args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("runner argument error: {e}");
            return RUNNER_INFRA_EXIT;
        }
    };
    let spec = match load_spec(&spec_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("runner spec error: {e}");
            return RUNNER_INFRA_EXIT;
        }
    };
    run_in_namespace(&spec)
}

fn parse_args(args: &[OsString]) -> io::Result<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--spec" {
            return iter
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing --spec value"));
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidInput, "missing --spec"))
}

fn run_in_namespace(spec: &RunnerSpec) -> i32 {
    let mut mounted: Vec<PathBuf> = Vec::new();
    let code = stack_and_run(spec, &mut mounted);
    // Defensive teardown, deepest overlay first.
    for target in mounted.iter().rev() {
        let _ = umount2(target, MntFlags::MNT_DETACH);
    }
    code
}

fn stack_and_run(spec: &RunnerSpec, mounted: &mut Vec<PathBuf>) -> i32 {
    if let Err(e) = mount_overlay(
        &spec.merged_dir,
        &spec.root_lower_dir,
        &spec.root_upper_dir,
        &spec.root_work_dir,
    ) {
        eprintln!("{e}");
        return RUNNER_INFRA_EXIT;
    }
    mounted.push(spec.merged_dir.clone());

    let mut extra = spec.extra_mounts.clone();
    extra.sort_by_key(|m| depth(&m.mount_point));
    for m in &extra {
        let rel = m
            .mount_point
            .strip_prefix("/")
            .unwrap_or(&m.mount_point)
            .to_path_buf();
        let target = spec.merged_dir.join(rel);
        if let Err(e) = mount_overlay(&target, &m.lower_dir, &m.upper_dir, &m.work_dir) {
            eprintln!("{e}");
            return RUNNER_INFRA_EXIT;
        }
        mounted.push(target);
    }

    exec_script(spec)
}

fn mount_overlay(target: &Path, lower: &Path, upper: &Path, work: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;
    std::fs::create_dir_all(upper)?;
    std::fs::create_dir_all(work)?;
    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|e| {
        io::Error::other(format!("mount overlay at {}: {e}", target.display()))
    })
}

/// Run the script in a child that enters the merged root and sheds
/// privileges before exec. The parent stays outside the chroot so it can
/// unwind the overlay stack afterwards.
fn exec_script(spec: &RunnerSpec) -> i32 {
    use std::os::unix::process::CommandExt;

    let merged = spec.merged_dir.clone();
    let cwd = spec.cwd.clone();
    let uid = nix::unistd::Uid::from_raw(spec.run_as_uid);
    let gid = nix::unistd::Gid::from_raw(spec.run_as_gid);

    let mut cmd = Command::new("/bin/bash");
    cmd.arg("-eu").arg(&spec.script_path).args(&spec.script_args);
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::chroot(&merged).map_err(errno_to_io)?;
            std::env::set_current_dir(&cwd)?;
            nix::unistd::setgroups(&[]).map_err(errno_to_io)?;
            nix::unistd::setgid(gid).map_err(errno_to_io)?;
            nix::unistd::setuid(uid).map_err(errno_to_io)?;
            Ok(())
        });
    }
    match cmd.status() {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            status
                .code()
                .or_else(|| status.signal().map(|s| 128 + s))
                .unwrap_or(RUNNER_INFRA_EXIT)
        }
        Err(e) => {
            eprintln!("failed to execute script: {e}");
            RUNNER_INFRA_EXIT
        }
    }
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
