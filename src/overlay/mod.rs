//! Overlay orchestration: plan the per-run workspace, write the runner
//! specification, and execute the script inside a private mount namespace
//! by re-executing this binary in runner mode.

#[cfg(target_os = "linux")]
pub mod runner;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::constants::{RUNNER_MODE_ARG, RUNNER_SPEC_FILE};
use crate::fs::paths::depth;
use crate::mounts;
use crate::types::errors::{EngineError, Result};

/// One overlay to stack: the live mount point serves as the lower layer,
/// upper/work hold the staged mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub mount_point: PathBuf,
    pub lower_dir: PathBuf,
    #[serde(default)]
    pub upper_dir: PathBuf,
    #[serde(default)]
    pub work_dir: PathBuf,
}

/// Everything the runner process needs, written to
/// `<run_dir>/runner-spec.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSpec {
    pub merged_dir: PathBuf,
    pub root_lower_dir: PathBuf,
    pub root_upper_dir: PathBuf,
    pub root_work_dir: PathBuf,
    pub extra_mounts: Vec<MountSpec>,
    pub cwd: PathBuf,
    pub script_path: PathBuf,
    pub script_args: Vec<String>,
    pub run_as_uid: u32,
    pub run_as_gid: u32,
}

/// Per-run script execution input.
pub struct RunConfig {
    pub run_id: String,
    pub work_root: PathBuf,
    pub script_path: PathBuf,
    pub script_args: Vec<String>,
    pub cwd: PathBuf,
    pub run_as_uid: u32,
    pub run_as_gid: u32,
    pub stdout: Option<Stdio>,
    pub stderr: Option<Stdio>,
    pub stdin: Option<Stdio>,
}

/// Artifacts of one staged script execution.
#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i32,
    pub run_dir: PathBuf,
    /// Root overlay first, then extra mounts shallowest-first.
    pub upper_dirs: Vec<MountSpec>,
    pub merged_dir: PathBuf,
}

/// Enumerate the writable real mounts overlay can stack on, shallowest
/// first. Fails when none survive the filters.
pub fn discover_mounts() -> Result<Vec<MountSpec>> {
    let real = mounts::live_writable_real_mounts()
        .map_err(|e| EngineError::Unsupported(format!("read mount table: {e}")))?;
    if real.is_empty() {
        return Err(EngineError::Unsupported(
            "no writable mounts found".to_string(),
        ));
    }
    let mut specs: Vec<MountSpec> = real
        .iter()
        .filter(|m| mounts::overlay_lower_supported(&m.fs_type))
        .map(|m| MountSpec {
            mount_point: m.mount_point.clone(),
            lower_dir: m.mount_point.clone(),
            upper_dir: PathBuf::new(),
            work_dir: PathBuf::new(),
        })
        .collect();
    if specs.is_empty() {
        return Err(EngineError::Unsupported(
            "no overlay-compatible writable mounts found".to_string(),
        ));
    }
    specs.sort_by(|a, b| {
        depth(&a.mount_point)
            .cmp(&depth(&b.mount_point))
            .then_with(|| a.mount_point.cmp(&b.mount_point))
    });
    Ok(specs)
}

/// Stage and execute the script: build the workspace, write the runner
/// spec, and run this binary in runner mode inside a fresh private mount
/// namespace. The script's exit code comes back in the result; a non-zero
/// code is not an error at this layer.
pub fn run_script(cfg: RunConfig) -> Result<RunResult> {
    if cfg.work_root.as_os_str().is_empty() {
        return Err(EngineError::Unsupported("work root is required".to_string()));
    }
    if cfg.script_path.as_os_str().is_empty() {
        return Err(EngineError::Unsupported("script path is required".to_string()));
    }
    let cwd = if cfg.cwd.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        cfg.cwd.clone()
    };

    let mount_specs = discover_mounts()?;
    let layout = plan_workspace(&cfg.work_root, &cfg.run_id, &mount_specs).map_err(|e| {
        EngineError::Unsupported(format!("create run workspace: {e}"))
    })?;

    let spec = RunnerSpec {
        merged_dir: layout.merged_dir.clone(),
        root_lower_dir: PathBuf::from("/"),
        root_upper_dir: layout.root_upper.clone(),
        root_work_dir: layout.root_work.clone(),
        extra_mounts: layout.extra_mounts.clone(),
        cwd,
        script_path: cfg.script_path,
        script_args: cfg.script_args,
        run_as_uid: cfg.run_as_uid,
        run_as_gid: cfg.run_as_gid,
    };
    let spec_path = layout.run_dir.join(RUNNER_SPEC_FILE);
    write_spec(&spec_path, &spec)
        .map_err(|e| EngineError::Unsupported(format!("write runner spec: {e}")))?;

    let exit_code = spawn_runner(&spec_path, cfg.stdout, cfg.stderr, cfg.stdin)?;

    let mut upper_dirs = vec![MountSpec {
        mount_point: PathBuf::from("/"),
        lower_dir: PathBuf::from("/"),
        upper_dir: layout.root_upper,
        work_dir: layout.root_work,
    }];
    upper_dirs.extend(layout.extra_mounts);

    Ok(RunResult {
        exit_code,
        run_dir: layout.run_dir,
        upper_dirs,
        merged_dir: layout.merged_dir,
    })
}

struct WorkspaceLayout {
    run_dir: PathBuf,
    merged_dir: PathBuf,
    root_upper: PathBuf,
    root_work: PathBuf,
    extra_mounts: Vec<MountSpec>,
}

/// Create `<work_root>/<run_id>/` with `merged`, `upper-root`/`work-root`,
/// and per-extra-mount `upper/<name>`/`work/<name>` staging directories.
/// Upper and work siblings share a filesystem by construction, which is the
/// kernel's requirement for an overlay mount.
fn plan_workspace(
    work_root: &Path,
    run_id: &str,
    mount_specs: &[MountSpec],
) -> io::Result<WorkspaceLayout> {
    let run_dir = work_root.join(run_id);
    make_dir(&run_dir, 0o700)?;
    let merged_dir = run_dir.join("merged");
    make_dir(&merged_dir, 0o755)?;
    let root_upper = run_dir.join("upper-root");
    let root_work = run_dir.join("work-root");
    make_dir(&root_upper, 0o755)?;
    make_dir(&root_work, 0o700)?;

    let mut extra_mounts = Vec::new();
    for spec in mount_specs {
        if spec.mount_point == Path::new("/") {
            continue;
        }
        let name = sanitize_mount_name(&spec.mount_point);
        let upper = run_dir.join("upper").join(&name);
        let work = run_dir.join("work").join(&name);
        make_dir(&upper, 0o755)?;
        make_dir(&work, 0o700)?;
        extra_mounts.push(MountSpec {
            mount_point: spec.mount_point.clone(),
            lower_dir: spec.mount_point.clone(),
            upper_dir: upper,
            work_dir: work,
        });
    }
    Ok(WorkspaceLayout {
        run_dir,
        merged_dir,
        root_upper,
        root_work,
        extra_mounts,
    })
}

fn make_dir(path: &Path, mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn write_spec(path: &Path, spec: &RunnerSpec) -> io::Result<()> {
    let blob = serde_json::to_vec(spec)
        .map_err(|e| io::Error::other(format!("serialize runner spec: {e}")))?;
    fs::write(path, blob)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

/// Load a runner specification previously written by the orchestrator.
pub fn load_spec(path: &Path) -> io::Result<RunnerSpec> {
    let blob = fs::read(path)?;
    serde_json::from_slice(&blob)
        .map_err(|e| io::Error::other(format!("parse runner spec {}: {e}", path.display())))
}

/// `/` → `root`, otherwise path with separators flattened to `__`.
#[must_use]
pub fn sanitize_mount_name(mount_point: &Path) -> String {
    let trimmed = mount_point
        .to_string_lossy()
        .trim_matches('/')
        .replace('/', "__");
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed
    }
}

#[cfg(target_os = "linux")]
fn spawn_runner(
    spec_path: &Path,
    stdout: Option<Stdio>,
    stderr: Option<Stdio>,
    stdin: Option<Stdio>,
) -> Result<i32> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()
        .map_err(|e| EngineError::Unsupported(format!("resolve own executable: {e}")))?;
    let mut cmd = Command::new(exe);
    cmd.arg(RUNNER_MODE_ARG).arg("--spec").arg(spec_path);
    cmd.stdout(stdout.unwrap_or_else(Stdio::inherit));
    cmd.stderr(stderr.unwrap_or_else(Stdio::inherit));
    cmd.stdin(stdin.unwrap_or_else(Stdio::inherit));
    // The child gets its own mount namespace with private propagation, so
    // nothing it stacks is visible outside, and host mounts stay visible
    // to it as the overlay lower layers.
    unsafe {
        cmd.pre_exec(|| {
            nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNS)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            nix::mount::mount(
                None::<&str>,
                "/",
                None::<&str>,
                nix::mount::MsFlags::MS_REC | nix::mount::MsFlags::MS_PRIVATE,
                None::<&str>,
            )
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }
    let status = cmd
        .status()
        .map_err(|e| EngineError::Unsupported(format!("spawn runner: {e}")))?;
    Ok(exit_code_of(status))
}

#[cfg(not(target_os = "linux"))]
fn spawn_runner(
    _spec_path: &Path,
    _stdout: Option<Stdio>,
    _stderr: Option<Stdio>,
    _stdin: Option<Stdio>,
) -> Result<i32> {
    Err(EngineError::Unsupported(
        "mount namespaces are only available on Linux".to_string(),
    ))
}

#[cfg(target_os = "linux")]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(crate::constants::RUNNER_INFRA_EXIT)
}
