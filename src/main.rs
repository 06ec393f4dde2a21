//! Thin command-line adapter over the transaction engine.
//!
//! `atomic-shell run [options] <script> [args…]` executes one transaction;
//! `atomic-shell recover` drives startup recovery only. The `__runner` mode
//! is internal: the overlay orchestrator re-executes this binary with it
//! inside the private mount namespace.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use atomic_shell::logging::{JsonlSink, StderrAudit};
use atomic_shell::types::errors::exit;
use atomic_shell::{Engine, RunRequest};

fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    #[cfg(target_os = "linux")]
    if args.first().map(|a| a == atomic_shell::constants::RUNNER_MODE_ARG).unwrap_or(false) {
        let code = atomic_shell::overlay::runner::main(&args[1..]);
        return ExitCode::from(code.clamp(0, 255) as u8);
    }

    match args.first().and_then(|a| a.to_str()) {
        Some("recover") => {
            let engine = Engine::new(JsonlSink, StderrAudit);
            match engine.recover() {
                Ok(()) => ExitCode::from(exit::OK as u8),
                Err(e) => {
                    eprintln!("atomic-shell: {e}");
                    ExitCode::from(e.exit_code() as u8)
                }
            }
        }
        Some("run") => run_command(&args[1..]),
        _ => {
            eprintln!(
                "usage: atomic-shell run [--keep-artifacts] [--uid N] [--gid N] [--cwd DIR] <script> [args…]"
            );
            eprintln!("       atomic-shell recover");
            ExitCode::from(exit::UNSUPPORTED as u8)
        }
    }
}

fn run_command(args: &[OsString]) -> ExitCode {
    let mut keep_artifacts = false;
    let mut uid: u32 = 0;
    let mut gid: u32 = 0;
    let mut cwd = PathBuf::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].to_str() {
            Some("--keep-artifacts") => {
                keep_artifacts = true;
                i += 1;
            }
            Some("--uid") | Some("--gid") => {
                let flag = args[i].to_string_lossy().into_owned();
                let Some(value) = args.get(i + 1).and_then(|v| v.to_str()).and_then(|v| v.parse().ok())
                else {
                    return usage_error(&format!("{flag} expects a number"));
                };
                if flag == "--uid" {
                    uid = value;
                } else {
                    gid = value;
                }
                i += 2;
            }
            Some("--cwd") => {
                let Some(value) = args.get(i + 1) else {
                    return usage_error("--cwd expects a directory");
                };
                cwd = PathBuf::from(value);
                i += 2;
            }
            _ => break,
        }
    }

    let Some(script) = args.get(i) else {
        return usage_error("missing script path");
    };
    let mut req = RunRequest::new(PathBuf::from(script));
    req.script_args = args[i + 1..]
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    req.keep_artifacts = keep_artifacts;
    req.run_as_uid = uid;
    req.run_as_gid = gid;
    req.cwd = cwd;

    let engine = Engine::new(JsonlSink, StderrAudit);
    match engine.run(req) {
        Ok(report) => {
            eprintln!(
                "atomic-shell: committed run {} ({} operations)",
                report.run_id, report.ops_applied
            );
            ExitCode::from(exit::OK as u8)
        }
        Err(e) => {
            eprintln!("atomic-shell: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn usage_error(msg: &str) -> ExitCode {
    eprintln!("atomic-shell: {msg}");
    ExitCode::from(exit::UNSUPPORTED as u8)
}
