//! Precondition checks run before any transaction (and before recovery).
//!
//! Failures here are of the Unsupported class: nothing has been staged and
//! no journal exists, so refusing early is always safe.

use crate::mounts;
use crate::types::errors::{EngineError, Result};

/// Verify the host can run transactions: Linux, root, overlayfs available,
/// at least one writable real mount, and an overlay module configuration the
/// diff scanner can decode.
pub fn check() -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Err(EngineError::Unsupported(format!(
            "only Linux hosts are supported (got {})",
            std::env::consts::OS
        )));
    }
    check_privilege()?;
    let filesystems = std::fs::read_to_string("/proc/filesystems")
        .map_err(|e| EngineError::Unsupported(format!("read /proc/filesystems: {e}")))?;
    check_overlay_support(&filesystems)?;
    check_overlay_params()?;
    let real = mounts::live_writable_real_mounts()
        .map_err(|e| EngineError::Unsupported(format!("read mount table: {e}")))?;
    if real.is_empty() {
        return Err(EngineError::Unsupported(
            "no writable real filesystems found".to_string(),
        ));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn check_privilege() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(EngineError::Unsupported(
            "transactions must run as root".to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn check_privilege() -> Result<()> {
    Err(EngineError::Unsupported(
        "only Linux hosts are supported".to_string(),
    ))
}

/// `/proc/filesystems` must list overlay.
pub fn check_overlay_support(proc_filesystems: &str) -> Result<()> {
    let present = proc_filesystems
        .lines()
        .any(|line| line.split_whitespace().last() == Some("overlay"));
    if present {
        Ok(())
    } else {
        Err(EngineError::Unsupported(
            "overlayfs is not available on this kernel".to_string(),
        ))
    }
}

/// Refuse overlay module defaults the scanner cannot decode: with metacopy
/// or redirect_dir enabled, upper layers encode changes in xattrs instead of
/// whole-file copy-ups.
fn check_overlay_params() -> Result<()> {
    for param in ["metacopy", "redirect_dir"] {
        let path = format!("/sys/module/overlay/parameters/{param}");
        // Absent on kernels that predate the feature; nothing to refuse.
        if let Ok(v) = std::fs::read_to_string(&path) {
            check_overlay_param(param, &v)?;
        }
    }
    Ok(())
}

/// A parameter value of `Y`/`on` means upper layers may carry encodings the
/// scanner does not understand.
pub fn check_overlay_param(param: &str, value: &str) -> Result<()> {
    let v = value.trim();
    if v.eq_ignore_ascii_case("y") || v.eq_ignore_ascii_case("on") {
        return Err(EngineError::Unsupported(format!(
            "overlay module enables {param} by default; upper layers would be undecodable"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_listed_in_proc_filesystems_passes() {
        let listing = "nodev\tsysfs\nnodev\toverlay\n\text4\n";
        assert!(check_overlay_support(listing).is_ok());
    }

    #[test]
    fn missing_overlay_entry_is_unsupported() {
        let listing = "nodev\tsysfs\n\text4\n\txfs\n";
        assert!(matches!(
            check_overlay_support(listing),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn enabled_metacopy_is_refused() {
        assert!(check_overlay_param("metacopy", "Y\n").is_err());
        assert!(check_overlay_param("redirect_dir", "on\n").is_err());
        assert!(check_overlay_param("metacopy", "N\n").is_ok());
        assert!(check_overlay_param("redirect_dir", "off\n").is_ok());
    }
}
