//! Playbooks and helper scripts compiled into the binary and written out
//! fresh for every run.

use crate::CoreError;
use std::fs;
use std::path::Path;

pub struct Asset {
    /// Path relative to the staged playbook directory.
    pub path: &'static str,
    pub contents: &'static [u8],
    pub executable: bool,
}

pub const ASSETS: &[Asset] = &[
    Asset {
        path: "hello.yml",
        contents: include_bytes!("../assets/playbooks/hello.yml"),
        executable: false,
    },
    Asset {
        path: "preflight.yml",
        contents: include_bytes!("../assets/playbooks/preflight.yml"),
        executable: false,
    },
    Asset {
        path: "manifests/scripts/node-report.sh",
        contents: include_bytes!("../assets/manifests/scripts/node-report.sh"),
        executable: true,
    },
];

/// Top-level playbooks a run can name.
pub fn playbook_names() -> Vec<&'static str> {
    ASSETS
        .iter()
        .map(|a| a.path)
        .filter(|p| !p.contains('/') && (p.ends_with(".yml") || p.ends_with(".yaml")))
        .collect()
}

/// Writes every asset under `dest`, creating directories as needed.
pub fn extract_all(dest: &Path) -> Result<usize, CoreError> {
    for asset in ASSETS {
        let target = dest.join(asset.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, asset.contents).map_err(|e| {
            CoreError::Staging(format!("failed to write {}: {e}", target.display()))
        })?;
        set_mode(&target, if asset.executable { 0o755 } else { 0o644 })?;
    }
    Ok(ASSETS.len())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), CoreError> {
    Ok(())
}
