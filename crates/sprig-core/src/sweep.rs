//! Best-effort removal of leftovers from earlier engine runs. Nothing here
//! fails a run; problems are logged as warnings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Temp entries younger than this may belong to a run still in flight.
pub const MIN_TEMP_AGE: Duration = Duration::from_secs(3600);
const MAX_TEMP_SIZE: u64 = 100 * 1024 * 1024;

const TEMP_PREFIXES: [&str; 3] = ["ansible-", "ansible_", ".ansible_async_"];

pub fn is_engine_temp(name: &str) -> bool {
    TEMP_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_control_socket_name(name: &str) -> bool {
    name.starts_with("master-") || (name.contains("ssh") && name.contains("127.0.0.1"))
}

fn entries(dir: &Path) -> Vec<(PathBuf, String)> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    read.filter_map(Result::ok)
        .map(|e| (e.path(), e.file_name().to_string_lossy().into_owned()))
        .collect()
}

fn remove_entry(path: &Path) -> bool {
    let result = if path.is_dir() && !path.is_symlink() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("cleanup: failed to remove {}: {e}", path.display());
            false
        }
    }
}

/// Removes engine temp files and directories under `dirs`. Entries newer
/// than `min_age` or files larger than 100 MiB are left alone.
pub fn sweep_engine_temp(dirs: &[PathBuf], min_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;
    for dir in dirs {
        for (path, name) in entries(dir) {
            if !is_engine_temp(&name) {
                continue;
            }
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < min_age || (meta.is_file() && meta.len() > MAX_TEMP_SIZE) {
                continue;
            }
            if remove_entry(&path) {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!("cleanup: removed {removed} stale engine temp entries");
    }
    removed
}

/// Removes SSH control-master sockets under `dirs` that nothing is
/// listening on.
#[cfg(unix)]
pub fn sweep_control_sockets(dirs: &[PathBuf]) -> usize {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::net::UnixStream;

    let mut removed = 0;
    for dir in dirs {
        for (path, name) in entries(dir) {
            if !is_control_socket_name(&name) {
                continue;
            }
            let is_socket = fs::symlink_metadata(&path)
                .map(|m| m.file_type().is_socket())
                .unwrap_or(false);
            if !is_socket || UnixStream::connect(&path).is_ok() {
                continue;
            }
            if remove_entry(&path) {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!("cleanup: removed {removed} dead SSH control sockets");
    }
    removed
}

#[cfg(not(unix))]
pub fn sweep_control_sockets(_dirs: &[PathBuf]) -> usize {
    0
}

/// Host-side sweep before a run.
pub fn sweep_host(home: Option<&Path>) {
    let mut temp_dirs = vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")];
    let mut socket_dirs = vec![PathBuf::from("/tmp")];
    if let Some(home) = home {
        temp_dirs.push(home.join(".ansible"));
        socket_dirs.push(home.join(".ssh"));
        socket_dirs.push(home.join(".ansible").join("cp"));
    }
    sweep_engine_temp(&temp_dirs, MIN_TEMP_AGE);
    sweep_control_sockets(&socket_dirs);
}

/// Sandbox-side sweep after the pivot. Anything engine-shaped in the
/// sandbox's own temp dirs is from an earlier run.
pub fn sweep_sandbox() {
    let temp_dirs = [
        PathBuf::from("/tmp"),
        PathBuf::from("/var/tmp"),
        PathBuf::from("/root/.ansible"),
    ];
    sweep_engine_temp(&temp_dirs, Duration::ZERO);
    sweep_control_sockets(&[PathBuf::from("/root/.ansible/cp")]);
}
