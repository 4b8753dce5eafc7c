//! Sandbox-phase root construction.
//!
//! Runs inside the fresh mount namespace before the engine starts: host and
//! playbook binds, the ephemeral SSH directory, the root pivot, kernel
//! filesystems and a minimal `/dev`. Any failure aborts the run before the
//! engine is launched, and the error names the step that failed.

use crate::sandbox::RunRequest;
use crate::RuntimeError;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, pivot_root, sethostname};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where the staged playbooks appear inside the sandbox.
pub const PLAYBOOK_MOUNT: &str = "playbooks";
/// Where the host's `/` appears inside the sandbox.
pub const HOST_MOUNT: &str = "host";
/// Where the ephemeral SSH directory appears inside the sandbox.
pub const SSH_MOUNT: &str = "root/.ssh";
/// Private key file name inside the ephemeral SSH directory.
pub const KEY_FILE: &str = "id_ephemeral";

const OLD_ROOT: &str = ".pivot_old";

/// Resolver configs on the host, most specific first. Relative to the host root.
const RESOLVER_SOURCES: [&str; 2] = ["run/systemd/resolve/resolv.conf", "etc/resolv.conf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    pub name: &'static str,
    pub major: u64,
    pub minor: u64,
}

pub const DEVICE_NODES: [DeviceNode; 5] = [
    DeviceNode { name: "null", major: 1, minor: 3 },
    DeviceNode { name: "zero", major: 1, minor: 5 },
    DeviceNode { name: "random", major: 1, minor: 8 },
    DeviceNode { name: "urandom", major: 1, minor: 9 },
    DeviceNode { name: "tty", major: 5, minor: 0 },
];

const DEVICE_LINKS: [(&str, &str); 5] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("ptmx", "pts/ptmx"),
];

/// A host path as seen from inside the pivoted root.
pub fn host_path(path: &Path) -> PathBuf {
    let rel = path.strip_prefix("/").unwrap_or(path);
    Path::new("/").join(HOST_MOUNT).join(rel)
}

/// Build the sandbox root described by `request` and pivot into it.
/// On return the process runs with the image as `/`.
pub fn build_sandbox(request: &RunRequest) -> Result<(), RuntimeError> {
    sethostname(&request.hostname).map_err(|e| RuntimeError::mount("set hostname", e))?;

    make_private()?;

    let rootfs = &request.rootfs;
    bind_mount(
        "bind playbooks",
        &request.playbook_dir,
        &rootfs.join(PLAYBOOK_MOUNT),
        false,
    )?;
    bind_mount("bind host root", Path::new("/"), &rootfs.join(HOST_MOUNT), true)?;

    verify_key(&request.ssh_dir)?;
    bind_mount(
        "bind ephemeral ssh dir",
        &request.ssh_dir,
        &rootfs.join(SSH_MOUNT),
        false,
    )?;

    pivot_into(rootfs)?;

    let root = Path::new("/");
    mount_kernel_filesystems(root)?;
    create_device_nodes(&root.join("dev"))?;
    copy_resolver_config(root);
    Ok(())
}

/// Fail fast when the ephemeral key is missing, rather than letting the
/// engine report an opaque connection failure.
pub fn verify_key(ssh_dir: &Path) -> Result<(), RuntimeError> {
    let key = ssh_dir.join(KEY_FILE);
    if key.is_file() {
        Ok(())
    } else {
        Err(RuntimeError::MissingKey(key))
    }
}

fn make_private() -> Result<(), RuntimeError> {
    debug!("making mount tree private");
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| RuntimeError::mount("make mounts private", e))
}

fn ensure_dir(step: &str, dir: &Path, mode: u32) -> Result<(), RuntimeError> {
    fs::create_dir_all(dir).map_err(|e| RuntimeError::mount(format!("{step} (mkdir)"), e))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(mode))
        .map_err(|e| RuntimeError::mount(format!("{step} (chmod)"), e))
}

fn bind_mount(step: &str, source: &Path, target: &Path, recursive: bool) -> Result<(), RuntimeError> {
    fs::create_dir_all(target).map_err(|e| RuntimeError::mount(format!("{step} (mkdir)"), e))?;
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    debug!("{step}: {} -> {}", source.display(), target.display());
    mount(Some(source), target, None::<&str>, flags, None::<&str>)
        .map_err(|e| RuntimeError::mount(step, e))
}

fn pivot_into(new_root: &Path) -> Result<(), RuntimeError> {
    bind_mount("bind new root onto itself", new_root, new_root, true)?;

    let put_old = new_root.join(OLD_ROOT);
    ensure_dir("create old root mount point", &put_old, 0o700)?;

    debug!("pivoting into {}", new_root.display());
    pivot_root(new_root, &put_old).map_err(|e| RuntimeError::mount("pivot_root", e))?;
    chdir("/").map_err(|e| RuntimeError::mount("chdir to new root", e))?;

    let old = Path::new("/").join(OLD_ROOT);
    umount2(&old, MntFlags::MNT_DETACH).map_err(|e| RuntimeError::mount("detach old root", e))?;
    fs::remove_dir(&old).map_err(|e| RuntimeError::mount("remove old root mount point", e))
}

fn mount_kernel_filesystems(root: &Path) -> Result<(), RuntimeError> {
    let proc_dir = root.join("proc");
    ensure_dir("mount /proc", &proc_dir, 0o755)?;
    mount(Some("proc"), &proc_dir, Some("proc"), MsFlags::empty(), None::<&str>)
        .map_err(|e| RuntimeError::mount("mount /proc", e))?;

    let sys_dir = root.join("sys");
    ensure_dir("mount /sys", &sys_dir, 0o755)?;
    mount(Some("sysfs"), &sys_dir, Some("sysfs"), MsFlags::empty(), None::<&str>)
        .map_err(|e| RuntimeError::mount("mount /sys", e))?;

    let dev_dir = root.join("dev");
    ensure_dir("mount /dev", &dev_dir, 0o755)?;
    mount(
        Some("tmpfs"),
        &dev_dir,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755"),
    )
    .map_err(|e| RuntimeError::mount("mount /dev", e))?;

    let pts_dir = dev_dir.join("pts");
    ensure_dir("mount /dev/pts", &pts_dir, 0o755)?;
    mount(Some("devpts"), &pts_dir, Some("devpts"), MsFlags::empty(), None::<&str>)
        .map_err(|e| RuntimeError::mount("mount /dev/pts", e))?;

    let shm_dir = dev_dir.join("shm");
    ensure_dir("mount /dev/shm", &shm_dir, 0o1777)?;
    mount(
        Some("tmpfs"),
        &shm_dir,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )
    .map_err(|e| RuntimeError::mount("mount /dev/shm", e))
}

fn create_device_nodes(dev_dir: &Path) -> Result<(), RuntimeError> {
    let mode = Mode::from_bits_truncate(0o666);
    for node in &DEVICE_NODES {
        let path = dev_dir.join(node.name);
        let step = format!("create /dev/{}", node.name);
        mknod(&path, SFlag::S_IFCHR, mode, makedev(node.major, node.minor))
            .map_err(|e| RuntimeError::mount(step.as_str(), e))?;
        // mknod is subject to the umask
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666))
            .map_err(|e| RuntimeError::mount(step.as_str(), e))?;
    }
    for (name, target) in DEVICE_LINKS {
        if let Err(e) = symlink(target, dev_dir.join(name)) {
            warn!("failed to link /dev/{name}: {e}");
        }
    }
    Ok(())
}

/// Copy the host's resolver configuration into `<root>/etc/resolv.conf`.
/// Best-effort: the engine may still work against loopback without DNS.
pub fn copy_resolver_config(root: &Path) -> Option<PathBuf> {
    let host = root.join(HOST_MOUNT);
    let Some(source) = RESOLVER_SOURCES
        .iter()
        .map(|rel| host.join(rel))
        .find(|p| p.is_file())
    else {
        warn!("no resolver configuration found on the host");
        return None;
    };

    let dest = root.join("etc/resolv.conf");
    let result = fs::create_dir_all(root.join("etc"))
        .and_then(|()| match fs::remove_file(&dest) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .and_then(|()| fs::copy(&source, &dest).map(|_| ()));
    match result {
        Ok(()) => {
            debug!("copied {} to {}", source.display(), dest.display());
            Some(source)
        }
        Err(e) => {
            warn!("failed to copy resolver configuration: {e}");
            None
        }
    }
}
