//! Ephemeral login trust for the loopback SSH connection the engine makes.
//!
//! [`SshKeyTrust`] generates a single-use key pair, appends its public half to
//! the target account's `authorized_keys` and reverses both on cleanup.

use crate::CoreError;
use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Comment appended to the installed key line so it can be found again.
pub const KEY_TAG: &str = "# sprig-ephemeral-key";
pub const PRIVATE_KEY: &str = "id_ephemeral";
pub const PUBLIC_KEY: &str = "id_ephemeral.pub";
const KEY_COMMENT: &str = "sprig-ephemeral@localhost";

/// Grants and revokes the credential a run connects with.
pub trait TrustManager: Send {
    fn setup(&mut self) -> Result<(), CoreError>;
    /// Must be safe to call more than once and after a partial setup.
    fn cleanup(&mut self) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Installed {
    No,
    Yes { backup: Option<PathBuf> },
}

pub struct SshKeyTrust {
    key_dir: PathBuf,
    authorized_keys: PathBuf,
    backup_path: PathBuf,
    owner: Option<Owner>,
    installed: Installed,
}

impl SshKeyTrust {
    /// Trust for `user`, with the key pair kept under `key_dir`.
    pub fn for_user(user: &str, key_dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let (home, owner) = lookup_user(user)?;
        Ok(Self::with_paths(
            key_dir,
            home.join(".ssh").join("authorized_keys"),
            owner,
        ))
    }

    /// Trust over explicit paths. With `owner` unset, ownership is left to
    /// whatever the current process creates.
    pub fn with_paths(
        key_dir: impl Into<PathBuf>,
        authorized_keys: impl Into<PathBuf>,
        owner: Option<Owner>,
    ) -> Self {
        let authorized_keys = authorized_keys.into();
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup_path = authorized_keys.with_file_name(format!("authorized_keys.backup.{stamp}"));
        Self {
            key_dir: key_dir.into(),
            authorized_keys,
            backup_path,
            owner,
            installed: Installed::No,
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn private_key(&self) -> PathBuf {
        self.key_dir.join(PRIVATE_KEY)
    }

    pub fn public_key(&self) -> PathBuf {
        self.key_dir.join(PUBLIC_KEY)
    }

    pub fn authorized_keys(&self) -> &Path {
        &self.authorized_keys
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn is_installed(&self) -> bool {
        self.installed != Installed::No
    }

    /// Creates a fresh ed25519 pair with `ssh-keygen`.
    pub fn generate_key(&self) -> Result<(), CoreError> {
        create_private_dir(&self.key_dir)?;
        for path in [self.private_key(), self.public_key()] {
            remove_if_exists(&path)?;
        }

        let output = Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", KEY_COMMENT, "-f"])
            .arg(self.private_key())
            .output()
            .map_err(|e| CoreError::Trust(format!("failed to run ssh-keygen: {e}")))?;
        if !output.status.success() {
            return Err(CoreError::Trust(format!(
                "ssh-keygen failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("generated ephemeral key at {}", self.private_key().display());
        Ok(())
    }

    /// Appends the public key to `authorized_keys`, backing up the original
    /// first and keeping its mode and ownership.
    pub fn install_public_key(&mut self) -> Result<(), CoreError> {
        let public = fs::read_to_string(self.public_key())
            .map_err(|e| CoreError::Trust(format!("failed to read public key: {e}")))?;
        let ssh_dir = self
            .authorized_keys
            .parent()
            .ok_or_else(|| CoreError::Trust("authorized_keys has no parent directory".to_owned()))?;
        create_private_dir(ssh_dir)?;
        self.chown(ssh_dir)?;

        let (existing, backup, mode) = match fs::read_to_string(&self.authorized_keys) {
            Ok(content) => {
                fs::copy(&self.authorized_keys, &self.backup_path).map_err(|e| {
                    CoreError::Trust(format!(
                        "failed to back up {}: {e}",
                        self.authorized_keys.display()
                    ))
                })?;
                self.chown(&self.backup_path)?;
                (
                    content,
                    Some(self.backup_path.clone()),
                    file_mode(&self.authorized_keys)?,
                )
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => (String::new(), None, 0o600),
            Err(e) => {
                return Err(CoreError::Trust(format!(
                    "failed to read {}: {e}",
                    self.authorized_keys.display()
                )))
            }
        };

        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("{} {KEY_TAG}\n", public.trim()));

        self.replace_authorized_keys(&content, mode)?;
        self.installed = Installed::Yes { backup };
        info!(
            "installed ephemeral key into {}",
            self.authorized_keys.display()
        );
        Ok(())
    }

    fn replace_authorized_keys(&self, content: &str, mode: u32) -> Result<(), CoreError> {
        let tmp = self.authorized_keys.with_extension("sprig-tmp");
        let write = || -> io::Result<()> {
            fs::write(&tmp, content)?;
            set_mode(&tmp, mode)?;
            Ok(())
        };
        write()
            .and_then(|()| {
                self.chown(&tmp).map_err(io::Error::other)?;
                fs::rename(&tmp, &self.authorized_keys)
            })
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                CoreError::Trust(format!(
                    "failed to write {}: {e}",
                    self.authorized_keys.display()
                ))
            })
    }

    /// Puts `authorized_keys` back the way it was before install.
    pub fn remove_public_key(&mut self) -> Result<(), CoreError> {
        let Installed::Yes { backup } = &self.installed else {
            return Ok(());
        };

        match backup {
            Some(backup) => {
                let mode = file_mode(backup)?;
                let content = fs::read_to_string(backup).map_err(|e| {
                    CoreError::Trust(format!("failed to read backup {}: {e}", backup.display()))
                })?;
                self.replace_authorized_keys(&content, mode)?;
            }
            None => {
                let content = read_or_empty(&self.authorized_keys)?;
                let kept: String = content
                    .lines()
                    .filter(|l| !l.contains(KEY_TAG))
                    .map(|l| format!("{l}\n"))
                    .collect();
                if kept.trim().is_empty() {
                    remove_if_exists(&self.authorized_keys)?;
                } else {
                    self.replace_authorized_keys(&kept, 0o600)?;
                }
            }
        }

        if read_or_empty(&self.authorized_keys)?.contains(KEY_TAG) {
            return Err(CoreError::Trust(format!(
                "ephemeral key still present in {}",
                self.authorized_keys.display()
            )));
        }
        self.installed = Installed::No;
        Ok(())
    }

    fn remove_key_files(&self) {
        for path in [self.private_key(), self.public_key()] {
            if let Err(e) = remove_if_exists(&path) {
                warn!("failed to remove {}: {e}", path.display());
            }
        }
        let _ = fs::remove_dir(&self.key_dir);
    }

    #[cfg(unix)]
    fn chown(&self, path: &Path) -> Result<(), CoreError> {
        let Some(owner) = self.owner else {
            return Ok(());
        };
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)).map_err(|e| {
            CoreError::Trust(format!("failed to set ownership on {}: {e}", path.display()))
        })
    }

    #[cfg(not(unix))]
    fn chown(&self, _path: &Path) -> Result<(), CoreError> {
        Ok(())
    }
}

impl TrustManager for SshKeyTrust {
    fn setup(&mut self) -> Result<(), CoreError> {
        self.generate_key()?;
        self.install_public_key()
    }

    fn cleanup(&mut self) -> Result<(), CoreError> {
        self.remove_public_key()?;
        self.remove_key_files();
        Ok(())
    }
}

#[cfg(unix)]
fn lookup_user(user: &str) -> Result<(PathBuf, Option<Owner>), CoreError> {
    match nix::unistd::User::from_name(user) {
        Ok(Some(entry)) => Ok((
            entry.dir,
            Some(Owner {
                uid: entry.uid.as_raw(),
                gid: entry.gid.as_raw(),
            }),
        )),
        Ok(None) => Err(CoreError::Trust(format!("unknown user '{user}'"))),
        Err(e) => Err(CoreError::Trust(format!("failed to look up user '{user}': {e}"))),
    }
}

#[cfg(not(unix))]
fn lookup_user(user: &str) -> Result<(PathBuf, Option<Owner>), CoreError> {
    let home = if user == "root" {
        PathBuf::from("/root")
    } else {
        Path::new("/home").join(user)
    };
    Ok((home, None))
}

fn create_private_dir(dir: &Path) -> Result<(), CoreError> {
    fs::create_dir_all(dir)
        .and_then(|()| set_mode(dir, 0o700))
        .map_err(|e| CoreError::Trust(format!("failed to create {}: {e}", dir.display())))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32, CoreError> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32, CoreError> {
    Ok(0o600)
}

fn read_or_empty(path: &Path) -> Result<String, CoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CoreError::Trust(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), CoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::Trust(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}
