use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file looked up in the working directory when `--config` is absent.
pub const DEFAULT_SETTINGS_FILE: &str = "sprig.toml";

const DEFAULT_USER: &str = "ubuntu";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Image reference the sandbox root filesystem is extracted from.
    pub image: String,
    /// Directory holding the rootfs cache, staged playbooks, keys and the run lock.
    /// Relative paths resolve against the working directory.
    pub state_dir: PathBuf,
    /// Transcript log, relative to the working directory.
    pub log_file: String,
    /// Hostname set inside the sandbox.
    pub hostname: String,
    /// Playbook engine binary inside the image.
    pub engine: String,
    /// Re-hash the extracted rootfs on every cache hit.
    pub verify_image: bool,
    /// Account the engine logs into over loopback SSH.
    pub user: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image: "willhallonline/ansible:latest".to_owned(),
            state_dir: PathBuf::from(".sprig"),
            log_file: "sprig.log".to_owned(),
            hostname: "sprig".to_owned(),
            engine: "ansible-playbook".to_owned(),
            verify_image: false,
            user: None,
        }
    }
}

impl Settings {
    pub fn parse_str(content: &str) -> Result<Self, SchemaError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    /// Load an explicit settings file, or `<cwd>/sprig.toml` when present,
    /// falling back to defaults.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<Self, SchemaError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = cwd.join(DEFAULT_SETTINGS_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let fields = [
            ("image", self.image.as_str()),
            ("log_file", self.log_file.as_str()),
            ("hostname", self.hostname.as_str()),
            ("engine", self.engine.as_str()),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(SchemaError::EmptyField { field });
            }
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(SchemaError::EmptyField { field: "state_dir" });
        }
        Ok(())
    }

    pub fn state_dir_in(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.state_dir)
    }

    pub fn log_path_in(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.log_file)
    }

    /// Target account: configured user, then `SUDO_USER`, then `USER`.
    pub fn target_user(&self) -> String {
        resolve_target_user(
            self.user.as_deref(),
            std::env::var("SUDO_USER").ok().as_deref(),
            std::env::var("USER").ok().as_deref(),
        )
    }
}

pub fn resolve_target_user(
    configured: Option<&str>,
    sudo_user: Option<&str>,
    user: Option<&str>,
) -> String {
    [configured, sudo_user, user]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(DEFAULT_USER)
        .to_owned()
}
