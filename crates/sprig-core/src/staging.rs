//! Per-run preparation on the host: log rotation, a fresh playbook tree and
//! the engine's variable tokens.

use crate::assets;
use crate::concurrency::LOCK_FILE;
use crate::CoreError;
use chrono::{DateTime, Local};
use sprig_runtime::force_remove;
use sprig_schema::{extra_var_token, Settings, VarMap, VarValue, EXTRA_VAR_FLAG};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Variable carrying the caller's working directory into every playbook.
pub const WORKDIR_VAR: &str = "SPRIG_DIR";

/// Where a run keeps its state, relative to the caller's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub workdir: PathBuf,
    pub state_dir: PathBuf,
    pub rootfs: PathBuf,
    pub playbook_dir: PathBuf,
    pub ssh_dir: PathBuf,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
}

impl RunLayout {
    pub fn new(settings: &Settings, workdir: &Path) -> Self {
        let state_dir = settings.state_dir_in(workdir);
        Self {
            workdir: workdir.to_path_buf(),
            rootfs: state_dir.join("rootfs"),
            playbook_dir: state_dir.join("playbooks"),
            ssh_dir: state_dir.join("ssh"),
            lock_path: state_dir.join(LOCK_FILE),
            log_path: settings.log_path_in(workdir),
            state_dir,
        }
    }
}

/// `sprig.log` becomes `sprig-20260102-150405.log`.
pub fn rotated_name(log: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = log
        .file_stem()
        .map_or_else(|| "sprig".into(), |s| s.to_string_lossy());
    let stamp = now.format("%Y%m%d-%H%M%S");
    let name = match log.extension() {
        Some(ext) => format!("{stem}-{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{stamp}"),
    };
    log.with_file_name(name)
}

/// Moves an existing log aside. Failure only warns.
pub fn rotate_log(log: &Path, now: DateTime<Local>) -> Option<PathBuf> {
    if !log.exists() {
        return None;
    }
    let backup = rotated_name(log, now);
    match fs::rename(log, &backup) {
        Ok(()) => {
            info!("rotated {} to {}", log.display(), backup.display());
            Some(backup)
        }
        Err(e) => {
            warn!("staging: failed to rotate {}: {e}", log.display());
            None
        }
    }
}

/// Recreates `dir` from the embedded assets so nothing from an earlier run
/// survives.
pub fn stage_playbooks(dir: &Path) -> Result<usize, CoreError> {
    force_remove(dir)?;
    fs::create_dir_all(dir)?;
    assets::extract_all(dir)
}

/// Checks that `name` is a plain relative path to a staged playbook.
pub fn resolve_playbook(dir: &Path, name: &str) -> Result<PathBuf, CoreError> {
    let relative = Path::new(name);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    let path = dir.join(relative);
    if plain && path.is_file() {
        return Ok(path);
    }
    Err(CoreError::Staging(format!(
        "unknown playbook '{name}', available: {}",
        assets::playbook_names().join(", ")
    )))
}

/// Variable tokens for the engine, with the working directory appended last.
pub fn engine_vars(vars: &VarMap, workdir: &Path) -> Result<Vec<String>, CoreError> {
    let mut args = vars.to_extra_args()?;
    let dir = VarValue::String(workdir.display().to_string());
    args.push(EXTRA_VAR_FLAG.to_owned());
    args.push(extra_var_token(WORKDIR_VAR, &dir)?);
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 1, 2, 15, 4, 5).unwrap()
    }

    #[test]
    fn layout_lives_under_state_dir() {
        let settings = Settings::default();
        let layout = RunLayout::new(&settings, Path::new("/srv/site"));
        assert_eq!(layout.rootfs, Path::new("/srv/site/.sprig/rootfs"));
        assert_eq!(layout.playbook_dir, Path::new("/srv/site/.sprig/playbooks"));
        assert_eq!(layout.ssh_dir, Path::new("/srv/site/.sprig/ssh"));
        assert_eq!(layout.lock_path, Path::new("/srv/site/.sprig/run.lock"));
        assert_eq!(layout.log_path, Path::new("/srv/site/sprig.log"));
    }

    #[test]
    fn rotated_name_has_timestamp() {
        assert_eq!(
            rotated_name(Path::new("/srv/site/sprig.log"), at()),
            Path::new("/srv/site/sprig-20260102-150405.log")
        );
        assert_eq!(
            rotated_name(Path::new("transcript"), at()),
            Path::new("transcript-20260102-150405")
        );
    }

    #[test]
    fn rotate_moves_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sprig.log");
        assert!(rotate_log(&log, at()).is_none());

        fs::write(&log, "previous run").unwrap();
        let backup = rotate_log(&log, at()).unwrap();
        assert!(!log.exists());
        assert_eq!(fs::read_to_string(backup).unwrap(), "previous run");
    }

    #[test]
    fn staging_replaces_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let playbooks = dir.path().join("playbooks");
        fs::create_dir_all(&playbooks).unwrap();
        fs::write(playbooks.join("stale.yml"), "old").unwrap();
        fs::write(playbooks.join("hello.yml"), "tampered").unwrap();

        stage_playbooks(&playbooks).unwrap();
        assert!(!playbooks.join("stale.yml").exists());
        assert_ne!(fs::read_to_string(playbooks.join("hello.yml")).unwrap(), "tampered");
        assert!(playbooks.join("manifests/scripts/node-report.sh").is_file());
    }

    #[test]
    fn resolve_rejects_unknown_and_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        stage_playbooks(dir.path()).unwrap();
        assert!(resolve_playbook(dir.path(), "hello.yml").is_ok());

        let err = resolve_playbook(dir.path(), "nope.yml").unwrap_err();
        assert!(err.to_string().contains("hello.yml, preflight.yml"));
        assert!(resolve_playbook(dir.path(), "../hello.yml").is_err());
        assert!(resolve_playbook(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn engine_vars_preserve_types_and_append_workdir() {
        let mut vars = VarMap::new();
        vars.insert("FIRST_NODE", true);
        vars.insert("DOMAIN", "x.com");
        vars.insert("COUNT", 3_i64);

        let args = engine_vars(&vars, Path::new("/srv/site")).unwrap();
        assert_eq!(args.len(), 8);
        assert!(args.iter().step_by(2).all(|a| a == EXTRA_VAR_FLAG));
        assert!(args.contains(&r#"{"FIRST_NODE":true}"#.to_owned()));
        assert!(args.contains(&r#"{"DOMAIN":"x.com"}"#.to_owned()));
        assert!(args.contains(&r#"{"COUNT":3}"#.to_owned()));
        assert_eq!(args[7], r#"{"SPRIG_DIR":"/srv/site"}"#);

        let parsed = VarMap::from_extra_args(&args).unwrap();
        assert_eq!(parsed.get("FIRST_NODE"), Some(&VarValue::Bool(true)));
        assert_eq!(parsed.get("COUNT"), Some(&VarValue::Integer(3)));
    }
}
