//! Sandbox phase: runs inside the fresh namespaces, builds the pivoted root
//! and drives the engine through the output processor.

use crate::lifecycle;
use crate::output::{context_values, spawn_reader, OutputProcessor, Sink, StreamId};
use crate::sweep;
use crate::CoreError;
use sprig_runtime::{exit_code, RunRequest, RuntimeError};
use sprig_schema::VarMap;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use tracing::{debug, warn};

/// Private key path as mounted inside the sandbox.
pub const SANDBOX_KEY: &str = "/root/.ssh/id_ephemeral";
/// Staged playbook directory as mounted inside the sandbox.
pub const SANDBOX_PLAYBOOKS: &str = "/playbooks";
const ENGINE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Engine arguments: loopback SSH as the target user with privilege
/// escalation and the ephemeral key, then tags, playbook, check flag and
/// variables.
pub fn engine_args(request: &RunRequest) -> Vec<String> {
    let mut args = vec![
        "--connection=ssh".to_owned(),
        "--inventory=127.0.0.1,".to_owned(),
        format!("--user={}", request.user),
        "--become".to_owned(),
        format!(
            "--ssh-extra-args=-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null \
             -o IdentitiesOnly=yes -i {SANDBOX_KEY}"
        ),
        "-v".to_owned(),
    ];
    if let Some(tags) = request.tags.as_deref().filter(|t| !t.is_empty()) {
        args.push("--tags".to_owned());
        args.push(tags.to_owned());
    }
    args.push(format!("{SANDBOX_PLAYBOOKS}/{}", request.playbook));
    if request.dry_run {
        args.push("--check".to_owned());
    }
    args.extend(request.extra_args.iter().cloned());
    args
}

/// The engine's whole environment. Nothing is inherited from the host.
pub fn engine_env(request: &RunRequest) -> Vec<(&'static str, String)> {
    vec![
        ("PATH", ENGINE_PATH.to_owned()),
        ("HOME", "/root".to_owned()),
        ("USER", request.user.clone()),
        ("ANSIBLE_LOCALHOST_WARNING", "False".to_owned()),
        ("ANSIBLE_PYTHON_INTERPRETER", "/usr/bin/python3".to_owned()),
    ]
}

pub fn engine_command(request: &RunRequest) -> Command {
    let mut cmd = Command::new(&request.engine);
    cmd.args(engine_args(request))
        .env_clear()
        .envs(engine_env(request))
        .current_dir(SANDBOX_PLAYBOOKS)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn open_log(path: &Path) -> Option<Sink> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(Box::new(io::BufWriter::new(file))),
        Err(e) => {
            warn!("could not open transcript log {}: {e}", path.display());
            None
        }
    }
}

/// Runs the whole sandbox phase and returns the engine's exit code.
#[cfg(target_os = "linux")]
pub fn run_child(request: &RunRequest) -> Result<i32, CoreError> {
    use sprig_runtime::mounts;

    lifecycle::install_init_listener()?;
    mounts::build_sandbox(request)?;
    sweep::sweep_sandbox();

    let log = open_log(&mounts::host_path(&request.log_file));
    let vars = VarMap::from_extra_args(&request.extra_args).unwrap_or_else(|e| {
        warn!("could not read run variables for the summary: {e}");
        VarMap::new()
    });
    let mut processor = OutputProcessor::new(
        request.mode,
        log,
        Box::new(io::stdout()),
        Box::new(io::stderr()),
        context_values(&vars),
    )?;

    let mut cmd = engine_command(request);
    debug!("launching engine: {cmd:?}");
    let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
        program: request.engine.clone(),
        source,
    })?;

    let (tx, rx) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(StreamId::Stdout, stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(StreamId::Stderr, stderr, tx.clone()));
    }
    drop(tx);
    processor.drain(&rx);

    for reader in readers {
        match reader.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("engine output reader failed: {e}"),
            Err(_) => warn!("engine output reader panicked"),
        }
    }

    let status = child.wait()?;
    processor.print_summary()?;
    Ok(exit_code(status))
}

#[cfg(not(target_os = "linux"))]
pub fn run_child(_request: &RunRequest) -> Result<i32, CoreError> {
    Err(RuntimeError::Unsupported.into())
}
