use crate::RuntimeError;
use sprig_schema::OutputMode;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info};

/// Hidden subcommand the host phase re-executes itself with.
pub const CHILD_COMMAND: &str = "__child__";

/// Everything the sandbox phase needs to build the sandbox and launch the
/// engine. Built once by the host and serialized onto the child command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub rootfs: PathBuf,
    pub playbook_dir: PathBuf,
    pub playbook: String,
    /// Serialized `-e <json>` tokens, passed to the engine unchanged.
    pub extra_args: Vec<String>,
    pub dry_run: bool,
    pub tags: Option<String>,
    pub mode: OutputMode,
    pub user: String,
    pub workdir: PathBuf,
    pub ssh_dir: PathBuf,
    /// Transcript log as a host path. Reached through `/host` after the pivot.
    pub log_file: PathBuf,
    pub hostname: String,
    pub engine: String,
}

impl RunRequest {
    /// Arguments after the program name for the sandbox-phase invocation.
    pub fn child_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            CHILD_COMMAND.into(),
            self.rootfs.clone().into(),
            self.playbook_dir.clone().into(),
            self.playbook.clone().into(),
            self.user.clone().into(),
            self.workdir.clone().into(),
            self.mode.as_str().into(),
            "--ssh-dir".into(),
            self.ssh_dir.clone().into(),
            "--log-file".into(),
            self.log_file.clone().into(),
            "--hostname".into(),
            self.hostname.clone().into(),
            "--engine".into(),
            self.engine.clone().into(),
        ];
        if self.dry_run {
            args.push("--dry-run".into());
        }
        if let Some(tags) = &self.tags {
            args.push("--tags".into());
            args.push(tags.into());
        }
        if !self.extra_args.is_empty() {
            args.push("--".into());
            args.extend(self.extra_args.iter().map(OsString::from));
        }
        args
    }
}

/// Namespaces the re-executed child is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceFlags {
    pub pid: bool,
    pub mount: bool,
    pub uts: bool,
    /// Make every mount in the new namespace private so nothing leaks back
    /// to the host.
    pub private_propagation: bool,
}

impl Default for NamespaceFlags {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            uts: true,
            private_propagation: true,
        }
    }
}

impl NamespaceFlags {
    pub fn unshare_args(&self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if self.pid {
            args.push("--pid");
        }
        if self.mount {
            args.push("--mount");
            if self.private_propagation {
                args.extend(["--propagation", "private"]);
            }
        }
        if self.uts {
            args.push("--uts");
        }
        args.extend(["--fork", "--kill-child=SIGTERM"]);
        args
    }
}

/// Runs the sandbox phase and reports the engine's exit code. `on_spawn`
/// receives the pid of any process started for it, before it is waited on.
pub trait Sandbox {
    fn run(&self, request: &RunRequest, on_spawn: &dyn Fn(u32)) -> Result<i32, RuntimeError>;
}

/// Re-executes `program` (normally the running sprig binary) through
/// `unshare` with fresh namespaces. Stdio is inherited.
pub struct NamespaceSandbox {
    program: PathBuf,
    flags: NamespaceFlags,
}

impl NamespaceSandbox {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            flags: NamespaceFlags::default(),
        }
    }

    pub fn current_exe() -> Result<Self, RuntimeError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    #[must_use]
    pub fn with_flags(mut self, flags: NamespaceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn build_command(&self, request: &RunRequest) -> Command {
        let mut cmd = Command::new("unshare");
        cmd.args(self.flags.unshare_args());
        cmd.arg(&self.program);
        cmd.args(request.child_args());
        cmd
    }
}

impl Sandbox for NamespaceSandbox {
    fn run(&self, request: &RunRequest, on_spawn: &dyn Fn(u32)) -> Result<i32, RuntimeError> {
        if !cfg!(target_os = "linux") {
            return Err(RuntimeError::Unsupported);
        }

        let mut cmd = self.build_command(request);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        debug!("launching sandbox: {cmd:?}");

        let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            program: "unshare".to_owned(),
            source,
        })?;
        on_spawn(child.id());
        let code = exit_code(child.wait()?);
        info!("sandbox exited with code {code}");
        Ok(code)
    }
}

/// Exit code of a finished child, mapping death-by-signal to 128 + signo.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}
