//! Host phase of a run: lock, image, staging, trust, sandbox, teardown.

use crate::concurrency::RunLock;
use crate::lifecycle::{self, TeardownGuard};
use crate::staging::{self, RunLayout};
use crate::sweep;
use crate::trust::TrustManager;
use crate::CoreError;
use chrono::Local;
use sprig_runtime::{EnsureOutcome, ImageCache, ImageRef, ImageSource, RunRequest, Sandbox};
use sprig_schema::{OutputMode, Settings, VarMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub playbook: String,
    pub vars: VarMap,
    pub dry_run: bool,
    pub tags: Option<String>,
    pub mode: OutputMode,
}

fn quiet(_: &str) {}

pub struct Runner<'a> {
    settings: &'a Settings,
    layout: RunLayout,
    source: &'a dyn ImageSource,
    sandbox: &'a dyn Sandbox,
    progress: &'a dyn Fn(&str),
    listen_for_signals: bool,
    sweep_host: bool,
}

impl<'a> Runner<'a> {
    pub fn new(
        settings: &'a Settings,
        workdir: &Path,
        source: &'a dyn ImageSource,
        sandbox: &'a dyn Sandbox,
    ) -> Self {
        Self {
            settings,
            layout: RunLayout::new(settings, workdir),
            source,
            sandbox,
            progress: &quiet,
            listen_for_signals: true,
            sweep_host: true,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn Fn(&str)) -> Self {
        self.progress = progress;
        self
    }

    /// Leaves process signal handling and host-wide temp sweeps alone, for
    /// embedding in tests.
    #[must_use]
    pub fn contained(mut self) -> Self {
        self.listen_for_signals = false;
        self.sweep_host = false;
        self
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn ensure_image(&self) -> Result<EnsureOutcome, CoreError> {
        let image = ImageRef::parse(&self.settings.image)?;
        let cache = ImageCache::new(&self.layout.rootfs);
        Ok(cache.ensure_image(
            &image,
            self.source,
            self.settings.verify_image,
            self.progress,
        )?)
    }

    /// Rotates the log, restages playbooks and builds the sandbox request.
    pub fn prepare(&self, options: &RunOptions, user: &str) -> Result<RunRequest, CoreError> {
        staging::rotate_log(&self.layout.log_path, Local::now());
        staging::stage_playbooks(&self.layout.playbook_dir)?;
        staging::resolve_playbook(&self.layout.playbook_dir, &options.playbook)?;

        Ok(RunRequest {
            rootfs: self.layout.rootfs.clone(),
            playbook_dir: self.layout.playbook_dir.clone(),
            playbook: options.playbook.clone(),
            extra_args: staging::engine_vars(&options.vars, &self.layout.workdir)?,
            dry_run: options.dry_run,
            tags: options.tags.clone(),
            mode: options.mode,
            user: user.to_owned(),
            workdir: self.layout.workdir.clone(),
            ssh_dir: self.layout.ssh_dir.clone(),
            log_file: self.layout.log_path.clone(),
            hostname: self.settings.hostname.clone(),
            engine: self.settings.engine.clone(),
        })
    }

    /// Runs `options.playbook` and returns the exit code to report. The
    /// credential from `trust` is revoked before this returns, on every path.
    pub fn run(
        &self,
        options: &RunOptions,
        user: &str,
        trust: Box<dyn TrustManager>,
    ) -> Result<i32, CoreError> {
        let _lock = RunLock::try_acquire(&self.layout.lock_path)?;

        self.ensure_image()?;
        let request = self.prepare(options, user)?;
        if self.sweep_host {
            sweep::sweep_host(std::env::var_os("HOME").map(PathBuf::from).as_deref());
        }

        let guard = Arc::new(TeardownGuard::new(trust));
        if self.listen_for_signals {
            lifecycle::install_signal_listener(Arc::clone(&guard))?;
        }
        if let Err(e) = guard.setup() {
            guard.complete(1);
            return Err(e);
        }
        info!("launching {} as {user}", options.playbook);

        let outcome = self.sandbox.run(&request, &|pid| guard.set_child(pid));
        guard.clear_child();
        if let Err(e) = &outcome {
            error!("sandbox failed: {e}");
        }
        let code = guard.complete(*outcome.as_ref().unwrap_or(&1));
        outcome?;
        Ok(code)
    }
}
