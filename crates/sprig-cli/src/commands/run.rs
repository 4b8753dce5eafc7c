use super::exit_byte;
use console::Style;
use sprig_core::{RunOptions, Runner, SshKeyTrust};
use sprig_runtime::{NamespaceSandbox, RegistrySource};
use sprig_schema::{OutputMode, Settings, VarMap};
use std::path::{Path, PathBuf};

pub struct RunArgs {
    pub playbook: String,
    pub vars: Option<PathBuf>,
    pub dry_run: bool,
    pub tags: Option<String>,
    pub output: OutputMode,
}

fn load_vars(path: Option<&Path>) -> Result<VarMap, String> {
    match path {
        Some(path) => VarMap::load(path).map_err(|e| format!("{e} ({})", path.display())),
        None => Ok(VarMap::new()),
    }
}

pub fn run(settings: &Settings, workdir: &Path, args: &RunArgs) -> Result<u8, String> {
    let options = RunOptions {
        playbook: args.playbook.clone(),
        vars: load_vars(args.vars.as_deref())?,
        dry_run: args.dry_run,
        tags: args.tags.clone(),
        mode: args.output,
    };
    let user = settings.target_user();

    let source = RegistrySource::new();
    let sandbox = NamespaceSandbox::current_exe().map_err(|e| e.to_string())?;
    let dim = Style::new().dim();
    let progress = move |msg: &str| eprintln!("{}", dim.apply_to(msg));
    let runner = Runner::new(settings, workdir, &source, &sandbox).with_progress(&progress);

    let trust =
        SshKeyTrust::for_user(&user, runner.layout().ssh_dir.clone()).map_err(|e| e.to_string())?;
    let code = runner
        .run(&options, &user, Box::new(trust))
        .map_err(|e| e.to_string())?;
    Ok(exit_byte(code))
}
