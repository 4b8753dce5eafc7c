mod commands;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::EXIT_FAILURE;
use sprig_runtime::{check_run_prereqs, format_missing, prereqs_skipped, RunRequest};
use sprig_schema::{OutputMode, Settings};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "sprig",
    version,
    about = "Run configuration playbooks against this host from a disposable sandbox"
)]
struct Cli {
    /// Settings file (defaults to ./sprig.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a built-in playbook against this host.
    Run {
        /// Playbook to run, relative to the built-in playbook tree.
        #[arg(default_value = "hello.yml")]
        playbook: String,
        /// Flat TOML file of variables passed to the playbook.
        #[arg(long)]
        vars: Option<PathBuf>,
        /// Report what would change without changing anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Only run tasks carrying these tags (comma separated).
        #[arg(long)]
        tags: Option<String>,
        /// Console output: clean, verbose or json.
        #[arg(long, default_value = "clean")]
        output: OutputMode,
    },
    /// Fetch and extract the sandbox image without running anything.
    Pull {
        /// Re-hash the extracted rootfs and re-extract on mismatch.
        #[arg(long, default_value_t = false)]
        verify: bool,
    },
    /// Run diagnostic checks on the host and the state directory.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
    #[command(name = "__child__", hide = true)]
    Child(ChildArgs),
}

/// Sandbox-phase arguments, as written by `RunRequest::child_args`.
#[derive(Debug, Args)]
struct ChildArgs {
    rootfs: PathBuf,
    playbook_dir: PathBuf,
    playbook: String,
    user: String,
    workdir: PathBuf,
    mode: OutputMode,
    #[arg(long)]
    ssh_dir: PathBuf,
    #[arg(long)]
    log_file: PathBuf,
    #[arg(long)]
    hostname: String,
    #[arg(long)]
    engine: String,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long)]
    tags: Option<String>,
    #[arg(last = true)]
    extra_args: Vec<String>,
}

impl From<ChildArgs> for RunRequest {
    fn from(args: ChildArgs) -> Self {
        Self {
            rootfs: args.rootfs,
            playbook_dir: args.playbook_dir,
            playbook: args.playbook,
            extra_args: args.extra_args,
            dry_run: args.dry_run,
            tags: args.tags,
            mode: args.mode,
            user: args.user,
            workdir: args.workdir,
            ssh_dir: args.ssh_dir,
            log_file: args.log_file,
            hostname: args.hostname,
            engine: args.engine,
        }
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SPRIG_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Run {
            playbook,
            vars,
            dry_run,
            tags,
            output,
        } => with_settings(cli.config.as_deref(), |settings, workdir| {
            if !prereqs_skipped() {
                let missing = check_run_prereqs();
                if !missing.is_empty() {
                    return Err(format_missing(&missing));
                }
            }
            commands::run::run(
                settings,
                workdir,
                &commands::run::RunArgs {
                    playbook,
                    vars,
                    dry_run,
                    tags,
                    output,
                },
            )
        }),
        Commands::Pull { verify } => with_settings(cli.config.as_deref(), |settings, workdir| {
            commands::pull::run(settings, workdir, verify, json_output)
        }),
        Commands::Doctor => with_settings(cli.config.as_deref(), |settings, workdir| {
            commands::doctor::run(settings, workdir, json_output)
        }),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
        Commands::Child(args) => commands::child::run(&RunRequest::from(args)),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Resolves the working directory and settings, then hands both to `f`.
fn with_settings(
    config: Option<&Path>,
    f: impl FnOnce(&Settings, &Path) -> Result<u8, String>,
) -> Result<u8, String> {
    let workdir = std::env::current_dir()
        .map_err(|e| format!("cannot determine working directory: {e}"))?;
    let settings = Settings::discover(config, &workdir).map_err(|e| e.to_string())?;
    tracing::debug!("settings for {}: {settings:?}", workdir.display());
    f(&settings, &workdir)
}
