//! Run orchestration for sprig.
//!
//! This crate ties the schema and runtime layers into a complete run: staging
//! the playbook tree and variable tokens, granting and revoking the ephemeral
//! SSH trust behind a one-shot `TeardownGuard`, holding the per-state-dir
//! `RunLock`, and, inside the sandbox, turning the engine's text output into
//! task events and a summary through the `OutputProcessor`.

pub mod assets;
pub mod child;
pub mod concurrency;
pub mod lifecycle;
pub mod output;
pub mod parser;
pub mod runner;
pub mod staging;
pub mod stats;
pub mod sweep;
pub mod trust;

pub use child::{engine_args, engine_command, run_child};
pub use concurrency::RunLock;
pub use lifecycle::{install_init_listener, install_signal_listener, TeardownGuard};
pub use output::{OutputProcessor, StreamId, TaskEvent};
pub use parser::{LineParser, ParsedLine, TaskResult};
pub use runner::{RunOptions, Runner};
pub use staging::{RunLayout, WORKDIR_VAR};
pub use stats::{format_elapsed, OutcomeCategory, RunStatistics};
pub use trust::{SshKeyTrust, TrustManager, KEY_TAG};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Schema(#[from] sprig_schema::SchemaError),
    #[error(transparent)]
    Runtime(#[from] sprig_runtime::RuntimeError),
    #[error("staging: {0}")]
    Staging(String),
    #[error("trust: {0}")]
    Trust(String),
    #[error("lock: another run is in progress ({})", .0.display())]
    LockBusy(PathBuf),
    #[error("output: invalid line pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
