//! Run settings, typed playbook variables, and output modes for sprig.
//!
//! This crate is the schema layer shared by the runtime, core and CLI crates:
//! the TOML settings file (`Settings`), the caller's variable map (`VarMap`)
//! with its type-preserving `-e` token encoding, and the console `OutputMode`.

pub mod mode;
pub mod settings;
pub mod vars;

pub use mode::OutputMode;
pub use settings::{resolve_target_user, Settings, DEFAULT_SETTINGS_FILE};
pub use vars::{extra_var_token, parse_extra_var, VarMap, VarValue, EXTRA_VAR_FLAG};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("config: failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: failed to parse: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("config: failed to encode variable: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config: invalid variable name '{0}', expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidVarName(String),
    #[error("config: variable '{key}' has unsupported type {kind}, expected boolean, integer, float or string")]
    UnsupportedValue { key: String, kind: String },
    #[error("config: invalid extra variable {0}")]
    InvalidExtraVar(String),
    #[error("config: unknown output mode '{0}', expected clean, verbose or json")]
    UnknownMode(String),
    #[error("config: {field} must not be empty")]
    EmptyField { field: &'static str },
}
