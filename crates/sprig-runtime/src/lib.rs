//! Image cache and sandbox infrastructure for sprig runs.
//!
//! This crate implements the execution layer: the rootfs image cache with
//! its registry-backed `ImageSource`, the host-phase `Sandbox` that re-executes
//! sprig under fresh PID, mount and UTS namespaces, the sandbox-phase mount
//! and pivot sequence, a `MockSandbox` for tests, and prerequisite checks.

pub mod image;
#[cfg(target_os = "linux")]
pub mod mounts;
pub mod mock;
pub mod prereq;
pub mod registry;
pub mod sandbox;

pub use image::{
    compute_image_digest, force_remove, Descriptor, EnsureOutcome, ImageCache, ImageManifest,
    ImageMarker, ImageRef, ImageSource,
};
pub use mock::{MockSandbox, RecordedRun};
pub use prereq::{check_run_prereqs, format_missing, prereqs_skipped, MissingPrereq};
pub use registry::RegistrySource;
pub use sandbox::{exit_code, NamespaceFlags, NamespaceSandbox, RunRequest, Sandbox, CHILD_COMMAND};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: invalid reference '{0}'")]
    InvalidImageRef(String),
    #[error("image: registry request failed: {0}")]
    Registry(String),
    #[error("image: {0}")]
    Image(String),
    #[error("image: failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("sandbox: {step} failed: {source}")]
    Mount {
        step: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox: ephemeral key not found at {0}")]
    MissingKey(PathBuf),
    #[error("sandbox: failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox: namespace isolation is not supported on this platform")]
    Unsupported,
}

impl RuntimeError {
    pub(crate) fn mount(step: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Mount {
            step: step.into(),
            source: source.into(),
        }
    }
}
