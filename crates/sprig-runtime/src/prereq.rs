use std::fmt;
use std::process::Command;

/// Set to `1` to skip the pre-run prerequisite gate.
pub const SKIP_PREREQS_ENV: &str = "SPRIG_SKIP_PREREQS";

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
pub(crate) fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn running_as_root() -> bool {
    false
}

pub fn prereqs_skipped() -> bool {
    std::env::var(SKIP_PREREQS_ENV).is_ok_and(|v| v == "1")
}

/// Check everything a run needs on the host.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_run_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !cfg!(target_os = "linux") {
        missing.push(MissingPrereq {
            name: "Linux",
            purpose: "PID, mount and UTS namespaces",
            install_hint: "run sprig on a Linux host",
        });
        return missing;
    }

    if !running_as_root() {
        missing.push(MissingPrereq {
            name: "root privileges",
            purpose: "mounting, pivot_root and editing the target's authorized_keys",
            install_hint: "re-run with sudo",
        });
    }

    if !command_exists("unshare") {
        missing.push(MissingPrereq {
            name: "unshare",
            purpose: "namespace isolation",
            install_hint: "part of util-linux (usually pre-installed)",
        });
    }

    if !command_exists("ssh-keygen") {
        missing.push(MissingPrereq {
            name: "ssh-keygen",
            purpose: "generating the ephemeral key pair",
            install_hint: "apt install openssh-client | dnf install openssh-clients | zypper install openssh-clients",
        });
    }

    if !command_exists("sshd") {
        missing.push(MissingPrereq {
            name: "sshd",
            purpose: "the engine connects to this host over loopback SSH",
            install_hint: "apt install openssh-server | dnf install openssh-server | zypper install openssh-server",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str(&format!(
        "\nsprig needs these to build the run sandbox (set {SKIP_PREREQS_ENV}=1 to skip this check)."
    ));
    msg
}
