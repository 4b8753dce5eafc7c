use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use sprig_core::{CoreError, RunLayout, RunLock};
use sprig_runtime::{check_run_prereqs, format_missing, ImageCache, ImageRef};
use sprig_schema::Settings;
use std::path::Path;

pub fn run(settings: &Settings, workdir: &Path, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);
    check_user(&settings.target_user(), &mut checks, &mut all_pass);

    let layout = RunLayout::new(settings, workdir);
    check_image(settings, &layout, &mut checks, &mut all_pass);
    if layout.state_dir.exists() {
        check_lock(&layout, &mut checks);
        check_disk_space(&layout.state_dir, &mut checks);
    } else {
        checks.push(Check::info(
            "state_dir",
            &format!(
                "State directory {} not created yet (made on first run)",
                layout.state_dir.display()
            ),
        ));
        check_disk_space(workdir, &mut checks);
    }

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = check_run_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass("run_prereqs", "Run prerequisites satisfied"));
    } else {
        *all_pass = false;
        checks.push(Check::fail("run_prereqs", &format_missing(&missing)));
    }
}

#[cfg(unix)]
fn check_user(user: &str, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match nix::unistd::User::from_name(user) {
        Ok(Some(account)) => checks.push(Check::pass(
            "target_user",
            &format!(
                "Target user '{user}' found (home {})",
                account.dir.display()
            ),
        )),
        Ok(None) => {
            *all_pass = false;
            checks.push(Check::fail(
                "target_user",
                &format!("Target user '{user}' does not exist; set `user` in sprig.toml"),
            ));
        }
        Err(e) => checks.push(Check::warn(
            "target_user",
            &format!("Cannot look up target user '{user}': {e}"),
        )),
    }
}

#[cfg(not(unix))]
fn check_user(user: &str, checks: &mut Vec<Check>, _all_pass: &mut bool) {
    checks.push(Check::info("target_user", &format!("Target user '{user}'")));
}

fn check_image(
    settings: &Settings,
    layout: &RunLayout,
    checks: &mut Vec<Check>,
    all_pass: &mut bool,
) {
    let image = match ImageRef::parse(&settings.image) {
        Ok(image) => image,
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("image", &e.to_string()));
            return;
        }
    };
    let cache = ImageCache::new(&layout.rootfs);
    match cache.read_marker() {
        Some(marker) if marker.reference == image.to_string() => checks.push(Check::pass(
            "image",
            &format!("Image {image} cached ({} layers)", marker.layers.len()),
        )),
        Some(marker) => checks.push(Check::warn(
            "image",
            &format!(
                "Cached image is {}, configured image {image} will be extracted on next run",
                marker.reference
            ),
        )),
        None => checks.push(Check::info(
            "image",
            &format!("Image {image} not pulled yet (run `sprig pull`)"),
        )),
    }
}

fn check_lock(layout: &RunLayout, checks: &mut Vec<Check>) {
    match RunLock::try_acquire(&layout.lock_path) {
        Ok(_) => checks.push(Check::pass("run_lock", "Run lock is free")),
        Err(CoreError::LockBusy(_)) => checks.push(Check::warn(
            "run_lock",
            "Run lock is held by another sprig process",
        )),
        Err(e) => checks.push(Check::warn(
            "run_lock",
            &format!("Cannot check run lock: {e}"),
        )),
    }
}

#[cfg(unix)]
#[allow(clippy::useless_conversion)]
fn check_disk_space(path: &Path, checks: &mut Vec<Check>) {
    let Ok(stat) = nix::sys::statvfs::statvfs(path) else {
        return;
    };
    let avail_bytes = u64::from(stat.blocks_available()) * u64::from(stat.fragment_size());
    let avail_mb = avail_bytes / (1024 * 1024);

    if avail_mb < 100 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (an image needs several hundred MB)"),
        ));
    } else {
        let free_gb = avail_mb / 1024;
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {free_gb} GB available"),
        ));
    }
}

#[cfg(not(unix))]
fn check_disk_space(_path: &Path, _checks: &mut Vec<Check>) {}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("sprig doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_directory_reports_uncreated_state() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(&Settings::default(), dir.path());
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_image(&Settings::default(), &layout, &mut checks, &mut all_pass);
        assert!(all_pass);
        assert_eq!(checks[0].status, "info");
        assert!(checks[0].message.contains("not pulled yet"));
    }

    #[test]
    fn invalid_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            image: "UPPER CASE".to_owned(),
            ..Settings::default()
        };
        let layout = RunLayout::new(&settings, dir.path());
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_image(&settings, &layout, &mut checks, &mut all_pass);
        assert!(!all_pass);
        assert_eq!(checks[0].status, "fail");
    }

    #[test]
    fn held_lock_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(&Settings::default(), dir.path());
        let _held = RunLock::try_acquire(&layout.lock_path).unwrap();
        let mut checks = Vec::new();
        check_lock(&layout, &mut checks);
        assert_eq!(checks[0].status, "warn");
    }
}
