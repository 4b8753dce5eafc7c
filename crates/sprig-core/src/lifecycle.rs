//! Exactly-once teardown of the run's ephemeral trust.
//!
//! The [`TeardownGuard`] owns the [`TrustManager`]. Whichever path reaches it
//! first (normal completion, an early error, a signal, or drop) takes the
//! manager out and runs cleanup; every later path finds it gone.

use crate::trust::{TrustManager, KEY_TAG};
use crate::CoreError;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

type Slot = Option<Box<dyn TrustManager>>;

pub struct TeardownGuard {
    manager: Mutex<Slot>,
    /// Sandbox process to stop on a signal. 0 when none is running.
    child: AtomicU32,
    /// Signal that ended the run. 0 when none arrived.
    signal: AtomicI32,
    failed: AtomicBool,
}

impl TeardownGuard {
    pub fn new(manager: Box<dyn TrustManager>) -> Self {
        Self {
            manager: Mutex::new(Some(manager)),
            child: AtomicU32::new(0),
            signal: AtomicI32::new(0),
            failed: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.manager.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the credential. A teardown racing this call waits for it.
    pub fn setup(&self) -> Result<(), CoreError> {
        match self.slot().as_mut() {
            Some(manager) => manager.setup(),
            None => Err(CoreError::Trust(
                "credential already torn down".to_owned(),
            )),
        }
    }

    pub fn is_done(&self) -> bool {
        self.slot().is_none()
    }

    /// Records the running sandbox process so a signal can stop it.
    pub fn set_child(&self, pid: u32) {
        self.child.store(pid, Ordering::SeqCst);
    }

    /// Forgets the sandbox process once it has been reaped.
    pub fn clear_child(&self) {
        self.child.store(0, Ordering::SeqCst);
    }

    pub fn child(&self) -> Option<u32> {
        match self.child.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// The signal that ended the run, if any.
    pub fn signalled(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            signo => Some(signo),
        }
    }

    /// Runs cleanup if nobody has yet. `None` means it already happened.
    /// Concurrent callers wait until the first cleanup has finished.
    pub fn teardown(&self) -> Option<Result<(), CoreError>> {
        let mut slot = self.slot();
        let mut manager = slot.take()?;
        let result = manager.cleanup();
        match &result {
            Ok(()) => {
                info!("trust: ephemeral credential revoked");
                eprintln!("sprig: ephemeral SSH credential revoked");
            }
            Err(e) => {
                self.failed.store(true, Ordering::SeqCst);
                error!("trust: teardown failed: {e}");
            }
        }
        drop(slot);
        Some(result)
    }

    /// Tears down after the run and returns the process exit code. A failed
    /// teardown turns a successful run into a failure, and a signal that
    /// arrived meanwhile decides the code the way [`Self::on_signal`] does.
    pub fn complete(&self, exit_code: i32) -> i32 {
        if let Some(Err(e)) = self.teardown() {
            report_critical(&e);
        }
        let failed = self.failed.load(Ordering::SeqCst);
        match self.signalled() {
            Some(_) if failed => 1,
            Some(signo) => 128 + signo,
            None if failed && exit_code == 0 => 1,
            None => exit_code,
        }
    }

    /// Tears down on a terminating signal, stopping the sandbox first.
    /// Returns `128 + signo`, or 1 when teardown failed.
    pub fn on_signal(&self, signo: i32) -> i32 {
        let _ = self
            .signal
            .compare_exchange(0, signo, Ordering::SeqCst, Ordering::SeqCst);
        self.stop_child();
        if let Some(Err(e)) = self.teardown() {
            report_critical(&e);
        }
        if self.failed.load(Ordering::SeqCst) {
            1
        } else {
            128 + signo
        }
    }

    /// `unshare` blocks SIGINT and SIGTERM while it waits, so it gets
    /// SIGKILL. Its `--kill-child` then hands SIGTERM to the namespace init.
    #[cfg(unix)]
    fn stop_child(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child() else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!("failed to stop sandbox process {pid}: {e}"),
        }
    }

    #[cfg(not(unix))]
    fn stop_child(&self) {}
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.teardown() {
            report_critical(&e);
        }
    }
}

fn report_critical(e: &CoreError) {
    eprintln!("CRITICAL: failed to revoke the ephemeral SSH key: {e}");
    eprintln!(
        "CRITICAL: check the target user's ~/.ssh/authorized_keys for lines tagged '{KEY_TAG}'"
    );
}

/// Blocks the terminating signals on the calling thread and starts a
/// listener that stops the sandbox, tears down through `guard` and exits.
/// Call before spawning any other thread so they inherit the mask.
#[cfg(unix)]
pub fn install_signal_listener(guard: Arc<TeardownGuard>) -> Result<(), CoreError> {
    let set = signals::teardown_set();
    set.thread_block().map_err(std::io::Error::from)?;

    std::thread::Builder::new()
        .name("sprig-signals".to_owned())
        .spawn(move || match set.wait() {
            Ok(signal) => {
                eprintln!("\nsprig: received {signal}, revoking ephemeral credential");
                let code = guard.on_signal(signal as i32);
                std::process::exit(code);
            }
            Err(e) => warn!("signal listener stopped: {e}"),
        })?;
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_listener(_guard: Arc<TeardownGuard>) -> Result<(), CoreError> {
    Ok(())
}

/// Namespace-init side: blocks the terminating signals and starts a
/// listener that exits with `128 + signo`. The init process ignores
/// unhandled signals, and its exit takes the rest of the namespace down.
#[cfg(unix)]
pub fn install_init_listener() -> Result<(), CoreError> {
    let set = signals::teardown_set();
    set.thread_block().map_err(std::io::Error::from)?;

    std::thread::Builder::new()
        .name("sprig-init-signals".to_owned())
        .spawn(move || match set.wait() {
            Ok(signal) => {
                eprintln!("\nsprig: sandbox received {signal}, stopping the engine");
                std::process::exit(128 + signal as i32);
            }
            Err(e) => warn!("sandbox signal listener stopped: {e}"),
        })?;
    Ok(())
}

#[cfg(not(unix))]
pub fn install_init_listener() -> Result<(), CoreError> {
    Ok(())
}

#[cfg(unix)]
mod signals {
    use nix::sys::signal::{SigSet, Signal};

    pub(super) const TEARDOWN_SIGNALS: [Signal; 4] =
        [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGQUIT];

    pub(super) fn teardown_set() -> SigSet {
        let mut set = SigSet::empty();
        for signal in TEARDOWN_SIGNALS {
            set.add(signal);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Counters {
        setups: AtomicUsize,
        cleanups: AtomicUsize,
    }

    struct CountingTrust {
        counters: Arc<Counters>,
        fail_cleanup: bool,
    }

    impl TrustManager for CountingTrust {
        fn setup(&mut self) -> Result<(), CoreError> {
            self.counters.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cleanup(&mut self) -> Result<(), CoreError> {
            self.counters.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.fail_cleanup {
                Err(CoreError::Trust("authorized_keys is read-only".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    fn guard(fail_cleanup: bool) -> (TeardownGuard, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let guard = TeardownGuard::new(Box::new(CountingTrust {
            counters: Arc::clone(&counters),
            fail_cleanup,
        }));
        (guard, counters)
    }

    #[test]
    fn complete_tears_down_once_and_passes_code() {
        let (g, counters) = guard(false);
        g.setup().unwrap();
        assert_eq!(g.complete(2), 2);
        assert_eq!(g.complete(0), 0);
        drop(g);
        assert_eq!(counters.setups.load(Ordering::SeqCst), 1);
        assert_eq!(counters.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_then_completion_tears_down_once() {
        let (g, counters) = guard(false);
        g.setup().unwrap();
        assert_eq!(g.on_signal(15), 143);
        assert_eq!(g.on_signal(2), 130);
        assert_eq!(g.complete(0), 143);
        assert!(g.is_done());
        assert_eq!(counters.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_code_wins_over_engine_code() {
        let (g, _) = guard(false);
        g.setup().unwrap();
        assert_eq!(g.on_signal(15), 143);
        assert_eq!(g.complete(2), 143);
        assert_eq!(g.signalled(), Some(15));

        let (g, _) = guard(true);
        assert_eq!(g.on_signal(15), 1);
        assert_eq!(g.complete(0), 1);
    }

    #[test]
    fn completion_without_signal_keeps_engine_code() {
        let (g, _) = guard(false);
        assert_eq!(g.complete(3), 3);
        assert_eq!(g.signalled(), None);
    }

    #[test]
    fn cleared_child_is_forgotten() {
        let (g, _) = guard(false);
        assert_eq!(g.child(), None);
        g.set_child(4321);
        assert_eq!(g.child(), Some(4321));
        g.clear_child();
        assert_eq!(g.child(), None);
    }

    #[cfg(unix)]
    #[test]
    fn signal_stops_the_recorded_sandbox_process() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::Command;

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let (g, counters) = guard(false);
        g.set_child(child.id());
        assert_eq!(g.on_signal(15), 143);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(9));
        assert_eq!(counters.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_tears_down_after_early_error() {
        let (g, counters) = guard(false);
        g.setup().unwrap();
        drop(g);
        assert_eq!(counters.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_teardown_overrides_success() {
        let (g, _) = guard(true);
        assert_eq!(g.complete(0), 1);
        let (g, _) = guard(true);
        assert_eq!(g.complete(4), 4);
        let (g, _) = guard(true);
        assert_eq!(g.on_signal(15), 1);
    }

    #[test]
    fn setup_after_teardown_is_refused() {
        let (g, counters) = guard(false);
        g.teardown();
        assert!(g.setup().is_err());
        assert_eq!(counters.setups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn racing_paths_tear_down_once() {
        let (g, counters) = guard(false);
        let g = Arc::new(g);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let g = Arc::clone(&g);
                thread::spawn(move || {
                    if i % 2 == 0 {
                        g.complete(0)
                    } else {
                        g.on_signal(15)
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.cleanups.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[test]
    fn teardown_set_covers_terminating_signals() {
        let set = signals::teardown_set();
        for signal in signals::TEARDOWN_SIGNALS {
            assert!(set.contains(signal));
        }
        assert!(!set.contains(nix::sys::signal::Signal::SIGCHLD));
    }
}
