use crate::sandbox::{RunRequest, Sandbox};
use crate::RuntimeError;
use std::sync::Mutex;

/// One call to [`MockSandbox::run`], with what the staged tree looked like
/// at that moment.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub request: RunRequest,
    pub playbook_present: bool,
}

/// In-process stand-in for the namespace sandbox. Records every request and
/// answers with a fixed exit code or launch failure. Nothing is spawned.
pub struct MockSandbox {
    exit_code: i32,
    failure: Option<String>,
    runs: Mutex<Vec<RecordedRun>>,
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MockSandbox {
    pub fn new(exit_code: i32) -> Self {
        Self {
            exit_code,
            failure: None,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(1)
        }
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn last_request(&self) -> Option<RunRequest> {
        self.runs().pop().map(|r| r.request)
    }
}

impl Sandbox for MockSandbox {
    fn run(&self, request: &RunRequest, _on_spawn: &dyn Fn(u32)) -> Result<i32, RuntimeError> {
        let playbook_present = request.playbook_dir.join(&request.playbook).is_file();
        self.runs
            .lock()
            .map_err(|e| RuntimeError::Image(format!("mutex poisoned: {e}")))?
            .push(RecordedRun {
                request: request.clone(),
                playbook_present,
            });

        match &self.failure {
            Some(msg) => Err(RuntimeError::Spawn {
                program: "mock".to_owned(),
                source: std::io::Error::other(msg.clone()),
            }),
            None => Ok(self.exit_code),
        }
    }
}
