//! Output processor for the engine's stdout and stderr.
//!
//! Every raw line is appended to the transcript log. What reaches the console
//! depends on the [`OutputMode`]: verbose passes lines through, clean collapses
//! each task to one glyph line, JSON emits one event object per task. Both
//! streams feed a single consumer over a channel, so parser state has exactly
//! one owner.

use crate::parser::{LineParser, ParsedLine, TaskResult};
use crate::stats::{format_elapsed, OutcomeCategory, RunStatistics};
use crate::CoreError;
use serde_json::json;
use sprig_schema::{OutputMode, VarMap};
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

/// Context key naming the cluster release; enables the access block.
pub const RELEASE_KEY: &str = "CLUSTERFORGE_RELEASE";
/// Context key naming the cluster domain.
pub const DOMAIN_KEY: &str = "DOMAIN";

pub type Sink = Box<dyn Write + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Stdout,
    Stderr,
}

/// One task's outcome, produced once and rendered immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub name: String,
    pub category: OutcomeCategory,
    pub host: String,
    pub message: String,
}

impl TaskEvent {
    /// `"<glyph> <task>"`, with the detail in parentheses unless it is empty
    /// or still looks like raw JSON.
    pub fn render_clean(&self) -> String {
        let mut line = format!("{} {}", self.category.glyph(), self.name);
        if !self.message.is_empty() && !self.message.contains('{') {
            line.push_str(&format!(" ({})", self.message));
        }
        line
    }

    pub fn render_json(&self) -> String {
        json!({
            "event": "task",
            "task": self.name,
            "status": self.category.as_str(),
            "host": self.host,
            "message": self.message,
        })
        .to_string()
    }
}

/// String view of the run variables the summary cares about.
pub fn context_values(vars: &VarMap) -> BTreeMap<String, String> {
    vars.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
}

pub struct OutputProcessor {
    mode: OutputMode,
    parser: LineParser,
    log: Option<Sink>,
    stdout: Sink,
    stderr: Sink,
    context: BTreeMap<String, String>,
    stats: RunStatistics,
    current_task: String,
    task_reported: bool,
    started: Instant,
}

impl OutputProcessor {
    pub fn new(
        mode: OutputMode,
        log: Option<Sink>,
        stdout: Sink,
        stderr: Sink,
        context: BTreeMap<String, String>,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            mode,
            parser: LineParser::new()?,
            log,
            stdout,
            stderr,
            context,
            stats: RunStatistics::new(),
            current_task: String::new(),
            task_reported: false,
            started: Instant::now(),
        })
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn stats(&self) -> &RunStatistics {
        &self.stats
    }

    /// Advances the task state machine. Returns an event for the first
    /// result seen under the current task header.
    pub fn observe(&mut self, line: &str) -> Option<TaskEvent> {
        match self.parser.parse(line) {
            ParsedLine::TaskHeader(name) => {
                self.current_task = name;
                self.task_reported = false;
                None
            }
            ParsedLine::Result(TaskResult {
                category,
                host,
                message,
            }) => {
                if self.task_reported || self.current_task.is_empty() {
                    return None;
                }
                self.task_reported = true;
                self.stats.record(category);
                Some(TaskEvent {
                    name: self.current_task.clone(),
                    category,
                    host,
                    message,
                })
            }
            ParsedLine::Other => None,
        }
    }

    /// What to echo for `line`, if anything.
    pub fn process_line(&mut self, line: &str) -> Option<String> {
        let event = self.observe(line);
        match self.mode {
            OutputMode::Verbose => Some(line.to_owned()),
            OutputMode::Clean => event.map(|e| e.render_clean()),
            OutputMode::Json => event.map(|e| e.render_json()),
        }
    }

    /// Logs `line` verbatim and echoes whatever the mode renders. Verbose
    /// output keeps its origin stream; rendered events go to stdout.
    pub fn consume_line(&mut self, stream: StreamId, line: &str) -> io::Result<()> {
        self.write_log(line);
        let Some(rendered) = self.process_line(line) else {
            return Ok(());
        };
        let sink = match (self.mode, stream) {
            (OutputMode::Verbose, StreamId::Stderr) => &mut self.stderr,
            _ => &mut self.stdout,
        };
        writeln!(sink, "{rendered}")?;
        sink.flush()
    }

    fn write_log(&mut self, line: &str) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(log, "{line}") {
            warn!("transcript log write failed, disabling log: {e}");
            self.log = None;
        }
    }

    /// Reads `reader` to EOF, one line at a time. Invalid UTF-8 is replaced
    /// rather than dropped.
    pub fn consume<R: BufRead>(&mut self, stream: StreamId, mut reader: R) -> io::Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            self.consume_line(stream, line.trim_end_matches(['\n', '\r']))?;
        }
    }

    /// Drains lines from every reader until all senders hang up. Console
    /// write failures are logged and skipped so the engine never blocks on a
    /// full pipe.
    pub fn drain(&mut self, rx: &Receiver<(StreamId, String)>) {
        for (stream, line) in rx {
            if let Err(e) = self.consume_line(stream, &line) {
                debug!("console write failed: {e}");
            }
        }
    }

    /// Closing summary: counters and elapsed time in clean mode, a summary
    /// event in JSON mode, nothing in verbose mode.
    pub fn print_summary(&mut self) -> io::Result<()> {
        let elapsed = self.started.elapsed();
        match self.mode {
            OutputMode::Verbose => {}
            OutputMode::Json => {
                let mut event = json!({
                    "event": "summary",
                    "total": self.stats.total(),
                    "elapsed_secs": elapsed.as_secs(),
                });
                for category in OutcomeCategory::ALL {
                    event[category.as_str()] = self.stats.count(category).into();
                }
                writeln!(self.stdout, "{event}")?;
            }
            OutputMode::Clean => {
                writeln!(self.stdout)?;
                writeln!(self.stdout, "Playbook complete: {}", self.stats.summary())?;
                writeln!(self.stdout, "Total time: {}", format_elapsed(elapsed))?;
                if let Some(block) = access_instructions(&self.context) {
                    write!(self.stdout, "{block}")?;
                }
            }
        }
        self.stdout.flush()?;
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        Ok(())
    }
}

/// Follow-up login details for a cluster deployment. Present only when both
/// a release (other than `none`) and a domain were supplied.
pub fn access_instructions(context: &BTreeMap<String, String>) -> Option<String> {
    let release = context.get(RELEASE_KEY).map(String::as_str).unwrap_or("");
    let domain = context.get(DOMAIN_KEY).map(String::as_str).unwrap_or("");
    if release.is_empty() || release == "none" || domain.is_empty() {
        return None;
    }

    let rule = "\u{2501}".repeat(50);
    Some(format!(
        "\n\u{1f4cb} Access details\n{rule}\n\
         \u{1f510} Developer login\n\
         \x20  URL:      https://airmui.{domain}\n\
         \x20  Username: devuser@{domain}\n\
         \x20  Password: kubectl -n keycloak get secret airm-devuser-credentials -o jsonpath='{{.data.KEYCLOAK_INITIAL_DEVUSER_PASSWORD}}' | base64 --decode\n\
         \n\
         \u{1f511} Keycloak admin login\n\
         \x20  URL:      https://kc.{domain}\n\
         \x20  Username: silogen-admin\n\
         \x20  Password: kubectl -n keycloak get secret keycloak-credentials -o jsonpath='{{.data.KEYCLOAK_INITIAL_ADMIN_PASSWORD}}' | base64 --decode\n"
    ))
}

/// Forwards lines from `reader` into the shared channel until EOF.
pub fn spawn_reader<R>(
    stream: StreamId,
    reader: R,
    tx: Sender<(StreamId, String)>,
) -> JoinHandle<io::Result<()>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\n', '\r'])
                .to_owned();
            if tx.send((stream, line)).is_err() {
                return Ok(());
            }
        }
    })
}
