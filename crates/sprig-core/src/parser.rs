//! Line classifier for the playbook engine's text protocol.
//!
//! The engine prints a `TASK [name]` header followed by one result line per
//! target (`ok: [host]`, `changed: [host] => {...}`, `fatal: [host]: ...`).
//! Everything else (play banners, recap, warnings) is classified as
//! [`ParsedLine::Other`].

use crate::stats::OutcomeCategory;
use regex::Regex;

/// Longest detail kept before truncating with an ellipsis.
pub const MAX_DETAIL: usize = 100;

const CHANGE_FALLBACK: &str = "configuration updated";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub category: OutcomeCategory,
    pub host: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    TaskHeader(String),
    Result(TaskResult),
    Other,
}

pub struct LineParser {
    header: Regex,
    result: Regex,
    fatal: Regex,
    msg_field: Regex,
    stderr_field: Regex,
}

impl LineParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            header: Regex::new(r"^TASK \[(.*?)\]")?,
            result: Regex::new(
                r"^(ok|changed|failed|skipping|unreachable|ignoring):\s*\[(.*?)\](.*)",
            )?,
            fatal: Regex::new(r"^fatal:\s*\[(.*?)\]:(.*)")?,
            msg_field: Regex::new(r#""msg":\s*"([^"]+)""#)?,
            stderr_field: Regex::new(r#""stderr":\s*"([^"]+)""#)?,
        })
    }

    pub fn parse(&self, line: &str) -> ParsedLine {
        if let Some(name) = self.task_header(line) {
            return ParsedLine::TaskHeader(name);
        }
        match self.task_result(line) {
            Some(result) => ParsedLine::Result(result),
            None => ParsedLine::Other,
        }
    }

    pub fn task_header(&self, line: &str) -> Option<String> {
        self.header
            .captures(line)
            .map(|caps| caps[1].trim().to_owned())
    }

    /// Classifies a result or fatal line. A failure marked as ignored on the
    /// same line is reported as [`OutcomeCategory::Ignored`].
    pub fn task_result(&self, line: &str) -> Option<TaskResult> {
        let (category, host, message) = if let Some(caps) = self.result.captures(line) {
            let category = OutcomeCategory::from_keyword(&caps[1])?;
            let rest = caps[3].trim();
            let message = match rest.split_once("=>") {
                Some((_, payload)) => self.brief_message(payload),
                None => rest.to_owned(),
            };
            (category, caps[2].to_owned(), message)
        } else if let Some(caps) = self.fatal.captures(line) {
            let message = self.brief_message(caps[2].trim());
            (OutcomeCategory::Failed, caps[1].to_owned(), message)
        } else {
            return None;
        };

        let category = if category == OutcomeCategory::Failed && is_ignored_error(line) {
            OutcomeCategory::Ignored
        } else {
            category
        };
        Some(TaskResult {
            category,
            host,
            message,
        })
    }

    /// Short human detail from a result payload: the `msg` field, else a
    /// truncated `stderr`, else a generic note when the payload reports a
    /// change, else the truncated payload itself.
    pub fn brief_message(&self, payload: &str) -> String {
        if let Some(caps) = self.msg_field.captures(payload) {
            return caps[1].to_owned();
        }
        if let Some(caps) = self.stderr_field.captures(payload) {
            return truncate(&caps[1], MAX_DETAIL);
        }
        if payload.contains("changed=true") || payload.contains(r#""changed": true"#) {
            return CHANGE_FALLBACK.to_owned();
        }
        truncate(payload.trim(), MAX_DETAIL)
    }
}

pub fn is_ignored_error(line: &str) -> bool {
    line.contains("...ignoring") || line.contains("ignore_errors=True")
}

/// Cuts `text` to at most `max` characters, ending in `...` when shortened.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LineParser {
        LineParser::new().unwrap()
    }

    #[test]
    fn headers_capture_task_name() {
        let p = parser();
        assert_eq!(
            p.parse("TASK [Install packages] *********************"),
            ParsedLine::TaskHeader("Install packages".to_owned())
        );
        assert_eq!(p.parse("PLAY [all] ***"), ParsedLine::Other);
        assert_eq!(p.parse("PLAY RECAP ***"), ParsedLine::Other);
    }

    #[test]
    fn every_keyword_classifies() {
        let p = parser();
        let cases = [
            ("ok", OutcomeCategory::Ok),
            ("changed", OutcomeCategory::Changed),
            ("failed", OutcomeCategory::Failed),
            ("skipping", OutcomeCategory::Skipped),
            ("unreachable", OutcomeCategory::Unreachable),
            ("ignoring", OutcomeCategory::Ignored),
        ];
        for (keyword, expected) in cases {
            let result = p
                .task_result(&format!("{keyword}: [127.0.0.1] extra"))
                .unwrap();
            assert_eq!(result.category, expected, "{keyword}");
            assert_eq!(result.host, "127.0.0.1");
            assert_eq!(result.message, "extra");
        }
    }

    #[test]
    fn fatal_lines_are_failures() {
        let p = parser();
        let result = p
            .task_result(r#"fatal: [127.0.0.1]: FAILED! => {"changed": false, "msg": "No package matching 'foo'"}"#)
            .unwrap();
        assert_eq!(result.category, OutcomeCategory::Failed);
        assert_eq!(result.message, "No package matching 'foo'");
    }

    #[test]
    fn ignored_failures_are_reclassified() {
        let p = parser();
        let result = p
            .task_result(r#"failed: [127.0.0.1] => {"msg": "boom"} ...ignoring"#)
            .unwrap();
        assert_eq!(result.category, OutcomeCategory::Ignored);

        let ok = p.task_result("ok: [127.0.0.1] ...ignoring").unwrap();
        assert_eq!(ok.category, OutcomeCategory::Ok);
    }

    #[test]
    fn brief_message_precedence() {
        let p = parser();
        assert_eq!(
            p.brief_message(r#"{"msg": "hello", "stderr": "noise"}"#),
            "hello"
        );
        assert_eq!(p.brief_message(r#"{"stderr": "disk busy"}"#), "disk busy");
        assert_eq!(
            p.brief_message(r#"{"changed": true, "rc": 0}"#),
            "configuration updated"
        );
        assert_eq!(p.brief_message("  plain text  "), "plain text");
    }

    #[test]
    fn long_details_are_truncated() {
        let p = parser();
        let long = "x".repeat(150);
        let brief = p.brief_message(&long);
        assert_eq!(brief.chars().count(), MAX_DETAIL);
        assert!(brief.ends_with("..."));

        let stderr = format!(r#"{{"stderr": "{}"}}"#, "e".repeat(120));
        assert!(p.brief_message(&stderr).ends_with("..."));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "\u{e9}".repeat(120);
        let cut = truncate(&text, 10);
        assert_eq!(cut.chars().count(), 10);
        assert_eq!(truncate("short", 10), "short");
    }
}
