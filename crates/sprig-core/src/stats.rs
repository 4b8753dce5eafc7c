use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Six-way classification of a task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeCategory {
    Ok,
    Changed,
    Failed,
    Skipped,
    Unreachable,
    Ignored,
}

impl OutcomeCategory {
    pub const ALL: [OutcomeCategory; 6] = [
        Self::Ok,
        Self::Changed,
        Self::Failed,
        Self::Skipped,
        Self::Unreachable,
        Self::Ignored,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Changed => "changed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Unreachable => "unreachable",
            Self::Ignored => "ignored",
        }
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Self::Ok => "\u{2705}",
            Self::Changed => "\u{1f504}",
            Self::Failed => "\u{274c}",
            Self::Skipped => "\u{23ed}\u{fe0f}",
            Self::Unreachable => "\u{26d4}",
            Self::Ignored => "\u{1f648}",
        }
    }

    /// Maps an engine result keyword (`ok`, `skipping`, `fatal`, ...) to a
    /// category.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "ok" => Some(Self::Ok),
            "changed" => Some(Self::Changed),
            "failed" | "fatal" => Some(Self::Failed),
            "skipping" => Some(Self::Skipped),
            "unreachable" => Some(Self::Unreachable),
            "ignoring" => Some(Self::Ignored),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Ok => 0,
            Self::Changed => 1,
            Self::Failed => 2,
            Self::Skipped => 3,
            Self::Unreachable => 4,
            Self::Ignored => 5,
        }
    }
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category task counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatistics {
    counts: [u64; 6],
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, category: OutcomeCategory) {
        self.counts[category.index()] += 1;
    }

    pub fn count(&self, category: OutcomeCategory) -> u64 {
        self.counts[category.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn has_failures(&self) -> bool {
        self.count(OutcomeCategory::Failed) > 0 || self.count(OutcomeCategory::Unreachable) > 0
    }

    /// `"3 ok, 1 changed, 0 failed, ..."` in category order.
    pub fn summary(&self) -> String {
        OutcomeCategory::ALL
            .iter()
            .map(|c| format!("{} {}", self.count(*c), c.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Formats a run duration by magnitude: `42s`, `3m 7s`, `1h 2m 3s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
