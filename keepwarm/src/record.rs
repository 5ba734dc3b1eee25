//! The per-run attempt record.
//!
//! Every stage writes its progress here instead of to ambient global state.
//! Each line is mirrored to `tracing` and kept for the end-of-run report.

use chrono::{DateTime, Local};
use std::fmt;
use tracing::{error, info, warn};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Key status points that make it into the notification summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    /// The fast-path probe got a 200
    DirectAccess,
    /// Overall outcome of the browser attempts
    RunResult,
    WorkspaceIconClicked,
    /// Reusing the stored session
    SessionReuse,
    UiLogin,
    WorkspaceVerified,
    SessionSaved,
    MainFlowError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub message: String,
    pub milestone: Option<(Milestone, Outcome)>,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.message
        )
    }
}

#[derive(Debug, Default)]
pub struct RunLog {
    lines: Vec<LogLine>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(Level::Info, message.into(), None);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(Level::Warn, message.into(), None);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(Level::Error, message.into(), None);
    }

    pub fn milestone(&mut self, milestone: Milestone, outcome: Outcome, message: impl Into<String>) {
        let level = match outcome {
            Outcome::Failure => Level::Warn,
            _ => Level::Info,
        };
        self.push(level, message.into(), Some((milestone, outcome)));
    }

    fn push(&mut self, level: Level, message: String, milestone: Option<(Milestone, Outcome)>) {
        match level {
            Level::Info => info!(milestone = ?milestone.map(|m| m.0), "{message}"),
            Level::Warn => warn!(milestone = ?milestone.map(|m| m.0), "{message}"),
            Level::Error => error!(milestone = ?milestone.map(|m| m.0), "{message}"),
        }
        self.lines.push(LogLine {
            timestamp: Local::now(),
            level,
            message,
            milestone,
        });
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines tagged with a milestone, in order.
    pub fn milestones(&self) -> impl Iterator<Item = (&LogLine, Milestone, Outcome)> {
        self.lines
            .iter()
            .filter_map(|line| line.milestone.map(|(m, o)| (line, m, o)))
    }

    pub fn has_milestone(&self, milestone: Milestone) -> bool {
        self.milestones().any(|(_, m, _)| m == milestone)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.message.contains(needle))
    }
}

impl fmt::Display for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
