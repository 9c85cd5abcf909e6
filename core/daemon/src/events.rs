//! Typed activity events produced by the ingestors.
//!
//! Timestamps are Unix seconds. Each source stamps its events through its
//! own [`StreamClock`], so timestamps never go backwards within a stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ShellCommand,
    FileChange,
    GitContext,
    HostLog,
    ProcessSample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    ShellCommand(ShellCommandEvent),
    FileChange(FileChangeEvent),
    GitContext(GitContextEvent),
    HostLog(HostLogEvent),
    ProcessSample(ProcessSampleEvent),
}

impl ActivityEvent {
    pub fn timestamp(&self) -> i64 {
        match self {
            ActivityEvent::ShellCommand(event) => event.timestamp,
            ActivityEvent::FileChange(event) => event.timestamp,
            ActivityEvent::GitContext(event) => event.timestamp,
            ActivityEvent::HostLog(event) => event.timestamp,
            ActivityEvent::ProcessSample(event) => event.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellCommandEvent {
    pub raw_command: String,
    pub sanitized_command: String,
    pub working_dir: String,
    pub timestamp: i64,
    pub duration: f64,
    pub exit_code: i32,
}

impl ShellCommandEvent {
    /// Text used when comparing commands with each other.
    pub fn display_command(&self) -> &str {
        if self.sanitized_command.is_empty() {
            &self.raw_command
        } else {
            &self.sanitized_command
        }
    }

    pub fn failed(&self) -> bool {
        self.exit_code != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl FileChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileChangeKind::Created => "CREATED",
            FileChangeKind::Modified => "MODIFIED",
            FileChangeKind::Deleted => "DELETED",
            FileChangeKind::Moved => "MOVED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(FileChangeKind::Created),
            "MODIFIED" => Some(FileChangeKind::Modified),
            "DELETED" => Some(FileChangeKind::Deleted),
            "MOVED" => Some(FileChangeKind::Moved),
            _ => None,
        }
    }

    /// Created and modified files count as edits.
    pub fn is_edit(self) -> bool {
        matches!(self, FileChangeKind::Created | FileChangeKind::Modified)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileChangeEvent {
    pub path: String,
    pub kind: FileChangeKind,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchClass {
    Feature,
    Fix,
    Refactor,
    Docs,
    Test,
    Chore,
    Other,
}

impl BranchClass {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchClass::Feature => "feature",
            BranchClass::Fix => "fix",
            BranchClass::Refactor => "refactor",
            BranchClass::Docs => "docs",
            BranchClass::Test => "test",
            BranchClass::Chore => "chore",
            BranchClass::Other => "other",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "feature" => BranchClass::Feature,
            "fix" => BranchClass::Fix,
            "refactor" => BranchClass::Refactor,
            "docs" => BranchClass::Docs,
            "test" => BranchClass::Test,
            "chore" => BranchClass::Chore,
            _ => BranchClass::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GitContextEvent {
    pub repo_root: String,
    pub branch: String,
    pub branch_class: BranchClass,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }

    /// Maps a syslog priority (0 = emerg .. 7 = debug).
    pub fn from_syslog_priority(priority: u8) -> Self {
        match priority {
            0..=2 => LogLevel::Critical,
            3 => LogLevel::Error,
            4 => LogLevel::Warning,
            5 | 6 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostLogEvent {
    pub level: LogLevel,
    pub service: String,
    pub message: String,
    pub raw_line: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSampleEvent {
    pub process_name: String,
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub timestamp: i64,
}

/// A derived pattern over a window of raw events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEvent {
    pub kind: String,
    pub description: String,
    pub window_start: i64,
    pub window_end: i64,
    pub details: Value,
}

/// Per-stream timestamp clamp.
#[derive(Debug, Default)]
pub struct StreamClock {
    last: AtomicI64,
}

impl StreamClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `ts`, or the last issued timestamp if `ts` would go backwards.
    pub fn stamp(&self, ts: i64) -> i64 {
        let previous = self.last.fetch_max(ts, Ordering::SeqCst);
        previous.max(ts)
    }
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
