//! Anomaly checks over recent raw events.
//!
//! Every check is a pure function of the stored events inside its window
//! ending at an explicit `now`, so replaying the same events always yields
//! the same candidates.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::warn;

use crate::db::Db;
use crate::events::{FileChangeEvent, HostLogEvent, LogLevel, ShellCommandEvent};

const REPEATED_COMMAND_WINDOW_SECS: i64 = 300;
const REPEATED_COMMAND_SAMPLE: usize = 50;
const REPEATED_COMMAND_MIN: usize = 3;
const REPEATED_COMMAND_HIGH: usize = 5;

const FILE_THRASHING_WINDOW_SECS: i64 = 600;
const FILE_THRASHING_SAMPLE: usize = 100;
const FILE_THRASHING_MIN: usize = 5;
const FILE_THRASHING_HIGH: usize = 10;

const ERROR_RATE_WINDOW_SECS: i64 = 300;
const ERROR_RATE_MIN_TOTAL: usize = 5;
const ERROR_RATE_MIN_FAILED: usize = 3;
const ERROR_RATE_TRIGGER: f64 = 0.5;
const ERROR_RATE_HIGH: f64 = 0.7;
const ERROR_RATE_FAILED_SAMPLE: usize = 10;

const HOST_ERRORS_WINDOW_SECS: i64 = 300;
const HOST_ERRORS_SAMPLE: usize = 20;
const HOST_ERRORS_SERVICE_MIN: usize = 3;
const HOST_ERRORS_TOTAL_MIN: usize = 5;
const HOST_ERRORS_SERVICE_HIGH: usize = 5;
const HOST_ERRORS_RECENT_MESSAGES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    RepeatedCommand,
    FileThrashing,
    HighErrorRate,
    HostErrors,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 4] = [
        AnomalyKind::RepeatedCommand,
        AnomalyKind::FileThrashing,
        AnomalyKind::HighErrorRate,
        AnomalyKind::HostErrors,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::RepeatedCommand => "repeated_command",
            AnomalyKind::FileThrashing => "file_thrashing",
            AnomalyKind::HighErrorRate => "high_error_rate",
            AnomalyKind::HostErrors => "host_errors",
        }
    }

    pub fn window_secs(self) -> i64 {
        match self {
            AnomalyKind::RepeatedCommand => REPEATED_COMMAND_WINDOW_SECS,
            AnomalyKind::FileThrashing => FILE_THRASHING_WINDOW_SECS,
            AnomalyKind::HighErrorRate => ERROR_RATE_WINDOW_SECS,
            AnomalyKind::HostErrors => HOST_ERRORS_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    fn at_least(high: bool) -> Self {
        if high {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyCandidate {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub context: Value,
    pub detection_window_secs: i64,
}

pub struct AnomalyDetector {
    db: Arc<Db>,
}

impl AnomalyDetector {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn check(&self, kind: AnomalyKind, now: i64) -> Option<AnomalyCandidate> {
        let start = now - kind.window_secs();
        let result = match kind {
            AnomalyKind::RepeatedCommand => self
                .db
                .shell_commands_between(start, now, Some(REPEATED_COMMAND_SAMPLE))
                .map(|commands| evaluate_repeated_command(&commands)),
            AnomalyKind::FileThrashing => self
                .db
                .file_changes_between(start, now, true, Some(FILE_THRASHING_SAMPLE))
                .map(|edits| evaluate_file_thrashing(&edits)),
            AnomalyKind::HighErrorRate => self
                .db
                .shell_commands_between(start, now, None)
                .map(|commands| evaluate_error_rate(&commands)),
            AnomalyKind::HostErrors => self
                .db
                .host_logs_between(start, now, LogLevel::Error, Some(HOST_ERRORS_SAMPLE))
                .map(|logs| evaluate_host_errors(&logs)),
        };

        match result {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(error = %err, kind = kind.as_str(), "Anomaly check failed");
                None
            }
        }
    }

    #[cfg(test)]
    pub fn check_all(&self, now: i64) -> Vec<AnomalyCandidate> {
        AnomalyKind::ALL
            .iter()
            .filter_map(|kind| self.check(*kind, now))
            .collect()
    }
}

/// Most frequent key in a newest-first sequence. Ties go to the key seen
/// most recently.
fn most_frequent<K: Eq + Hash + Copy>(newest_first: impl Iterator<Item = K>) -> Option<(K, usize)> {
    let mut tallies: HashMap<K, (usize, usize)> = HashMap::new();
    for (position, key) in newest_first.enumerate() {
        tallies.entry(key).or_insert((0, position)).0 += 1;
    }
    tallies
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(key, (count, _))| (key, count))
}

fn failed_command_entry(command: &ShellCommandEvent) -> Value {
    json!({
        "command": command.display_command(),
        "exit_code": command.exit_code,
        "timestamp": command.timestamp,
        "working_dir": command.working_dir,
    })
}

/// `commands` newest first.
pub fn evaluate_repeated_command(commands: &[ShellCommandEvent]) -> Option<AnomalyCandidate> {
    let most_recent = commands.first()?.display_command();
    let (top, count) = most_frequent(commands.iter().map(|command| command.display_command()))?;
    if top != most_recent || count < REPEATED_COMMAND_MIN {
        return None;
    }

    // Every failure in the sample, not only the repeated one, so the
    // analysis sees what else broke around it.
    let failed_commands: Vec<Value> = commands
        .iter()
        .rev()
        .filter(|command| command.failed())
        .map(failed_command_entry)
        .collect();

    Some(AnomalyCandidate {
        kind: AnomalyKind::RepeatedCommand,
        severity: Severity::at_least(count >= REPEATED_COMMAND_HIGH),
        context: json!({
            "command": top,
            "count": count,
            "failed_commands": failed_commands,
            "time_window": REPEATED_COMMAND_WINDOW_SECS,
        }),
        detection_window_secs: REPEATED_COMMAND_WINDOW_SECS,
    })
}

/// `edits` newest first, CREATED/MODIFIED only.
pub fn evaluate_file_thrashing(edits: &[FileChangeEvent]) -> Option<AnomalyCandidate> {
    let (path, count) = most_frequent(edits.iter().map(|event| event.path.as_str()))?;
    if count < FILE_THRASHING_MIN {
        return None;
    }

    Some(AnomalyCandidate {
        kind: AnomalyKind::FileThrashing,
        severity: Severity::at_least(count >= FILE_THRASHING_HIGH),
        context: json!({
            "file": path,
            "edit_count": count,
            "time_window": FILE_THRASHING_WINDOW_SECS,
        }),
        detection_window_secs: FILE_THRASHING_WINDOW_SECS,
    })
}

/// `commands` newest first.
pub fn evaluate_error_rate(commands: &[ShellCommandEvent]) -> Option<AnomalyCandidate> {
    let total = commands.len();
    if total < ERROR_RATE_MIN_TOTAL {
        return None;
    }
    let failed: Vec<&ShellCommandEvent> = commands.iter().filter(|c| c.failed()).collect();
    let ratio = failed.len() as f64 / total as f64;
    if ratio <= ERROR_RATE_TRIGGER || failed.len() < ERROR_RATE_MIN_FAILED {
        return None;
    }

    let recent_failures: Vec<Value> = failed
        .iter()
        .take(ERROR_RATE_FAILED_SAMPLE)
        .map(|command| failed_command_entry(command))
        .collect();

    Some(AnomalyCandidate {
        kind: AnomalyKind::HighErrorRate,
        severity: Severity::at_least(ratio > ERROR_RATE_HIGH),
        context: json!({
            "error_rate": ratio,
            "failed_count": failed.len(),
            "total_count": total,
            "failed_commands": recent_failures,
            "time_window": ERROR_RATE_WINDOW_SECS,
        }),
        detection_window_secs: ERROR_RATE_WINDOW_SECS,
    })
}

/// `logs` newest first, ERROR and CRITICAL only.
pub fn evaluate_host_errors(logs: &[HostLogEvent]) -> Option<AnomalyCandidate> {
    let (top_service, top_count) = most_frequent(logs.iter().map(|log| log.service.as_str()))?;
    let total = logs.len();
    if top_count < HOST_ERRORS_SERVICE_MIN && total < HOST_ERRORS_TOTAL_MIN {
        return None;
    }

    let mut by_service = serde_json::Map::new();
    for log in logs {
        let entry = by_service
            .entry(log.service.clone())
            .or_insert_with(|| Value::from(0u64));
        *entry = Value::from(entry.as_u64().unwrap_or(0) + 1);
    }
    let recent_messages: Vec<Value> = logs
        .iter()
        .take(HOST_ERRORS_RECENT_MESSAGES)
        .map(|log| {
            json!({
                "service": log.service,
                "level": log.level.as_str(),
                "message": log.message,
                "timestamp": log.timestamp,
            })
        })
        .collect();

    Some(AnomalyCandidate {
        kind: AnomalyKind::HostErrors,
        severity: Severity::at_least(top_count >= HOST_ERRORS_SERVICE_HIGH),
        context: json!({
            "total_errors": total,
            "top_service": top_service,
            "top_service_count": top_count,
            "by_service": by_service,
            "recent_messages": recent_messages,
            "time_window": HOST_ERRORS_WINDOW_SECS,
        }),
        detection_window_secs: HOST_ERRORS_WINDOW_SECS,
    })
}
