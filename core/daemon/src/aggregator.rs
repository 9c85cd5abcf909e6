//! Window aggregation: derives semantic activity patterns from the raw
//! events of the window that just ended.
//!
//! The window is as long as the run interval, so consecutive runs tile the
//! timeline without overlap. Rules are independent of each other and of
//! previous runs. Each cycle also prunes raw events past the retention
//! horizon.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collector::{run_periodic, Collector, CollectorError, Worker};
use crate::db::Db;
use crate::events::{
    now_secs, ActivityEvent, AggregatedEvent, EventKind, FileChangeEvent, ShellCommandEvent,
};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

const BUILD_VOCABULARY: &[&str] = &[
    "make",
    "gcc",
    "g++",
    "cargo build",
    "cargo test",
    "npm run",
    "npm test",
    "pytest",
    "python",
    "java",
    "mvn",
    "go build",
    "go test",
];
const DOC_EXTENSIONS: &[&str] = &["md", "rst", "txt"];

const DEBUGGING_MIN_FAILURES: usize = 5;
const DEVELOPMENT_MIN_FILES: usize = 10;
const DOCUMENTATION_MIN_FILES: usize = 5;
const GIT_MIN_OPERATIONS: usize = 3;
const SAMPLE_COMMANDS: usize = 5;

/// Applies every rule to one window. Inputs may be in any order.
pub fn aggregate_window(
    commands: &[ShellCommandEvent],
    file_events: &[FileChangeEvent],
    window_start: i64,
    window_end: i64,
) -> Vec<AggregatedEvent> {
    let mut commands: Vec<&ShellCommandEvent> = commands.iter().collect();
    commands.sort_by_key(|command| command.timestamp);

    let edited: BTreeSet<&str> = file_events
        .iter()
        .filter(|event| event.kind.is_edit())
        .map(|event| event.path.as_str())
        .collect();

    let rules = [
        high_intensity_debugging(&commands),
        continuous_development(&edited),
        documentation_writing(&edited),
        git_operations(&commands),
    ];

    rules
        .into_iter()
        .flatten()
        .map(|(kind, description, details)| AggregatedEvent {
            kind: kind.to_string(),
            description,
            window_start,
            window_end,
            details,
        })
        .collect()
}

type RuleOutput = Option<(&'static str, String, Value)>;

fn high_intensity_debugging(commands: &[&ShellCommandEvent]) -> RuleOutput {
    let failed: Vec<&str> = commands
        .iter()
        .filter(|command| command.failed())
        .map(|command| command.display_command())
        .filter(|text| {
            let lowered = text.to_lowercase();
            BUILD_VOCABULARY.iter().any(|word| lowered.contains(word))
        })
        .collect();

    if failed.len() < DEBUGGING_MIN_FAILURES {
        return None;
    }
    Some((
        "high_intensity_debugging",
        format!(
            "High intensity debugging detected: {} failed builds/runs",
            failed.len()
        ),
        json!({
            "failed_count": failed.len(),
            "commands": failed.iter().take(SAMPLE_COMMANDS).collect::<Vec<_>>(),
        }),
    ))
}

fn continuous_development(edited: &BTreeSet<&str>) -> RuleOutput {
    if edited.len() < DEVELOPMENT_MIN_FILES {
        return None;
    }

    let mut extensions: BTreeMap<String, u64> = BTreeMap::new();
    for path in edited {
        if let Some(ext) = Path::new(path).extension() {
            *extensions
                .entry(ext.to_string_lossy().to_lowercase())
                .or_insert(0) += 1;
        }
    }
    let extensions: Map<String, Value> = extensions
        .into_iter()
        .map(|(ext, count)| (ext, Value::from(count)))
        .collect();

    Some((
        "continuous_development",
        format!("Continuous development: {} files modified", edited.len()),
        json!({ "file_count": edited.len(), "extensions": extensions }),
    ))
}

fn documentation_writing(edited: &BTreeSet<&str>) -> RuleOutput {
    let docs = edited
        .iter()
        .filter(|path| {
            Path::new(path)
                .extension()
                .map(|ext| DOC_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .count();

    if docs < DOCUMENTATION_MIN_FILES {
        return None;
    }
    Some((
        "documentation_writing",
        format!("Documentation writing: {} doc files edited", docs),
        json!({ "file_count": docs }),
    ))
}

fn git_operations(commands: &[&ShellCommandEvent]) -> RuleOutput {
    let operations = commands
        .iter()
        .filter(|command| {
            let lowered = command.display_command().to_lowercase();
            lowered.contains("git commit") || lowered.contains("git push")
        })
        .count();

    if operations < GIT_MIN_OPERATIONS {
        return None;
    }
    Some((
        "git_operations",
        format!("Active Git operations: {} commits/pushes", operations),
        json!({ "operation_count": operations }),
    ))
}

/// Commands and file events with `start <= ts <= end`.
fn read_window(db: &Db, start: i64, end: i64) -> Result<Vec<ActivityEvent>, String> {
    let mut events = db.query_window(EventKind::ShellCommand, start, end, None)?;
    events.extend(db.query_window(EventKind::FileChange, start, end, None)?);
    Ok(events)
}

fn split_window(events: Vec<ActivityEvent>) -> (Vec<ShellCommandEvent>, Vec<FileChangeEvent>) {
    let mut commands = Vec::new();
    let mut file_events = Vec::new();
    for event in events {
        match event {
            ActivityEvent::ShellCommand(command) => commands.push(command),
            ActivityEvent::FileChange(file_event) => file_events.push(file_event),
            _ => {}
        }
    }
    (commands, file_events)
}

/// One aggregation pass over `(now - window_secs, now]`. Returns what was
/// persisted.
pub fn run_cycle(
    db: &Db,
    now: i64,
    window_secs: i64,
    retention_days: u32,
) -> Vec<AggregatedEvent> {
    let window_start = now - window_secs;

    let (commands, file_events) = match read_window(db, window_start + 1, now) {
        Ok(events) => split_window(events),
        Err(err) => {
            warn!(error = %err, "Aggregation skipped: failed to read window");
            return Vec::new();
        }
    };

    let mut persisted = Vec::new();
    for event in aggregate_window(&commands, &file_events, window_start, now) {
        match db.insert_aggregated_event(&event) {
            Ok(()) => {
                info!(kind = %event.kind, description = %event.description, "Aggregated event");
                persisted.push(event);
            }
            Err(err) => warn!(error = %err, kind = %event.kind, "Failed to store aggregated event"),
        }
    }

    if retention_days > 0 {
        let cutoff = now - i64::from(retention_days) * SECS_PER_DAY;
        match db.prune_before(cutoff) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, cutoff, "Pruned expired raw events"),
            Err(err) => warn!(error = %err, "Failed to prune expired events"),
        }
    }

    persisted
}

pub struct Aggregator {
    interval: Duration,
    retention_days: u32,
    db: Arc<Db>,
    worker: Option<Worker>,
}

impl Aggregator {
    pub fn new(interval: Duration, retention_days: u32, db: Arc<Db>) -> Self {
        Self {
            interval,
            retention_days,
            db,
            worker: None,
        }
    }
}

impl Collector for Aggregator {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }
        let db = Arc::clone(&self.db);
        let interval = self.interval;
        let window_secs = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
        let retention_days = self.retention_days;
        self.worker = Some(Worker::spawn(self.name(), move |shutdown| {
            run_periodic(&shutdown, interval, interval, || {
                run_cycle(&db, now_secs(), window_secs, retention_days);
            });
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{command, file_event, temp_db};
    use crate::events::FileChangeKind;

    #[test]
    fn mixed_python_and_markdown_edits_emit_both_patterns() {
        let mut files = Vec::new();
        for index in 0..6 {
            files.push(file_event(
                &format!("/repo/src/module_{}.py", index),
                FileChangeKind::Modified,
                index * 50,
            ));
        }
        for index in 0..5 {
            files.push(file_event(
                &format!("/repo/docs/page_{}.md", index),
                FileChangeKind::Modified,
                300 + index * 50,
            ));
        }

        let events = aggregate_window(&[], &files, 0, 600);
        let kinds: Vec<&str> = events.iter().map(|event| event.kind.as_str()).collect();
        assert_eq!(kinds, vec!["continuous_development", "documentation_writing"]);

        let development = &events[0];
        assert_eq!(development.details["file_count"], 11);
        assert_eq!(development.details["extensions"]["py"], 6);
        assert_eq!(development.details["extensions"]["md"], 5);
        assert_eq!(events[1].details["file_count"], 5);
        assert_eq!(development.window_start, 0);
        assert_eq!(development.window_end, 600);
    }

    #[test]
    fn repeated_edits_to_one_file_count_once() {
        let files: Vec<FileChangeEvent> = (0..20)
            .map(|ts| file_event("/repo/a.md", FileChangeKind::Modified, ts))
            .collect();
        assert!(aggregate_window(&[], &files, 0, 600).is_empty());
    }

    #[test]
    fn deletions_do_not_count_as_development() {
        let files: Vec<FileChangeEvent> = (0..12)
            .map(|index| file_event(&format!("/repo/f{}.rs", index), FileChangeKind::Deleted, index))
            .collect();
        assert!(aggregate_window(&[], &files, 0, 600).is_empty());
    }

    #[test]
    fn failed_builds_emit_debugging_with_first_five_commands() {
        let mut commands: Vec<ShellCommandEvent> = (0..6)
            .map(|index| command(&format!("cargo test case_{}", index), 100 + index, 101))
            .collect();
        commands.push(command("ls", 50, 1));
        commands.push(command("cargo build", 60, 0));
        commands.reverse();

        let events = aggregate_window(&commands, &[], 0, 600);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "high_intensity_debugging");
        assert_eq!(events[0].details["failed_count"], 6);
        let sample = events[0].details["commands"].as_array().expect("commands");
        assert_eq!(sample.len(), 5);
        assert_eq!(sample[0], "cargo test case_0");
    }

    #[test]
    fn four_failed_builds_are_not_enough() {
        let commands: Vec<ShellCommandEvent> = (0..4)
            .map(|index| command("make", index, 2))
            .collect();
        assert!(aggregate_window(&commands, &[], 0, 600).is_empty());
    }

    #[test]
    fn git_operations_need_three_commits_or_pushes() {
        let mut commands = vec![
            command("git commit -m 'a'", 1, 0),
            command("git push origin main", 2, 0),
            command("git status", 3, 0),
        ];
        assert!(aggregate_window(&commands, &[], 0, 600).is_empty());

        commands.push(command("git commit --amend", 4, 0));
        let events = aggregate_window(&commands, &[], 0, 600);
        assert_eq!(events[0].kind, "git_operations");
        assert_eq!(events[0].details["operation_count"], 3);
    }

    #[test]
    fn run_cycle_persists_and_prunes() {
        let (_temp_dir, db) = temp_db();
        let now = 100 * SECS_PER_DAY;
        for index in 0..3 {
            db.insert_shell_command(&command("git push", now - 10 - index, 0))
                .expect("insert");
        }
        db.insert_shell_command(&command("ancient", now - 40 * SECS_PER_DAY, 0))
            .expect("insert");

        let persisted = run_cycle(&db, now, 600, 30);
        assert_eq!(persisted.len(), 1);
        assert_eq!(db.list_aggregated_events(10).expect("list").len(), 1);

        let remaining = db.shell_commands_between(0, now, None).expect("query");
        assert_eq!(remaining.len(), 3);
    }

    #[test]
    fn window_follows_the_run_interval() {
        let (_temp_dir, db) = temp_db();
        let now = 10_000;
        for offset in [400, 450, 500] {
            db.insert_shell_command(&command("git commit -m wip", now - offset, 0))
                .expect("insert");
        }

        assert!(run_cycle(&db, now, 300, 0).is_empty());

        let persisted = run_cycle(&db, now, 600, 0);
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].window_start, now - 600);
        assert_eq!(persisted[0].window_end, now);
    }

    #[test]
    fn consecutive_windows_do_not_share_events() {
        let (_temp_dir, db) = temp_db();
        let boundary = 10_000;
        for offset in [0, 10, 20] {
            db.insert_shell_command(&command("git push", boundary - offset, 0))
                .expect("insert");
        }

        assert_eq!(run_cycle(&db, boundary, 300, 0).len(), 1);
        assert!(run_cycle(&db, boundary + 300, 300, 0).is_empty());
    }
}
