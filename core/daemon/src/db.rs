//! SQLite persistence for devpulse-daemon.
//!
//! Every ingestor appends to its own table; readers query trailing windows
//! by timestamp. Each call opens its own connection, so writes from
//! different collector threads never share a transaction.

use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use serde_json::Value;
use std::path::PathBuf;

use crate::events::{
    ActivityEvent, AggregatedEvent, BranchClass, EventKind, FileChangeEvent, FileChangeKind,
    GitContextEvent, HostLogEvent, LogLevel, ProcessSampleEvent, ShellCommandEvent,
};

pub struct Db {
    path: PathBuf,
}

/// Persisted outcome of one dispatched anomaly. Exactly one of `analysis`
/// and `error` is set.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AnomalyRecord {
    pub id: Option<i64>,
    pub timestamp: i64,
    pub anomaly_kind: String,
    pub severity: String,
    pub trigger_context: Value,
    pub analysis: Option<Value>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

const RAW_EVENT_TABLES: [&str; 5] = [
    "shell_commands",
    "file_events",
    "git_contexts",
    "host_logs",
    "process_samples",
];

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn insert_shell_command(&self, event: &ShellCommandEvent) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO shell_commands \
                    (ts, command, sanitized_command, working_dir, duration, exit_code) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.timestamp,
                    event.raw_command,
                    event.sanitized_command,
                    event.working_dir,
                    event.duration,
                    event.exit_code
                ],
            )
            .map_err(|err| format!("Failed to insert shell command: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_file_change(&self, event: &FileChangeEvent) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO file_events (ts, path, kind) VALUES (?1, ?2, ?3)",
                params![event.timestamp, event.path, event.kind.as_str()],
            )
            .map_err(|err| format!("Failed to insert file event: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_git_context(&self, event: &GitContextEvent) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO git_contexts (ts, repo_root, branch, branch_class) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.timestamp,
                    event.repo_root,
                    event.branch,
                    event.branch_class.as_str()
                ],
            )
            .map_err(|err| format!("Failed to insert git context: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_host_log(&self, event: &HostLogEvent) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO host_logs (ts, level, service, message, raw_line) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.timestamp,
                    event.level.as_str(),
                    event.service,
                    event.message,
                    event.raw_line
                ],
            )
            .map_err(|err| format!("Failed to insert host log: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_process_sample(&self, event: &ProcessSampleEvent) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO process_samples (ts, process_name, pid, cpu_percent, memory_mb) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.timestamp,
                    event.process_name,
                    event.pid,
                    event.cpu_percent as f64,
                    event.memory_mb
                ],
            )
            .map_err(|err| format!("Failed to insert process sample: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_aggregated_event(&self, event: &AggregatedEvent) -> Result<(), String> {
        let details = serde_json::to_string(&event.details)
            .map_err(|err| format!("Failed to serialize aggregated details: {}", err))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO aggregated_events \
                    (kind, description, window_start, window_end, details) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.kind,
                    event.description,
                    event.window_start,
                    event.window_end,
                    details
                ],
            )
            .map_err(|err| format!("Failed to insert aggregated event: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_anomaly_record(&self, record: &AnomalyRecord) -> Result<i64, String> {
        let context = serde_json::to_string(&record.trigger_context)
            .map_err(|err| format!("Failed to serialize trigger context: {}", err))?;
        let analysis = match &record.analysis {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|err| format!("Failed to serialize analysis: {}", err))?,
            ),
            None => None,
        };
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO anomaly_records \
                    (ts, anomaly_kind, severity, trigger_context, analysis, confidence, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.timestamp,
                    record.anomaly_kind,
                    record.severity,
                    context,
                    analysis,
                    record.confidence,
                    record.error
                ],
            )
            .map_err(|err| format!("Failed to insert anomaly record: {}", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Events of one kind with `start <= ts <= end`, newest first.
    pub fn query_window(
        &self,
        kind: EventKind,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityEvent>, String> {
        let events = match kind {
            EventKind::ShellCommand => self
                .shell_commands_between(start, end, limit)?
                .into_iter()
                .map(ActivityEvent::ShellCommand)
                .collect(),
            EventKind::FileChange => self
                .file_changes_between(start, end, false, limit)?
                .into_iter()
                .map(ActivityEvent::FileChange)
                .collect(),
            EventKind::GitContext => self
                .git_contexts_between(start, end, limit)?
                .into_iter()
                .map(ActivityEvent::GitContext)
                .collect(),
            EventKind::HostLog => self
                .host_logs_between(start, end, LogLevel::Debug, limit)?
                .into_iter()
                .map(ActivityEvent::HostLog)
                .collect(),
            EventKind::ProcessSample => self
                .process_samples_between(start, end, limit)?
                .into_iter()
                .map(ActivityEvent::ProcessSample)
                .collect(),
        };
        Ok(events)
    }

    pub fn shell_commands_between(
        &self,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ShellCommandEvent>, String> {
        self.with_connection(|conn| {
            query_rows(
                conn,
                "SELECT command, sanitized_command, working_dir, ts, duration, exit_code \
                 FROM shell_commands WHERE ts >= ?1 AND ts <= ?2 \
                 ORDER BY ts DESC, id DESC LIMIT ?3",
                params![start, end, sql_limit(limit)],
                "shell command",
                |row| {
                    Ok(ShellCommandEvent {
                        raw_command: row.get(0)?,
                        sanitized_command: row.get(1)?,
                        working_dir: row.get(2)?,
                        timestamp: row.get(3)?,
                        duration: row.get(4)?,
                        exit_code: row.get(5)?,
                    })
                },
            )
        })
    }

    /// File events in the window; `edits_only` keeps CREATED/MODIFIED.
    pub fn file_changes_between(
        &self,
        start: i64,
        end: i64,
        edits_only: bool,
        limit: Option<usize>,
    ) -> Result<Vec<FileChangeEvent>, String> {
        let sql = if edits_only {
            "SELECT path, kind, ts FROM file_events \
             WHERE ts >= ?1 AND ts <= ?2 AND kind IN ('CREATED', 'MODIFIED') \
             ORDER BY ts DESC, id DESC LIMIT ?3"
        } else {
            "SELECT path, kind, ts FROM file_events \
             WHERE ts >= ?1 AND ts <= ?2 \
             ORDER BY ts DESC, id DESC LIMIT ?3"
        };
        self.with_connection(|conn| {
            query_rows(
                conn,
                sql,
                params![start, end, sql_limit(limit)],
                "file event",
                file_change_from_row,
            )
        })
    }

    pub fn git_contexts_between(
        &self,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<GitContextEvent>, String> {
        self.with_connection(|conn| {
            query_rows(
                conn,
                "SELECT repo_root, branch, branch_class, ts FROM git_contexts \
                 WHERE ts >= ?1 AND ts <= ?2 \
                 ORDER BY ts DESC, id DESC LIMIT ?3",
                params![start, end, sql_limit(limit)],
                "git context",
                |row| {
                    let class: String = row.get(2)?;
                    Ok(GitContextEvent {
                        repo_root: row.get(0)?,
                        branch: row.get(1)?,
                        branch_class: BranchClass::from_str(&class),
                        timestamp: row.get(3)?,
                    })
                },
            )
        })
    }

    /// Host log lines at or above `min_level` in the window.
    pub fn host_logs_between(
        &self,
        start: i64,
        end: i64,
        min_level: LogLevel,
        limit: Option<usize>,
    ) -> Result<Vec<HostLogEvent>, String> {
        let levels: Vec<&'static str> = [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ]
        .into_iter()
        .filter(|level| *level >= min_level)
        .map(LogLevel::as_str)
        .collect();
        let placeholders: Vec<String> = (4..4 + levels.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT level, service, message, raw_line, ts FROM host_logs \
             WHERE ts >= ?1 AND ts <= ?2 AND level IN ({}) \
             ORDER BY ts DESC, id DESC LIMIT ?3",
            placeholders.join(", ")
        );

        let mut values: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Integer(start),
            rusqlite::types::Value::Integer(end),
            rusqlite::types::Value::Integer(sql_limit(limit)),
        ];
        values.extend(
            levels
                .iter()
                .map(|level| rusqlite::types::Value::Text(level.to_string())),
        );

        self.with_connection(|conn| {
            query_rows(
                conn,
                &sql,
                params_from_iter(values.iter()),
                "host log",
                |row| {
                    let level_raw: String = row.get(0)?;
                    Ok(HostLogEvent {
                        level: LogLevel::from_str(&level_raw).unwrap_or(LogLevel::Info),
                        service: row.get(1)?,
                        message: row.get(2)?,
                        raw_line: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                },
            )
        })
    }

    pub fn process_samples_between(
        &self,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ProcessSampleEvent>, String> {
        self.with_connection(|conn| {
            query_rows(
                conn,
                "SELECT process_name, pid, cpu_percent, memory_mb, ts FROM process_samples \
                 WHERE ts >= ?1 AND ts <= ?2 \
                 ORDER BY ts DESC, id DESC LIMIT ?3",
                params![start, end, sql_limit(limit)],
                "process sample",
                |row| {
                    Ok(ProcessSampleEvent {
                        process_name: row.get(0)?,
                        pid: row.get(1)?,
                        cpu_percent: row.get::<_, f64>(2)? as f32,
                        memory_mb: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                },
            )
        })
    }

    pub fn list_aggregated_events(&self, limit: usize) -> Result<Vec<AggregatedEvent>, String> {
        self.with_connection(|conn| {
            query_rows(
                conn,
                "SELECT kind, description, window_start, window_end, details \
                 FROM aggregated_events ORDER BY window_end DESC, id DESC LIMIT ?1",
                params![limit as i64],
                "aggregated event",
                |row| {
                    let details: String = row.get(4)?;
                    Ok(AggregatedEvent {
                        kind: row.get(0)?,
                        description: row.get(1)?,
                        window_start: row.get(2)?,
                        window_end: row.get(3)?,
                        details: serde_json::from_str(&details).unwrap_or(Value::Null),
                    })
                },
            )
        })
    }

    #[cfg(test)]
    pub fn list_anomaly_records(&self, limit: usize) -> Result<Vec<AnomalyRecord>, String> {
        self.with_connection(|conn| {
            query_rows(
                conn,
                "SELECT id, ts, anomaly_kind, severity, trigger_context, analysis, confidence, error \
                 FROM anomaly_records ORDER BY ts DESC, id DESC LIMIT ?1",
                params![limit as i64],
                "anomaly record",
                |row| {
                    let context: String = row.get(4)?;
                    let analysis: Option<String> = row.get(5)?;
                    Ok(AnomalyRecord {
                        id: Some(row.get(0)?),
                        timestamp: row.get(1)?,
                        anomaly_kind: row.get(2)?,
                        severity: row.get(3)?,
                        trigger_context: serde_json::from_str(&context).unwrap_or(Value::Null),
                        analysis: analysis.and_then(|raw| serde_json::from_str(&raw).ok()),
                        confidence: row.get(6)?,
                        error: row.get(7)?,
                    })
                },
            )
        })
    }

    /// Usage score per directory since `since`: one point per shell command
    /// run there, ten per git context recorded for a repository root.
    pub fn directory_scores(&self, since: i64) -> Result<Vec<(String, f64)>, String> {
        self.with_connection(|conn| {
            let commands = query_rows(
                conn,
                "SELECT working_dir, COUNT(*) FROM shell_commands \
                 WHERE ts >= ?1 AND working_dir != '' AND working_dir != '/' \
                 GROUP BY working_dir",
                params![since],
                "directory score",
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?;
            let repos = query_rows(
                conn,
                "SELECT repo_root, COUNT(*) FROM git_contexts \
                 WHERE ts >= ?1 AND repo_root != '' GROUP BY repo_root",
                params![since],
                "repository score",
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?;

            let mut scores: std::collections::HashMap<String, f64> =
                std::collections::HashMap::new();
            for (dir, count) in commands {
                *scores.entry(dir).or_insert(0.0) += count as f64;
            }
            for (repo, count) in repos {
                *scores.entry(repo).or_insert(0.0) += 10.0 * count as f64;
            }

            let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
            ranked.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            Ok(ranked)
        })
    }

    /// Deletes raw events older than `cutoff`. Derived tables are kept.
    pub fn prune_before(&self, cutoff: i64) -> Result<u64, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start prune transaction: {}", err))?;
            let mut removed = 0u64;
            for table in RAW_EVENT_TABLES {
                let sql = format!("DELETE FROM {} WHERE ts < ?1", table);
                removed += tx
                    .execute(&sql, params![cutoff])
                    .map_err(|err| format!("Failed to prune {}: {}", table, err))?
                    as u64;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit prune: {}", err))?;
            Ok(removed)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS shell_commands (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts INTEGER NOT NULL,
                    command TEXT NOT NULL,
                    sanitized_command TEXT NOT NULL,
                    working_dir TEXT NOT NULL,
                    duration REAL NOT NULL DEFAULT 0,
                    exit_code INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_shell_commands_ts ON shell_commands (ts);
                 CREATE TABLE IF NOT EXISTS file_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts INTEGER NOT NULL,
                    path TEXT NOT NULL,
                    kind TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_file_events_ts ON file_events (ts);
                 CREATE TABLE IF NOT EXISTS git_contexts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts INTEGER NOT NULL,
                    repo_root TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    branch_class TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_git_contexts_ts ON git_contexts (ts);
                 CREATE TABLE IF NOT EXISTS host_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    service TEXT NOT NULL,
                    message TEXT NOT NULL,
                    raw_line TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_host_logs_ts ON host_logs (ts);
                 CREATE TABLE IF NOT EXISTS process_samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts INTEGER NOT NULL,
                    process_name TEXT NOT NULL,
                    pid INTEGER NOT NULL,
                    cpu_percent REAL NOT NULL,
                    memory_mb REAL NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_process_samples_ts ON process_samples (ts);
                 CREATE TABLE IF NOT EXISTS aggregated_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    description TEXT NOT NULL,
                    window_start INTEGER NOT NULL,
                    window_end INTEGER NOT NULL,
                    details TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_aggregated_events_start
                    ON aggregated_events (window_start);
                 CREATE TABLE IF NOT EXISTS anomaly_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts INTEGER NOT NULL,
                    anomaly_kind TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    trigger_context TEXT NOT NULL,
                    analysis TEXT,
                    confidence REAL,
                    error TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_anomaly_records_ts ON anomaly_records (ts);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn query_rows<T, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    label: &str,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| format!("Failed to prepare {} query: {}", label, err))?;
    let rows = stmt
        .query_map(params, map)
        .map_err(|err| format!("Failed to query {} rows: {}", label, err))?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row.map_err(|err| format!("Failed to decode {} row: {}", label, err))?);
    }
    Ok(items)
}

fn file_change_from_row(row: &Row<'_>) -> rusqlite::Result<FileChangeEvent> {
    let kind_raw: String = row.get(1)?;
    let kind = FileChangeKind::from_str(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            kind_raw.len(),
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown file event kind: {}", kind_raw),
            )),
        )
    })?;
    Ok(FileChangeEvent {
        path: row.get(0)?,
        kind,
        timestamp: row.get(2)?,
    })
}

// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|value| value as i64).unwrap_or(-1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn temp_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("events.db")).expect("db init");
        (temp_dir, db)
    }

    pub(crate) fn command(text: &str, ts: i64, exit_code: i32) -> ShellCommandEvent {
        ShellCommandEvent {
            raw_command: text.to_string(),
            sanitized_command: text.to_string(),
            working_dir: "/repo".to_string(),
            timestamp: ts,
            duration: 0.5,
            exit_code,
        }
    }

    pub(crate) fn file_event(path: &str, kind: FileChangeKind, ts: i64) -> FileChangeEvent {
        FileChangeEvent {
            path: path.to_string(),
            kind,
            timestamp: ts,
        }
    }

    pub(crate) fn host_log(service: &str, level: LogLevel, ts: i64) -> HostLogEvent {
        HostLogEvent {
            level,
            service: service.to_string(),
            message: format!("{} failed", service),
            raw_line: "{}".to_string(),
            timestamp: ts,
        }
    }

    #[test]
    fn schema_includes_all_tables() {
        let (_temp_dir, db) = temp_db();
        let conn = Connection::open(&db.path).expect("open db");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
            .expect("prepare");
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .map(|row| row.expect("row"))
            .collect();

        for table in RAW_EVENT_TABLES {
            assert!(tables.iter().any(|name| name == table), "missing {}", table);
        }
        assert!(tables.iter().any(|name| name == "aggregated_events"));
        assert!(tables.iter().any(|name| name == "anomaly_records"));
    }

    #[test]
    fn query_window_orders_newest_first_and_bounds_inclusive() {
        let (_temp_dir, db) = temp_db();
        for (text, ts) in [("a", 100), ("b", 200), ("c", 300), ("d", 400)] {
            db.insert_shell_command(&command(text, ts, 0))
                .expect("insert command");
        }

        let events = db
            .query_window(EventKind::ShellCommand, 200, 300, None)
            .expect("query");
        let texts: Vec<String> = events
            .iter()
            .map(|event| match event {
                ActivityEvent::ShellCommand(cmd) => cmd.raw_command.clone(),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(texts, vec!["c", "b"]);
    }

    #[test]
    fn query_window_respects_limit_and_insertion_order_ties() {
        let (_temp_dir, db) = temp_db();
        db.insert_shell_command(&command("first", 50, 0)).expect("insert");
        db.insert_shell_command(&command("second", 50, 0)).expect("insert");
        db.insert_shell_command(&command("third", 50, 0)).expect("insert");

        let commands = db.shell_commands_between(0, 100, Some(2)).expect("query");
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].raw_command, "third");
        assert_eq!(commands[1].raw_command, "second");
    }

    #[test]
    fn file_changes_can_be_filtered_to_edits() {
        let (_temp_dir, db) = temp_db();
        db.insert_file_change(&file_event("/a.rs", FileChangeKind::Created, 10))
            .expect("insert");
        db.insert_file_change(&file_event("/a.rs", FileChangeKind::Modified, 11))
            .expect("insert");
        db.insert_file_change(&file_event("/a.rs", FileChangeKind::Deleted, 12))
            .expect("insert");
        db.insert_file_change(&file_event("/b.rs", FileChangeKind::Moved, 13))
            .expect("insert");

        let all = db.file_changes_between(0, 100, false, None).expect("query");
        assert_eq!(all.len(), 4);
        let edits = db.file_changes_between(0, 100, true, None).expect("query");
        assert_eq!(edits.len(), 2);
        assert!(edits.iter().all(|event| event.kind.is_edit()));
    }

    #[test]
    fn host_logs_filter_by_minimum_level() {
        let (_temp_dir, db) = temp_db();
        db.insert_host_log(&host_log("nginx", LogLevel::Warning, 10))
            .expect("insert");
        db.insert_host_log(&host_log("nginx", LogLevel::Error, 11))
            .expect("insert");
        db.insert_host_log(&host_log("kernel", LogLevel::Critical, 12))
            .expect("insert");

        let errors = db
            .host_logs_between(0, 100, LogLevel::Error, None)
            .expect("query");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].service, "kernel");
        assert_eq!(errors[0].level, LogLevel::Critical);

        let everything = db
            .query_window(EventKind::HostLog, 0, 100, None)
            .expect("query");
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn stores_git_contexts_and_process_samples() {
        let (_temp_dir, db) = temp_db();
        db.insert_git_context(&GitContextEvent {
            repo_root: "/repo".to_string(),
            branch: "feature/login".to_string(),
            branch_class: BranchClass::Feature,
            timestamp: 10,
        })
        .expect("insert git");
        db.insert_process_sample(&ProcessSampleEvent {
            process_name: "cargo".to_string(),
            pid: 4242,
            cpu_percent: 88.5,
            memory_mb: 512.0,
            timestamp: 11,
        })
        .expect("insert process");

        let contexts = db.git_contexts_between(0, 100, None).expect("query");
        assert_eq!(contexts[0].branch_class, BranchClass::Feature);
        let samples = db.process_samples_between(0, 100, None).expect("query");
        assert_eq!(samples[0].pid, 4242);
        assert!((samples[0].cpu_percent - 88.5).abs() < f32::EPSILON);
    }

    #[test]
    fn round_trips_aggregated_events_and_anomaly_records() {
        let (_temp_dir, db) = temp_db();
        db.insert_aggregated_event(&AggregatedEvent {
            kind: "git_operations".to_string(),
            description: "Active Git operations: 3 commits/pushes".to_string(),
            window_start: 0,
            window_end: 600,
            details: json!({ "operation_count": 3 }),
        })
        .expect("insert aggregated");
        let aggregated = db.list_aggregated_events(10).expect("list");
        assert_eq!(aggregated[0].details["operation_count"], 3);

        let id = db
            .insert_anomaly_record(&AnomalyRecord {
                id: None,
                timestamp: 700,
                anomaly_kind: "file_thrashing".to_string(),
                severity: "medium".to_string(),
                trigger_context: json!({ "file": "/a.rs", "edit_count": 6 }),
                analysis: None,
                confidence: None,
                error: Some("analyzer timed out".to_string()),
            })
            .expect("insert record");
        let records = db.list_anomaly_records(10).expect("list");
        assert_eq!(records[0].id, Some(id));
        assert_eq!(records[0].trigger_context["edit_count"], 6);
        assert_eq!(records[0].error.as_deref(), Some("analyzer timed out"));
        assert!(records[0].analysis.is_none());
    }

    #[test]
    fn directory_scores_weight_repositories() {
        let (_temp_dir, db) = temp_db();
        for ts in 0..3 {
            db.insert_shell_command(&ShellCommandEvent {
                working_dir: "/home/dev/scratch".to_string(),
                ..command("ls", 100 + ts, 0)
            })
            .expect("insert");
        }
        db.insert_shell_command(&ShellCommandEvent {
            working_dir: "/".to_string(),
            ..command("ls", 100, 0)
        })
        .expect("insert");
        db.insert_git_context(&GitContextEvent {
            repo_root: "/home/dev/project".to_string(),
            branch: "main".to_string(),
            branch_class: BranchClass::Other,
            timestamp: 100,
        })
        .expect("insert git");

        let scores = db.directory_scores(0).expect("scores");
        assert_eq!(scores[0], ("/home/dev/project".to_string(), 10.0));
        assert_eq!(scores[1], ("/home/dev/scratch".to_string(), 3.0));
        assert!(scores.iter().all(|(dir, _)| dir != "/"));
    }

    #[test]
    fn prunes_raw_events_before_cutoff() {
        let (_temp_dir, db) = temp_db();
        db.insert_shell_command(&command("old", 10, 0)).expect("insert");
        db.insert_shell_command(&command("new", 1000, 0)).expect("insert");
        db.insert_file_change(&file_event("/old.rs", FileChangeKind::Modified, 10))
            .expect("insert");

        let removed = db.prune_before(500).expect("prune");
        assert_eq!(removed, 2);
        let remaining = db.shell_commands_between(0, 2000, None).expect("query");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].raw_command, "new");
    }
}
