//! Host log streaming from the systemd journal.
//!
//! [`create_host_log_collector`] picks the journal-backed collector when
//! `journalctl` is usable and falls back to [`NullHostLogCollector`]
//! otherwise, so callers never need to branch on platform.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collector::{signal, ActivitySignal, Collector, CollectorError, SignalSender, Worker};
use crate::config::HostLogConfig;
use crate::db::Db;
use crate::events::{now_secs, HostLogEvent, LogLevel, StreamClock};
use crate::process::{find_in_path, terminate_gracefully};

const JOURNALCTL: &str = "journalctl";
const STOP_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_PRIORITY: u8 = 6;

static NOISE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"DHCP.*renewal",
        r"DHCPDISCOVER",
        r"CRON.*pam_unix.*session (opened|closed)",
        r"NetworkManager.*state changed",
        r"NetworkManager.*link became (ready|not-ready)",
        r"systemd.*Started Session",
        r"systemd.*Stopped Session",
        r"systemd.*Starting Session",
        r"systemd.*Created slice",
        r"systemd.*Removed slice",
        r"bluetoothd",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Matches against `"<service> <message>"` so service-scoped patterns work
/// whether or not the message repeats the service name.
pub fn is_noise(service: &str, message: &str) -> bool {
    let combined = format!("{} {}", service, message);
    NOISE_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(&combined))
}

/// journalctl `--priority` argument for a configured minimum level.
pub fn priority_arg(min_level: LogLevel) -> &'static str {
    match min_level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warning",
        LogLevel::Error => "err",
        LogLevel::Critical => "crit",
    }
}

/// Parses one `journalctl --output json` line. Returns `None` for
/// unparseable lines and noise.
pub fn parse_journal_line(line: &str, now: i64) -> Option<HostLogEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let entry: Value = match serde_json::from_str(line) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => return None,
        Err(err) => {
            debug!(error = %err, "Failed to parse journal line");
            return None;
        }
    };

    let message = journal_text(&entry["MESSAGE"]).unwrap_or_default();
    let service = journal_text(&entry["SYSLOG_IDENTIFIER"])
        .or_else(|| journal_text(&entry["_COMM"]))
        .unwrap_or_else(|| "unknown".to_string());
    let priority = journal_number(&entry["PRIORITY"])
        .and_then(|value| u8::try_from(value).ok())
        .unwrap_or(DEFAULT_PRIORITY);
    let timestamp = journal_number(&entry["__REALTIME_TIMESTAMP"])
        .map(|micros| (micros / 1_000_000) as i64)
        .unwrap_or(now);

    if is_noise(&service, &message) {
        return None;
    }

    Some(HostLogEvent {
        level: LogLevel::from_syslog_priority(priority),
        service,
        message,
        raw_line: line.to_string(),
        timestamp,
    })
}

// Journal fields are strings, but binary-safe fields arrive as byte arrays.
fn journal_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(bytes) => {
            let bytes: Vec<u8> = bytes
                .iter()
                .filter_map(|byte| byte.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => None,
    }
}

fn journal_number(value: &Value) -> Option<u64> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

pub fn create_host_log_collector(
    config: &HostLogConfig,
    db: Arc<Db>,
    signals: SignalSender,
) -> Box<dyn Collector> {
    if !config.enabled {
        info!("Host log collection disabled by config");
        return Box::new(NullHostLogCollector::default());
    }
    if find_in_path(JOURNALCTL).is_none() {
        info!("journalctl not found; host log collection unavailable");
        return Box::new(NullHostLogCollector::default());
    }
    let min_level = LogLevel::from_str(&config.min_level).unwrap_or(LogLevel::Warning);
    Box::new(JournalCollector::new(min_level, db, signals))
}

pub struct JournalCollector {
    min_level: LogLevel,
    db: Arc<Db>,
    signals: SignalSender,
    child: Option<Child>,
    worker: Option<Worker>,
}

impl JournalCollector {
    pub fn new(min_level: LogLevel, db: Arc<Db>, signals: SignalSender) -> Self {
        Self {
            min_level,
            db,
            signals,
            child: None,
            worker: None,
        }
    }
}

impl Collector for JournalCollector {
    fn name(&self) -> &'static str {
        "host-log"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }

        let mut child = Command::new(JOURNALCTL)
            .args([
                "-f",
                "--priority",
                priority_arg(self.min_level),
                "--output",
                "json",
                "--no-pager",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CollectorError::Start {
                name: "host-log",
                reason: format!("Failed to spawn journalctl: {}", err),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| CollectorError::Start {
            name: "host-log",
            reason: "journalctl stdout unavailable".to_string(),
        })?;
        self.child = Some(child);
        info!(min_level = self.min_level.as_str(), "Host log streaming started");

        let db = Arc::clone(&self.db);
        let signals = self.signals.clone();
        self.worker = Some(Worker::spawn(self.name(), move |_shutdown| {
            let clock = StreamClock::new();
            // Ends on EOF, which stop() forces by terminating journalctl.
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "Failed to read journalctl output");
                        break;
                    }
                };
                let Some(mut event) = parse_journal_line(&line, now_secs()) else {
                    continue;
                };
                event.timestamp = clock.stamp(event.timestamp);
                match db.insert_host_log(&event) {
                    Ok(()) => {
                        if event.level >= LogLevel::Error {
                            signal(&signals, ActivitySignal::HostLog);
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to record host log"),
                }
            }
            debug!("journalctl output closed");
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate_gracefully(&mut child, STOP_GRACE);
        }
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!("Host log streaming stopped");
        }
    }
}

/// Stand-in when no journal is available. Starts and stops successfully
/// and never produces events.
#[derive(Debug, Default)]
pub struct NullHostLogCollector {
    running: bool,
}

impl Collector for NullHostLogCollector {
    fn name(&self) -> &'static str {
        "host-log"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.running {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }
}
