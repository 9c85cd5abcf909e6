//! Surrounding activity attached to analysis requests.

use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::warn;

use crate::db::Db;
use crate::events::{ActivityEvent, EventKind};

pub const LOOKBACK_SECS: i64 = 600;
const TIMELINE_PER_KIND: usize = 10;
const PATTERN_LIMIT: usize = 10;

/// Git contexts and host log lines of the last ten minutes (newest first),
/// the latest sample per process, and the patterns aggregated in that time.
/// A source that cannot be read is left empty.
pub fn recent_activity(db: &Db, now: i64) -> Value {
    let start = now - LOOKBACK_SECS;

    let mut timeline: Vec<ActivityEvent> = Vec::new();
    for kind in [EventKind::GitContext, EventKind::HostLog] {
        match db.query_window(kind, start, now, Some(TIMELINE_PER_KIND)) {
            Ok(events) => timeline.extend(events),
            Err(err) => warn!(error = %err, "Failed to read recent activity"),
        }
    }
    timeline.sort_by_key(|event| Reverse(event.timestamp()));

    let mut processes: BTreeMap<String, Value> = BTreeMap::new();
    match db.query_window(EventKind::ProcessSample, start, now, None) {
        Ok(samples) => {
            for event in samples {
                let ActivityEvent::ProcessSample(sample) = event else {
                    continue;
                };
                // Newest first: the first sample seen per name is the latest.
                processes
                    .entry(sample.process_name.clone())
                    .or_insert_with(|| {
                        json!({
                            "process_name": sample.process_name,
                            "cpu_percent": sample.cpu_percent,
                            "memory_mb": sample.memory_mb,
                        })
                    });
            }
        }
        Err(err) => warn!(error = %err, "Failed to read recent process samples"),
    }

    let patterns: Vec<Value> = match db.list_aggregated_events(PATTERN_LIMIT) {
        Ok(events) => events
            .into_iter()
            .filter(|event| event.window_end >= start)
            .map(|event| json!({ "kind": event.kind, "description": event.description }))
            .collect(),
        Err(err) => {
            warn!(error = %err, "Failed to read recent patterns");
            Vec::new()
        }
    };

    json!({
        "lookback_secs": LOOKBACK_SECS,
        "timeline": timeline,
        "processes": processes.into_values().collect::<Vec<_>>(),
        "patterns": patterns,
    })
}
