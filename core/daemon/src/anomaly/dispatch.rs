//! Escalation of fired anomalies: analysis, persistence, notification.
//!
//! Runs off the monitor thread. Nothing here reports back to the monitor,
//! so a slow or failing analyzer never delays detection or cooldown.

use std::fmt::Write as _;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

use super::activity::recent_activity;
use super::analysis::{AnalysisRequest, AnomalyAnalysis, AnomalyAnalyzer};
use super::detector::AnomalyCandidate;
use super::notifier::{Notifier, Urgency};
use crate::db::{AnomalyRecord, Db};

pub const NOTIFICATION_TITLE: &str = "devpulse alert";
const CRITICAL_CONFIDENCE: f64 = 0.8;

/// Everything a dispatch thread needs, cloned cheaply per candidate.
#[derive(Clone)]
pub struct Escalation {
    pub db: Arc<Db>,
    pub analyzer: Arc<dyn AnomalyAnalyzer>,
    pub notifier: Arc<dyn Notifier>,
}

impl Escalation {
    /// Hands `candidate` to a detached thread and returns immediately.
    pub fn dispatch(&self, candidate: AnomalyCandidate, fired_at: i64) {
        let escalation = self.clone();
        let kind = candidate.kind.as_str();
        let spawned = thread::Builder::new()
            .name(format!("devpulse-analysis-{}", kind))
            .spawn(move || {
                escalation.process(&candidate, fired_at);
            });
        if let Err(err) = spawned {
            warn!(error = %err, kind, "Failed to spawn analysis thread");
        }
    }

    /// Synchronous body of a dispatch. Returns the stored record.
    pub fn process(&self, candidate: &AnomalyCandidate, fired_at: i64) -> AnomalyRecord {
        let request = AnalysisRequest::from_candidate(candidate)
            .with_recent_activity(recent_activity(&self.db, fired_at));
        let outcome = self.analyzer.analyze(&request);

        let mut record = AnomalyRecord {
            id: None,
            timestamp: fired_at,
            anomaly_kind: request.anomaly_kind.clone(),
            severity: request.severity.clone(),
            trigger_context: candidate.context.clone(),
            analysis: None,
            confidence: None,
            error: None,
        };

        match &outcome {
            Ok(analysis) => {
                info!(
                    kind = %record.anomaly_kind,
                    analyzer = self.analyzer.name(),
                    issue = %analysis.issue,
                    suggestions = analysis.suggestions.len(),
                    "Anomaly analysis completed"
                );
                record.analysis = serde_json::to_value(analysis).ok();
                record.confidence = Some(analysis.confidence);
            }
            Err(err) => {
                warn!(
                    kind = %record.anomaly_kind,
                    analyzer = self.analyzer.name(),
                    error = %err,
                    "Anomaly analysis failed"
                );
                record.error = Some(err.clone());
            }
        }

        match self.db.insert_anomaly_record(&record) {
            Ok(id) => record.id = Some(id),
            Err(err) => warn!(error = %err, kind = %record.anomaly_kind, "Failed to store anomaly record"),
        }

        if let Ok(analysis) = &outcome {
            let (message, urgency) = notification_for(analysis);
            self.notifier.send(NOTIFICATION_TITLE, &message, urgency);
        }

        record
    }
}

/// Message body and urgency for a successful analysis.
pub fn notification_for(analysis: &AnomalyAnalysis) -> (String, Urgency) {
    let mut message = analysis.issue.clone();
    if analysis.confidence > 0.0 {
        let _ = write!(message, "\nConfidence: {:.0}%", analysis.confidence * 100.0);
    }
    if let Some(first) = analysis.suggestions.first() {
        let _ = write!(message, "\n\nTry: {}", first);
    }

    let urgency = if analysis.confidence >= CRITICAL_CONFIDENCE {
        Urgency::Critical
    } else {
        Urgency::Normal
    };
    (message, urgency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::detector::{AnomalyKind, Severity};
    use crate::db::tests::temp_db;
    use crate::events::{BranchClass, GitContextEvent};
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedAnalyzer(Result<AnomalyAnalysis, String>);

    impl AnomalyAnalyzer for FixedAnalyzer {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn analyze(&self, _request: &AnalysisRequest) -> Result<AnomalyAnalysis, String> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String, Urgency)>>,
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, title: &str, message: &str, urgency: Urgency) -> bool {
            self.sent
                .lock()
                .expect("lock")
                .push((title.to_string(), message.to_string(), urgency));
            true
        }
    }

    fn analysis(confidence: f64) -> AnomalyAnalysis {
        AnomalyAnalysis {
            situation: "running tests".to_string(),
            issue: "make test keeps failing".to_string(),
            root_cause: "missing fixture".to_string(),
            analysis: "the same target fails each time".to_string(),
            suggestions: vec!["Regenerate fixtures".to_string(), "Run one test".to_string()],
            confidence,
        }
    }

    fn candidate() -> AnomalyCandidate {
        AnomalyCandidate {
            kind: AnomalyKind::RepeatedCommand,
            severity: Severity::High,
            context: json!({ "command": "make test", "count": 5 }),
            detection_window_secs: 300,
        }
    }

    fn make_escalation(
        db: Db,
        result: Result<AnomalyAnalysis, String>,
    ) -> (Escalation, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let escalation = Escalation {
            db: Arc::new(db),
            analyzer: Arc::new(FixedAnalyzer(result)),
            notifier: notifier.clone(),
        };
        (escalation, notifier)
    }

    #[test]
    fn successful_analysis_is_stored_and_notified() {
        let (_temp_dir, db) = temp_db();
        let (escalation, notifier) = make_escalation(db, Ok(analysis(0.85)));

        let record = escalation.process(&candidate(), 1_000);
        assert!(record.id.is_some());
        assert_eq!(record.confidence, Some(0.85));
        assert!(record.error.is_none());

        let stored = escalation.db.list_anomaly_records(10).expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].anomaly_kind, "repeated_command");
        assert_eq!(stored[0].severity, "high");
        assert_eq!(stored[0].timestamp, 1_000);
        assert_eq!(stored[0].trigger_context["command"], "make test");
        assert_eq!(
            stored[0].analysis.as_ref().expect("analysis")["issue"],
            "make test keeps failing"
        );

        let sent = notifier.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NOTIFICATION_TITLE);
        assert_eq!(sent[0].2, Urgency::Critical);
        assert!(sent[0].1.starts_with("make test keeps failing"));
        assert!(sent[0].1.contains("Confidence: 85%"));
        assert!(sent[0].1.contains("Regenerate fixtures"));
        assert!(!sent[0].1.contains("Run one test"));
    }

    #[test]
    fn failed_analysis_stores_error_without_notifying() {
        let (_temp_dir, db) = temp_db();
        let (escalation, notifier) = make_escalation(db, Err("Analyzer timed out".to_string()));

        let record = escalation.process(&candidate(), 2_000);
        assert_eq!(record.error.as_deref(), Some("Analyzer timed out"));
        assert!(record.analysis.is_none());
        assert!(record.confidence.is_none());

        let stored = escalation.db.list_anomaly_records(10).expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].error.as_deref(), Some("Analyzer timed out"));
        assert!(notifier.sent.lock().expect("lock").is_empty());
    }

    struct CapturingAnalyzer {
        requests: Mutex<Vec<AnalysisRequest>>,
    }

    impl AnomalyAnalyzer for CapturingAnalyzer {
        fn name(&self) -> &'static str {
            "capturing"
        }

        fn analyze(&self, request: &AnalysisRequest) -> Result<AnomalyAnalysis, String> {
            self.requests.lock().expect("lock").push(request.clone());
            Ok(analysis(0.5))
        }
    }

    #[test]
    fn request_carries_recent_activity() {
        let (_temp_dir, db) = temp_db();
        db.insert_git_context(&GitContextEvent {
            repo_root: "/work/app".to_string(),
            branch: "feat/search".to_string(),
            branch_class: BranchClass::Feature,
            timestamp: 4_900,
        })
        .expect("insert");

        let analyzer = Arc::new(CapturingAnalyzer {
            requests: Mutex::new(Vec::new()),
        });
        let escalation = Escalation {
            db: Arc::new(db),
            analyzer: analyzer.clone(),
            notifier: Arc::new(RecordingNotifier::default()),
        };
        escalation.process(&candidate(), 5_000);

        let requests = analyzer.requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        let timeline = &requests[0].recent_activity["timeline"];
        assert_eq!(timeline[0]["type"], "git_context");
        assert_eq!(timeline[0]["branch"], "feat/search");

        let wire = serde_json::to_value(&requests[0]).expect("serialize");
        assert_eq!(wire["context"]["command"], "make test");
        assert!(wire["recent_activity"].is_object());
    }

    #[test]
    fn urgency_tracks_confidence() {
        assert_eq!(notification_for(&analysis(0.8)).1, Urgency::Critical);
        assert_eq!(notification_for(&analysis(0.79)).1, Urgency::Normal);

        let (message, _) = notification_for(&AnomalyAnalysis {
            suggestions: Vec::new(),
            ..analysis(0.0)
        });
        assert_eq!(message, "make test keeps failing");
    }

    #[test]
    fn dispatch_does_not_block_the_caller() {
        let (_temp_dir, db) = temp_db();
        let (escalation, notifier) = make_escalation(db, Ok(analysis(0.5)));

        escalation.dispatch(candidate(), 3_000);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while notifier.sent.lock().expect("lock").is_empty() {
            assert!(std::time::Instant::now() < deadline, "dispatch never finished");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(escalation.db.list_anomaly_records(10).expect("list").len(), 1);
    }
}
