//! Analysis collaborators that explain a fired anomaly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::detector::{AnomalyCandidate, AnomalyKind};
use crate::config::AnalysisConfig;
use crate::process::run_with_timeout;

const HEURISTIC_CONFIDENCE: f64 = 0.5;
const PROMPT_SAMPLE: usize = 3;
const STDERR_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub anomaly_kind: String,
    pub severity: String,
    pub detection_window_secs: i64,
    pub context: Value,
    pub prompt: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub recent_activity: Value,
}

impl AnalysisRequest {
    pub fn from_candidate(candidate: &AnomalyCandidate) -> Self {
        Self {
            anomaly_kind: candidate.kind.as_str().to_string(),
            severity: candidate.severity.as_str().to_string(),
            detection_window_secs: candidate.detection_window_secs,
            context: candidate.context.clone(),
            prompt: render_prompt(candidate),
            recent_activity: Value::Null,
        }
    }

    pub fn with_recent_activity(mut self, activity: Value) -> Self {
        self.recent_activity = activity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAnalysis {
    pub situation: String,
    pub issue: String,
    pub root_cause: String,
    pub analysis: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub confidence: f64,
}

impl AnomalyAnalysis {
    pub fn validate(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "Analysis confidence {} is outside [0, 1]",
                self.confidence
            ));
        }
        Ok(())
    }
}

pub trait AnomalyAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;
    fn analyze(&self, request: &AnalysisRequest) -> Result<AnomalyAnalysis, String>;
}

pub fn create_analyzer(config: &AnalysisConfig) -> Arc<dyn AnomalyAnalyzer> {
    match config.command.as_deref().map(str::trim) {
        Some(program) if !program.is_empty() => {
            info!(program, "Using external anomaly analyzer");
            Arc::new(ExternalCommandAnalyzer::new(
                program.to_string(),
                config.args.clone(),
                Duration::from_secs(config.timeout_secs),
            ))
        }
        _ => Arc::new(HeuristicAnalyzer),
    }
}

/// Runs a user-supplied program: request JSON on stdin, analysis JSON on
/// stdout.
pub struct ExternalCommandAnalyzer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCommandAnalyzer {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }
}

impl AnomalyAnalyzer for ExternalCommandAnalyzer {
    fn name(&self) -> &'static str {
        "external"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<AnomalyAnalysis, String> {
        let input = serde_json::to_vec(request)
            .map_err(|err| format!("Failed to serialize analysis request: {}", err))?;

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        let output = run_with_timeout(command, Some(input), self.timeout)?;

        if !output.status.success() {
            let stderr: String = output.stderr.trim().chars().take(STDERR_SNIPPET_CHARS).collect();
            return Err(format!(
                "Analyzer exited with {}: {}",
                output.status, stderr
            ));
        }

        let analysis: AnomalyAnalysis = serde_json::from_str(output.stdout.trim())
            .map_err(|err| format!("Analyzer returned invalid JSON: {}", err))?;
        analysis.validate()?;
        Ok(analysis)
    }
}

/// Offline fallback that restates the detection in plain language.
pub struct HeuristicAnalyzer;

impl AnomalyAnalyzer for HeuristicAnalyzer {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<AnomalyAnalysis, String> {
        let context = &request.context;
        let window = request.detection_window_secs;
        let (situation, issue, root_cause, suggestions) = match request.anomaly_kind.as_str() {
            "repeated_command" => {
                let command = context["command"].as_str().unwrap_or("unknown");
                let count = context["count"].as_u64().unwrap_or(0);
                let failures = context["failed_commands"]
                    .as_array()
                    .map(|failed| {
                        failed
                            .iter()
                            .filter(|entry| entry["command"].as_str() == Some(command))
                            .count()
                    })
                    .unwrap_or(0);
                (
                    format!("Re-running `{}`", command),
                    format!("`{}` ran {} times in {}s", command, count, window),
                    if failures > 0 {
                        format!("{} of those runs failed with the same command line", failures)
                    } else {
                        "The command is being repeated without changes in between".to_string()
                    },
                    vec![
                        format!("Read the full output of the last `{}` run", command),
                        "Change one thing between attempts".to_string(),
                    ],
                )
            }
            "file_thrashing" => {
                let file = context["file"].as_str().unwrap_or("unknown");
                let edits = context["edit_count"].as_u64().unwrap_or(0);
                (
                    format!("Editing {}", file),
                    format!("{} was saved {} times in {}s", file, edits, window),
                    "Repeated edits to one file often mean trial-and-error changes".to_string(),
                    vec![
                        format!("Review the diff of {} so far", file),
                        "Write a small test that pins down the expected behavior".to_string(),
                    ],
                )
            }
            "high_error_rate" => {
                let rate = context["error_rate"].as_f64().unwrap_or(0.0);
                let failed = context["failed_count"].as_u64().unwrap_or(0);
                (
                    "Running commands that keep failing".to_string(),
                    format!("{:.0}% of recent commands failed ({} failures)", rate * 100.0, failed),
                    "Something in the environment or build is broken".to_string(),
                    vec![
                        "Check the first failure, later ones may be knock-on effects".to_string(),
                        "Verify toolchain and dependencies are installed".to_string(),
                    ],
                )
            }
            "host_errors" => {
                let service = context["top_service"].as_str().unwrap_or("unknown");
                let count = context["top_service_count"].as_u64().unwrap_or(0);
                (
                    "Host services are logging errors".to_string(),
                    format!("{} logged {} errors in {}s", service, count, window),
                    format!("{} is failing or restarting", service),
                    vec![format!("Inspect `journalctl -u {}` for details", service)],
                )
            }
            other => (
                "Unusual activity".to_string(),
                format!("Anomaly {} detected", other),
                "Unknown".to_string(),
                Vec::new(),
            ),
        };

        Ok(AnomalyAnalysis {
            situation,
            issue,
            root_cause,
            analysis: request.prompt.clone(),
            suggestions,
            confidence: HEURISTIC_CONFIDENCE,
        })
    }
}

pub fn render_prompt(candidate: &AnomalyCandidate) -> String {
    let context = &candidate.context;
    let window = candidate.detection_window_secs;
    let mut prompt = String::new();

    match candidate.kind {
        AnomalyKind::RepeatedCommand => {
            let _ = writeln!(
                prompt,
                "ANOMALY DETECTED: The same command ran {} times in the last {} seconds.\n",
                context["count"], window
            );
            let _ = writeln!(
                prompt,
                "Repeated command: {}\n",
                context["command"].as_str().unwrap_or("unknown")
            );
            if let Some(failed) = context["failed_commands"].as_array() {
                if !failed.is_empty() {
                    let _ = writeln!(prompt, "Failed commands in the window ({}):", failed.len());
                    for entry in failed.iter().take(PROMPT_SAMPLE) {
                        let _ = writeln!(
                            prompt,
                            "  - {}: Exit code {} in {}",
                            entry["command"].as_str().unwrap_or("?"),
                            entry["exit_code"],
                            entry["working_dir"].as_str().unwrap_or("?")
                        );
                    }
                }
            }
            prompt.push_str(
                "\nInvestigate what the developer is trying to do and why this command keeps failing or being repeated.",
            );
        }
        AnomalyKind::FileThrashing => {
            let _ = writeln!(
                prompt,
                "ANOMALY DETECTED: The same file was edited {} times in the last {} seconds.\n",
                context["edit_count"], window
            );
            let _ = writeln!(
                prompt,
                "File: {}\n",
                context["file"].as_str().unwrap_or("unknown")
            );
            prompt.push_str(
                "Investigate what changes are being made and why this file keeps being edited.",
            );
        }
        AnomalyKind::HighErrorRate => {
            let rate = context["error_rate"].as_f64().unwrap_or(0.0);
            let _ = writeln!(
                prompt,
                "ANOMALY DETECTED: High command failure rate ({:.0}%).\n",
                rate * 100.0
            );
            let _ = writeln!(prompt, "Failed commands: {}\n", context["failed_count"]);
            prompt.push_str("Recent failures:\n");
            if let Some(failed) = context["failed_commands"].as_array() {
                for entry in failed.iter().take(PROMPT_SAMPLE) {
                    let _ = writeln!(
                        prompt,
                        "  - {} (exit code {})",
                        entry["command"].as_str().unwrap_or("?"),
                        entry["exit_code"]
                    );
                }
            }
            prompt.push_str("\nInvestigate what is causing these failures.");
        }
        AnomalyKind::HostErrors => {
            let _ = writeln!(
                prompt,
                "ANOMALY DETECTED: {} host errors in the last {} seconds.\n",
                context["total_errors"], window
            );
            let _ = writeln!(
                prompt,
                "Most affected service: {} ({} errors)\n",
                context["top_service"].as_str().unwrap_or("unknown"),
                context["top_service_count"]
            );
            prompt.push_str("Recent messages:\n");
            if let Some(messages) = context["recent_messages"].as_array() {
                for entry in messages.iter().take(PROMPT_SAMPLE) {
                    let _ = writeln!(
                        prompt,
                        "  - [{}] {}",
                        entry["service"].as_str().unwrap_or("?"),
                        entry["message"].as_str().unwrap_or("")
                    );
                }
            }
            prompt.push_str("\nInvestigate whether these errors affect the developer's work.");
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::detector::Severity;
    use serde_json::json;

    fn repeated_candidate() -> AnomalyCandidate {
        AnomalyCandidate {
            kind: AnomalyKind::RepeatedCommand,
            severity: Severity::High,
            context: json!({
                "command": "make test",
                "count": 5,
                "failed_commands": [
                    {"command": "make test", "exit_code": 2, "timestamp": 0, "working_dir": "/repo"}
                ],
                "time_window": 300,
            }),
            detection_window_secs: 300,
        }
    }

    // Run through `sh` rather than exec'ing a freshly written file, which
    // can fail with ETXTBSY while other test threads fork.
    fn script_analyzer(
        dir: &std::path::Path,
        name: &str,
        body: &str,
        timeout: Duration,
    ) -> ExternalCommandAnalyzer {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write script");
        ExternalCommandAnalyzer::new(
            "sh".to_string(),
            vec![path.to_string_lossy().into_owned()],
            timeout,
        )
    }

    #[test]
    fn prompt_mentions_command_and_failures() {
        let prompt = render_prompt(&repeated_candidate());
        assert!(prompt.contains("ran 5 times in the last 300 seconds"));
        assert!(prompt.contains("Repeated command: make test"));
        assert!(prompt.contains("Exit code 2 in /repo"));
    }

    #[test]
    fn heuristic_analysis_is_deterministic_and_valid() {
        let request = AnalysisRequest::from_candidate(&repeated_candidate());
        let first = HeuristicAnalyzer.analyze(&request).expect("analysis");
        let second = HeuristicAnalyzer.analyze(&request).expect("analysis");
        assert_eq!(first, second);
        assert!(first.validate().is_ok());
        assert!(first.issue.contains("make test"));
        assert!(!first.suggestions.is_empty());
    }

    #[test]
    fn external_analyzer_reads_stdout_json() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let analyzer = script_analyzer(
            temp_dir.path(),
            "ok.sh",
            r#"cat > /dev/null
echo '{"situation":"s","issue":"build broken","root_cause":"r","analysis":"a","suggestions":["fix it"],"confidence":0.9}'"#,
            Duration::from_secs(5),
        );

        let analysis = analyzer
            .analyze(&AnalysisRequest::from_candidate(&repeated_candidate()))
            .expect("analysis");
        assert_eq!(analysis.issue, "build broken");
        assert_eq!(analysis.suggestions, vec!["fix it"]);
    }

    #[test]
    fn external_analyzer_receives_request_on_stdin() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let capture = temp_dir.path().join("request.json");
        let analyzer = script_analyzer(
            temp_dir.path(),
            "capture.sh",
            &format!(
                "cat > {}\necho '{{\"situation\":\"s\",\"issue\":\"i\",\"root_cause\":\"r\",\"analysis\":\"a\",\"confidence\":0.2}}'",
                capture.display()
            ),
            Duration::from_secs(5),
        );
        analyzer
            .analyze(&AnalysisRequest::from_candidate(&repeated_candidate()))
            .expect("analysis");

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(capture).expect("read")).expect("json");
        assert_eq!(written["anomaly_kind"], "repeated_command");
        assert_eq!(written["severity"], "high");
        assert!(written["prompt"].as_str().unwrap_or("").contains("make test"));
        assert!(written.get("recent_activity").is_none());
    }

    #[test]
    fn external_analyzer_failures_are_errors() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let request = AnalysisRequest::from_candidate(&repeated_candidate());

        let err = script_analyzer(
            temp_dir.path(),
            "fail.sh",
            "echo boom >&2\nexit 3",
            Duration::from_secs(5),
        )
        .analyze(&request)
        .unwrap_err();
        assert!(err.contains("boom"));

        let err = script_analyzer(
            temp_dir.path(),
            "range.sh",
            r#"echo '{"situation":"s","issue":"i","root_cause":"r","analysis":"a","confidence":1.5}'"#,
            Duration::from_secs(5),
        )
        .analyze(&request)
        .unwrap_err();
        assert!(err.contains("outside"));

        let err = script_analyzer(
            temp_dir.path(),
            "slow.sh",
            "sleep 5",
            Duration::from_millis(200),
        )
        .analyze(&request)
        .unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[test]
    fn blank_command_falls_back_to_heuristic() {
        let config = AnalysisConfig {
            command: Some("  ".to_string()),
            args: Vec::new(),
            timeout_secs: 120,
        };
        assert_eq!(create_analyzer(&config).name(), "heuristic");
    }
}
