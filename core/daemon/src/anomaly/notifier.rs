//! Desktop notification sink.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::NotificationsConfig;
use crate::process::{find_in_path, run_with_timeout};

const NOTIFY_SEND: &str = "notify-send";
const APP_NAME: &str = "devpulse";
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::Critical => "critical",
        }
    }
}

pub trait Notifier: Send + Sync {
    /// Best effort. Returns whether the notification was handed off.
    fn send(&self, title: &str, message: &str, urgency: Urgency) -> bool;
}

pub fn create_notifier(config: &NotificationsConfig) -> Arc<dyn Notifier> {
    if !config.enabled {
        info!("Desktop notifications disabled by config");
        return Arc::new(NullNotifier);
    }
    if !has_display() {
        info!("No graphical session detected, notifications disabled");
        return Arc::new(NullNotifier);
    }
    match find_in_path(NOTIFY_SEND) {
        Some(program) => Arc::new(DesktopNotifier::new(program.to_string_lossy().into_owned())),
        None => {
            warn!("notify-send not found, notifications disabled");
            Arc::new(NullNotifier)
        }
    }
}

fn has_display() -> bool {
    ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|var| std::env::var_os(var).is_some_and(|value| !value.is_empty()))
}

pub struct DesktopNotifier {
    program: String,
}

impl DesktopNotifier {
    pub fn new(program: String) -> Self {
        Self { program }
    }

    fn command(&self, title: &str, message: &str, urgency: Urgency) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--app-name")
            .arg(APP_NAME)
            .arg("--urgency")
            .arg(urgency.as_str())
            .arg(title)
            .arg(message);
        command
    }
}

impl Notifier for DesktopNotifier {
    fn send(&self, title: &str, message: &str, urgency: Urgency) -> bool {
        match run_with_timeout(self.command(title, message, urgency), None, SEND_TIMEOUT) {
            Ok(output) if output.status.success() => {
                debug!(title, urgency = urgency.as_str(), "Notification sent");
                true
            }
            Ok(output) => {
                warn!(status = %output.status, stderr = %output.stderr.trim(), "notify-send failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "Failed to send notification");
                false
            }
        }
    }
}

pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, title: &str, _message: &str, _urgency: Urgency) -> bool {
        debug!(title, "Notification suppressed");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_yields_null_notifier() {
        let notifier = create_notifier(&NotificationsConfig { enabled: false });
        assert!(!notifier.send("title", "message", Urgency::Normal));
    }

    #[test]
    fn command_line_carries_app_name_and_urgency() {
        let notifier = DesktopNotifier::new("notify-send".to_string());
        let command = notifier.command("devpulse alert", "build broken", Urgency::Critical);
        let args: Vec<String> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--app-name",
                "devpulse",
                "--urgency",
                "critical",
                "devpulse alert",
                "build broken"
            ]
        );
    }

    #[test]
    fn failing_program_reports_false() {
        let notifier = DesktopNotifier::new("false".to_string());
        assert!(!notifier.send("t", "m", Urgency::Low));
    }

    #[test]
    fn missing_program_reports_false() {
        let notifier = DesktopNotifier::new("/nonexistent/notify-send".to_string());
        assert!(!notifier.send("t", "m", Urgency::Low));
    }
}
