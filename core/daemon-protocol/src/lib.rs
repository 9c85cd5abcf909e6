//! IPC payload types and validation for devpulse-daemon.
//!
//! Shared by the daemon and the shell hook so both sides agree on the
//! command record schema. The daemon remains the authority on validation;
//! the hook reuses the same types to build records that will be accepted.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

pub const SOCKET_NAME: &str = "devpulse.sock";
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const MAX_COMMAND_CHARS: usize = 16 * 1024;

/// One shell command as reported by the shell hook.
///
/// The wire format is a flat JSON object. Only `command` and `pwd` are
/// required; the daemon fills the rest in on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandPayload {
    pub command: String,
    pub pwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl CommandPayload {
    pub fn new(command: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            pwd: pwd.into(),
            ts: None,
            duration: None,
            exit_code: None,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.command.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "command is required"));
        }
        if self.command.chars().count() > MAX_COMMAND_CHARS {
            return Err(ErrorInfo::new(
                "command_too_long",
                format!("command must be {} characters or fewer", MAX_COMMAND_CHARS),
            ));
        }
        if self.pwd.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "pwd is required"));
        }

        if let Some(ts) = self.ts {
            if ts < 0 || DateTime::from_timestamp(ts, 0).is_none() {
                return Err(ErrorInfo::new(
                    "invalid_timestamp",
                    "ts must be non-negative epoch seconds",
                ));
            }
        }

        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(ErrorInfo::new(
                    "invalid_duration",
                    "duration must be a non-negative number of seconds",
                ));
            }
        }

        Ok(())
    }
}

/// Parses and validates a raw payload body (without its trailing newline).
pub fn parse_payload(bytes: &[u8]) -> Result<CommandPayload, ErrorInfo> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_payload", "payload body was empty"));
    }
    let payload: CommandPayload = serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("payload was not a valid command record: {}", err),
        )
    })?;
    payload.validate()?;
    Ok(payload)
}
