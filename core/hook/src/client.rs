//! Sends one command record to the daemon.
//!
//! The protocol is one JSON object per connection, newline terminated, with
//! no response. A missing daemon is an ordinary outcome, not a crash.

use devpulse_protocol::{CommandPayload, ErrorInfo, MAX_PAYLOAD_BYTES, SOCKET_NAME};
use std::env;
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SOCKET_ENV: &str = "DEVPULSE_SOCKET";
const ENABLE_ENV: &str = "DEVPULSE_HOOK_ENABLED";
const WRITE_TIMEOUT_MS: u64 = 500;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Invalid command record: {0}")]
    Invalid(ErrorInfo),

    #[error("Command record is {0} bytes, over the daemon limit")]
    TooLarge(usize),

    #[error("Failed to serialize command record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write to daemon socket: {0}")]
    Write(#[source] io::Error),
}

pub fn hook_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => !matches!(value.as_str(), "0" | "false" | "FALSE" | "no" | "NO"),
        Err(_) => true,
    }
}

pub fn socket_path() -> Result<PathBuf, HookError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(HookError::HomeNotFound)?;
    Ok(home.join(".devpulse").join(SOCKET_NAME))
}

/// Validates `payload` with the daemon's own rules and encodes it as one
/// wire line.
pub fn encode(payload: &CommandPayload) -> Result<Vec<u8>, HookError> {
    payload.validate().map_err(HookError::Invalid)?;
    let mut line = serde_json::to_vec(payload)?;
    line.push(b'\n');
    if line.len() > MAX_PAYLOAD_BYTES {
        return Err(HookError::TooLarge(line.len()));
    }
    Ok(line)
}

pub fn send(payload: &CommandPayload, socket: &Path) -> Result<(), HookError> {
    let line = encode(payload)?;
    let mut stream = UnixStream::connect(socket).map_err(|source| HookError::Connect {
        path: socket.to_path_buf(),
        source,
    })?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    stream.write_all(&line).map_err(HookError::Write)?;
    stream.flush().map_err(HookError::Write)?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpulse_protocol::parse_payload;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn encode_is_a_single_parseable_line() {
        let mut payload = CommandPayload::new("cargo test", "/repo");
        payload.exit_code = Some(101);
        payload.duration = Some(1.5);

        let line = encode(&payload).expect("encode");
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|byte| **byte == b'\n').count(), 1);

        let parsed = parse_payload(&line[..line.len() - 1]).expect("parse");
        assert_eq!(parsed, payload);
    }

    #[test]
    fn encode_rejects_what_the_daemon_would_drop() {
        let err = encode(&CommandPayload::new("   ", "/repo")).unwrap_err();
        assert!(matches!(err, HookError::Invalid(info) if info.code == "missing_field"));

        let err = encode(&CommandPayload::new("ls", "")).unwrap_err();
        assert!(matches!(err, HookError::Invalid(_)));
    }

    #[test]
    fn send_delivers_one_line() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("devpulse.sock");
        let listener = UnixListener::bind(&socket).expect("bind");

        let reader = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut received = Vec::new();
            stream.read_to_end(&mut received).expect("read");
            received
        });

        let payload = CommandPayload::new("git status", "/repo");
        send(&payload, &socket).expect("send");

        let received = reader.join().expect("join");
        assert_eq!(received, encode(&payload).expect("encode"));
    }

    #[test]
    fn send_without_daemon_is_a_connect_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("missing.sock");
        let err = send(&CommandPayload::new("ls", "/"), &socket).unwrap_err();
        assert!(matches!(err, HookError::Connect { .. }));
    }
}
