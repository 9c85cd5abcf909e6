//! Unix socket endpoint for the shell hook.
//!
//! One JSON record per connection, no response. Each connection is handled
//! on its own short-lived thread; the accept loop only dispatches.

use crossbeam_channel::{Receiver, Sender};
use fs_err as fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use devpulse_protocol::{parse_payload, CommandPayload, ErrorInfo, MAX_PAYLOAD_BYTES};

use crate::collector::{
    shutdown_requested, signal, ActivitySignal, Collector, CollectorError, SignalSender, Worker,
};
use crate::db::Db;
use crate::events::{now_secs, ShellCommandEvent, StreamClock};
use crate::sanitizer::sanitize;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

struct ReceiverContext {
    db: Arc<Db>,
    clock: StreamClock,
    git_pwds: Sender<String>,
    signals: SignalSender,
}

pub struct CommandReceiver {
    socket_path: PathBuf,
    context: Arc<ReceiverContext>,
    worker: Option<Worker>,
}

impl CommandReceiver {
    pub fn new(
        socket_path: PathBuf,
        db: Arc<Db>,
        git_pwds: Sender<String>,
        signals: SignalSender,
    ) -> Self {
        Self {
            socket_path,
            context: Arc::new(ReceiverContext {
                db,
                clock: StreamClock::new(),
                git_pwds,
                signals,
            }),
            worker: None,
        }
    }
}

impl Collector for CommandReceiver {
    fn name(&self) -> &'static str {
        "command-receiver"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }

        let listener = bind_socket(&self.socket_path).map_err(|reason| CollectorError::Start {
            name: "command-receiver",
            reason,
        })?;
        info!(path = %self.socket_path.display(), "Command receiver listening");

        let context = Arc::clone(&self.context);
        self.worker = Some(Worker::spawn(self.name(), move |shutdown| {
            accept_loop(listener, context, shutdown)
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        worker.request_stop();
        // Wake the blocking accept so the loop can observe shutdown.
        let _ = UnixStream::connect(&self.socket_path);
        worker.stop();

        if let Err(err) = remove_existing_socket(&self.socket_path) {
            warn!(error = %err, "Failed to remove command socket");
        }
        info!("Command receiver stopped");
    }
}

fn bind_socket(socket_path: &Path) -> Result<UnixListener, String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent)
        .map_err(|err| format!("Failed to create socket directory: {}", err))?;
    remove_existing_socket(socket_path)?;

    let listener = UnixListener::bind(socket_path)
        .map_err(|err| format!("Failed to bind {}: {}", socket_path.display(), err))?;
    fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|err| format!("Failed to restrict socket permissions: {}", err))?;
    Ok(listener)
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn accept_loop(listener: UnixListener, context: Arc<ReceiverContext>, shutdown: Receiver<()>) {
    for stream in listener.incoming() {
        if shutdown_requested(&shutdown) {
            break;
        }
        match stream {
            Ok(stream) => {
                let context = Arc::clone(&context);
                thread::spawn(move || handle_connection(stream, &context));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept command connection");
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, context: &ReceiverContext) {
    let payload = match read_payload(&mut stream) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Dropped command payload");
            return;
        }
    };

    if let Err(err) = ingest_payload(context, payload, now_secs()) {
        warn!(error = %err, "Failed to record shell command");
    }
}

fn read_payload(stream: &mut UnixStream) -> Result<CommandPayload, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_PAYLOAD_BYTES {
                    return Err(ErrorInfo::new(
                        "payload_too_large",
                        "payload exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "payload timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read payload: {}", err),
                ));
            }
        }
    }

    let body = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    parse_payload(body)
}

fn ingest_payload(
    context: &ReceiverContext,
    payload: CommandPayload,
    received_at: i64,
) -> Result<ShellCommandEvent, String> {
    let event = ShellCommandEvent {
        sanitized_command: sanitize(&payload.command),
        raw_command: payload.command,
        working_dir: payload.pwd,
        timestamp: context.clock.stamp(payload.ts.unwrap_or(received_at)),
        duration: payload.duration.unwrap_or(0.0),
        exit_code: payload.exit_code.unwrap_or(0),
    };

    context.db.insert_shell_command(&event)?;
    debug!(
        command = %event.sanitized_command,
        exit_code = event.exit_code,
        "Recorded shell command"
    );

    if context.git_pwds.try_send(event.working_dir.clone()).is_err() {
        debug!("Git tracker queue full; skipping context check");
    }
    signal(&context.signals, ActivitySignal::Command);
    Ok(event)
}
