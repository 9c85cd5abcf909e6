//! Lifecycle plumbing shared by every background component.
//!
//! A component owns one or more [`Worker`] threads. Each worker gets a
//! shutdown receiver; stopping the worker drops the sender, which wakes any
//! `recv_timeout` sleep immediately.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// "Something new arrived" hint from an ingestor to the anomaly loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySignal {
    Command,
    FileChange,
    HostLog,
}

pub type SignalSender = Sender<ActivitySignal>;

/// Capacity of the activity signal channel. Signals are hints, so a full
/// channel just drops them.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 256;

pub fn signal(sender: &SignalSender, value: ActivitySignal) {
    if sender.try_send(value).is_err() {
        debug!(signal = ?value, "Activity signal dropped");
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Failed to start {name}: {reason}")]
    Start { name: &'static str, reason: String },
}

pub trait Collector: Send {
    fn name(&self) -> &'static str;
    fn start(&mut self) -> Result<(), CollectorError>;
    /// Idempotent. Blocks until the component's threads have exited.
    fn stop(&mut self);
}

pub struct Worker {
    name: &'static str,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self, CollectorError>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("devpulse-{}", name))
            .spawn(move || body(shutdown_rx))
            .map_err(|err| CollectorError::Start {
                name,
                reason: format!("Failed to spawn thread: {}", err),
            })?;
        Ok(Self {
            name,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Signals shutdown without waiting. Used when the thread is parked in
    /// a blocking call that the caller still has to unblock.
    pub fn request_stop(&mut self) {
        self.shutdown.take();
    }

    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(crossbeam_channel::TryRecvError::Empty))
}

/// Sleeps up to `timeout`. Returns `true` if shutdown was requested.
pub fn wait_for_shutdown(shutdown: &Receiver<()>, timeout: Duration) -> bool {
    match shutdown.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

/// Runs `tick` every `interval` (first run after `initial_delay`) until
/// shutdown.
pub fn run_periodic(
    shutdown: &Receiver<()>,
    initial_delay: Duration,
    interval: Duration,
    mut tick: impl FnMut(),
) {
    if wait_for_shutdown(shutdown, initial_delay) {
        return;
    }
    loop {
        tick();
        if wait_for_shutdown(shutdown, interval) {
            return;
        }
    }
}
