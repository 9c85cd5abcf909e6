//! Recursive file change watching over the project roots.
//!
//! The notify callback only translates events and pushes them into a
//! bounded queue; filtering, debouncing and persistence happen on the
//! watcher's own thread.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::collector::{signal, ActivitySignal, Collector, CollectorError, SignalSender, Worker};
use crate::db::Db;
use crate::events::{now_secs, FileChangeEvent, FileChangeKind, StreamClock};

const RAW_QUEUE_CAPACITY: usize = 1024;
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);
const DEBOUNCE_CAPACITY: usize = 4096;

const IGNORED_SEGMENTS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".git",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    "dist",
    "build",
    "target",
    "out",
    "bin",
    ".next",
    ".nuxt",
    ".cache",
    "vendor",
    "coverage",
    ".coverage",
    ".eggs",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RawFileEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// Maps a backend event to at most one change. Directory events, metadata
/// touches and rename sources yield nothing.
pub fn translate_event(event: &Event) -> Option<RawFileEvent> {
    let (kind, path) = match event.kind {
        EventKind::Create(CreateKind::Folder) => return None,
        EventKind::Create(_) => (FileChangeKind::Created, event.paths.first()?),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            (FileChangeKind::Moved, event.paths.get(1)?)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            (FileChangeKind::Moved, event.paths.first()?)
        }
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Modify(ModifyKind::Metadata(_)) => {
            return None
        }
        EventKind::Modify(_) => (FileChangeKind::Modified, event.paths.first()?),
        EventKind::Remove(RemoveKind::Folder) => return None,
        EventKind::Remove(_) => (FileChangeKind::Deleted, event.paths.first()?),
        _ => return None,
    };
    Some(RawFileEvent {
        path: path.clone(),
        kind,
    })
}

#[derive(Debug, Clone)]
pub struct PathFilter {
    extensions: Vec<String>,
}

impl PathFilter {
    /// `extensions` are expected lowercase with a leading dot.
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        for component in path.components() {
            if let Component::Normal(segment) = component {
                let segment = segment.to_string_lossy();
                if IGNORED_SEGMENTS.contains(&segment.as_ref()) || segment.starts_with('.') {
                    return false;
                }
            }
        }

        let Some(extension) = path.extension() else {
            return false;
        };
        let extension = format!(".{}", extension.to_string_lossy().to_ascii_lowercase());
        self.extensions.iter().any(|allowed| *allowed == extension)
    }
}

/// Per-path "last recorded" instants, bounded in size.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    capacity: usize,
    last_seen: HashMap<PathBuf, Instant>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW, DEBOUNCE_CAPACITY)
    }
}

impl Debouncer {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            last_seen: HashMap::new(),
        }
    }

    /// Returns `true` (and remembers `now`) when `path` was not recorded
    /// within the window.
    pub fn should_record(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(last) = self.last_seen.get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }

        if !self.last_seen.contains_key(path) && self.last_seen.len() >= self.capacity {
            self.evict(now);
        }
        self.last_seen.insert(path.to_path_buf(), now);
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    fn evict(&mut self, now: Instant) {
        let window = self.window;
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        if self.last_seen.len() < self.capacity {
            return;
        }
        let oldest = self
            .last_seen
            .iter()
            .min_by_key(|(_, seen)| **seen)
            .map(|(path, _)| path.clone());
        if let Some(oldest) = oldest {
            self.last_seen.remove(&oldest);
        }
    }
}

pub struct FileWatcher {
    roots: Vec<PathBuf>,
    filter: PathFilter,
    db: Arc<Db>,
    signals: SignalSender,
    worker: Option<Worker>,
}

impl FileWatcher {
    pub fn new(
        roots: Vec<PathBuf>,
        extensions: Vec<String>,
        db: Arc<Db>,
        signals: SignalSender,
    ) -> Self {
        Self {
            roots,
            filter: PathFilter::new(extensions),
            db,
            signals,
            worker: None,
        }
    }
}

impl Collector for FileWatcher {
    fn name(&self) -> &'static str {
        "file-watcher"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }

        let (raw_tx, raw_rx) = bounded::<RawFileEvent>(RAW_QUEUE_CAPACITY);
        let mut watcher = create_watcher(raw_tx).map_err(|reason| CollectorError::Start {
            name: "file-watcher",
            reason,
        })?;

        let mut watched = 0usize;
        for root in &self.roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    watched += 1;
                    info!(root = %root.display(), "Watching for file changes");
                }
                Err(err) => warn!(error = %err, root = %root.display(), "Failed to watch root"),
            }
        }
        if watched == 0 {
            info!("No watchable roots; file watcher idle");
        }

        let filter = self.filter.clone();
        let db = Arc::clone(&self.db);
        let signals = self.signals.clone();
        self.worker = Some(Worker::spawn(self.name(), move |shutdown| {
            // Keep the backend alive for as long as this thread runs.
            let _watcher = watcher;
            consume(&raw_rx, &shutdown, &filter, &db, &signals);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!("File watcher stopped");
        }
    }
}

fn create_watcher(raw_tx: Sender<RawFileEvent>) -> Result<RecommendedWatcher, String> {
    RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if let Some(raw) = translate_event(&event) {
                    let _ = raw_tx.try_send(raw);
                }
            }
            Err(err) => debug!(error = %err, "File watch backend error"),
        },
        notify::Config::default(),
    )
    .map_err(|err| format!("Failed to create filesystem watcher: {}", err))
}

fn consume(
    raw_rx: &Receiver<RawFileEvent>,
    shutdown: &Receiver<()>,
    filter: &PathFilter,
    db: &Db,
    signals: &SignalSender,
) {
    let mut debouncer = Debouncer::default();
    let clock = StreamClock::new();
    loop {
        select! {
            recv(shutdown) -> _ => return,
            recv(raw_rx) -> message => {
                let Ok(raw) = message else { return };
                if let Some(event) = accept_event(raw, filter, &mut debouncer, &clock, Instant::now()) {
                    match db.insert_file_change(&event) {
                        Ok(()) => {
                            debug!(path = %event.path, kind = event.kind.as_str(), "Recorded file change");
                            signal(signals, ActivitySignal::FileChange);
                        }
                        Err(err) => warn!(error = %err, "Failed to record file change"),
                    }
                }
            },
        }
    }
}

fn accept_event(
    raw: RawFileEvent,
    filter: &PathFilter,
    debouncer: &mut Debouncer,
    clock: &StreamClock,
    now: Instant,
) -> Option<FileChangeEvent> {
    if !filter.accepts(&raw.path) {
        return None;
    }
    if raw.kind != FileChangeKind::Deleted && raw.path.is_dir() {
        return None;
    }
    if !debouncer.should_record(&raw.path, now) {
        return None;
    }
    Some(FileChangeEvent {
        path: raw.path.to_string_lossy().into_owned(),
        kind: raw.kind,
        timestamp: clock.stamp(now_secs()),
    })
}
