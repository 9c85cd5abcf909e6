//! Periodic samples of developer-relevant and resource-heavy processes.

use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, warn};

use crate::collector::{run_periodic, Collector, CollectorError, Worker};
use crate::db::Db;
use crate::events::{now_secs, ProcessSampleEvent, StreamClock};
use crate::process::{snapshot_processes, ProcessSnapshot};

const FIRST_SAMPLE_DELAY: Duration = Duration::from_secs(1);
const CPU_THRESHOLD_PERCENT: f32 = 25.0;
const MEMORY_THRESHOLD_MB: f64 = 1024.0;

const WATCHED_PROCESSES: &[&str] = &[
    "code", "pycharm", "idea", "intellij", "eclipse", "docker", "dockerd", "containerd", "node",
    "npm", "yarn", "pnpm", "python", "python3", "java", "javac", "gcc", "g++", "clang", "make",
    "cmake", "cargo", "rustc", "go", "gopls", "postgres", "mysql", "redis", "mongodb", "chrome",
    "firefox", "chromium",
];

pub fn qualifies(process: &ProcessSnapshot) -> bool {
    let name = process.name.to_lowercase();
    WATCHED_PROCESSES.iter().any(|watched| name.contains(watched))
        || process.cpu_percent > CPU_THRESHOLD_PERCENT
        || process.memory_mb > MEMORY_THRESHOLD_MB
}

pub struct ProcessSampler {
    interval: Duration,
    db: Arc<Db>,
    worker: Option<Worker>,
}

impl ProcessSampler {
    pub fn new(interval: Duration, db: Arc<Db>) -> Self {
        Self {
            interval,
            db,
            worker: None,
        }
    }
}

impl Collector for ProcessSampler {
    fn name(&self) -> &'static str {
        "process-sampler"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }

        let db = Arc::clone(&self.db);
        let interval = self.interval;
        self.worker = Some(Worker::spawn(self.name(), move |shutdown| {
            let mut sys = System::new();
            let clock = StreamClock::new();
            // Prime CPU accounting so the first sample has a baseline.
            let _ = snapshot_processes(&mut sys);
            run_periodic(&shutdown, FIRST_SAMPLE_DELAY, interval, || {
                sample_once(&db, &mut sys, &clock);
            });
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

fn sample_once(db: &Db, sys: &mut System, clock: &StreamClock) {
    let timestamp = clock.stamp(now_secs());
    let mut recorded = 0usize;
    for process in snapshot_processes(sys).into_iter().filter(qualifies) {
        let event = ProcessSampleEvent {
            process_name: process.name,
            pid: process.pid,
            cpu_percent: process.cpu_percent,
            memory_mb: process.memory_mb,
            timestamp,
        };
        match db.insert_process_sample(&event) {
            Ok(()) => recorded += 1,
            Err(err) => warn!(error = %err, "Failed to record process sample"),
        }
    }
    debug!(recorded, "Process sample complete");
}
