//! The anomaly loop: runs checks on a timer and on activity signals, gates
//! each candidate through a per-kind cooldown and hands fired ones off for
//! escalation.

use crossbeam_channel::{select, tick, Receiver};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::detector::{AnomalyCandidate, AnomalyDetector, AnomalyKind};
use super::dispatch::Escalation;
use crate::collector::{ActivitySignal, Collector, CollectorError, Worker};
use crate::db::Db;
use crate::events::now_secs;

pub const COOLDOWN_SECS: i64 = 30 * 60;

/// Last fire time per anomaly kind.
#[derive(Debug, Default)]
pub struct CooldownState {
    last_fired: HashMap<AnomalyKind, i64>,
}

impl CooldownState {
    /// Records a fire and returns `true` unless `kind` fired less than
    /// [`COOLDOWN_SECS`] before `now`.
    pub fn try_fire(&mut self, kind: AnomalyKind, now: i64) -> bool {
        if let Some(last) = self.last_fired.get(&kind) {
            if now - last < COOLDOWN_SECS {
                return false;
            }
        }
        self.last_fired.insert(kind, now);
        true
    }
}

/// Which checks a signal should trigger.
pub fn checks_for(signal: ActivitySignal) -> &'static [AnomalyKind] {
    match signal {
        ActivitySignal::Command => &[AnomalyKind::RepeatedCommand, AnomalyKind::HighErrorRate],
        ActivitySignal::FileChange => &[AnomalyKind::FileThrashing],
        ActivitySignal::HostLog => &[AnomalyKind::HostErrors],
    }
}

/// Detection plus cooldown, free of threads and clocks.
pub struct MonitorCore {
    detector: AnomalyDetector,
    cooldown: CooldownState,
}

impl MonitorCore {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            detector: AnomalyDetector::new(db),
            cooldown: CooldownState::default(),
        }
    }

    /// Runs `kinds` at `now` and returns the candidates that passed cooldown.
    pub fn evaluate(&mut self, kinds: &[AnomalyKind], now: i64) -> Vec<AnomalyCandidate> {
        let mut fired = Vec::new();
        for kind in kinds {
            let Some(candidate) = self.detector.check(*kind, now) else {
                continue;
            };
            if self.cooldown.try_fire(*kind, now) {
                info!(
                    kind = kind.as_str(),
                    severity = candidate.severity.as_str(),
                    "Anomaly detected"
                );
                fired.push(candidate);
            } else {
                debug!(kind = kind.as_str(), "Anomaly suppressed by cooldown");
            }
        }
        fired
    }
}

pub struct AnomalyMonitor {
    interval: Duration,
    signals: Option<Receiver<ActivitySignal>>,
    escalation: Escalation,
    worker: Option<Worker>,
}

impl AnomalyMonitor {
    pub fn new(interval: Duration, signals: Receiver<ActivitySignal>, escalation: Escalation) -> Self {
        Self {
            interval,
            signals: Some(signals),
            escalation,
            worker: None,
        }
    }
}

impl Collector for AnomalyMonitor {
    fn name(&self) -> &'static str {
        "anomaly-monitor"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }
        let signals = self.signals.take().ok_or_else(|| CollectorError::Start {
            name: "anomaly-monitor",
            reason: "signal receiver already consumed".to_string(),
        })?;
        let escalation = self.escalation.clone();
        let interval = self.interval;

        self.worker = Some(Worker::spawn(self.name(), move |shutdown| {
            let mut core = MonitorCore::new(Arc::clone(&escalation.db));
            let ticker = tick(interval);
            info!(interval_secs = interval.as_secs(), "Anomaly monitor started");

            loop {
                let kinds: Option<&[AnomalyKind]> = select! {
                    recv(shutdown) -> _ => None,
                    recv(signals) -> signal => match signal {
                        Ok(signal) => Some(checks_for(signal)),
                        // Every sender is gone; keep running on the timer alone.
                        Err(_) => {
                            run_timer_only(&shutdown, &ticker, &mut core, &escalation);
                            None
                        }
                    },
                    recv(ticker) -> _ => Some(&AnomalyKind::ALL[..]),
                };
                let Some(kinds) = kinds else {
                    break;
                };
                let now = now_secs();
                for candidate in core.evaluate(kinds, now) {
                    escalation.dispatch(candidate, now);
                }
            }
            debug!("Anomaly monitor stopped");
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

fn run_timer_only(
    shutdown: &Receiver<()>,
    ticker: &Receiver<std::time::Instant>,
    core: &mut MonitorCore,
    escalation: &Escalation,
) {
    loop {
        let stopping = select! {
            recv(shutdown) -> _ => true,
            recv(ticker) -> _ => false,
        };
        if stopping {
            return;
        }
        let now = now_secs();
        for candidate in core.evaluate(&AnomalyKind::ALL, now) {
            escalation.dispatch(candidate, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::analysis::HeuristicAnalyzer;
    use crate::anomaly::notifier::NullNotifier;
    use crate::db::tests::{command, temp_db};
    use crossbeam_channel::bounded;

    #[test]
    fn cooldown_suppresses_within_window() {
        let mut cooldown = CooldownState::default();
        assert!(cooldown.try_fire(AnomalyKind::RepeatedCommand, 1_000));
        assert!(!cooldown.try_fire(AnomalyKind::RepeatedCommand, 1_000 + COOLDOWN_SECS - 1));
        assert!(cooldown.try_fire(AnomalyKind::RepeatedCommand, 1_000 + COOLDOWN_SECS));
    }

    #[test]
    fn suppressed_attempts_do_not_reset_the_timer() {
        let mut cooldown = CooldownState::default();
        assert!(cooldown.try_fire(AnomalyKind::FileThrashing, 0));
        assert!(!cooldown.try_fire(AnomalyKind::FileThrashing, 1_000));
        assert!(cooldown.try_fire(AnomalyKind::FileThrashing, COOLDOWN_SECS));
    }

    #[test]
    fn cooldown_is_independent_per_kind() {
        let mut cooldown = CooldownState::default();
        assert!(cooldown.try_fire(AnomalyKind::RepeatedCommand, 100));
        assert!(cooldown.try_fire(AnomalyKind::HighErrorRate, 101));
        assert!(cooldown.try_fire(AnomalyKind::HostErrors, 102));
        assert!(!cooldown.try_fire(AnomalyKind::RepeatedCommand, 103));
    }

    #[test]
    fn signals_map_to_their_checks() {
        assert_eq!(
            checks_for(ActivitySignal::Command),
            &[AnomalyKind::RepeatedCommand, AnomalyKind::HighErrorRate]
        );
        assert_eq!(checks_for(ActivitySignal::FileChange), &[AnomalyKind::FileThrashing]);
        assert_eq!(checks_for(ActivitySignal::HostLog), &[AnomalyKind::HostErrors]);
    }

    #[test]
    fn core_fires_once_per_cooldown() {
        let (_temp_dir, db) = temp_db();
        let now = 10_000;
        for offset in 0..5 {
            db.insert_shell_command(&command("make test", now - 10 + offset, 2))
                .expect("insert");
        }
        let db = Arc::new(db);
        let mut core = MonitorCore::new(Arc::clone(&db));

        let fired = core.evaluate(checks_for(ActivitySignal::Command), now);
        let kinds: Vec<AnomalyKind> = fired.iter().map(|candidate| candidate.kind).collect();
        assert_eq!(kinds, vec![AnomalyKind::RepeatedCommand, AnomalyKind::HighErrorRate]);

        assert!(core.evaluate(&AnomalyKind::ALL, now + 60).is_empty());

        let later = now + COOLDOWN_SECS;
        for offset in 0..3 {
            db.insert_shell_command(&command("make test", later - 10 + offset, 2))
                .expect("insert");
        }
        let fired = core.evaluate(&[AnomalyKind::RepeatedCommand], later);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].context["count"], 3);
    }

    #[test]
    fn monitor_escalates_on_signal() {
        let (_temp_dir, db) = temp_db();
        let db = Arc::new(db);
        let now = now_secs();
        for offset in 0..5 {
            db.insert_shell_command(&command("cargo test", now - 20 + offset, 101))
                .expect("insert");
        }

        let (signal_tx, signal_rx) = bounded(8);
        let mut monitor = AnomalyMonitor::new(
            Duration::from_secs(3600),
            signal_rx,
            Escalation {
                db: Arc::clone(&db),
                analyzer: Arc::new(HeuristicAnalyzer),
                notifier: Arc::new(NullNotifier),
            },
        );
        monitor.start().expect("start");
        signal_tx.send(ActivitySignal::Command).expect("signal");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let records = db.list_anomaly_records(10).expect("list");
            if records.len() == 2 {
                let mut kinds: Vec<String> =
                    records.into_iter().map(|record| record.anomaly_kind).collect();
                kinds.sort();
                assert_eq!(kinds, vec!["high_error_rate", "repeated_command"]);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no anomaly records");
            std::thread::sleep(Duration::from_millis(20));
        }

        monitor.stop();
        monitor.stop();
    }
}
