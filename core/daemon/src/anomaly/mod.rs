//! Anomaly detection and escalation.

pub mod activity;
pub mod analysis;
pub mod detector;
pub mod dispatch;
pub mod monitor;
pub mod notifier;

pub use analysis::create_analyzer;
pub use dispatch::Escalation;
pub use monitor::AnomalyMonitor;
pub use notifier::create_notifier;
