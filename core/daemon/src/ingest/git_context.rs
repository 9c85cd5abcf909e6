//! Git branch context for the directories commands run in.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::collector::{Collector, CollectorError, Worker};
use crate::db::Db;
use crate::events::{now_secs, BranchClass, GitContextEvent, StreamClock};
use crate::process::run_with_timeout;

const PWD_QUEUE_CAPACITY: usize = 64;
const RECHECK_INTERVAL_SECS: i64 = 300;
const GIT_TIMEOUT: Duration = Duration::from_secs(2);

static BRANCH_PATTERNS: Lazy<Vec<(Regex, BranchClass)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"^(feat|feature)/").unwrap(), BranchClass::Feature),
        (Regex::new(r"^(fix|bugfix|hotfix)/").unwrap(), BranchClass::Fix),
        (Regex::new(r"^refactor/").unwrap(), BranchClass::Refactor),
        (Regex::new(r"^docs?/").unwrap(), BranchClass::Docs),
        (Regex::new(r"^test/").unwrap(), BranchClass::Test),
        (Regex::new(r"^chore/").unwrap(), BranchClass::Chore),
    ]
});

pub fn classify_branch(branch: &str) -> BranchClass {
    BRANCH_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(branch))
        .map(|(_, class)| *class)
        .unwrap_or(BranchClass::Other)
}

/// Decides whether a working directory needs a fresh git lookup.
#[derive(Debug, Default)]
pub struct CheckGate {
    last_pwd: Option<String>,
    last_check: Option<i64>,
}

impl CheckGate {
    /// Returns `true` (and records the check) when `pwd` differs from the
    /// last checked directory or the last check is older than five minutes.
    pub fn should_check(&mut self, pwd: &str, now: i64) -> bool {
        let changed = self.last_pwd.as_deref() != Some(pwd);
        let stale = self
            .last_check
            .map(|last| now - last > RECHECK_INTERVAL_SECS)
            .unwrap_or(true);
        if !changed && !stale {
            return false;
        }
        self.last_pwd = Some(pwd.to_string());
        self.last_check = Some(now);
        true
    }
}

pub struct GitContextTracker {
    db: Arc<Db>,
    pwd_tx: Sender<String>,
    pwd_rx: Receiver<String>,
    worker: Option<Worker>,
}

impl GitContextTracker {
    pub fn new(db: Arc<Db>) -> Self {
        let (pwd_tx, pwd_rx) = bounded(PWD_QUEUE_CAPACITY);
        Self {
            db,
            pwd_tx,
            pwd_rx,
            worker: None,
        }
    }

    /// Queue the command receiver feeds working directories into.
    pub fn pwd_sender(&self) -> Sender<String> {
        self.pwd_tx.clone()
    }
}

impl Collector for GitContextTracker {
    fn name(&self) -> &'static str {
        "git-context"
    }

    fn start(&mut self) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning(self.name()));
        }

        let db = Arc::clone(&self.db);
        let pwd_rx = self.pwd_rx.clone();
        self.worker = Some(Worker::spawn(self.name(), move |shutdown| {
            let mut gate = CheckGate::default();
            let clock = StreamClock::new();
            loop {
                let pwd = select! {
                    recv(shutdown) -> _ => None,
                    recv(pwd_rx) -> message => message.ok(),
                };
                let Some(pwd) = pwd else { break };
                if gate.should_check(&pwd, now_secs()) {
                    record_context(&db, &clock, &pwd);
                }
            }
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

fn record_context(db: &Db, clock: &StreamClock, pwd: &str) {
    let Some((repo_root, branch)) = resolve_context(Path::new(pwd)) else {
        return;
    };
    let event = GitContextEvent {
        branch_class: classify_branch(&branch),
        repo_root,
        branch,
        timestamp: clock.stamp(now_secs()),
    };
    match db.insert_git_context(&event) {
        Ok(()) => debug!(
            repo = %event.repo_root,
            branch = %event.branch,
            class = event.branch_class.as_str(),
            "Recorded git context"
        ),
        Err(err) => warn!(error = %err, "Failed to record git context"),
    }
}

/// `(repo_root, branch)` for `dir`, or `None` when `dir` is not inside a
/// repository on a named branch.
pub fn resolve_context(dir: &Path) -> Option<(String, String)> {
    let repo_root = git_output(dir, &["rev-parse", "--show-toplevel"])?;
    let branch = git_output(dir, &["branch", "--show-current"])?;
    Some((repo_root, branch))
}

fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    if !dir.is_dir() {
        return None;
    }
    let mut command = Command::new("git");
    command.args(args).current_dir(dir);
    let output = match run_with_timeout(command, None, GIT_TIMEOUT) {
        Ok(output) => output,
        Err(err) => {
            debug!(error = %err, dir = %dir.display(), "git lookup failed");
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }
    let value = output.stdout.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_branch_prefixes() {
        assert_eq!(classify_branch("feat/login"), BranchClass::Feature);
        assert_eq!(classify_branch("feature/login"), BranchClass::Feature);
        assert_eq!(classify_branch("hotfix/crash"), BranchClass::Fix);
        assert_eq!(classify_branch("bugfix/crash"), BranchClass::Fix);
        assert_eq!(classify_branch("refactor/db"), BranchClass::Refactor);
        assert_eq!(classify_branch("doc/readme"), BranchClass::Docs);
        assert_eq!(classify_branch("docs/readme"), BranchClass::Docs);
        assert_eq!(classify_branch("test/flaky"), BranchClass::Test);
        assert_eq!(classify_branch("chore/deps"), BranchClass::Chore);
        assert_eq!(classify_branch("main"), BranchClass::Other);
        assert_eq!(classify_branch("my-feature/x"), BranchClass::Other);
    }

    #[test]
    fn gate_rechecks_on_change_or_staleness() {
        let mut gate = CheckGate::default();
        assert!(gate.should_check("/a", 1_000));
        assert!(!gate.should_check("/a", 1_100));
        assert!(!gate.should_check("/a", 1_300));
        assert!(gate.should_check("/b", 1_301));
        assert!(gate.should_check("/a", 1_302));
        assert!(gate.should_check("/a", 1_603));
    }

    #[test]
    fn non_repository_yields_no_context() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        assert!(resolve_context(temp_dir.path()).is_none());
        assert!(resolve_context(Path::new("/definitely/not/a/dir")).is_none());
    }
}
