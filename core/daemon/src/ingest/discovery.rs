//! Picks watch roots from recorded activity when none are configured.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db::Db;

pub const LOOKBACK_SECS: i64 = 7 * 24 * 60 * 60;
pub const MAX_DISCOVERED_ROOTS: usize = 5;

/// Highest-scoring existing directories from the last week of shell and
/// git history. Directories nested under an already chosen root are
/// skipped since the watch is recursive.
pub fn discover_roots(db: &Db, now: i64) -> Vec<PathBuf> {
    let scores = match db.directory_scores(now - LOOKBACK_SECS) {
        Ok(scores) => scores,
        Err(err) => {
            warn!(error = %err, "Failed to score directories for discovery");
            return Vec::new();
        }
    };

    let roots = select_roots(
        scores.into_iter().map(|(dir, score)| (PathBuf::from(dir), score)),
        |path| path.is_dir(),
    );

    if roots.is_empty() {
        info!("No directories discovered for file watching");
    } else {
        info!(count = roots.len(), "Discovered directories for file watching");
    }
    roots
}

fn select_roots(
    ranked: impl Iterator<Item = (PathBuf, f64)>,
    exists: impl Fn(&Path) -> bool,
) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    for (path, score) in ranked {
        if roots.len() >= MAX_DISCOVERED_ROOTS {
            break;
        }
        if !exists(&path) || roots.iter().any(|root| path.starts_with(root)) {
            continue;
        }
        debug!(path = %path.display(), score, "Discovered directory");
        roots.push(path);
    }
    roots
}
