//! Discovers session files, establishes the shared virtual clock, launches
//! one worker per file in `firstTs` order, and waits for all of them
//! before returning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::replay::clock::VirtualClock;
use crate::replay::db::DatabaseHandle;
use crate::replay::worker::{ReplayConfig, ReplayWorker};
use crate::stats::Stats;

/// A discovered `<firstTs>.<lastTs>.<hash>.tsv` session file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFile {
    pub path: PathBuf,
    pub first_ts: i64,
    pub last_ts: i64,
    pub hash: String,
}

/// Parses a `<firstTs>.<lastTs>.<hash>.tsv` filename, matching the format
/// [`crate::capture::sink::FileEventSink::finish`] writes.
fn parse_session_filename(path: &Path) -> Option<SessionFile> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".tsv")?;
    let mut parts = stem.splitn(3, '.');
    let first_ts: i64 = parts.next()?.parse().ok()?;
    let last_ts: i64 = parts.next()?.parse().ok()?;
    let hash = parts.next()?.to_string();
    Some(SessionFile {
        path: path.to_path_buf(),
        first_ts,
        last_ts,
        hash,
    })
}

/// Discovers and orders session files in `dir`.
pub fn discover_sessions(dir: &Path) -> Result<Vec<SessionFile>> {
    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(Error::Transport)? {
        let entry = entry.map_err(Error::Transport)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match parse_session_filename(&path) {
            Some(session) => sessions.push(session),
            None => warn!(path = %path.display(), "skipping file not matching <firstTs>.<lastTs>.<hash>.tsv"),
        }
    }
    sessions.sort_by_key(|s| s.first_ts);
    Ok(sessions)
}

pub struct ReplayScheduler<H: DatabaseHandle> {
    config: Arc<ReplayConfig>,
    handle: Arc<H>,
    stats: Arc<dyn Stats>,
}

impl<H: DatabaseHandle + 'static> ReplayScheduler<H> {
    pub fn new(config: ReplayConfig, handle: H, stats: Arc<dyn Stats>) -> Self {
        Self {
            config: Arc::new(config),
            handle: Arc::new(handle),
            stats,
        }
    }

    /// Runs every session file found in `dir` to completion.
    pub async fn run(&self, dir: &Path) -> Result<()> {
        let sessions = discover_sessions(dir)?;
        let Some(first) = sessions.first() else {
            return Ok(());
        };
        let orig_start = first.first_ts;
        let clock = Arc::new(VirtualClock::new(orig_start, self.config.speed));

        let mut tasks = Vec::with_capacity(sessions.len());
        for session in sessions {
            if let Some(scheduled) = clock.scheduled_at(session.first_ts) {
                tokio::time::sleep_until(scheduled.into()).await;
            }

            info!(session = %session.hash, path = %session.path.display(), "launching replay worker");
            let worker = ReplayWorker::new(
                session.hash.clone(),
                session.path.clone(),
                self.config.clone(),
                clock.clone(),
                self.stats.clone(),
                self.handle.clone(),
            );
            tasks.push(tokio::spawn(worker.run()));
        }

        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "replay worker exited with an error"),
                Err(err) => warn!(error = %err, "replay worker task panicked"),
            }
        }

        Ok(())
    }
}
