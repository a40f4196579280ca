//! Deduplication ledger and run statistics.
//!
//! The ledger is the single source of truth for "has this channel already been
//! dispatched?". The seen-set and the [`RunStats`] counters share one mutex;
//! every operation is a short check-and-update, and no lock is held across I/O.
//!
//! # Persistence
//!
//! When opened with a file path, previously seen channels are loaded from a
//! line-oriented file (one [`ChannelUrl`] per line). A channel is written to
//! that file only once it has been settled (its result emitted, or its retries
//! exhausted), so a run that stops early leaves its queued channels for the
//! next run. Admitted channels that never got processed are handed back with
//! [`DedupLedger::release`].

use chrono::Local;
use itertools::Itertools;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::models::{ChannelUrl, RunStats};

#[derive(Debug, Default)]
struct LedgerState {
    seen: HashSet<ChannelUrl>,
    /// Settled but not yet appended to the backing file.
    unsaved: Vec<ChannelUrl>,
    stats: RunStats,
}

#[derive(Debug, Default)]
pub struct DedupLedger {
    state: Mutex<LedgerState>,
    path: Option<PathBuf>,
}

impl DedupLedger {
    /// An in-memory ledger that lives as long as the value.
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger backed by an append-only file.
    ///
    /// A missing file is treated as empty; unparseable lines are skipped.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let seen: HashSet<ChannelUrl> = match fs::read_to_string(&path).await {
            Ok(raw) => raw.lines().filter_map(ChannelUrl::from_ledger_line).collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e),
        };
        info!(count = seen.len(), "Loaded processed channels");
        Ok(Self {
            state: Mutex::new(LedgerState {
                seen,
                ..LedgerState::default()
            }),
            path: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Reset counters for a new run.
    ///
    /// An in-memory ledger also forgets what it has seen; a persistent one
    /// keeps its history.
    pub fn begin_run(&self) {
        let mut state = self.lock();
        state.stats = RunStats::default();
        if self.path.is_none() {
            state.seen.clear();
        }
    }

    /// Admit the channels not seen before, marking them seen in the same
    /// critical section.
    ///
    /// Duplicates inside `urls` count once. Concurrent callers never receive
    /// overlapping results.
    pub fn try_insert_all(&self, urls: impl IntoIterator<Item = ChannelUrl>) -> Vec<ChannelUrl> {
        self.try_insert_up_to(urls, usize::MAX)
    }

    /// Like [`DedupLedger::try_insert_all`], but admits at most `limit`
    /// channels. The rest stay unseen for a later pass.
    pub fn try_insert_up_to(
        &self,
        urls: impl IntoIterator<Item = ChannelUrl>,
        limit: usize,
    ) -> Vec<ChannelUrl> {
        let mut state = self.lock();
        let fresh: Vec<ChannelUrl> = urls
            .into_iter()
            .unique()
            .filter(|url| !state.seen.contains(url))
            .take(limit)
            .collect();
        state.seen.extend(fresh.iter().cloned());
        state.stats.total_channels_found += fresh.len() as u64;
        fresh
    }

    /// Count one discovery pass.
    pub fn record_query(&self) {
        let mut state = self.lock();
        state.stats.total_queries += 1;
        state.stats.last_search_time = Some(Local::now());
    }

    /// Count one processed channel.
    pub fn record_result(&self, link_found: bool) {
        let mut state = self.lock();
        state.stats.channels_processed += 1;
        if link_found {
            state.stats.total_links_found += 1;
        }
    }

    pub fn record_failure(&self) {
        self.lock().stats.channels_failed += 1;
    }

    pub fn stats(&self) -> RunStats {
        self.lock().stats.clone()
    }

    #[cfg(test)]
    pub fn contains(&self, url: &ChannelUrl) -> bool {
        self.lock().seen.contains(url)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `url` as done for good, queueing it for the next [`DedupLedger::flush`].
    ///
    /// No-op for an in-memory ledger.
    pub fn settle(&self, url: &ChannelUrl) {
        if self.path.is_some() {
            self.lock().unsaved.push(url.clone());
        }
    }

    /// Forget admitted channels that were never processed, so a later pass
    /// or run admits them again.
    ///
    /// # Returns
    ///
    /// How many were released.
    pub fn release(&self, urls: impl IntoIterator<Item = ChannelUrl>) -> usize {
        let mut state = self.lock();
        let mut released = 0usize;
        for url in urls {
            if state.seen.remove(&url) {
                released += 1;
            }
        }
        released
    }

    /// Append settled channels to the backing file.
    ///
    /// On failure the channels stay queued and the next flush retries them.
    ///
    /// # Returns
    ///
    /// How many lines were written.
    pub async fn flush(&self) -> io::Result<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let pending = std::mem::take(&mut self.lock().unsaved);
        if pending.is_empty() {
            return Ok(0);
        }
        match append_lines(path, &pending).await {
            Ok(()) => Ok(pending.len()),
            Err(e) => {
                let mut state = self.lock();
                let newer = std::mem::replace(&mut state.unsaved, pending);
                state.unsaved.extend(newer);
                Err(e)
            }
        }
    }
}

async fn append_lines(path: &Path, urls: &[ChannelUrl]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let lines: String = urls.iter().map(|url| format!("{url}\n")).collect();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(lines.as_bytes()).await?;
    file.flush().await?;
    debug!(count = urls.len(), path = %path.display(), "Appended to ledger");
    Ok(())
}
