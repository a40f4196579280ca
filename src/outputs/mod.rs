//! Result sink: writes each [`ChannelResult`] to disk as it arrives.
//!
//! # Submodules
//!
//! - [`text`]: human-readable daily log, one block per channel
//! - [`jsonl`]: one JSON object per line, for tooling
//! - [`search_log`]: one line per discovery pass that found new channels
//!
//! # Output Structure
//!
//! ```text
//! results_dir/
//! ├── results_20250506.txt
//! ├── results_20250507.txt
//! ├── results.jsonl
//! ├── search_log.txt
//! └── processed_urls.txt     # ledger, when enabled
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

use crate::models::ChannelResult;

pub mod jsonl;
pub mod search_log;
pub mod text;

/// Write one result to every output.
pub async fn write_result(
    result: &ChannelResult,
    results_dir: &Path,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let text_path = text::append_result(result, results_dir).await?;
    jsonl::append_result(result, results_dir).await?;
    info!(
        channel = %result.channel,
        telegram = result.telegram.as_ref().map_or("Not found", |link| link.as_str()),
        path = %text_path.display(),
        "Saved result"
    );
    Ok(())
}

/// Drain `rx` into `results_dir` until every sender is gone.
///
/// A failed write is logged and the result skipped; the sink keeps going.
///
/// # Returns
///
/// The number of results written.
#[instrument(level = "info", skip_all, fields(results_dir = %results_dir.display()))]
pub async fn drain_results(mut rx: mpsc::Receiver<ChannelResult>, results_dir: PathBuf) -> usize {
    let mut written = 0usize;
    while let Some(result) = rx.recv().await {
        match write_result(&result, &results_dir).await {
            Ok(()) => written += 1,
            Err(e) => error!(channel = %result.channel, error = %e, "Failed to write result"),
        }
    }
    info!(written, "Result sink closed");
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelUrl, TelegramLink};

    #[tokio::test]
    async fn test_drain_writes_until_senders_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(4);
        let sink = tokio::spawn(drain_results(rx, dir.path().to_path_buf()));

        for handle in ["one", "two", "three"] {
            tx.send(ChannelResult::new(
                ChannelUrl::parse(&format!("/@{handle}")).unwrap(),
                TelegramLink::normalize(&format!("@{handle}_tg")),
            ))
            .await
            .unwrap();
        }
        drop(tx);

        assert_eq!(sink.await.unwrap(), 3);
        let jsonl = std::fs::read_to_string(dir.path().join(jsonl::JSONL_FILE_NAME)).unwrap();
        assert_eq!(jsonl.lines().count(), 3);
    }
}
