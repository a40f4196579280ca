//! Per-query search log.
//!
//! Every discovery pass that admits new channels appends one line to
//! `{results_dir}/search_log.txt`:
//!
//! ```text
//! 2025-05-06 14:03 | Query: 'music reviews' | Found: 12
//! ```

use chrono::{DateTime, Local};
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::models::SearchQuery;

pub const SEARCH_LOG_FILE_NAME: &str = "search_log.txt";

pub fn format_entry(at: DateTime<Local>, query: &SearchQuery, found: usize) -> String {
    format!(
        "{} | Query: '{}' | Found: {}\n",
        at.format("%Y-%m-%d %H:%M"),
        query.as_str(),
        found
    )
}

/// Append a line for a pass over `query` that admitted `found` new channels.
pub async fn append_entry(
    results_dir: &Path,
    query: &SearchQuery,
    found: usize,
) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(results_dir).await?;
    let path = results_dir.join(SEARCH_LOG_FILE_NAME);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(format_entry(Local::now(), query, found).as_bytes()).await?;
    file.flush().await?;
    debug!(%query, found, "Logged search");
    Ok(path)
}
