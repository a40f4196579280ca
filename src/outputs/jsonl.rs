//! JSON Lines output.
//!
//! Every [`ChannelResult`] becomes one line of `{results_dir}/results.jsonl`:
//!
//! ```text
//! {"channel":"https://www.youtube.com/@chA","telegram":"https://t.me/cha","found_at":"2025-05-06T14:03:09+02:00"}
//! {"channel":"https://www.youtube.com/@chB","telegram":null,"found_at":"2025-05-06T14:03:11+02:00"}
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::models::ChannelResult;

pub const JSONL_FILE_NAME: &str = "results.jsonl";

/// Append `result` as one JSON line.
///
/// # Returns
///
/// The path written to.
#[instrument(level = "debug", skip_all, fields(channel = %result.channel))]
pub async fn append_result(
    result: &ChannelResult,
    results_dir: &Path,
) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    let mut line = serde_json::to_string(result)?;
    line.push('\n');

    fs::create_dir_all(results_dir).await?;
    let path = results_dir.join(JSONL_FILE_NAME);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    debug!(path = %path.display(), "Appended JSON line");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelUrl, TelegramLink};

    #[tokio::test]
    async fn test_lines_accumulate_and_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let with_link = ChannelResult::new(
            ChannelUrl::parse("/@chA").unwrap(),
            TelegramLink::normalize("t.me/cha_tg"),
        );
        let without = ChannelResult::new(ChannelUrl::parse("/@chB").unwrap(), None);

        append_result(&with_link, dir.path()).await.unwrap();
        let path = append_result(&without, dir.path()).await.unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        let parsed: Vec<ChannelResult> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].telegram.as_ref().unwrap().as_str(), "https://t.me/cha_tg");
        assert!(parsed[1].telegram.is_none());
        assert!(raw.contains(r#""telegram":null"#));
    }
}
