//! Channel list files for batch mode.
//!
//! One channel per line, either a full URL or a bare `@handle`. Blank lines
//! and lines starting with `#` are ignored; anything else that is not a
//! channel is skipped with a warning.
//!
//! ```text
//! # music
//! https://www.youtube.com/@chA
//! @chB
//! https://youtube.com/channel/UC123/videos
//! ```

use itertools::Itertools;
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::models::ChannelUrl;

/// Read and parse a channel list file.
#[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
pub async fn load(path: impl AsRef<Path>) -> io::Result<Vec<ChannelUrl>> {
    let raw = fs::read_to_string(path.as_ref()).await?;
    let channels = parse(&raw);
    info!(count = channels.len(), "Loaded channel list");
    Ok(channels)
}

/// Parse list contents, keeping file order and dropping duplicates.
pub fn parse(raw: &str) -> Vec<ChannelUrl> {
    raw.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|(line_no, line)| {
            let parsed = if line.starts_with('@') {
                ChannelUrl::parse(&format!("/{line}"))
            } else {
                ChannelUrl::parse(line)
            };
            if parsed.is_none() {
                warn!(line_no, line, "Skipping line that is not a channel");
            }
            parsed
        })
        .unique()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_forms() {
        let raw = "# comment\n\nhttps://www.youtube.com/@chA\n  @chB  \nhttps://youtube.com/channel/UC123/videos\n";
        let channels: Vec<String> = parse(raw).iter().map(ToString::to_string).collect();
        assert_eq!(
            channels,
            vec![
                "https://www.youtube.com/@chA",
                "https://www.youtube.com/@chB",
                "https://www.youtube.com/channel/UC123",
            ]
        );
    }

    #[test]
    fn test_parse_skips_garbage_and_duplicates() {
        let raw = "https://www.youtube.com/@chA/videos\nnot a channel\nhttps://www.youtube.com/watch?v=1\n@chA\n";
        let channels = parse(raw);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].as_str(), "https://www.youtube.com/@chA");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path().join("CHANNELS_LIST.txt")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.txt");
        std::fs::write(&path, "@one\n@two\n").unwrap();
        assert_eq!(load(&path).await.unwrap().len(), 2);
    }
}
