//! Plain-text daily log.
//!
//! Results are appended to one file per local day,
//! `{results_dir}/results_YYYYMMDD.txt`, one block per channel:
//!
//! ```text
//! [14:03:09] YouTube: https://www.youtube.com/@chA
//! Telegram: https://t.me/cha
//!
//! [14:03:11] YouTube: https://www.youtube.com/@chB
//! Telegram: Not found
//!
//! ```
//!
//! The day is taken from the result's own timestamp, so a result found just
//! before midnight lands in that day's file even if it is written after.

use chrono::NaiveDate;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::models::ChannelResult;

pub fn daily_file_name(date: NaiveDate) -> String {
    format!("results_{}.txt", date.format("%Y%m%d"))
}

pub fn format_block(result: &ChannelResult) -> String {
    let telegram = result
        .telegram
        .as_ref()
        .map_or("Not found", |link| link.as_str());
    format!(
        "[{}] YouTube: {}\nTelegram: {}\n\n",
        result.found_at.format("%H:%M:%S"),
        result.channel,
        telegram
    )
}

/// Append `result` to its day's file.
///
/// # Returns
///
/// The path written to.
#[instrument(level = "debug", skip_all, fields(channel = %result.channel))]
pub async fn append_result(
    result: &ChannelResult,
    results_dir: &Path,
) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(results_dir).await?;
    let path = results_dir.join(daily_file_name(result.found_at.date_naive()));
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(format_block(result).as_bytes()).await?;
    file.flush().await?;
    debug!(path = %path.display(), "Appended result block");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelUrl, TelegramLink};
    use chrono::{Local, TimeZone};

    fn result_at(handle: &str, telegram: Option<&str>) -> ChannelResult {
        ChannelResult {
            channel: ChannelUrl::parse(&format!("/@{handle}")).unwrap(),
            telegram: telegram.and_then(TelegramLink::normalize),
            found_at: Local.with_ymd_and_hms(2025, 5, 6, 14, 3, 9).unwrap(),
        }
    }

    #[test]
    fn test_daily_file_name() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        assert_eq!(daily_file_name(date), "results_20250109.txt");
    }

    #[test]
    fn test_format_block() {
        assert_eq!(
            format_block(&result_at("chA", Some("@cha_tg"))),
            "[14:03:09] YouTube: https://www.youtube.com/@chA\nTelegram: https://t.me/cha_tg\n\n"
        );
        assert_eq!(
            format_block(&result_at("chB", None)),
            "[14:03:09] YouTube: https://www.youtube.com/@chB\nTelegram: Not found\n\n"
        );
    }

    #[tokio::test]
    async fn test_append_uses_result_date() {
        let dir = tempfile::tempdir().unwrap();
        append_result(&result_at("chA", Some("@cha_tg")), dir.path()).await.unwrap();
        let path = append_result(&result_at("chB", None), dir.path()).await.unwrap();

        assert_eq!(path, dir.path().join("results_20250506.txt"));
        let raw = std::fs::read_to_string(path).unwrap();
        assert_eq!(raw.matches("YouTube: ").count(), 2);
        assert!(raw.ends_with("Telegram: Not found\n\n"));
    }
}
