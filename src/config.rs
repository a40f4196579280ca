//! Runtime configuration.
//!
//! Every knob has a default, so an empty (or absent) YAML file is a valid
//! configuration. The CLI loads the file first and then applies its own flags
//! on top, see [`crate::cli::Cli::apply`].
//!
//! ```yaml
//! search:
//!   scroll_steps: 5
//!   fallback_broad_scan: false
//! dispatch:
//!   workers: 4
//!   pass_interval_secs: 20
//! browser:
//!   engine: chrome
//!   headless: true
//! output:
//!   results_dir: ./results
//!   ledger_file: ./results/processed_urls.txt
//!   search_log: false
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Hard ceiling on concurrent workers.
pub const MAX_WORKERS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub search: SearchConfig,
    pub extract: ExtractConfig,
    pub dispatch: DispatchConfig,
    pub browser: BrowserConfig,
    pub output: OutputConfig,
}

impl ScoutConfig {
    /// Load a YAML config file.
    ///
    /// # Errors
    ///
    /// Fails if the file can't be read or doesn't parse; a missing field is
    /// not an error and takes its default.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })?;
        info!("Loaded configuration");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }
}

/// How the search-results page is driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    /// Value of the `sp=` parameter restricting results to channels.
    pub channel_filter: String,
    pub results_timeout_secs: u64,
    pub scroll_steps: usize,
    pub scroll_pause_ms: u64,
    /// Attempts per discovery pass.
    pub max_retries: usize,
    pub retry_delay_secs: u64,
    /// Rerun an empty facet-filtered pass as an unfiltered scan for `/@` links.
    pub fallback_broad_scan: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.youtube.com/results".to_string(),
            channel_filter: "EgIQAg%3D%3D".to_string(),
            results_timeout_secs: 20,
            scroll_steps: 3,
            scroll_pause_ms: 1500,
            max_retries: 3,
            retry_delay_secs: 2,
            fallback_broad_scan: true,
        }
    }
}

impl SearchConfig {
    pub fn results_timeout(&self) -> Duration {
        Duration::from_secs(self.results_timeout_secs)
    }

    pub fn scroll_pause(&self) -> Duration {
        Duration::from_millis(self.scroll_pause_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, Duration::from_secs(self.retry_delay_secs))
    }
}

/// Per-channel extraction timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Bound on each strategy's page-ready wait.
    pub strategy_timeout_secs: u64,
    pub show_more_timeout_secs: u64,
    /// Pause after expanding a "show more" control.
    pub settle_ms: u64,
    /// Attempts per channel when navigation itself fails.
    pub max_attempts: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_secs: 15,
            show_more_timeout_secs: 5,
            settle_ms: 1000,
            max_attempts: 2,
        }
    }
}

impl ExtractConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.strategy_timeout_secs)
    }

    pub fn show_more_timeout(&self) -> Duration {
        Duration::from_secs(self.show_more_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(1))
    }
}

/// Worker and pacing settings for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Pool capacity; `None` means one session per worker plus one for discovery.
    pub max_sessions: Option<usize>,
    /// Pause between discovery passes in continuous mode.
    pub pass_interval_secs: u64,
    /// Pause after a failed discovery pass.
    pub fault_backoff_secs: u64,
    pub acquire_timeout_secs: u64,
    /// How long a worker waits on a full result queue before dropping a result.
    pub result_send_timeout_secs: u64,
    pub result_queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_sessions: None,
            pass_interval_secs: 5,
            fault_backoff_secs: 30,
            acquire_timeout_secs: 120,
            result_send_timeout_secs: 30,
            result_queue_capacity: 256,
        }
    }
}

impl DispatchConfig {
    pub fn session_capacity(&self) -> usize {
        self.max_sessions.unwrap_or(self.workers + 1).max(1)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }

    pub fn fault_backoff(&self) -> Duration {
        Duration::from_secs(self.fault_backoff_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn result_send_timeout(&self) -> Duration {
        Duration::from_secs(self.result_send_timeout_secs)
    }
}

/// Which page fetcher backs a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Headless Chromium over CDP.
    #[default]
    Chrome,
    /// Plain HTTP GET with server-rendered HTML only.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub engine: Engine,
    pub headless: bool,
    /// Chromium binary; searched in the usual locations when unset.
    pub executable: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub user_agent: String,
    pub page_load_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            headless: true,
            executable: None,
            extra_args: Vec::new(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            page_load_timeout_secs: 30,
        }
    }
}

impl BrowserConfig {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: String,
    /// Append-only list of channels already processed, for cross-run dedup.
    pub ledger_file: Option<String>,
    /// Keep `search_log.txt` in `results_dir`, one line per pass that found new channels.
    pub search_log: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: "results".to_string(),
            ledger_file: None,
            search_log: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(ScoutConfig::from_yaml("").unwrap(), ScoutConfig::default());
        assert_eq!(ScoutConfig::from_yaml("  \n").unwrap(), ScoutConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = ScoutConfig::from_yaml(
            "dispatch:\n  workers: 7\nbrowser:\n  engine: http\n",
        )
        .unwrap();
        assert_eq!(config.dispatch.workers, 7);
        assert_eq!(config.dispatch.pass_interval_secs, 5);
        assert_eq!(config.browser.engine, Engine::Http);
        assert!(config.browser.headless);
        assert_eq!(config.search.scroll_steps, 3);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(ScoutConfig::from_yaml("dispatch: [1, 2").is_err());
    }

    #[test]
    fn test_session_capacity_defaults_to_workers_plus_one() {
        let mut dispatch = DispatchConfig::default();
        assert_eq!(dispatch.session_capacity(), 4);
        dispatch.max_sessions = Some(2);
        assert_eq!(dispatch.session_capacity(), 2);
        dispatch.max_sessions = Some(0);
        assert_eq!(dispatch.session_capacity(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "output:\n  results_dir: /tmp/out\n  ledger_file: /tmp/out/seen.txt").unwrap();
        let config = ScoutConfig::load(file.path()).unwrap();
        assert_eq!(config.output.results_dir, "/tmp/out");
        assert_eq!(config.output.ledger_file.as_deref(), Some("/tmp/out/seen.txt"));
        assert!(config.output.search_log);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScoutConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
