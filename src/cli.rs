//! Command-line interface definitions for tg_scout.
//!
//! Flags override the YAML config file, which overrides built-in defaults.
//! Most options can also be provided via environment variables.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{Engine, ScoutConfig};

/// Find YouTube channels for a search query and collect their Telegram links.
///
/// Without `--max-results` the search repeats until interrupted with Ctrl-C;
/// with it, a single pass runs and the program exits. `--channels-file` skips
/// the search and processes a list of channels instead.
///
/// # Examples
///
/// ```sh
/// # Continuous search with five workers
/// tg_scout -w 5 "music reviews"
///
/// # One pass, at most 20 channels, remembering processed channels across runs
/// tg_scout -n 20 --ledger-file ./results/processed_urls.txt "music reviews"
///
/// # No Chromium available
/// tg_scout --engine http "music reviews"
///
/// # Known channels, no search
/// tg_scout --channels-file CHANNELS_LIST.txt
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Search query
    #[arg(required_unless_present = "channels_file")]
    pub query: Option<String>,

    /// Process the channels listed in this file (one per line) instead of searching
    #[arg(long, env = "TG_SCOUT_CHANNELS_FILE", conflicts_with = "interval_secs")]
    pub channels_file: Option<PathBuf>,

    /// Number of concurrent workers (1-10)
    #[arg(short, long, env = "TG_SCOUT_WORKERS")]
    pub workers: Option<usize>,

    /// Maximum live browser sessions (default: workers + 1)
    #[arg(long, env = "TG_SCOUT_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Process at most this many channels in a single pass, then exit
    /// (with --channels-file: only the first N listed)
    #[arg(short = 'n', long)]
    pub max_results: Option<usize>,

    /// Output directory for result files
    #[arg(short = 'o', long, env = "TG_SCOUT_RESULTS_DIR")]
    pub results_dir: Option<String>,

    /// File of already-processed channels, shared across runs
    #[arg(long, env = "TG_SCOUT_LEDGER_FILE")]
    pub ledger_file: Option<String>,

    /// Optional path to config.yaml file
    #[arg(short, long, env = "TG_SCOUT_CONFIG")]
    pub config: Option<String>,

    /// Page fetcher to use
    #[arg(long, value_enum, env = "TG_SCOUT_ENGINE")]
    pub engine: Option<Engine>,

    /// Path to the Chromium/Chrome binary
    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Seconds between discovery passes in continuous mode
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,
}

impl Cli {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut ScoutConfig) {
        if let Some(workers) = self.workers {
            config.dispatch.workers = workers;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.dispatch.max_sessions = Some(max_sessions);
        }
        if let Some(interval) = self.interval_secs {
            config.dispatch.pass_interval_secs = interval;
        }
        if let Some(dir) = &self.results_dir {
            config.output.results_dir = dir.clone();
        }
        if let Some(ledger) = &self.ledger_file {
            config.output.ledger_file = Some(ledger.clone());
        }
        if let Some(engine) = self.engine {
            config.browser.engine = engine;
        }
        if let Some(path) = &self.chrome_path {
            config.browser.executable = Some(path.clone());
        }
        if self.headed {
            config.browser.headless = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "tg_scout",
            "--workers",
            "5",
            "--results-dir",
            "./out",
            "--engine",
            "http",
            "music reviews",
        ]);

        assert_eq!(cli.query.as_deref(), Some("music reviews"));
        assert_eq!(cli.workers, Some(5));
        assert_eq!(cli.results_dir.as_deref(), Some("./out"));
        assert_eq!(cli.engine, Some(Engine::Http));
        assert!(cli.max_results.is_none());
        assert!(!cli.headed);
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from(["tg_scout", "-w", "2", "-n", "20", "-o", "/tmp/out", "-c", "cfg.yaml", "q"]);

        assert_eq!(cli.workers, Some(2));
        assert_eq!(cli.max_results, Some(20));
        assert_eq!(cli.results_dir.as_deref(), Some("/tmp/out"));
        assert_eq!(cli.config.as_deref(), Some("cfg.yaml"));
    }

    #[test]
    fn test_query_is_required() {
        assert!(Cli::try_parse_from(["tg_scout", "-w", "2"]).is_err());
    }

    #[test]
    fn test_channels_file_replaces_query() {
        let cli = Cli::parse_from(["tg_scout", "--channels-file", "CHANNELS_LIST.txt"]);
        assert!(cli.query.is_none());
        assert_eq!(cli.channels_file, Some(PathBuf::from("CHANNELS_LIST.txt")));

        assert!(Cli::try_parse_from(["tg_scout", "--channels-file", "list.txt", "--interval-secs", "5"]).is_err());
    }

    #[test]
    fn test_apply_overrides_only_given_flags() {
        let mut config = ScoutConfig::from_yaml("dispatch:\n  workers: 7\n  pass_interval_secs: 60\n").unwrap();
        let cli = Cli::parse_from(["tg_scout", "--interval-secs", "10", "--headed", "--ledger-file", "seen.txt", "q"]);
        cli.apply(&mut config);

        assert_eq!(config.dispatch.workers, 7);
        assert_eq!(config.dispatch.pass_interval_secs, 10);
        assert!(!config.browser.headless);
        assert_eq!(config.output.ledger_file.as_deref(), Some("seen.txt"));
        assert_eq!(config.browser.engine, Engine::Chrome);
    }
}
