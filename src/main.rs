//! # tg_scout
//!
//! Searches YouTube for channels matching a query and collects the Telegram
//! links those channels advertise, using a small pool of headless browsers.
//!
//! ## Usage
//!
//! ```sh
//! tg_scout "music reviews"            # continuous, until Ctrl-C
//! tg_scout -n 25 "music reviews"      # one pass, at most 25 channels
//! tg_scout --channels-file list.txt   # known channels, no search
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: load the channel-filtered search results and collect channel URLs
//! 2. **Dedup**: drop channels already seen by the ledger
//! 3. **Extraction**: workers borrow a browser session from the pool and try,
//!    in order, redirect links, the About panel, and the description text
//! 4. **Output**: results stream to a daily text log and a JSON Lines file;
//!    each search pass that finds something new is noted in a search log

use clap::Parser;
use std::error::Error;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod channel_list;
mod cli;
mod config;
mod discover;
mod dispatcher;
mod error;
mod extract;
mod fetcher;
mod ledger;
mod models;
mod outputs;
mod pool;
mod retry;
mod stop;
mod utils;

use cli::Cli;
use config::ScoutConfig;
use dispatcher::{Dispatcher, RunState};
use error::DispatchError;
use fetcher::build_factory;
use ledger::DedupLedger;
use models::{ChannelResult, RunStats};
use pool::SessionPool;
use utils::ensure_writable_dir;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("tg_scout starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(?args.query, ?args.channels_file, ?args.workers, ?args.max_results, ?args.config, "Parsed CLI arguments");

    let mut config = match &args.config {
        Some(path) => ScoutConfig::load(path)?,
        None => ScoutConfig::default(),
    };
    args.apply(&mut config);

    let channels = match &args.channels_file {
        Some(path) => {
            let mut channels = channel_list::load(path).await?;
            if let Some(limit) = args.max_results {
                channels.truncate(limit);
            }
            Some(channels)
        }
        None => None,
    };

    // Early check: ensure the results dir is writable
    let results_dir = PathBuf::from(&config.output.results_dir);
    if let Err(e) = ensure_writable_dir(&results_dir).await {
        error!(
            path = %results_dir.display(),
            error = %e,
            "Results directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let ledger = match &config.output.ledger_file {
        Some(path) => DedupLedger::open(path).await?,
        None => DedupLedger::new(),
    };
    let ledger = Arc::new(ledger);

    let factory = build_factory(&config.browser)?;
    let pool = SessionPool::new(
        factory,
        config.dispatch.session_capacity(),
        config.dispatch.acquire_timeout(),
    );
    info!(
        engine = ?config.browser.engine,
        workers = config.dispatch.workers,
        sessions = pool.capacity(),
        persistent_ledger = ledger.is_persistent(),
        "Pipeline configured"
    );

    let workers = config.dispatch.workers;
    let (dispatcher, rx) = Dispatcher::with_channel(config, pool.clone(), Arc::clone(&ledger));
    let sink = tokio::spawn(outputs::drain_results(rx, results_dir.clone()));

    let query = args.query.clone().unwrap_or_default();
    let outcome = match (channels, args.max_results) {
        (Some(channels), _) => run_bounded(&dispatcher, dispatcher.process(channels), &results_dir).await,
        (None, Some(max_results)) => {
            run_bounded(&dispatcher, dispatcher.search(&query, max_results), &results_dir).await
        }
        (None, None) => run_continuous(&dispatcher, &pool, &query, workers).await,
    };

    let stats = dispatcher.stats();
    // Dropping the dispatcher closes the result queue so the sink can finish.
    drop(dispatcher);
    let streamed = sink.await?;
    pool.drain().await;

    log_stats(&stats);
    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        streamed,
        "Execution complete"
    );
    outcome
}

/// Discover continuously until Ctrl-C or until the run ends on its own.
#[instrument(level = "info", skip(dispatcher, pool))]
async fn run_continuous(
    dispatcher: &Dispatcher,
    pool: &SessionPool,
    query: &str,
    workers: usize,
) -> Result<(), Box<dyn Error>> {
    dispatcher.start(query, workers)?;
    info!("Running until interrupted (Ctrl-C)");

    let mut state = dispatcher.subscribe_state();
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C; stopping");
                }
                info!("Interrupted; stopping");
                break;
            }
            _ = ticker.tick() => {
                log_stats(&dispatcher.stats());
                debug!(live = pool.live(), idle = pool.idle(), "Session pool");
            }
            _ = state.wait_for(|s| *s == RunState::Idle) => {
                error!("Run ended without a stop request; see earlier errors");
                break;
            }
        }
    }

    dispatcher.stop().await;
    Ok(())
}

/// One bounded pass, written straight to the outputs.
async fn run_bounded<F>(dispatcher: &Dispatcher, pass: F, results_dir: &Path) -> Result<(), Box<dyn Error>>
where
    F: Future<Output = Result<Vec<ChannelResult>, DispatchError>>,
{
    tokio::pin!(pass);

    let results = tokio::select! {
        results = &mut pass => results?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; finishing channels already in progress");
            let (results, ()) = tokio::join!(pass, dispatcher.stop());
            results?
        }
    };

    let mut written = 0usize;
    for result in &results {
        match outputs::write_result(result, results_dir).await {
            Ok(()) => written += 1,
            Err(e) => error!(channel = %result.channel, error = %e, "Failed to write result"),
        }
    }
    let links = results.iter().filter(|r| r.telegram.is_some()).count();
    info!(processed = results.len(), links, written, "Pass finished");
    Ok(())
}

fn log_stats(stats: &RunStats) {
    info!(
        queries = stats.total_queries,
        channels = stats.total_channels_found,
        processed = stats.channels_processed,
        failed = stats.channels_failed,
        links = stats.total_links_found,
        last_search = ?stats.last_search_time.map(|t| t.format("%H:%M:%S").to_string()),
        "Run statistics"
    );
}
