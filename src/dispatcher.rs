//! Run coordination.
//!
//! A [`Dispatcher`] owns one run at a time and moves through
//! `Idle -> Running -> Stopping -> Idle`.
//!
//! # Continuous mode
//!
//! [`Dispatcher::start`] spawns a coordinator that repeats discovery passes
//! until stopped. Each pass filters the discovered channels through the
//! [`DedupLedger`], queues the new ones and tops the worker crew back up to
//! the requested size. Workers drain the queue and exit when it is empty, so
//! an idle run holds no sessions between passes.
//!
//! # Bounded mode
//!
//! [`Dispatcher::search`] runs a single pass, processes at most
//! `max_results` new channels with a fixed crew and returns their results.
//! [`Dispatcher::process`] does the same for a given channel list, with no
//! discovery at all.
//!
//! # Stopping
//!
//! [`Dispatcher::stop`] only raises a flag. The coordinator checks it at the
//! top of every pass and workers before every channel; the extractor checks it
//! before every navigation. A navigation already in flight finishes (each is
//! bounded by a page timeout) and nothing new starts after it.
//!
//! Only channels a worker settled are written to a persisted ledger. Whatever
//! is still queued when a run ends is released, so the next run picks it up.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{MAX_WORKERS, ScoutConfig};
use crate::discover::ChannelDiscoverer;
use crate::error::{DispatchError, PoolError, StageError};
use crate::extract::LinkExtractor;
use crate::ledger::DedupLedger;
use crate::models::{ChannelResult, ChannelUrl, RunStats, SearchQuery, TelegramLink};
use crate::outputs::search_log;
use crate::pool::SessionPool;
use crate::stop::StopSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Stopping,
}

type WorkQueue = Arc<Mutex<VecDeque<ChannelUrl>>>;

fn lock_queue(queue: &WorkQueue) -> MutexGuard<'_, VecDeque<ChannelUrl>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    config: ScoutConfig,
    pool: SessionPool,
    ledger: Arc<DedupLedger>,
    results: mpsc::Sender<ChannelResult>,
    state: watch::Sender<RunState>,
}

impl Shared {
    fn enter_stopping(&self) {
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Stopping;
                true
            } else {
                false
            }
        });
    }

    /// Hand channels still queued back to the ledger.
    fn release_unprocessed(&self, queue: &WorkQueue) -> usize {
        let left: Vec<ChannelUrl> = lock_queue(queue).drain(..).collect();
        self.ledger.release(left)
    }

    /// Append a line to the search log when a pass found something new.
    async fn log_search(&self, query: &SearchQuery, found: usize) {
        if !self.config.output.search_log || found == 0 {
            return;
        }
        let dir = Path::new(&self.config.output.results_dir);
        if let Err(e) = search_log::append_entry(dir, query, found).await {
            warn!(error = %e, "Failed to write search log");
        }
    }
}

/// Puts the dispatcher back to `Idle` when a continuous run ends, however it ends.
struct IdleOnExit(Arc<Shared>);

impl Drop for IdleOnExit {
    fn drop(&mut self) {
        self.0.state.send_replace(RunState::Idle);
    }
}

struct ActiveRun {
    stop: StopSignal,
    coordinator: Option<JoinHandle<()>>,
}

/// One bounded pass in progress. Dropping it forgets the run and returns the
/// dispatcher to `Idle`.
struct BoundedRun<'a> {
    dispatcher: &'a Dispatcher,
    stop: StopSignal,
}

impl Drop for BoundedRun<'_> {
    fn drop(&mut self) {
        self.dispatcher.active().take();
        self.dispatcher.shared.state.send_replace(RunState::Idle);
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveRun>>,
}

impl Dispatcher {
    /// Results of continuous runs are sent to `results`.
    pub fn new(
        config: ScoutConfig,
        pool: SessionPool,
        ledger: Arc<DedupLedger>,
        results: mpsc::Sender<ChannelResult>,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                pool,
                ledger,
                results,
                state,
            }),
            active: Mutex::new(None),
        }
    }

    /// Build a dispatcher together with the receiving end of its result queue,
    /// sized by `dispatch.result_queue_capacity`.
    pub fn with_channel(
        config: ScoutConfig,
        pool: SessionPool,
        ledger: Arc<DedupLedger>,
    ) -> (Self, mpsc::Receiver<ChannelResult>) {
        let (tx, rx) = mpsc::channel(config.dispatch.result_queue_capacity.max(1));
        (Self::new(config, pool, ledger, tx), rx)
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub fn state(&self) -> RunState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> RunStats {
        self.shared.ledger.stats()
    }

    /// Claim the Idle -> Running transition.
    fn begin(&self) -> Result<(), DispatchError> {
        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        if claimed { Ok(()) } else { Err(DispatchError::AlreadyRunning) }
    }

    fn begin_bounded(&self) -> Result<BoundedRun<'_>, DispatchError> {
        self.begin()?;
        let stop = StopSignal::new();
        *self.active() = Some(ActiveRun {
            stop: stop.clone(),
            coordinator: None,
        });
        self.shared.ledger.begin_run();
        Ok(BoundedRun {
            dispatcher: self,
            stop,
        })
    }

    /// Start a continuous run in the background.
    ///
    /// # Errors
    ///
    /// Rejects an empty query, a worker count outside `1..=MAX_WORKERS`, or a
    /// call while another run is active. Nothing is spawned in those cases.
    #[instrument(level = "info", skip(self))]
    pub fn start(&self, query: &str, workers: usize) -> Result<(), DispatchError> {
        let query = SearchQuery::new(query)?;
        validate_workers(workers)?;
        self.begin()?;
        self.shared.ledger.begin_run();

        let stop = StopSignal::new();
        let coordinator = tokio::spawn(run_continuous(
            Arc::clone(&self.shared),
            query,
            workers,
            stop.clone(),
        ));
        *self.active() = Some(ActiveRun {
            stop,
            coordinator: Some(coordinator),
        });
        Ok(())
    }

    /// Ask the current run to stop and wait until the dispatcher is Idle.
    ///
    /// Returns immediately when nothing is running.
    pub async fn stop(&self) {
        let Some(run) = self.active().take() else {
            return;
        };
        info!("Stop requested");
        self.shared.enter_stopping();
        run.stop.trigger();

        if let Some(coordinator) = run.coordinator {
            if let Err(e) = coordinator.await {
                error!(error = %e, "Coordinator task failed");
            }
        }
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == RunState::Idle).await;
        info!(stats = ?self.stats(), "Dispatcher idle");
    }

    /// Run one discovery pass and process up to `max_results` new channels.
    ///
    /// Uses `dispatch.workers` workers. Results come back in completion order.
    ///
    /// # Errors
    ///
    /// Configuration errors as for [`Dispatcher::start`], a drained pool, or a
    /// failure appending to the persisted ledger.
    #[instrument(level = "info", skip(self))]
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<ChannelResult>, DispatchError> {
        let query = SearchQuery::new(query)?;
        validate_workers(self.shared.config.dispatch.workers)?;
        let run = self.begin_bounded()?;
        let shared = &self.shared;

        let discoverer = ChannelDiscoverer::new(
            shared.config.search.clone(),
            shared.pool.clone(),
            run.stop.clone(),
        );
        shared.ledger.record_query();
        let found = discoverer
            .discover(&query, shared.config.search.max_retries)
            .await;
        if found.is_empty() && shared.pool.is_closed() {
            error!("Session pool closed before search could run");
            return Err(PoolError::Closed.into());
        }

        let fresh = shared.ledger.try_insert_up_to(found, max_results);
        shared.log_search(&query, fresh.len()).await;
        let results = self.work_through(fresh, &run.stop).await?;
        info!(results = results.len(), stats = ?self.stats(), "Search complete");
        Ok(results)
    }

    /// Process a fixed list of channels without any discovery.
    ///
    /// Channels the ledger has already seen are skipped. Uses
    /// `dispatch.workers` workers and returns results in completion order.
    ///
    /// # Errors
    ///
    /// As for [`Dispatcher::search`], minus the query check.
    #[instrument(level = "info", skip_all, fields(channels = channels.len()))]
    pub async fn process(&self, channels: Vec<ChannelUrl>) -> Result<Vec<ChannelResult>, DispatchError> {
        validate_workers(self.shared.config.dispatch.workers)?;
        let run = self.begin_bounded()?;
        if self.shared.pool.is_closed() {
            return Err(PoolError::Closed.into());
        }

        let fresh = self.shared.ledger.try_insert_all(channels);
        let results = self.work_through(fresh, &run.stop).await?;
        info!(results = results.len(), stats = ?self.stats(), "Channel list complete");
        Ok(results)
    }

    /// Drain `channels` with a fixed crew and collect what they emit.
    async fn work_through(
        &self,
        channels: Vec<ChannelUrl>,
        stop: &StopSignal,
    ) -> Result<Vec<ChannelResult>, DispatchError> {
        let shared = &self.shared;
        if channels.is_empty() {
            info!("No new channels");
            return Ok(Vec::new());
        }

        let total = channels.len();
        let (tx, mut rx) = mpsc::channel(total);
        let queue: WorkQueue = Arc::new(Mutex::new(VecDeque::from(channels)));
        let mut crew = JoinSet::new();
        for id in 1..=shared.config.dispatch.workers.min(total) {
            crew.spawn(run_worker(
                id,
                Arc::clone(shared),
                Arc::clone(&queue),
                stop.clone(),
                tx.clone(),
            ));
        }
        drop(tx);
        while let Some(joined) = crew.join_next().await {
            log_join(joined);
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        let released = shared.release_unprocessed(&queue);
        if released > 0 {
            info!(released, "Unprocessed channels left for a later run");
        }
        shared.ledger.flush().await?;
        Ok(results)
    }
}

fn validate_workers(workers: usize) -> Result<(), DispatchError> {
    if !(1..=MAX_WORKERS).contains(&workers) {
        return Err(DispatchError::InvalidWorkerCount {
            got: workers,
            max: MAX_WORKERS,
        });
    }
    Ok(())
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Worker panicked");
        } else {
            debug!(error = %e, "Worker cancelled");
        }
    }
}

#[instrument(level = "info", skip_all, fields(query = %query, workers = workers))]
async fn run_continuous(shared: Arc<Shared>, query: SearchQuery, workers: usize, stop: StopSignal) {
    let _idle = IdleOnExit(Arc::clone(&shared));
    let dispatch = &shared.config.dispatch;
    let discoverer = ChannelDiscoverer::new(
        shared.config.search.clone(),
        shared.pool.clone(),
        stop.clone(),
    );
    let queue: WorkQueue = Arc::default();
    let mut crew: JoinSet<()> = JoinSet::new();
    let mut spawned = 0usize;
    info!("Dispatcher running");

    while !stop.is_stopped() {
        while let Some(joined) = crew.try_join_next() {
            log_join(joined);
        }
        if let Err(e) = shared.ledger.flush().await {
            warn!(error = %e, "Failed to append to ledger file");
        }

        shared.ledger.record_query();
        let pause = match discoverer
            .try_discover(&query, shared.config.search.max_retries)
            .await
        {
            Ok(found) => {
                let fresh = shared.ledger.try_insert_all(found);
                shared.log_search(&query, fresh.len()).await;
                info!(new = fresh.len(), queued = lock_queue(&queue).len(), "Discovery pass complete");
                lock_queue(&queue).extend(fresh);

                while crew.len() < workers && !lock_queue(&queue).is_empty() {
                    spawned += 1;
                    crew.spawn(run_worker(
                        spawned,
                        Arc::clone(&shared),
                        Arc::clone(&queue),
                        stop.clone(),
                        shared.results.clone(),
                    ));
                }
                dispatch.pass_interval()
            }
            Err(e) if e.is_cancelled() => break,
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Session pool closed mid-run; shutting down");
                stop.trigger();
                break;
            }
            Err(e) => {
                warn!(error = %e, backoff = ?dispatch.fault_backoff(), "Discovery pass failed");
                dispatch.fault_backoff()
            }
        };

        if !stop.sleep(pause).await {
            break;
        }
    }

    shared.enter_stopping();
    debug!(in_flight = crew.len(), "Waiting for workers");
    while let Some(joined) = crew.join_next().await {
        log_join(joined);
    }
    let released = shared.release_unprocessed(&queue);
    if let Err(e) = shared.ledger.flush().await {
        warn!(error = %e, "Failed to append to ledger file");
    }
    info!(unprocessed = released, stats = ?shared.ledger.stats(), "Dispatcher stopped");
}

#[instrument(level = "info", skip_all, fields(worker = id))]
async fn run_worker(
    id: usize,
    shared: Arc<Shared>,
    queue: WorkQueue,
    stop: StopSignal,
    out: mpsc::Sender<ChannelResult>,
) {
    let extractor = LinkExtractor::new(shared.config.extract.clone(), stop.clone());
    let policy = shared.config.extract.retry_policy();
    let send_timeout = shared.config.dispatch.result_send_timeout();
    let mut handled = 0usize;

    while !stop.is_stopped() {
        let next = lock_queue(&queue).pop_front();
        let Some(channel) = next else {
            break;
        };
        let outcome = policy
            .run(
                "extract",
                &stop,
                |_attempt| extract_once(&shared.pool, &extractor, &channel),
                StageError::is_retryable,
            )
            .await;

        match outcome {
            Ok(telegram) => {
                shared.ledger.record_result(telegram.is_some());
                shared.ledger.settle(&channel);
                emit(&out, ChannelResult::new(channel, telegram), send_timeout).await;
                handled += 1;
            }
            Err(e) if e.is_cancelled() || stop.is_stopped() => {
                debug!(%channel, error = %e, "Stop requested; channel left unprocessed");
                lock_queue(&queue).push_front(channel);
                break;
            }
            Err(e) if e.is_fatal() => {
                error!(%channel, error = %e, "Session pool closed mid-run; shutting down");
                lock_queue(&queue).push_front(channel);
                stop.trigger();
                break;
            }
            Err(e) => {
                warn!(%channel, error = %e, "Channel failed; moving on");
                shared.ledger.record_failure();
                shared.ledger.settle(&channel);
            }
        }
    }
    debug!(handled, "Worker exiting");
}

/// One extraction attempt on a pooled session.
async fn extract_once(
    pool: &SessionPool,
    extractor: &LinkExtractor,
    channel: &ChannelUrl,
) -> Result<Option<TelegramLink>, StageError> {
    let session = pool.acquire().await?;
    let outcome = extractor.extract(&*session, channel).await;
    match &outcome {
        Err(e) if e.poisons_session() => pool.discard(session).await,
        _ => pool.release(session).await,
    }
    Ok(outcome?)
}

async fn emit(out: &mpsc::Sender<ChannelResult>, result: ChannelResult, timeout: Duration) {
    match out.send_timeout(result, timeout).await {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(result)) => {
            warn!(channel = %result.channel, ?timeout, "Result queue full; dropping result");
        }
        Err(SendTimeoutError::Closed(result)) => {
            debug!(channel = %result.channel, "Result receiver gone; dropping result");
        }
    }
}
