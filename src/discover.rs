//! Channel discovery from the search-results page.
//!
//! One pass loads the channel-filtered results for a query, scrolls until the
//! page stops growing, and collects every anchor that points at a channel.
//! If that page loads but lists no channels, the same pass reruns without the
//! filter and keeps only `/@handle` links.

use itertools::Itertools;
use tracing::{debug, info, instrument, warn};

use crate::config::SearchConfig;
use crate::error::{FetchError, StageError};
use crate::fetcher::{PageSession, collect_attribute};
use crate::models::{ChannelUrl, SearchQuery};
use crate::pool::SessionPool;
use crate::retry::RetryPolicy;
use crate::stop::StopSignal;

const RESULTS_SELECTOR: &str = "#contents, ytd-channel-renderer";
/// Channel anchors inside result renderers.
const CHANNEL_ANCHOR_SELECTOR: &str =
    "ytd-channel-renderer a#main-link, ytd-channel-renderer a.channel-link, a#video-title-link, a.yt-simple-endpoint";
/// Any handle link on an unfiltered page.
const HANDLE_ANCHOR_SELECTOR: &str = r#"a[href*="/@"]"#;
const HEIGHT_SCRIPT: &str = "document.documentElement.scrollHeight";
const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.documentElement.scrollHeight);";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Results restricted to channels by the `sp=` facet.
    Facet,
    /// Unfiltered results; only `/@` anchors count.
    Broad,
}

/// Build the results URL for `query`.
pub fn search_url(config: &SearchConfig, query: &SearchQuery, facet: bool) -> String {
    let mut url = format!("{}?search_query={}", config.base_url, query.encoded());
    if facet && !config.channel_filter.is_empty() {
        url.push_str("&sp=");
        url.push_str(&config.channel_filter);
    }
    url
}

pub struct ChannelDiscoverer {
    config: SearchConfig,
    pool: SessionPool,
    stop: StopSignal,
}

impl ChannelDiscoverer {
    pub fn new(config: SearchConfig, pool: SessionPool, stop: StopSignal) -> Self {
        Self { config, pool, stop }
    }

    /// Channels listed for `query`, deduplicated within this call.
    ///
    /// Never fails: when every attempt fails the result is empty.
    pub async fn discover(&self, query: &SearchQuery, max_retries: usize) -> Vec<ChannelUrl> {
        match self.try_discover(query, max_retries).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(%query, error = %e, "Discovery gave up; no channels this pass");
                Vec::new()
            }
        }
    }

    /// Like [`ChannelDiscoverer::discover`], but reports why a pass failed.
    #[instrument(level = "info", skip_all, fields(query = %query, max_retries = max_retries))]
    pub async fn try_discover(
        &self,
        query: &SearchQuery,
        max_retries: usize,
    ) -> Result<Vec<ChannelUrl>, StageError> {
        let policy = RetryPolicy {
            max_attempts: max_retries.max(1),
            ..self.config.retry_policy()
        };
        let channels = policy
            .run(
                "discover",
                &self.stop,
                |_attempt| self.attempt(query),
                StageError::is_retryable,
            )
            .await?;
        info!(count = channels.len(), "Discovered channels");
        Ok(channels)
    }

    async fn attempt(&self, query: &SearchQuery) -> Result<Vec<ChannelUrl>, StageError> {
        if self.stop.is_stopped() {
            return Err(FetchError::Cancelled.into());
        }
        let session = self.pool.acquire().await?;
        let outcome = self.scan_with_fallback(&*session, query).await;
        match &outcome {
            Err(e) if e.poisons_session() => self.pool.discard(session).await,
            _ => self.pool.release(session).await,
        }
        Ok(outcome?)
    }

    async fn scan_with_fallback(
        &self,
        session: &dyn PageSession,
        query: &SearchQuery,
    ) -> Result<Vec<ChannelUrl>, FetchError> {
        let channels = self.scan(session, query, Scan::Facet).await?;
        if !channels.is_empty() || !self.config.fallback_broad_scan {
            return Ok(channels);
        }

        info!("Channel filter returned nothing; falling back to broad scan");
        match self.scan(session, query, Scan::Broad).await {
            Ok(channels) => Ok(channels),
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Broad scan found no results container");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn scan(
        &self,
        session: &dyn PageSession,
        query: &SearchQuery,
        scan: Scan,
    ) -> Result<Vec<ChannelUrl>, FetchError> {
        if self.stop.is_stopped() {
            return Err(FetchError::Cancelled);
        }
        let url = search_url(&self.config, query, scan == Scan::Facet);
        debug!(%url, ?scan, "Loading search results");
        session.navigate(&url).await?;
        session
            .wait_for_element(RESULTS_SELECTOR, self.config.results_timeout())
            .await?;
        self.scroll(session).await?;

        let selector = match scan {
            Scan::Facet => CHANNEL_ANCHOR_SELECTOR,
            Scan::Broad => HANDLE_ANCHOR_SELECTOR,
        };
        let anchors = session.find_all(selector).await?;
        let hrefs = collect_attribute(&anchors, "href").await?;
        let channels: Vec<ChannelUrl> = hrefs
            .iter()
            .filter(|href| scan == Scan::Facet || href.contains("/@"))
            .filter_map(|href| ChannelUrl::parse(href))
            .unique()
            .collect();
        debug!(anchors = hrefs.len(), channels = channels.len(), ?scan, "Collected channel links");
        Ok(channels)
    }

    /// Scroll to the bottom until the document height stops changing.
    ///
    /// Engines without scripting report no height and skip this entirely.
    /// Script failures end scrolling early; only a lost session is an error.
    async fn scroll(&self, session: &dyn PageSession) -> Result<(), FetchError> {
        let Some(mut last_height) = page_height(session).await? else {
            return Ok(());
        };

        for step in 1..=self.config.scroll_steps {
            if let Err(e) = session.execute_script(SCROLL_SCRIPT).await {
                if e.poisons_session() {
                    return Err(e);
                }
                debug!(step, error = %e, "Scroll failed; keeping what is loaded");
                break;
            }
            if !self.stop.sleep(self.config.scroll_pause()).await {
                break;
            }
            match page_height(session).await? {
                Some(height) if height > last_height => last_height = height,
                _ => {
                    debug!(step, "Page height settled");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn page_height(session: &dyn PageSession) -> Result<Option<f64>, FetchError> {
    match session.execute_script(HEIGHT_SCRIPT).await {
        Ok(value) => Ok(value.as_f64()),
        Err(e) if e.poisons_session() => Err(e),
        Err(_) => Ok(None),
    }
}
