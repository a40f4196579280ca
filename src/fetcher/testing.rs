//! Scripted in-memory sessions for tests.
//!
//! A [`FakeWeb`] maps URLs to HTML and answers selectors through the snapshot
//! engine's [`select`]. It counts live sessions (and the peak), creations and
//! navigations so tests can assert pool bounds and stop behaviour.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::snapshot::{boxed, first_match, select};
use super::{Element, PageSession, Session, SessionFactory};
use crate::error::FetchError;

const BLANK: &str = "<html><body></body></html>";

#[derive(Default)]
pub struct FakeWeb {
    pages: HashMap<String, String>,
    latency: Duration,
    deadly: HashSet<String>,
    heights: Vec<f64>,
    height_reads: AtomicUsize,
    scrolls: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
    created: AtomicUsize,
    navigations: Mutex<Vec<String>>,
}

impl FakeWeb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    /// Every navigation takes `latency` of (tokio) time.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Navigating to `url` kills the session.
    pub fn deadly(mut self, url: impl Into<String>) -> Self {
        self.deadly.insert(url.into());
        self
    }

    /// Successive document heights reported to scripts that read
    /// `scrollHeight`; the last value repeats. Defaults to a constant 1000.
    pub fn heights(mut self, heights: &[f64]) -> Self {
        self.heights = heights.to_vec();
        self
    }

    /// Scripts that scrolled the window.
    pub fn scrolls(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    fn next_height(&self) -> f64 {
        let read = self.height_reads.fetch_add(1, Ordering::SeqCst);
        self.heights
            .get(read)
            .or(self.heights.last())
            .copied()
            .unwrap_or(1000.0)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    pub fn navigation_count(&self) -> usize {
        self.navigations.lock().unwrap().len()
    }
}

pub struct FakeFactory(pub Arc<FakeWeb>);

impl FakeFactory {
    pub fn new(web: FakeWeb) -> (Arc<Self>, Arc<FakeWeb>) {
        let web = Arc::new(web);
        (Arc::new(Self(Arc::clone(&web))), web)
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn create(&self) -> Result<Session, FetchError> {
        let web = &self.0;
        web.created.fetch_add(1, Ordering::SeqCst);
        let live = web.live.fetch_add(1, Ordering::SeqCst) + 1;
        web.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            web: Arc::clone(web),
            html: Mutex::new(BLANK.to_string()),
            dead: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeSession {
    web: Arc<FakeWeb>,
    html: Mutex<String>,
    dead: AtomicBool,
    closed: AtomicBool,
}

impl FakeSession {
    fn html(&self) -> String {
        self.html.lock().unwrap().clone()
    }

    fn check_alive(&self) -> Result<(), FetchError> {
        if self.dead.load(Ordering::SeqCst) {
            Err(FetchError::SessionLost("fake browser crashed".to_string()))
        } else {
            Ok(())
        }
    }

    fn release_slot(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.web.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.release_slot();
    }
}

#[async_trait]
impl PageSession for FakeSession {
    async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        self.check_alive()?;
        self.web.navigations.lock().unwrap().push(url.to_string());
        if !self.web.latency.is_zero() {
            tokio::time::sleep(self.web.latency).await;
        }
        if self.web.deadly.contains(url) {
            self.dead.store(true, Ordering::SeqCst);
            return Err(FetchError::SessionLost(format!("crashed loading {url}")));
        }
        let html = self
            .web
            .pages
            .get(url)
            .cloned()
            .unwrap_or_else(|| BLANK.to_string());
        *self.html.lock().unwrap() = html;
        Ok(())
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<Element, FetchError> {
        self.check_alive()?;
        first_match(&self.html(), selector, timeout)
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Element>, FetchError> {
        self.check_alive()?;
        Ok(boxed(select(&self.html(), selector)?))
    }

    async fn execute_script(&self, js: &str) -> Result<serde_json::Value, FetchError> {
        self.check_alive()?;
        if js.contains("scrollTo") {
            self.web.scrolls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        } else if js.contains("scrollHeight") {
            Ok(serde_json::Value::from(self.web.next_height()))
        } else {
            Ok(serde_json::Value::Null)
        }
    }

    async fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.release_slot();
    }
}

/// A channel page carrying a redirect-wrapped Telegram link.
pub fn redirect_page(target: &str) -> String {
    format!(
        r#"<html><body><a href="https://www.youtube.com/redirect?event=channel_description&q={}">link</a></body></html>"#,
        urlencoding::encode(target)
    )
}

/// A channel page whose description text is `text`.
pub fn description_page(text: &str) -> String {
    format!(r#"<html><body><div id="description">{text}</div></body></html>"#)
}

/// A search-results page listing `hrefs` as channel renderers.
pub fn results_page(hrefs: &[&str]) -> String {
    let items: String = hrefs
        .iter()
        .map(|href| {
            format!(r#"<ytd-channel-renderer><a id="main-link" class="channel-link" href="{href}">c</a></ytd-channel-renderer>"#)
        })
        .collect();
    format!(r#"<html><body><div id="contents">{items}</div></body></html>"#)
}
