//! Headless Chromium sessions over CDP.
//!
//! Each session owns its own browser process and a single tab. Processes are
//! started with the flags the scraper has always used (headless, no GPU, no
//! sandbox, muted, 1920x1080) and a private profile directory so concurrent
//! sessions never share state. The profile directory lives exactly as long as
//! the session.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig as CdpConfig, Page};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, instrument, warn};

use super::{Element, PageElement, PageSession, Session, SessionFactory};
use crate::config::BrowserConfig;
use crate::error::FetchError;

const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// Interval between `find_element` polls while waiting for a selector.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

const ALIVE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const PROFILE_PREFIX: &str = "tg_scout-";

fn find_chrome() -> Option<PathBuf> {
    CHROME_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

/// A fresh profile directory, removed when the returned value is dropped.
fn profile_dir() -> Result<TempDir, FetchError> {
    tempfile::Builder::new()
        .prefix(PROFILE_PREFIX)
        .tempdir()
        .map_err(|e| FetchError::SessionLost(format!("cannot create browser profile: {e}")))
}

/// Translate a CDP failure into the crate's error taxonomy.
fn map_cdp(e: CdpError, context: &str) -> FetchError {
    match &e {
        CdpError::NotFound => FetchError::NotFound(context.to_string()),
        CdpError::Timeout => FetchError::Timeout {
            selector: context.to_string(),
            timeout: Duration::ZERO,
        },
        CdpError::JavascriptException(details) => FetchError::Script(format!("{details:?}")),
        CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
            FetchError::SessionLost(e.to_string())
        }
        _ => FetchError::Navigation {
            url: context.to_string(),
            reason: e.to_string(),
        },
    }
}

pub struct ChromeSessionFactory {
    config: BrowserConfig,
}

impl ChromeSessionFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn launch_config(&self, profile: &Path) -> Result<CdpConfig, FetchError> {
        let mut builder = CdpConfig::builder()
            .user_data_dir(profile)
            .window_size(1920, 1080)
            .request_timeout(self.config.page_load_timeout());

        // `with_head` means NOT headless
        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = self.config.executable.clone().or_else(find_chrome) {
            builder = builder.chrome_executable(path);
        }

        builder = builder
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-notifications")
            .arg("--mute-audio")
            .arg("--log-level=3")
            .arg("--disable-blink-features=AutomationControlled");
        for arg in &self.config.extra_args {
            builder = builder.arg(arg);
        }

        builder
            .build()
            .map_err(|e| FetchError::SessionLost(format!("invalid browser config: {e}")))
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    #[instrument(level = "info", skip_all)]
    async fn create(&self) -> Result<Session, FetchError> {
        let profile = profile_dir()?;
        let config = self.launch_config(profile.path())?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::SessionLost(format!("failed to launch browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| map_cdp(e, "about:blank"))?;
        page.execute(SetUserAgentOverrideParams::new(self.config.user_agent.clone()))
            .await
            .map_err(|e| map_cdp(e, "user agent"))?;

        info!(
            headless = self.config.headless,
            profile = %profile.path().display(),
            "Launched browser session"
        );
        Ok(Box::new(ChromeSession {
            browser: Mutex::new(browser),
            page,
            handler,
            page_load_timeout: self.config.page_load_timeout(),
            profile,
        }))
    }
}

pub struct ChromeSession {
    browser: Mutex<Browser>,
    page: Page,
    handler: JoinHandle<()>,
    page_load_timeout: Duration,
    /// Dropped after the browser, taking the profile directory with it.
    profile: TempDir,
}

struct ChromeElement(chromiumoxide::Element);

#[async_trait]
impl PageElement for ChromeElement {
    async fn attribute(&self, name: &str) -> Result<Option<String>, FetchError> {
        self.0.attribute(name).await.map_err(|e| map_cdp(e, name))
    }

    async fn text(&self) -> Result<String, FetchError> {
        Ok(self
            .0
            .inner_text()
            .await
            .map_err(|e| map_cdp(e, "inner_text"))?
            .unwrap_or_default())
    }

    async fn click(&self) -> Result<(), FetchError> {
        self.0.click().await.map(|_| ()).map_err(|e| map_cdp(e, "click"))
    }
}

#[async_trait]
impl PageSession for ChromeSession {
    #[instrument(level = "debug", skip(self))]
    async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        if self.handler.is_finished() {
            return Err(FetchError::SessionLost("CDP handler exited".to_string()));
        }
        match timeout(self.page_load_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(map_cdp(e, url)),
            Err(_) => Err(FetchError::Timeout {
                selector: url.to_string(),
                timeout: self.page_load_timeout,
            }),
        }
    }

    async fn wait_for_element(&self, selector: &str, wait: Duration) -> Result<Element, FetchError> {
        let deadline = Instant::now() + wait;
        loop {
            match self.page.find_element(selector).await {
                Ok(element) => return Ok(Box::new(ChromeElement(element))),
                Err(e) => {
                    let e = map_cdp(e, selector);
                    if e.poisons_session() {
                        return Err(e);
                    }
                }
            }
            if Instant::now() >= deadline {
                debug!(selector, ?wait, "Selector wait timed out");
                return Err(FetchError::Timeout {
                    selector: selector.to_string(),
                    timeout: wait,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Element>, FetchError> {
        match self.page.find_elements(selector).await {
            Ok(elements) => Ok(elements
                .into_iter()
                .map(|e| Box::new(ChromeElement(e)) as Element)
                .collect()),
            Err(e) => {
                let e = map_cdp(e, selector);
                if e.is_transient() { Ok(Vec::new()) } else { Err(e) }
            }
        }
    }

    async fn execute_script(&self, js: &str) -> Result<serde_json::Value, FetchError> {
        let result = self.page.evaluate(js).await.map_err(|e| map_cdp(e, "evaluate"))?;
        Ok(result.into_value::<serde_json::Value>().unwrap_or(serde_json::Value::Null))
    }

    async fn is_alive(&self) -> bool {
        if self.handler.is_finished() {
            return false;
        }
        matches!(timeout(ALIVE_CHECK_TIMEOUT, self.page.evaluate("1")).await, Ok(Ok(_)))
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            debug!(error = %e, "Page close failed");
        }
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(error = %e, "Browser close failed");
        }
        let _ = browser.wait().await;
        self.handler.abort();
        debug!(profile = %self.profile.path().display(), "Browser closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_dir_is_removed_on_drop() {
        let first = profile_dir().unwrap();
        let second = profile_dir().unwrap();
        let path = first.path().to_path_buf();

        assert!(path.is_dir());
        assert_ne!(path, second.path());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(PROFILE_PREFIX), "{name}");

        drop(first);
        assert!(!path.exists());
        assert!(second.path().is_dir());
    }
}
