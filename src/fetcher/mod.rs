//! Page fetchers: the browser sessions the pipeline drives.
//!
//! The pipeline only ever talks to the [`PageSession`] and [`PageElement`]
//! traits. Two engines implement them:
//!
//! | Engine | Module | Backend | Notes |
//! |--------|--------|---------|-------|
//! | `chrome` | [`chrome`] | chromiumoxide (CDP) | One Chromium process per session; needs the `browser` feature |
//! | `http` | [`snapshot`] | reqwest + scraper | Server-rendered HTML only; clicks and scripts are no-ops |
//!
//! Sessions are created by a [`SessionFactory`] and lent out by
//! [`crate::pool::SessionPool`]; nothing else creates them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BrowserConfig, Engine};
use crate::error::FetchError;

#[cfg(feature = "browser")]
pub mod chrome;
pub mod snapshot;
#[cfg(test)]
pub mod testing;

/// A DOM element handle owned by the session that returned it.
#[async_trait]
pub trait PageElement: Send + Sync {
    async fn attribute(&self, name: &str) -> Result<Option<String>, FetchError>;

    /// Rendered text of the element and its descendants.
    async fn text(&self) -> Result<String, FetchError>;

    async fn click(&self) -> Result<(), FetchError>;
}

pub type Element = Box<dyn PageElement>;

/// One live browser tab.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Load `url` and wait for the document itself.
    async fn navigate(&self, url: &str) -> Result<(), FetchError>;

    /// Wait up to `timeout` for the first element matching `selector`.
    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<Element, FetchError>;

    /// All elements currently matching `selector`; empty if none.
    async fn find_all(&self, selector: &str) -> Result<Vec<Element>, FetchError>;

    async fn execute_script(&self, js: &str) -> Result<serde_json::Value, FetchError>;

    /// Cheap health check used when a session is handed back to the pool.
    async fn is_alive(&self) -> bool;

    async fn close(&self);
}

pub type Session = Box<dyn PageSession>;

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Session, FetchError>;
}

/// Build the session factory for the configured engine.
pub fn build_factory(config: &BrowserConfig) -> Result<Arc<dyn SessionFactory>, FetchError> {
    match config.engine {
        Engine::Http => Ok(Arc::new(snapshot::HttpSessionFactory::new(config)?)),
        #[cfg(feature = "browser")]
        Engine::Chrome => Ok(Arc::new(chrome::ChromeSessionFactory::new(config.clone()))),
        #[cfg(not(feature = "browser"))]
        Engine::Chrome => Err(FetchError::SessionLost(
            "browser support not compiled. Rebuild with: cargo build --features browser".to_string(),
        )),
    }
}

/// Read an attribute from each element, skipping elements that lack it.
pub async fn collect_attribute(elements: &[Element], name: &str) -> Result<Vec<String>, FetchError> {
    let mut values = Vec::with_capacity(elements.len());
    for element in elements {
        match element.attribute(name).await {
            Ok(Some(value)) => values.push(value),
            Ok(None) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(values)
}
