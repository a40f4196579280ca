//! Plain-HTTP page fetcher backed by `scraper`.
//!
//! The page is fetched once per navigation and every query re-parses the
//! stored HTML; `scraper::Html` is not `Send`, so no parsed tree is kept
//! across an await point.

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{Element, PageElement, PageSession, Session, SessionFactory};
use crate::config::BrowserConfig;
use crate::error::FetchError;

/// An element captured from a parsed document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotElement {
    pub attrs: HashMap<String, String>,
    pub text: String,
}

#[async_trait]
impl PageElement for SnapshotElement {
    async fn attribute(&self, name: &str) -> Result<Option<String>, FetchError> {
        Ok(self.attrs.get(name).cloned())
    }

    async fn text(&self) -> Result<String, FetchError> {
        Ok(self.text.clone())
    }

    async fn click(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Evaluate a CSS selector against an HTML document.
pub fn select(html: &str, selector: &str) -> Result<Vec<SnapshotElement>, FetchError> {
    let parsed = Selector::parse(selector)
        .map_err(|e| FetchError::Script(format!("invalid selector `{selector}`: {e}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&parsed)
        .map(|element| SnapshotElement {
            attrs: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            text: element.text().collect::<Vec<_>>().join(" ").trim().to_string(),
        })
        .collect())
}

/// Box the first match, or report `selector` as missing.
pub fn first_match(html: &str, selector: &str, timeout: Duration) -> Result<Element, FetchError> {
    select(html, selector)?
        .into_iter()
        .next()
        .map(|e| Box::new(e) as Element)
        .ok_or_else(|| FetchError::Timeout {
            selector: selector.to_string(),
            timeout,
        })
}

pub fn boxed(elements: Vec<SnapshotElement>) -> Vec<Element> {
    elements.into_iter().map(|e| Box::new(e) as Element).collect()
}

pub struct HttpSessionFactory {
    client: Client,
}

impl HttpSessionFactory {
    pub fn new(config: &BrowserConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.page_load_timeout())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn create(&self) -> Result<Session, FetchError> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            html: Mutex::new(String::new()),
        }))
    }
}

/// A "session" that holds the last fetched document.
pub struct HttpSession {
    client: Client,
    html: Mutex<String>,
}

impl HttpSession {
    fn html(&self) -> String {
        self.html
            .lock()
            .map(|html| html.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PageSession for HttpSession {
    #[instrument(level = "debug", skip(self))]
    async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Navigation {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        let body = response.text().await?;
        debug!(bytes = body.len(), "Fetched page");
        if let Ok(mut html) = self.html.lock() {
            *html = body;
        }
        Ok(())
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<Element, FetchError> {
        first_match(&self.html(), selector, timeout)
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Element>, FetchError> {
        Ok(boxed(select(&self.html(), selector)?))
    }

    async fn execute_script(&self, _js: &str) -> Result<serde_json::Value, FetchError> {
        Ok(serde_json::Value::Null)
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) {}
}
