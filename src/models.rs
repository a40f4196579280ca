//! Data models shared by the discovery, extraction and dispatch stages.
//!
//! - [`SearchQuery`]: the user's search term, validated and URL-encoded
//! - [`ChannelUrl`]: a normalized channel address, the unit of work
//! - [`TelegramLink`]: a normalized `t.me` / `telegram.me` link
//! - [`ChannelResult`]: what a worker reports for one channel
//! - [`RunStats`]: counters for one run, guarded by the ledger lock
//!
//! Normalization is done once, at construction, so every value of these types
//! is already canonical and comparing two of them is a plain string compare.

use chrono::{DateTime, Local};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::DispatchError;

/// Host every YouTube channel URL is rewritten to.
pub const YOUTUBE_HOST: &str = "www.youtube.com";

/// A search term as typed by the user.
///
/// Whitespace is trimmed and internal runs collapse to a single space, so
/// `"  music   reviews "` and `"music reviews"` are the same query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery(String);

impl SearchQuery {
    /// Validate and normalize a raw query.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EmptyQuery`] if nothing but whitespace remains.
    pub fn new(raw: &str) -> Result<Self, DispatchError> {
        let normalized = raw.split_whitespace().join(" ");
        if normalized.is_empty() {
            return Err(DispatchError::EmptyQuery);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form-encode the query for a `search_query=` parameter.
    ///
    /// Words are percent-encoded individually and joined with `+`.
    pub fn encoded(&self) -> String {
        self.0
            .split(' ')
            .map(|word| urlencoding::encode(word).into_owned())
            .join("+")
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A canonical YouTube channel address.
///
/// Only the identifying part of the path is kept: `/@handle`,
/// `/channel/<id>`, `/user/<name>` or `/c/<name>`. Tabs such as `/videos`,
/// `/featured` or `/about`, query strings and fragments are dropped, and the
/// host is rewritten to [`YOUTUBE_HOST`] over `https`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelUrl(String);

impl ChannelUrl {
    /// Normalize a raw anchor `href`.
    ///
    /// Root-relative hrefs (`/@name`) are resolved against `https://www.youtube.com`.
    /// Anything else without a scheme is skipped, as is any URL whose path does
    /// not identify a channel.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) if raw.starts_with('/') => {
                let base = Url::parse(&format!("https://{YOUTUBE_HOST}")).ok()?;
                base.join(raw).ok()?
            }
            Err(_) => return None,
        };

        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?;
        if !is_youtube_host(host) {
            return None;
        }

        let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
        let identity = match segments.as_slice() {
            [handle, ..] if handle.starts_with('@') && handle.len() > 1 => handle.to_string(),
            [kind @ ("channel" | "user" | "c"), name, ..] => format!("{kind}/{name}"),
            _ => return None,
        };

        Some(Self(format!("https://{YOUTUBE_HOST}/{identity}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The channel's "About" tab.
    pub fn about_url(&self) -> String {
        format!("{}/about", self.0)
    }

    /// Reconstruct from a line of the persisted ledger, re-normalizing it.
    pub fn from_ledger_line(line: &str) -> Option<Self> {
        Self::parse(line)
    }
}

impl fmt::Display for ChannelUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_youtube_host(host: &str) -> bool {
    matches!(host, "youtube.com" | "www.youtube.com" | "m.youtube.com")
}

/// A canonical Telegram link.
///
/// Always `https://t.me/<path>` or `https://telegram.me/<path>`, with no
/// query string, fragment or trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelegramLink(String);

impl TelegramLink {
    /// Normalize anything that looks like a Telegram reference.
    ///
    /// Accepts full URLs (`https://t.me/x`), scheme-less URLs (`t.me/x`),
    /// `@handle` and bare handles. Returns `None` for anything pointing
    /// elsewhere or carrying an empty path.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let link = TelegramLink::normalize("@mychannel99").unwrap();
    /// assert_eq!(link.as_str(), "https://t.me/mychannel99");
    /// ```
    pub fn normalize(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let without_scheme = match raw.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => rest,
            Some(_) => return None,
            None => raw,
        };

        let (host, path) = match without_scheme.split_once('/') {
            Some((host, path)) => {
                let host = host.to_ascii_lowercase();
                let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
                if host != "t.me" && host != "telegram.me" {
                    return None;
                }
                (host, path)
            }
            None => {
                let handle = without_scheme.strip_prefix('@').unwrap_or(without_scheme);
                if !is_handle(handle) {
                    return None;
                }
                ("t.me".to_string(), handle)
            }
        };

        let path = path
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        if path.is_empty() {
            return None;
        }

        Some(Self(format!("https://{host}/{path}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TelegramLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_handle(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The outcome of processing one channel.
///
/// `telegram` is `None` when every extraction strategy came back empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResult {
    pub channel: ChannelUrl,
    pub telegram: Option<TelegramLink>,
    pub found_at: DateTime<Local>,
}

impl ChannelResult {
    pub fn new(channel: ChannelUrl, telegram: Option<TelegramLink>) -> Self {
        Self {
            channel,
            telegram,
            found_at: Local::now(),
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Discovery passes issued against the search page.
    pub total_queries: u64,
    /// Distinct channels that made it past the ledger.
    pub total_channels_found: u64,
    /// Channels for which a Telegram link was extracted.
    pub total_links_found: u64,
    /// Channels that produced a [`ChannelResult`].
    pub channels_processed: u64,
    /// Channels dropped because extraction failed outright.
    pub channels_failed: u64,
    pub last_search_time: Option<DateTime<Local>>,
}
