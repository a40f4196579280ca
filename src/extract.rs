//! Telegram link extraction from a channel's pages.
//!
//! Three strategies run in a fixed order and the first hit wins:
//!
//! | # | Strategy | Page | Looks at |
//! |---|----------|------|----------|
//! | 1 | [`Strategy::Redirect`] | channel | `/redirect?q=` links whose target is Telegram |
//! | 2 | [`Strategy::AboutPanel`] | `<channel>/about` | every anchor, after expanding "show more" |
//! | 3 | [`Strategy::Description`] | channel | description text, matched against [`TEXT_PATTERNS`] |
//!
//! A strategy that times out or can't find its elements simply found nothing.
//! A page that fails to load is skipped too, but if *every* strategy failed to
//! load its page the channel is reported as an error so the caller can retry it.
//! A lost session and a stop request always propagate immediately.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::ExtractConfig;
use crate::error::FetchError;
use crate::fetcher::{PageSession, collect_attribute};
use crate::models::{ChannelUrl, TelegramLink, YOUTUBE_HOST};
use crate::stop::StopSignal;
use crate::utils::truncate_for_log;

const READY_SELECTOR: &str = "body";
const REDIRECT_SELECTOR: &str = r#"a[href*="/redirect"]"#;
const SHOW_MORE_SELECTOR: &str =
    "button#expand, tp-yt-paper-button#expand, paper-button#more, #description-container button";
const DESCRIPTION_SELECTORS: &[&str] = &[
    "#description",
    "yt-formatted-string.description",
    "#description-container",
];
const META_DESCRIPTION_SELECTOR: &str = r#"meta[name="description"]"#;

/// Description-text patterns in priority order, with the capture group to keep.
///
/// The `@handle` pattern refuses a preceding word character or dot so email
/// addresses don't turn into handles.
pub static TEXT_PATTERNS: Lazy<Vec<(Regex, usize)>> = Lazy::new(|| {
    [
        (r"https?://(?:www\.)?t\.me/[A-Za-z0-9_\-]+", 0),
        (r"https?://(?:www\.)?telegram\.me/[A-Za-z0-9_\-]+", 0),
        (r"(?:^|[^A-Za-z0-9_.])@([A-Za-z0-9_\-]{5,32})", 1),
        (r"t\.me/[A-Za-z0-9_\-]{5,32}", 0),
        (r"telegram\.me/[A-Za-z0-9_\-]{5,32}", 0),
    ]
    .into_iter()
    .filter_map(|(pattern, group)| Regex::new(pattern).ok().map(|re| (re, group)))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Redirect,
    AboutPanel,
    Description,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [Strategy::Redirect, Strategy::AboutPanel, Strategy::Description];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Redirect => "redirect",
            Strategy::AboutPanel => "about_panel",
            Strategy::Description => "description",
        })
    }
}

/// Decode the destination of a platform redirect link.
///
/// Accepts absolute and root-relative hrefs. Returns `None` when `href` is not
/// a `/redirect` link or carries no `q` parameter.
pub fn decode_redirect(href: &str) -> Option<String> {
    let url = if href.starts_with('/') {
        Url::parse(&format!("https://{YOUTUBE_HOST}{href}")).ok()?
    } else {
        Url::parse(href).ok()?
    };
    if !url.host_str()?.ends_with("youtube.com") || url.path() != "/redirect" {
        return None;
    }
    let target = url
        .query_pairs()
        .find(|(key, _)| key == "q")
        .map(|(_, value)| value.into_owned())?;

    // some links arrive encoded twice
    if !target.contains("://") && target.contains('%') {
        return urlencoding::decode(&target).ok().map(|t| t.into_owned());
    }
    Some(target)
}

fn has_telegram_marker(s: &str) -> bool {
    s.contains("t.me/") || s.contains("telegram.me/")
}

/// Turn an anchor href into a Telegram link, unwrapping redirects.
pub fn telegram_from_href(href: &str) -> Option<TelegramLink> {
    let target = decode_redirect(href).unwrap_or_else(|| href.to_string());
    if !has_telegram_marker(&target) {
        return None;
    }
    TelegramLink::normalize(&target)
}

/// Find the first Telegram reference in free text.
///
/// Patterns are tried in [`TEXT_PATTERNS`] order; within a pattern the
/// earliest match wins.
pub fn find_in_text(text: &str) -> Option<TelegramLink> {
    TEXT_PATTERNS.iter().find_map(|(re, group)| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(*group))
            .find_map(|m| TelegramLink::normalize(m.as_str()))
    })
}

/// Runs the strategies against one pooled session.
#[derive(Debug, Clone)]
pub struct LinkExtractor {
    config: ExtractConfig,
    stop: StopSignal,
}

impl LinkExtractor {
    pub fn new(config: ExtractConfig, stop: StopSignal) -> Self {
        Self { config, stop }
    }

    /// Extract a Telegram link for `channel`, or `None` if it has none.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] if a stop arrived before a navigation
    /// - [`FetchError::SessionLost`] (or any other non-page error) as-is
    /// - the last page failure, when no strategy could load its page
    #[instrument(level = "info", skip_all, fields(channel = %channel))]
    pub async fn extract(
        &self,
        session: &dyn PageSession,
        channel: &ChannelUrl,
    ) -> Result<Option<TelegramLink>, FetchError> {
        let mut last_page_failure = None;
        let mut any_loaded = false;

        for strategy in Strategy::ORDER {
            let outcome = match strategy {
                Strategy::Redirect => self.via_redirect(session, channel).await,
                Strategy::AboutPanel => self.via_about_panel(session, channel).await,
                Strategy::Description => self.via_description(session, channel).await,
            };
            match outcome {
                Ok(Some(link)) => {
                    info!(%strategy, %link, "Found Telegram link");
                    return Ok(Some(link));
                }
                Ok(None) => {
                    any_loaded = true;
                    debug!(%strategy, "Strategy found nothing");
                }
                Err(e) if e.is_transient() => {
                    any_loaded = true;
                    debug!(%strategy, error = %e, "Strategy gave up");
                }
                Err(e) if e.is_page_failure() => {
                    warn!(%strategy, error = %e, "Page failed to load; trying next strategy");
                    last_page_failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_page_failure {
            Some(e) if !any_loaded => Err(e),
            _ => {
                info!("No Telegram link found");
                Ok(None)
            }
        }
    }

    /// Navigate and wait for the document body, unless stopping.
    async fn open(&self, session: &dyn PageSession, url: &str) -> Result<(), FetchError> {
        if self.stop.is_stopped() {
            return Err(FetchError::Cancelled);
        }
        session.navigate(url).await?;
        session
            .wait_for_element(READY_SELECTOR, self.config.strategy_timeout())
            .await?;
        Ok(())
    }

    /// Click "show more" if it shows up in time; its absence is fine.
    async fn expand_show_more(&self, session: &dyn PageSession) -> Result<(), FetchError> {
        let button = match session
            .wait_for_element(SHOW_MORE_SELECTOR, self.config.show_more_timeout())
            .await
        {
            Ok(button) => button,
            Err(e) if e.poisons_session() => return Err(e),
            Err(_) => return Ok(()),
        };
        match button.click().await {
            Ok(()) => {
                self.stop.sleep(self.config.settle()).await;
                Ok(())
            }
            Err(e) if e.poisons_session() => Err(e),
            Err(e) => {
                debug!(error = %e, "Could not expand description");
                Ok(())
            }
        }
    }

    async fn via_redirect(
        &self,
        session: &dyn PageSession,
        channel: &ChannelUrl,
    ) -> Result<Option<TelegramLink>, FetchError> {
        self.open(session, channel.as_str()).await?;
        let anchors = session.find_all(REDIRECT_SELECTOR).await?;
        let hrefs = collect_attribute(&anchors, "href").await?;
        Ok(hrefs
            .iter()
            .filter_map(|href| decode_redirect(href))
            .filter(|target| has_telegram_marker(target))
            .find_map(|target| TelegramLink::normalize(&target)))
    }

    async fn via_about_panel(
        &self,
        session: &dyn PageSession,
        channel: &ChannelUrl,
    ) -> Result<Option<TelegramLink>, FetchError> {
        self.open(session, &channel.about_url()).await?;
        self.expand_show_more(session).await?;
        let anchors = session.find_all("a[href]").await?;
        let hrefs = collect_attribute(&anchors, "href").await?;
        Ok(hrefs.iter().find_map(|href| telegram_from_href(href)))
    }

    async fn via_description(
        &self,
        session: &dyn PageSession,
        channel: &ChannelUrl,
    ) -> Result<Option<TelegramLink>, FetchError> {
        self.open(session, channel.as_str()).await?;
        self.expand_show_more(session).await?;

        for selector in DESCRIPTION_SELECTORS {
            for element in session.find_all(selector).await? {
                let text = element.text().await?;
                debug!(selector, text = %truncate_for_log(&text, 120), "Read description");
                if let Some(link) = find_in_text(&text) {
                    return Ok(Some(link));
                }
            }
        }

        let metas = session.find_all(META_DESCRIPTION_SELECTOR).await?;
        let contents = collect_attribute(&metas, "content").await?;
        Ok(contents.iter().find_map(|content| find_in_text(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::SessionFactory;
    use crate::fetcher::testing::{FakeFactory, FakeWeb, description_page, redirect_page};
    use std::sync::Arc;

    fn channel(raw: &str) -> ChannelUrl {
        ChannelUrl::parse(raw).unwrap()
    }

    fn extractor() -> LinkExtractor {
        LinkExtractor::new(ExtractConfig::default(), StopSignal::new())
    }

    async fn run(web: FakeWeb, url: &ChannelUrl) -> (Result<Option<TelegramLink>, FetchError>, Arc<FakeWeb>) {
        let (factory, web) = FakeFactory::new(web);
        let session = factory.create().await.unwrap();
        let result = extractor().extract(session.as_ref(), url).await;
        (result, web)
    }

    #[test]
    fn test_decode_redirect() {
        let href = "https://www.youtube.com/redirect?event=channel_description&q=https%3A%2F%2Ft.me%2Fmychan&v=1";
        assert_eq!(decode_redirect(href).as_deref(), Some("https://t.me/mychan"));
        assert_eq!(
            decode_redirect("/redirect?q=https%253A%252F%252Ft.me%252Fdouble").as_deref(),
            Some("https://t.me/double")
        );
        assert!(decode_redirect("https://www.youtube.com/watch?v=1").is_none());
        assert!(decode_redirect("https://evil.example/redirect?q=x").is_none());
        assert!(decode_redirect("https://www.youtube.com/redirect?event=x").is_none());
    }

    #[test]
    fn test_telegram_from_href() {
        assert_eq!(
            telegram_from_href("https://t.me/direct_link/").unwrap().as_str(),
            "https://t.me/direct_link"
        );
        assert_eq!(
            telegram_from_href("https://www.youtube.com/redirect?q=https%3A%2F%2Ftelegram.me%2Fwrapped%3Fx%3D1")
                .unwrap()
                .as_str(),
            "https://telegram.me/wrapped"
        );
        assert!(telegram_from_href("https://www.youtube.com/redirect?q=https%3A%2F%2Finstagram.com%2Fx").is_none());
        assert!(telegram_from_href("https://twitter.com/someone").is_none());
    }

    #[test]
    fn test_find_in_text_handle() {
        assert_eq!(
            find_in_text("contact me at @mychannel99").unwrap().as_str(),
            "https://t.me/mychannel99"
        );
    }

    #[test]
    fn test_find_in_text_pattern_priority() {
        let text = "follow @firsthandle or https://t.me/full_link";
        assert_eq!(find_in_text(text).unwrap().as_str(), "https://t.me/full_link");

        let text = "bare t.me/barehandle and telegram.me/otherhandle";
        assert_eq!(find_in_text(text).unwrap().as_str(), "https://t.me/barehandle");

        let text = "only telegram.me/otherhandle here";
        assert_eq!(find_in_text(text).unwrap().as_str(), "https://telegram.me/otherhandle");
    }

    #[test]
    fn test_find_in_text_ignores_short_handles_and_emails() {
        assert!(find_in_text("ping @abc").is_none());
        assert!(find_in_text("mail me: someone@example.com").is_none());
        assert!(find_in_text("nothing to see").is_none());
        assert_eq!(
            find_in_text("@leading_handle at start").unwrap().as_str(),
            "https://t.me/leading_handle"
        );
    }

    #[tokio::test]
    async fn test_redirect_strategy_wins_over_description() {
        let url = channel("https://youtube.com/@both");
        let html = format!(
            "{}<div id=\"description\">also @descriptionhandle</div>",
            redirect_page("https://t.me/from_redirect")
        );
        let (result, web) = run(FakeWeb::new().page(url.as_str(), html), &url).await;
        assert_eq!(result.unwrap().unwrap().as_str(), "https://t.me/from_redirect");
        assert_eq!(web.navigations(), vec![url.as_str().to_string()]);
    }

    #[tokio::test]
    async fn test_about_panel_strategy() {
        let url = channel("https://youtube.com/@aboutonly");
        let about = r#"<html><body><a href="https://instagram.com/x">ig</a><a href="https://t.me/about_link?x=1">tg</a></body></html>"#;
        let (result, web) = run(FakeWeb::new().page(url.about_url(), about), &url).await;
        assert_eq!(result.unwrap().unwrap().as_str(), "https://t.me/about_link");
        assert_eq!(web.navigation_count(), 2);
    }

    #[tokio::test]
    async fn test_description_strategy() {
        let url = channel("https://youtube.com/@desc");
        let web = FakeWeb::new().page(url.as_str(), description_page("contact me at @mychannel99"));
        let (result, web) = run(web, &url).await;
        assert_eq!(result.unwrap().unwrap().as_str(), "https://t.me/mychannel99");
        assert_eq!(web.navigation_count(), 3);
    }

    #[tokio::test]
    async fn test_meta_description_fallback() {
        let url = channel("https://youtube.com/@meta");
        let html = r#"<html><head><meta name="description" content="Join t.me/meta_channel today"></head><body></body></html>"#;
        let (result, _) = run(FakeWeb::new().page(url.as_str(), html), &url).await;
        assert_eq!(result.unwrap().unwrap().as_str(), "https://t.me/meta_channel");
    }

    #[tokio::test]
    async fn test_not_found_is_none_not_error() {
        let url = channel("https://youtube.com/@nothing");
        let (result, web) = run(FakeWeb::new(), &url).await;
        assert!(result.unwrap().is_none());
        assert_eq!(web.navigation_count(), 3);
    }

    #[tokio::test]
    async fn test_session_loss_propagates() {
        let url = channel("https://youtube.com/@crash");
        let (result, web) = run(FakeWeb::new().deadly(url.as_str()), &url).await;
        assert!(matches!(result, Err(FetchError::SessionLost(_))));
        assert_eq!(web.navigation_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_prevents_navigation() {
        let (factory, web) = FakeFactory::new(FakeWeb::new());
        let session = factory.create().await.unwrap();
        let stop = StopSignal::new();
        stop.trigger();
        let extractor = LinkExtractor::new(ExtractConfig::default(), stop);
        let result = extractor.extract(session.as_ref(), &channel("/@stopped")).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(web.navigation_count(), 0);
    }
}
