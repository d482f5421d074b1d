//! Listing page fetcher.
//!
//! One GET per check against a normalized, newest-first version of the
//! task URL, then a scrape of the listing cards into [`Item`]s.

use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::config::FetcherConfig;

/// Promoted cards the feed layout renders ahead of the real listings.
pub const DEFAULT_SKIP_CARDS: usize = 4;

/// Query parameters forced onto every fetch so results are newest-first.
const FORCED_PARAMS: [(&str, &str); 3] = [
    ("sorting", "bumped_at+desc"),
    ("items_view", "list"),
    ("page", "1"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub price: String,
    pub location: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("url does not point at the listing site: {0}")]
    InvalidSource(String),

    #[error("{0}")]
    FetchFailed(String),
}

/// Anything that can produce the current listings for a URL.
///
/// `Ok(None)` means the page was reachable but held no listings.
#[async_trait::async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch(&self, url: &str, limit: usize) -> Result<Option<Vec<Item>>, FetchError>;
}

pub struct ListingFetcher {
    client: reqwest::Client,
    host_marker: String,
    skip_cards: usize,
}

impl ListingFetcher {
    pub fn new(config: &FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            host_marker: config.host_marker.clone(),
            skip_cards: config.skip_cards,
        })
    }
}

#[async_trait::async_trait]
impl ListingSource for ListingFetcher {
    async fn fetch(&self, url: &str, limit: usize) -> Result<Option<Vec<Item>>, FetchError> {
        if !url.contains(&self.host_marker) {
            return Err(FetchError::InvalidSource(url.to_string()));
        }
        let url = normalize_url(url);
        tracing::debug!(%url, "Fetching listings");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::FetchFailed(format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| FetchError::FetchFailed(format!("HTTP error: {e}")))?;
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::FetchFailed(format!("response read failed: {e}")))?;

        parse_listings(&body, self.skip_cards, limit)
    }
}

/// Rebuild `url` with the forced sort/view/page parameters.
///
/// A query with any pair lacking exactly one `=` is dropped entirely, keeping
/// only the base path. Other pairs keep their order and raw encoding. Any
/// `#fragment` is dropped.
pub fn normalize_url(url: &str) -> String {
    let url = url.split_once('#').map_or(url, |(before, _)| before);
    let (base, query) = url.split_once('?').unwrap_or((url, ""));

    let mut params: Vec<(&str, &str)> = Vec::new();
    for pair in query.split('&') {
        let mut parts = pair.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(v), None) => params.push((k, v)),
            _ => {
                params.clear();
                break;
            }
        }
    }

    params.retain(|(k, _)| !FORCED_PARAMS.iter().any(|(f, _)| f == k));
    params.extend(FORCED_PARAMS);

    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

/// Scrape listing cards out of a results page.
///
/// The first `skip` cards are dropped. A card with missing markup fails the
/// whole page.
pub fn parse_listings(
    html: &str,
    skip: usize,
    limit: usize,
) -> Result<Option<Vec<Item>>, FetchError> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.items-i")?;
    let price_sel = selector("div.price")?;
    let location_sel = selector("div.location")?;
    let link_sel = selector("a.item_link")?;

    let mut items = Vec::new();
    for card in document.select(&card_sel).skip(skip).take(limit) {
        let price = text_of(card, &price_sel)
            .ok_or_else(|| FetchError::FetchFailed("listing card has no price".into()))?;
        let location = text_of(card, &location_sel)
            .ok_or_else(|| FetchError::FetchFailed("listing card has no location".into()))?;
        let href = card
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .ok_or_else(|| FetchError::FetchFailed("listing card has no link".into()))?;
        let id = item_id_from_href(href)
            .ok_or_else(|| FetchError::FetchFailed(format!("unparseable item link: {href}")))?;
        items.push(Item {
            id,
            price,
            location,
        });
    }

    tracing::debug!(count = items.len(), "Listings parsed");
    Ok(if items.is_empty() { None } else { Some(items) })
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css)
        .map_err(|e| FetchError::FetchFailed(format!("invalid selector {css}: {e:?}")))
}

fn text_of(card: ElementRef<'_>, sel: &Selector) -> Option<String> {
    card.select(sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
}

fn item_id_from_href(href: &str) -> Option<i64> {
    let path = href.split(['?', '#']).next()?;
    path.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}
