use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use futures_util::future::try_join_all;
use html2text::render::text_renderer::TrivialDecorator;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::FeedConfig;

/// Number of items returned by [`Aggregator::aggregate`].
pub const MAX_ITEMS: usize = 10;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("failed to fetch feed '{name}': {source}")]
    Fetch {
        name: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to parse feed '{name}': {source}")]
    Parse {
        name: String,
        #[source]
        source: feed_rs::parser::ParseFeedError,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    /// RFC 2822, as carried in RSS `<pubDate>`
    pub pub_date: Option<String>,
    /// RFC 3339
    pub iso_date: Option<String>,
    pub content_snippet: Option<String>,
    pub guid: String,
    pub creator: Option<String>,
    /// Configured name of the feed the item came from
    pub source: String,
    #[serde(skip)]
    pub published: Option<DateTime<Utc>>,
}

pub struct Aggregator {
    client: Client,
    sources: Vec<FeedConfig>,
}

impl Aggregator {
    pub fn new(sources: Vec<FeedConfig>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Newsdesk/1.0 (RSS Aggregator)")
            .build()?;

        Ok(Self { client, sources })
    }

    /// Fetch every source concurrently and return the newest items.
    ///
    /// Any failing source fails the whole call.
    pub async fn aggregate(&self) -> Result<Vec<FeedItem>, AggregateError> {
        let fetches = self.sources.iter().map(|source| self.fetch_feed(source));
        let per_feed = try_join_all(fetches).await.map_err(|e| {
            error!("Feed aggregation failed: {}", e);
            e
        })?;

        let items = merge_latest(per_feed.into_iter().flatten().collect());
        info!(
            "Aggregated {} items from {} feeds",
            items.len(),
            self.sources.len()
        );
        Ok(items)
    }

    async fn fetch_feed(&self, source: &FeedConfig) -> Result<Vec<FeedItem>, AggregateError> {
        info!("Fetching feed: {} ({})", source.name, source.url);

        let fetch_error = |e: reqwest::Error| AggregateError::Fetch {
            name: source.name.clone(),
            source: e,
        };
        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_error)?;
        let bytes = response.bytes().await.map_err(fetch_error)?;

        parse_items(&source.name, &bytes)
    }
}

/// Parse an RSS or Atom document into items tagged with `source`.
pub fn parse_items(source: &str, bytes: &[u8]) -> Result<Vec<FeedItem>, AggregateError> {
    let parsed = parser::parse(bytes).map_err(|e| AggregateError::Parse {
        name: source.to_string(),
        source: e,
    })?;

    Ok(parsed
        .entries
        .into_iter()
        .map(|entry| item_from_entry(source, entry))
        .collect())
}

fn item_from_entry(source: &str, entry: feed_rs::model::Entry) -> FeedItem {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_else(|| "Untitled".to_string());

    let link = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .unwrap_or_default();

    let published: Option<DateTime<Utc>> = entry.published.or(entry.updated);

    let content_snippet = entry
        .summary
        .as_ref()
        .map(|s| s.content.as_str())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.as_deref()))
        .map(plain_text)
        .filter(|s| !s.is_empty());

    let creator = entry.authors.first().map(|p| p.name.clone());

    FeedItem {
        title,
        link,
        pub_date: published.map(|d| d.to_rfc2822()),
        iso_date: published.map(|d| d.to_rfc3339()),
        content_snippet,
        guid: entry.id,
        creator,
        source: source.to_string(),
        published,
    }
}

/// Render feed markup as a single line of text.
fn plain_text(html: &str) -> String {
    let text = html2text::from_read_with_decorator(html.as_bytes(), 10_000, TrivialDecorator::new());
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sort newest first and keep [`MAX_ITEMS`]. Undated items go last in their
/// original order.
pub fn merge_latest(mut items: Vec<FeedItem>) -> Vec<FeedItem> {
    items.sort_by(|a, b| match (a.published, b.published) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    items.truncate(MAX_ITEMS);
    items
}
