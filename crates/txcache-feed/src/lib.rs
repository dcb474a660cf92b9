//! Upstream transaction feed client: authenticated page fetches, envelope
//! decoding, lazy page iteration, and record normalization.

mod normalize;

use std::fmt::Write;

use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::info;
use txcache_core::{RawRecord, RawRecordBatch, SyncScope};
use txcache_storage::{FetchError, HttpFetcher};

pub use normalize::{currency_minor_units, normalize, peek_id, NormalizationError};

pub const CRATE_NAME: &str = "txcache-feed";

pub const DEFAULT_DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("feed rejected the credential: {0}")]
    Authentication(String),
    #[error("feed unavailable on page {page}: {message}")]
    Unavailable { page: u32, message: String },
    #[error("feed page {page} timed out: {message}")]
    Timeout { page: u32, message: String },
    #[error("unexpected feed response on page {page}: {message}")]
    Protocol { page: u32, message: String },
}

impl SourceError {
    pub fn from_fetch(page: u32, err: FetchError) -> Self {
        let message = err.to_string();
        match err {
            FetchError::Unauthorized { .. } => Self::Authentication(message),
            FetchError::TimedOut { .. } => Self::Timeout { page, message },
            FetchError::RetriesExhausted { .. } => Self::Unavailable { page, message },
            FetchError::HttpStatus { .. } | FetchError::Request(_) => Self::Protocol { page, message },
        }
    }
}

/// One page request against the upstream feed.
#[async_trait]
pub trait TransactionFeed: Send + Sync {
    async fn fetch_page(&self, scope: &SyncScope, page: u32) -> Result<RawRecordBatch, SourceError>;
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    #[serde(default)]
    data: Vec<Box<RawValue>>,
    #[serde(default)]
    meta: FeedMeta,
    #[serde(default)]
    links: FeedLinks,
}

#[derive(Debug, Default, Deserialize)]
struct FeedMeta {
    last_page: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedLinks {
    next: Option<String>,
}

/// Decode one response envelope. `meta.last_page` decides whether more pages
/// follow; without it a non-null `links.next` on a non-empty page does.
pub fn decode_page(page: u32, body: &[u8]) -> Result<RawRecordBatch, SourceError> {
    let envelope: FeedEnvelope = serde_json::from_slice(body).map_err(|err| SourceError::Protocol {
        page,
        message: format!("decoding feed envelope: {err}"),
    })?;

    let records = envelope.data.into_iter().map(RawRecord::new).collect::<Vec<_>>();
    let has_more = match envelope.meta.last_page {
        Some(last) => page < last,
        None => envelope.links.next.is_some() && !records.is_empty(),
    };

    Ok(RawRecordBatch {
        page,
        last_page: envelope.meta.last_page,
        has_more,
        records,
    })
}

pub struct HttpTransactionFeed {
    http: HttpFetcher,
    feed_url: String,
    day_format: String,
}

impl HttpTransactionFeed {
    pub fn new(http: HttpFetcher, feed_url: impl Into<String>) -> Self {
        Self {
            http,
            feed_url: feed_url.into(),
            day_format: DEFAULT_DAY_FORMAT.to_string(),
        }
    }

    pub fn with_day_format(mut self, day_format: impl Into<String>) -> Self {
        self.day_format = day_format.into();
        self
    }

    pub fn query_for(&self, scope: &SyncScope, page: u32) -> Result<Vec<(&'static str, String)>, SourceError> {
        let mut query = vec![("page", page.to_string())];
        if let SyncScope::Day(day) = scope {
            let mut rendered = String::new();
            write!(rendered, "{}", day.format(&self.day_format)).map_err(|_| SourceError::Protocol {
                page,
                message: format!("day format `{}` cannot render {day}", self.day_format),
            })?;
            query.push(("day", rendered));
        }
        Ok(query)
    }
}

/// True when every strftime specifier in `format` is one chrono understands.
pub fn is_valid_day_format(format: &str) -> bool {
    StrftimeItems::new(format).all(|item| !matches!(item, Item::Error))
}

#[async_trait]
impl TransactionFeed for HttpTransactionFeed {
    async fn fetch_page(&self, scope: &SyncScope, page: u32) -> Result<RawRecordBatch, SourceError> {
        let query = self.query_for(scope, page)?;
        let response = self
            .http
            .get_bytes(&self.feed_url, &query)
            .await
            .map_err(|err| SourceError::from_fetch(page, err))?;
        let batch = decode_page(page, &response.body)?;
        info!(
            page,
            last_page = ?batch.last_page,
            records = batch.records.len(),
            scope = %scope,
            "fetched feed page"
        );
        Ok(batch)
    }
}

/// Lazy, finite walk over the feed's pages starting at page 1. A new cursor
/// restarts from the beginning; a failed cursor yields nothing further.
pub struct PageCursor<'a> {
    feed: &'a dyn TransactionFeed,
    scope: SyncScope,
    next_page: Option<u32>,
    pages_fetched: u32,
}

impl<'a> PageCursor<'a> {
    pub fn new(feed: &'a dyn TransactionFeed, scope: SyncScope) -> Self {
        Self {
            feed,
            scope,
            next_page: Some(1),
            pages_fetched: 0,
        }
    }

    pub async fn next_batch(&mut self) -> Result<Option<RawRecordBatch>, SourceError> {
        let Some(page) = self.next_page else {
            return Ok(None);
        };

        match self.feed.fetch_page(&self.scope, page).await {
            Ok(batch) => {
                self.pages_fetched += 1;
                self.next_page = if batch.has_more { page.checked_add(1) } else { None };
                Ok(Some(batch))
            }
            Err(err) => {
                self.next_page = None;
                Err(err)
            }
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }
}
