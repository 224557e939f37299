//! Source adapter contracts, pagination bookkeeping, and the HTTP and fixture record sources.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pdir_core::RawRecord;
use pdir_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pdir-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<RawRecord>,
    /// Total advertised by the source, when it reports one.
    pub total_count: Option<u64>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Paginated provider-record source.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<RecordPage, AdapterError>;
}

/// Parse the datastore page shape `{"results": [...], "count": N}`; a bare array is also accepted.
pub fn parse_page(value: &JsonValue) -> Result<RecordPage, AdapterError> {
    let (rows, total_count) = match value {
        JsonValue::Array(rows) => (rows.as_slice(), None),
        JsonValue::Object(map) => {
            let rows = map
                .get("results")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| AdapterError::Message("page has no results array".into()))?;
            let total = map.get("count").and_then(|c| match c {
                JsonValue::Number(n) => n.as_u64(),
                JsonValue::String(s) => s.trim().parse().ok(),
                _ => None,
            });
            (rows.as_slice(), total)
        }
        other => {
            return Err(AdapterError::Message(format!(
                "unexpected page payload: {}",
                other
            )))
        }
    };
    let records = rows
        .iter()
        .map(|row| serde_json::from_value::<RawRecord>(row.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AdapterError::Message(format!("invalid provider record: {e}")))?;
    Ok(RecordPage {
        records,
        total_count,
    })
}

#[derive(Debug)]
pub struct HttpRecordSource {
    http: HttpFetcher,
    url: String,
}

impl HttpRecordSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    fn source_id(&self) -> &str {
        &self.url
    }

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<RecordPage, AdapterError> {
        let query = [
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("count", "true".to_string()),
            ("results", "true".to_string()),
        ];
        let response = self.http.get_json(&self.url, &query).await?;
        let body = response
            .body
            .ok_or_else(|| AdapterError::Message(format!("empty page from {}", response.final_url)))?;
        parse_page(&body)
    }
}

/// Records loaded from a JSON file and served in pages.
#[derive(Debug, Clone)]
pub struct FixtureRecordSource {
    source_id: String,
    records: Vec<RawRecord>,
    advertised_total: Option<u64>,
}

impl FixtureRecordSource {
    pub fn new(source_id: impl Into<String>, records: Vec<RawRecord>) -> Self {
        let advertised_total = Some(records.len() as u64);
        Self {
            source_id: source_id.into(),
            records,
            advertised_total,
        }
    }

    /// Override the count reported with each page, to mimic a miscounting source.
    pub fn with_advertised_total(mut self, total: Option<u64>) -> Self {
        self.advertised_total = total;
        self
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }
}

pub fn load_fixture_source(path: impl AsRef<Path>) -> Result<FixtureRecordSource> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let page = parse_page(&value).with_context(|| format!("decoding records in {}", path.display()))?;
    let total = page.total_count.unwrap_or(page.records.len() as u64);
    Ok(FixtureRecordSource::new(path.display().to_string(), page.records).with_advertised_total(Some(total)))
}

#[async_trait]
impl RecordSource for FixtureRecordSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<RecordPage, AdapterError> {
        let start = (offset as usize).min(self.records.len());
        let end = start.saturating_add(limit as usize).min(self.records.len());
        Ok(RecordPage {
            records: self.records[start..end].to_vec(),
            total_count: self.advertised_total,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    TotalReached,
    EmptyPage,
    /// No total advertised and the page came back short.
    ShortPage,
    PageLimit,
}

/// Offset/limit pagination state.
///
/// A zero-record page always stops the loop regardless of the advertised
/// count, and the number of pages is capped so a miscounting source cannot
/// spin forever.
#[derive(Debug, Clone)]
pub struct PageCursor {
    offset: u64,
    page_size: u64,
    max_pages: usize,
    pages_fetched: usize,
    total: Option<u64>,
    stop: Option<StopReason>,
}

impl PageCursor {
    pub fn new(page_size: u64, max_pages: usize) -> Self {
        Self {
            offset: 0,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
            pages_fetched: 0,
            total: None,
            stop: None,
        }
    }

    /// `(offset, limit)` of the next page, or `None` once pagination has stopped.
    pub fn next_request(&mut self) -> Option<(u64, u64)> {
        if self.stop.is_some() {
            return None;
        }
        if self.pages_fetched >= self.max_pages {
            self.stop = Some(StopReason::PageLimit);
            return None;
        }
        Some((self.offset, self.page_size))
    }

    pub fn advance(&mut self, page_len: usize, total: Option<u64>) {
        self.pages_fetched += 1;
        if total.is_some() {
            self.total = total;
        }
        self.offset += page_len as u64;

        if page_len == 0 {
            self.stop = Some(StopReason::EmptyPage);
        } else if self.total.is_some_and(|t| self.offset >= t) {
            self.stop = Some(StopReason::TotalReached);
        } else if self.total.is_none() && (page_len as u64) < self.page_size {
            self.stop = Some(StopReason::ShortPage);
        }
    }

    pub fn records_seen(&self) -> u64 {
        self.offset
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn advertised_total(&self) -> Option<u64> {
        self.total
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }
}

/// Fetch pages until the cursor stops, handing each page to `on_page` in order.
/// Callers inspect `cursor.stop_reason()` afterwards to report an early stop.
pub async fn drain_source<F>(
    source: &dyn RecordSource,
    cursor: &mut PageCursor,
    mut on_page: F,
) -> Result<u64, AdapterError>
where
    F: FnMut(Vec<RawRecord>) -> Result<(), AdapterError> + Send,
{
    while let Some((offset, limit)) = cursor.next_request() {
        let page = source.fetch_page(offset, limit).await?;
        let len = page.records.len();
        debug!(source = source.source_id(), offset, len, total = ?page.total_count, "fetched page");
        cursor.advance(len, page.total_count);
        on_page(page.records)?;
    }

    Ok(cursor.records_seen())
}
