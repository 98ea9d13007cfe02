//! Source adapter contracts plus the results and price-feed adapters.
//!
//! Adapters only turn raw payloads into source records. A malformed record is
//! skipped and reported; only an unreadable payload fails the whole source.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use paddock_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod price_feed;
mod results;

pub use price_feed::{parse_event_dt, venue_from_menu_hint, PriceFeedAdapter};
pub use results::ResultsAdapter;

pub const CRATE_NAME: &str = "paddock-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Fixture,
    Http,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("payload {origin} is not a valid document: {source}")]
    Document {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub race_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub source_id: String,
    pub payload_date: NaiveDate,
    pub origin: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// A record dropped while parsing, with its position in the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRecord {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub records: Vec<T>,
    pub skipped: Vec<SkippedRecord>,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Where a source's daily payload lives. `{date}` in the template is replaced
/// by the payload date as `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    pub mode: SourceMode,
    pub template: String,
    pub base_dir: PathBuf,
}

impl SourceLocator {
    pub fn fixture(base_dir: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            mode: SourceMode::Fixture,
            template: template.into(),
            base_dir: base_dir.into(),
        }
    }

    pub fn http(template: impl Into<String>) -> Self {
        Self {
            mode: SourceMode::Http,
            template: template.into(),
            base_dir: PathBuf::new(),
        }
    }

    pub fn resolve(&self, payload_date: NaiveDate) -> String {
        self.template
            .replace("{date}", &payload_date.format("%Y-%m-%d").to_string())
    }

    pub async fn load(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        source_id: &str,
        payload_date: NaiveDate,
    ) -> Result<RawPayload, AdapterError> {
        let target = self.resolve(payload_date);
        let (origin, body) = match self.mode {
            SourceMode::Fixture => {
                let path = self.base_dir.join(&target);
                let body = tokio::fs::read(&path).await.map_err(|source| AdapterError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                (path.display().to_string(), body)
            }
            SourceMode::Http => {
                let response = http.fetch_bytes(run_id, source_id, &target).await?;
                (response.final_url, response.body)
            }
        };

        Ok(RawPayload {
            source_id: source_id.to_string(),
            payload_date,
            origin,
            content_type: "application/json".to_string(),
            body,
        })
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Record: Send;

    fn source_id(&self) -> &str;

    fn locator(&self) -> &SourceLocator;

    /// Date of the payload that carries `race_date`'s records.
    fn payload_date(&self, race_date: NaiveDate) -> NaiveDate {
        race_date
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawPayload, AdapterError> {
        let payload_date = self.payload_date(ctx.race_date);
        self.locator()
            .load(http, ctx.run_id, self.source_id(), payload_date)
            .await
    }

    /// Parses the records belonging to `race_date` out of `payload`.
    fn parse(
        &self,
        race_date: NaiveDate,
        payload: &RawPayload,
    ) -> Result<Parsed<Self::Record>, AdapterError>;
}

fn parse_document<T: serde::de::DeserializeOwned>(payload: &RawPayload) -> Result<T, AdapterError> {
    serde_json::from_slice(&payload.body).map_err(|source| AdapterError::Document {
        origin: payload.origin.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_substitutes_payload_date() {
        let locator = SourceLocator::http("https://feeds.example/win/{date}.json");
        let date = NaiveDate::from_ymd_opt(2024, 1, 12).unwrap();
        assert_eq!(locator.resolve(date), "https://feeds.example/win/2024-01-12.json");
    }

    #[tokio::test]
    async fn missing_fixture_is_an_io_error() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let locator = SourceLocator::fixture(std::env::temp_dir(), "paddock-missing/{date}.json");
        let err = locator
            .load(
                &http,
                Uuid::new_v4(),
                "results",
                NaiveDate::from_ymd_opt(2024, 1, 13).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Io { .. }));
    }
}
