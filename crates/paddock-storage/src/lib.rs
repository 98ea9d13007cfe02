//! Persistence seam, raw-artifact storage and HTTP fetch utilities.

use async_trait::async_trait;
use paddock_core::names::{name_key, normalize_course_name};
use paddock_core::{ReconciledRace, Region};
use serde::Serialize;
use thiserror::Error;

mod artifacts;
mod http;
mod memory;
mod postgres;

pub use artifacts::{payload_digest, ArtifactStore, StoredArtifact};
pub use http::{
    is_transient_error, is_transient_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher,
};
pub use memory::{merge_prices, MemoryStore, StoredRunner};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "paddock-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("dimension names for {0:?} were not staged in this transaction")]
    NotStaged(DimensionKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Horse,
    Trainer,
    Jockey,
    Owner,
    Course,
}

impl DimensionKind {
    pub const ALL: [DimensionKind; 5] = [
        DimensionKind::Horse,
        DimensionKind::Trainer,
        DimensionKind::Jockey,
        DimensionKind::Owner,
        DimensionKind::Course,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            DimensionKind::Horse => "horses",
            DimensionKind::Trainer => "trainers",
            DimensionKind::Jockey => "jockeys",
            DimensionKind::Owner => "owners",
            DimensionKind::Course => "courses",
        }
    }
}

/// Uniqueness key of a dimension row. Only courses carry a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DimensionKey {
    pub name_key: String,
    pub region: Option<Region>,
}

impl DimensionKey {
    pub fn for_name(raw: &str) -> Self {
        Self {
            name_key: name_key(raw),
            region: None,
        }
    }

    pub fn for_course(raw: &str, region: Region) -> Self {
        Self {
            name_key: normalize_course_name(raw),
            region: Some(region),
        }
    }
}

/// A distinct entity name seen in a batch: its key plus the display spelling
/// used if the row has to be created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionName {
    pub key: DimensionKey,
    pub display: String,
}

/// One open all-or-nothing write transaction for a single ingestion batch.
///
/// Dropping a transaction without calling [`BatchTransaction::commit`] discards
/// everything written through it.
#[async_trait]
pub trait BatchTransaction: Send {
    /// Loads the batch's names for `kind` into transaction-scoped staging.
    async fn stage_dimension_names(
        &mut self,
        kind: DimensionKind,
        names: &[DimensionName],
    ) -> Result<(), StoreError>;

    /// Inserts staged names with no existing row. Existing rows are left alone.
    /// When one key was staged under several spellings, the first staged wins.
    async fn insert_missing_dimensions(&mut self, kind: DimensionKind) -> Result<u64, StoreError>;

    /// Surrogate keys for every staged name of `kind`.
    async fn select_staged_dimension_ids(
        &mut self,
        kind: DimensionKind,
    ) -> Result<Vec<(DimensionKey, i64)>, StoreError>;

    /// Upserts races by race key; conflicts update metadata only.
    async fn upsert_races(&mut self, races: &[ReconciledRace]) -> Result<u64, StoreError>;

    /// Upserts every runner of `races` by runner key; stored prices are only
    /// replaced by non-null incoming prices.
    async fn upsert_runners(&mut self, races: &[ReconciledRace]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RaceStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn BatchTransaction + '_>, StoreError>;
}
