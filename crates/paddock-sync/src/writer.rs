use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use paddock_core::ReconciledRace;
use paddock_storage::{BatchTransaction, DimensionKind, RaceStore, StoreError};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::resolver::resolve_dimensions;
use crate::IngestError;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistOutcome {
    pub races_written: u64,
    pub runners_written: u64,
    pub dimensions_inserted: BTreeMap<DimensionKind, u64>,
    pub unresolved_names: usize,
}

/// Writes one date's batch in a single transaction: resolve dimensions,
/// back-fill ids, upsert races, upsert runners, commit.
///
/// Everything before the commit must finish by `deadline`; a batch that runs
/// out of time is dropped uncommitted. The commit itself is never raced.
pub async fn persist_batch(
    store: &dyn RaceStore,
    date: NaiveDate,
    races: &mut [ReconciledRace],
    deadline: Instant,
    budget: Duration,
) -> Result<PersistOutcome, IngestError> {
    let (tx, outcome) = match timeout_at(deadline, stage_batch(store, races)).await {
        Err(_) => return Err(IngestError::Timeout { date, budget }),
        Ok(Err(source)) => return Err(IngestError::Store { date, source }),
        Ok(Ok(staged)) => staged,
    };

    tx.commit()
        .await
        .map_err(|source| IngestError::Store { date, source })?;
    info!(
        %date,
        races = outcome.races_written,
        runners = outcome.runners_written,
        "committed batch"
    );
    Ok(outcome)
}

async fn stage_batch<'s>(
    store: &'s dyn RaceStore,
    races: &mut [ReconciledRace],
) -> Result<(Box<dyn BatchTransaction + 's>, PersistOutcome), StoreError> {
    let mut tx = store.begin().await?;
    match write_batch(tx.as_mut(), races).await {
        Ok(outcome) => Ok((tx, outcome)),
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed after batch error");
            }
            Err(err)
        }
    }
}

async fn write_batch<T>(tx: &mut T, races: &mut [ReconciledRace]) -> Result<PersistOutcome, StoreError>
where
    T: BatchTransaction + ?Sized,
{
    let resolved = resolve_dimensions(&mut *tx, races).await?;
    let unresolved_names = resolved.back_fill(races);
    let races_written = tx.upsert_races(races).await?;
    let runners_written = tx.upsert_runners(races).await?;
    Ok(PersistOutcome {
        races_written,
        runners_written,
        dimensions_inserted: resolved.inserted().clone(),
        unresolved_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use paddock_core::{
        MarketPrices, PriceFields, RaceType, Region, ResultsRace, ResultsRunner,
    };
    use paddock_storage::{DimensionKey, DimensionName, MemoryStore};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 13).unwrap()
    }

    fn batch(bsp: Option<f64>) -> Vec<ReconciledRace> {
        let mut race = ReconciledRace::from_results(ResultsRace {
            date: day(),
            region: Region::Gb,
            course: "Ascot".into(),
            off_time: "14:30".into(),
            race_name: "Handicap Chase".into(),
            race_type: RaceType::Chase,
            distance: Some("2m5f".into()),
            going: None,
            race_class: None,
            runners: vec![ResultsRunner {
                horse: "Frankel".into(),
                number: Some(1),
                trainer: Some("Gosden".into()),
                ..Default::default()
            }],
        });
        race.runners[0].prices = Some(PriceFields {
            win: MarketPrices {
                bsp,
                ..Default::default()
            },
            place: MarketPrices::default(),
        });
        vec![race]
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn second_run_with_null_price_keeps_the_stored_one() {
        let store = MemoryStore::new();
        let mut first = batch(Some(4.5));
        persist_batch(&store, day(), &mut first, later(), Duration::from_secs(30))
            .await
            .unwrap();

        let mut second = batch(None);
        persist_batch(&store, day(), &mut second, later(), Duration::from_secs(30))
            .await
            .unwrap();
        let stored = store.runner(&first[0].runners[0].runner_key).await.unwrap();
        assert_eq!(stored.runner.win_bsp(), Some(4.5));

        let mut third = batch(Some(5.0));
        persist_batch(&store, day(), &mut third, later(), Duration::from_secs(30))
            .await
            .unwrap();
        let stored = store.runner(&first[0].runners[0].runner_key).await.unwrap();
        assert_eq!(stored.runner.win_bsp(), Some(5.0));
        assert_eq!(store.runners().await.len(), 1);
    }

    struct FailingStore {
        inner: MemoryStore,
        delay: Duration,
    }

    struct FailingTx<'a> {
        inner: Box<dyn BatchTransaction + 'a>,
    }

    #[async_trait]
    impl RaceStore for FailingStore {
        async fn begin(&self) -> Result<Box<dyn BatchTransaction + '_>, StoreError> {
            tokio::time::sleep(self.delay).await;
            Ok(Box::new(FailingTx {
                inner: self.inner.begin().await?,
            }))
        }
    }

    #[async_trait]
    impl<'a> BatchTransaction for FailingTx<'a> {
        async fn stage_dimension_names(
            &mut self,
            kind: DimensionKind,
            names: &[DimensionName],
        ) -> Result<(), StoreError> {
            self.inner.stage_dimension_names(kind, names).await
        }

        async fn insert_missing_dimensions(&mut self, kind: DimensionKind) -> Result<u64, StoreError> {
            self.inner.insert_missing_dimensions(kind).await
        }

        async fn select_staged_dimension_ids(
            &mut self,
            kind: DimensionKind,
        ) -> Result<Vec<(DimensionKey, i64)>, StoreError> {
            self.inner.select_staged_dimension_ids(kind).await
        }

        async fn upsert_races(&mut self, races: &[ReconciledRace]) -> Result<u64, StoreError> {
            self.inner.upsert_races(races).await
        }

        async fn upsert_runners(&mut self, _races: &[ReconciledRace]) -> Result<u64, StoreError> {
            Err(StoreError::NotStaged(DimensionKind::Horse))
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn failure_mid_batch_rolls_back_dimensions_and_races() {
        let inner = MemoryStore::new();
        let store = FailingStore {
            inner: inner.clone(),
            delay: Duration::ZERO,
        };
        let mut races = batch(Some(4.5));

        let err = persist_batch(&store, day(), &mut races, later(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store { .. }));
        assert!(inner.races().await.is_empty());
        assert!(inner.dimension_rows(DimensionKind::Horse).await.is_empty());
        assert!(inner.dimension_rows(DimensionKind::Trainer).await.is_empty());
    }

    #[tokio::test]
    async fn batch_past_its_deadline_is_abandoned_uncommitted() {
        let inner = MemoryStore::new();
        let store = FailingStore {
            inner: inner.clone(),
            delay: Duration::from_millis(200),
        };
        let mut races = batch(Some(4.5));
        let budget = Duration::from_millis(20);

        let err = persist_batch(&store, day(), &mut races, Instant::now() + budget, budget)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Timeout { .. }));
        assert!(inner.races().await.is_empty());
    }
}
