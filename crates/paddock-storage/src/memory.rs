//! In-process store with the same transactional contract as Postgres.
//! Backs dry runs and the test suites.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use paddock_core::{
    MarketPrices, PriceFields, ReconciledRace, ReconciledRunner, RunnerDimensionIds,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{BatchTransaction, DimensionKey, DimensionKind, DimensionName, RaceStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRunner {
    pub race_key: String,
    pub runner: ReconciledRunner,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    dimensions: BTreeMap<DimensionKind, BTreeMap<DimensionKey, (i64, String)>>,
    races: BTreeMap<String, ReconciledRace>,
    runners: BTreeMap<String, StoredRunner>,
}

/// Transactions are serialized: one holds the state lock from `begin` until it
/// commits or is dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored races, runners left out.
    pub async fn races(&self) -> Vec<ReconciledRace> {
        self.state.lock().await.races.values().cloned().collect()
    }

    pub async fn runners(&self) -> Vec<StoredRunner> {
        self.state.lock().await.runners.values().cloned().collect()
    }

    pub async fn runner(&self, runner_key: &str) -> Option<StoredRunner> {
        self.state.lock().await.runners.get(runner_key).cloned()
    }

    /// `(display name, key, id)` for every row of a dimension table.
    pub async fn dimension_rows(&self, kind: DimensionKind) -> Vec<(String, DimensionKey, i64)> {
        self.state
            .lock()
            .await
            .dimensions
            .get(&kind)
            .map(|rows| {
                rows.iter()
                    .map(|(key, (id, name))| (name.clone(), key.clone(), *id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RaceStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn BatchTransaction + '_>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            staged: HashMap::new(),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    staged: HashMap<DimensionKind, Vec<DimensionName>>,
}

impl MemoryTransaction {
    fn staged(&self, kind: DimensionKind) -> Result<&[DimensionName], StoreError> {
        self.staged
            .get(&kind)
            .map(Vec::as_slice)
            .ok_or(StoreError::NotStaged(kind))
    }
}

#[async_trait]
impl BatchTransaction for MemoryTransaction {
    async fn stage_dimension_names(
        &mut self,
        kind: DimensionKind,
        names: &[DimensionName],
    ) -> Result<(), StoreError> {
        self.staged
            .entry(kind)
            .or_default()
            .extend(names.iter().cloned());
        Ok(())
    }

    async fn insert_missing_dimensions(&mut self, kind: DimensionKind) -> Result<u64, StoreError> {
        let staged = self.staged(kind)?.to_vec();
        let state = &mut self.working;
        let table = state.dimensions.entry(kind).or_default();
        let mut inserted = 0;
        for name in staged {
            if table.contains_key(&name.key) {
                continue;
            }
            state.next_id += 1;
            table.insert(name.key, (state.next_id, name.display));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn select_staged_dimension_ids(
        &mut self,
        kind: DimensionKind,
    ) -> Result<Vec<(DimensionKey, i64)>, StoreError> {
        let staged = self.staged(kind)?;
        let table = self.working.dimensions.get(&kind);
        let mut found: Vec<(DimensionKey, i64)> = staged
            .iter()
            .filter_map(|name| {
                table
                    .and_then(|rows| rows.get(&name.key))
                    .map(|(id, _)| (name.key.clone(), *id))
            })
            .collect();
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn upsert_races(&mut self, races: &[ReconciledRace]) -> Result<u64, StoreError> {
        for race in races {
            let incoming = ReconciledRace {
                runners: Vec::new(),
                ..race.clone()
            };
            match self.working.races.get_mut(&race.race_key) {
                Some(stored) => {
                    let price_event_id = incoming
                        .price_event_id
                        .clone()
                        .or_else(|| stored.price_event_id.clone());
                    let confidence = incoming.confidence.or(stored.confidence);
                    let course_id = incoming.course_id.or(stored.course_id);
                    *stored = ReconciledRace {
                        price_event_id,
                        confidence,
                        course_id,
                        ..incoming
                    };
                }
                None => {
                    self.working.races.insert(race.race_key.clone(), incoming);
                }
            }
        }
        Ok(races.len() as u64)
    }

    async fn upsert_runners(&mut self, races: &[ReconciledRace]) -> Result<u64, StoreError> {
        let mut written = 0;
        for race in races {
            for runner in &race.runners {
                match self.working.runners.get_mut(&runner.runner_key) {
                    Some(stored) => {
                        stored.race_key = race.race_key.clone();
                        stored.runner.result = runner.result.clone();
                        stored.runner.dimension_ids =
                            merge_ids(stored.runner.dimension_ids, runner.dimension_ids);
                        stored.runner.prices = merge_prices(stored.runner.prices, runner.prices);
                    }
                    None => {
                        self.working.runners.insert(
                            runner.runner_key.clone(),
                            StoredRunner {
                                race_key: race.race_key.clone(),
                                runner: runner.clone(),
                            },
                        );
                    }
                }
                written += 1;
            }
        }
        Ok(written)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Column-wise `COALESCE(incoming, stored)` over every price field.
pub fn merge_prices(stored: Option<PriceFields>, incoming: Option<PriceFields>) -> Option<PriceFields> {
    match (stored, incoming) {
        (Some(stored), Some(incoming)) => Some(PriceFields {
            win: merge_market(stored.win, incoming.win),
            place: merge_market(stored.place, incoming.place),
        }),
        (stored, incoming) => incoming.or(stored),
    }
}

fn merge_market(stored: MarketPrices, incoming: MarketPrices) -> MarketPrices {
    MarketPrices {
        bsp: incoming.bsp.or(stored.bsp),
        ppwap: incoming.ppwap.or(stored.ppwap),
        morning_wap: incoming.morning_wap.or(stored.morning_wap),
        pp_max: incoming.pp_max.or(stored.pp_max),
        pp_min: incoming.pp_min.or(stored.pp_min),
        ip_max: incoming.ip_max.or(stored.ip_max),
        ip_min: incoming.ip_min.or(stored.ip_min),
        morning_traded_vol: incoming.morning_traded_vol.or(stored.morning_traded_vol),
        pp_traded_vol: incoming.pp_traded_vol.or(stored.pp_traded_vol),
        ip_traded_vol: incoming.ip_traded_vol.or(stored.ip_traded_vol),
    }
}

fn merge_ids(stored: RunnerDimensionIds, incoming: RunnerDimensionIds) -> RunnerDimensionIds {
    RunnerDimensionIds {
        horse_id: incoming.horse_id.or(stored.horse_id),
        jockey_id: incoming.jockey_id.or(stored.jockey_id),
        trainer_id: incoming.trainer_id.or(stored.trainer_id),
        owner_id: incoming.owner_id.or(stored.owner_id),
    }
}
