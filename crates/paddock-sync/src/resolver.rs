//! Turns the free-text entity names of a batch into surrogate keys.

use std::collections::{BTreeMap, HashMap};

use paddock_core::ReconciledRace;
use paddock_storage::{BatchTransaction, DimensionKey, DimensionKind, DimensionName, StoreError};
use serde::Serialize;
use tracing::{debug, warn};

/// Distinct names per kind, keyed so each key keeps the first spelling seen.
pub fn collect_dimension_names(races: &[ReconciledRace]) -> BTreeMap<DimensionKind, Vec<DimensionName>> {
    let mut distinct: BTreeMap<DimensionKind, BTreeMap<DimensionKey, String>> = BTreeMap::new();
    let mut add = |kind: DimensionKind, key: DimensionKey, display: &str| {
        if key.name_key.is_empty() {
            return;
        }
        distinct
            .entry(kind)
            .or_default()
            .entry(key)
            .or_insert_with(|| display.trim().to_string());
    };

    for race in races {
        add(
            DimensionKind::Course,
            DimensionKey::for_course(&race.course, race.region),
            &race.course,
        );
        for runner in &race.runners {
            let result = &runner.result;
            add(DimensionKind::Horse, DimensionKey::for_name(&result.horse), &result.horse);
            let people = [
                (DimensionKind::Jockey, &result.jockey),
                (DimensionKind::Trainer, &result.trainer),
                (DimensionKind::Owner, &result.owner),
            ];
            for (kind, name) in people {
                if let Some(name) = name {
                    add(kind, DimensionKey::for_name(name), name);
                }
            }
        }
    }

    distinct
        .into_iter()
        .map(|(kind, names)| {
            let names = names
                .into_iter()
                .map(|(key, display)| DimensionName { key, display })
                .collect();
            (kind, names)
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedDimensions {
    ids: HashMap<DimensionKind, HashMap<DimensionKey, i64>>,
    inserted: BTreeMap<DimensionKind, u64>,
}

impl ResolvedDimensions {
    pub fn id(&self, kind: DimensionKind, key: &DimensionKey) -> Option<i64> {
        self.ids.get(&kind).and_then(|ids| ids.get(key)).copied()
    }

    /// Rows created by this resolution, per kind.
    pub fn inserted(&self) -> &BTreeMap<DimensionKind, u64> {
        &self.inserted
    }

    /// Writes resolved ids into `races`. A name that did not resolve keeps a
    /// null reference; the count of such names is returned.
    pub fn back_fill(&self, races: &mut [ReconciledRace]) -> usize {
        let mut unresolved = 0;
        let mut lookup = |kind: DimensionKind, key: DimensionKey, raw: &str| -> Option<i64> {
            if key.name_key.is_empty() {
                return None;
            }
            let id = self.id(kind, &key);
            if id.is_none() {
                warn!(kind = kind.table(), name = raw, "dimension name did not resolve");
                unresolved += 1;
            }
            id
        };

        for race in races.iter_mut() {
            race.course_id = lookup(
                DimensionKind::Course,
                DimensionKey::for_course(&race.course, race.region),
                &race.course,
            );
            for runner in &mut race.runners {
                let result = &runner.result;
                let ids = &mut runner.dimension_ids;
                ids.horse_id = lookup(DimensionKind::Horse, DimensionKey::for_name(&result.horse), &result.horse);
                ids.jockey_id = result
                    .jockey
                    .as_deref()
                    .and_then(|n| lookup(DimensionKind::Jockey, DimensionKey::for_name(n), n));
                ids.trainer_id = result
                    .trainer
                    .as_deref()
                    .and_then(|n| lookup(DimensionKind::Trainer, DimensionKey::for_name(n), n));
                ids.owner_id = result
                    .owner
                    .as_deref()
                    .and_then(|n| lookup(DimensionKind::Owner, DimensionKey::for_name(n), n));
            }
        }
        unresolved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindResolution {
    pub distinct: usize,
    pub inserted: u64,
    pub resolved: usize,
}

/// Stage, insert-missing, select: three statements per kind whatever the
/// batch size. Kinds with no names in the batch are skipped.
pub async fn resolve_dimensions<T>(
    tx: &mut T,
    races: &[ReconciledRace],
) -> Result<ResolvedDimensions, StoreError>
where
    T: BatchTransaction + ?Sized,
{
    let mut resolved = ResolvedDimensions::default();
    for (kind, names) in collect_dimension_names(races) {
        tx.stage_dimension_names(kind, &names).await?;
        let inserted = tx.insert_missing_dimensions(kind).await?;
        let rows = tx.select_staged_dimension_ids(kind).await?;

        let stats = KindResolution {
            distinct: names.len(),
            inserted,
            resolved: rows.len(),
        };
        debug!(kind = kind.table(), distinct = stats.distinct, inserted, resolved = stats.resolved, "resolved dimension");

        resolved.inserted.insert(kind, inserted);
        resolved.ids.insert(kind, rows.into_iter().collect());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use paddock_core::{RaceType, Region, ResultsRace, ResultsRunner};
    use paddock_storage::{MemoryStore, RaceStore};

    fn race(course: &str, off_time: &str, runners: Vec<ResultsRunner>) -> ReconciledRace {
        ReconciledRace::from_results(ResultsRace {
            date: NaiveDate::from_ymd_opt(2024, 1, 13).unwrap(),
            region: Region::Gb,
            course: course.into(),
            off_time: off_time.into(),
            race_name: "Maiden Stakes".into(),
            race_type: RaceType::Flat,
            distance: None,
            going: None,
            race_class: None,
            runners,
        })
    }

    fn runner(horse: &str, trainer: &str) -> ResultsRunner {
        ResultsRunner {
            horse: horse.into(),
            trainer: Some(trainer.into()),
            ..Default::default()
        }
    }

    #[test]
    fn collection_merges_spelling_variants() {
        let races = vec![race(
            "Kempton (AW)",
            "16:10",
            vec![runner("Kingman (IRE)", "A P O'Brien"), runner("kingman", "A P OBrien")],
        )];
        let names = collect_dimension_names(&races);
        assert_eq!(names[&DimensionKind::Horse].len(), 1);
        assert_eq!(names[&DimensionKind::Horse][0].display, "Kingman (IRE)");
        assert_eq!(names[&DimensionKind::Trainer].len(), 1);
        assert_eq!(names[&DimensionKind::Course][0].key.name_key, "kempton");
        assert!(!names.contains_key(&DimensionKind::Owner));
    }

    #[tokio::test]
    async fn one_trainer_key_across_three_races() {
        let store = MemoryStore::new();
        let mut races = vec![
            race("Ascot", "14:30", vec![runner("Frankel", "Gosden")]),
            race("Sandown", "15:05", vec![runner("Enable", "Gosden")]),
            race("Kempton", "16:10", vec![runner("Roaring Lion", "Gosden")]),
        ];

        let mut tx = store.begin().await.unwrap();
        let resolved = resolve_dimensions(tx.as_mut(), &races).await.unwrap();
        assert_eq!(resolved.inserted()[&DimensionKind::Trainer], 1);
        assert_eq!(resolved.back_fill(&mut races), 0);
        tx.commit().await.unwrap();

        let trainer_ids: Vec<_> = races
            .iter()
            .map(|r| r.runners[0].dimension_ids.trainer_id)
            .collect();
        assert!(trainer_ids[0].is_some());
        assert!(trainer_ids.iter().all(|id| *id == trainer_ids[0]));
        assert_eq!(store.dimension_rows(DimensionKind::Trainer).await.len(), 1);
        assert!(races.iter().all(|r| r.course_id.is_some()));
    }

    #[tokio::test]
    async fn spelling_variant_reuses_the_existing_row() {
        let store = MemoryStore::new();
        let mut first = vec![race("Ascot", "14:30", vec![runner("Frankel", "A P O'Brien")])];
        let mut tx = store.begin().await.unwrap();
        resolve_dimensions(tx.as_mut(), &first).await.unwrap().back_fill(&mut first);
        tx.commit().await.unwrap();

        let mut second = vec![race("Ascot", "15:05", vec![runner("Enable", "A P OBrien")])];
        let mut tx = store.begin().await.unwrap();
        let resolved = resolve_dimensions(tx.as_mut(), &second).await.unwrap();
        assert_eq!(resolved.inserted()[&DimensionKind::Trainer], 0);
        resolved.back_fill(&mut second);
        tx.commit().await.unwrap();

        assert_eq!(
            first[0].runners[0].dimension_ids.trainer_id,
            second[0].runners[0].dimension_ids.trainer_id
        );
    }

    #[test]
    fn unresolved_names_keep_null_references() {
        let mut races = vec![race("Ascot", "14:30", vec![runner("Frankel", "Gosden")])];
        let unresolved = ResolvedDimensions::default().back_fill(&mut races);
        assert_eq!(unresolved, 3);
        assert_eq!(races[0].course_id, None);
        assert_eq!(races[0].runners[0].dimension_ids.horse_id, None);
    }
}
