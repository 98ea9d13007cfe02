use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use paddock_core::MatchTier;
use paddock_storage::{DimensionKind, MemoryStore, RaceStore};
use paddock_sync::reports::write_run_reports;
use paddock_sync::{DateStatus, IngestConfig, IngestError, IngestPipeline, SourceRegistry};

fn workspace_root() -> PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn race_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 13).unwrap()
}

async fn pipeline(store: &MemoryStore, scratch: &tempfile::TempDir) -> IngestPipeline {
    let root = workspace_root();
    let registry = SourceRegistry::load(&root).await.unwrap();
    let config = IngestConfig {
        workspace_root: root,
        artifacts_dir: scratch.path().join("artifacts"),
        reports_dir: scratch.path().join("reports"),
        ..Default::default()
    };
    let store: Arc<dyn RaceStore> = Arc::new(store.clone());
    IngestPipeline::new(config, &registry, store).unwrap()
}

#[tokio::test]
async fn fixture_day_reconciles_and_persists() {
    let scratch = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let pipeline = pipeline(&store, &scratch).await;

    let report = pipeline.run_date(race_day()).await.unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(report.skipped_results.len(), 2);
    assert_eq!(report.skipped_price_feed.len(), 1);

    let matching = &report.matching;
    assert_eq!(matching.candidates, 3);
    assert_eq!(matching.races, 4);
    assert_eq!(matching.matched, 3);
    assert_eq!(matching.by_tier.get(&MatchTier::CourseTime), Some(&3));
    assert_eq!(matching.unmatched.len(), 1);
    assert_eq!(matching.unmatched[0].course, "Leopardstown");
    assert_eq!(matching.runners, 13);
    assert_eq!(matching.runners_priced, 10);
    assert!(matching
        .near_misses
        .iter()
        .any(|n| n.horse == "Palace Pier" && n.closest == "Palace Peir"));

    assert_eq!(store.races().await.len(), 4);
    assert_eq!(store.runners().await.len(), 13);

    let ascot = report
        .races
        .iter()
        .find(|r| r.course == "Ascot" && r.off_time == "14:30")
        .unwrap();
    assert!(ascot.handicap);
    assert_eq!(ascot.price_event_id.as_deref(), Some("32901001"));
    let kingman = store.runner(&ascot.runners[0].runner_key).await.unwrap();
    assert_eq!(kingman.runner.win_bsp(), Some(4.5));
    assert_eq!(kingman.runner.place_bsp(), Some(1.8));

    // J Gosden rides across three races but is one trainer row.
    let trainers = store.dimension_rows(DimensionKind::Trainer).await;
    assert_eq!(trainers.len(), 8);
    let gosden: Vec<_> = report
        .races
        .iter()
        .flat_map(|r| r.runners.iter())
        .filter(|r| r.result.trainer.as_deref() == Some("J Gosden"))
        .map(|r| r.dimension_ids.trainer_id)
        .collect();
    assert!(gosden.len() > 3);
    assert!(gosden[0].is_some());
    assert!(gosden.iter().all(|id| *id == gosden[0]));
}

#[tokio::test]
async fn rerunning_a_day_leaves_the_same_rows() {
    let scratch = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let pipeline = pipeline(&store, &scratch).await;

    pipeline.run_date(race_day()).await.unwrap();
    let mut first: Vec<_> = store
        .runners()
        .await
        .into_iter()
        .map(|r| (r.runner.runner_key.clone(), r.runner.win_bsp()))
        .collect();
    let horses = store.dimension_rows(DimensionKind::Horse).await.len();

    pipeline.run_date(race_day()).await.unwrap();
    let mut second: Vec<_> = store
        .runners()
        .await
        .into_iter()
        .map(|r| (r.runner.runner_key.clone(), r.runner.win_bsp()))
        .collect();

    first.sort_by(|a, b| a.0.cmp(&b.0));
    second.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(first, second);
    assert_eq!(store.races().await.len(), 4);
    assert_eq!(store.dimension_rows(DimensionKind::Horse).await.len(), horses);
}

#[tokio::test]
async fn missing_source_payload_fails_only_that_date() {
    let scratch = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let pipeline = pipeline(&store, &scratch).await;
    let next_day = race_day().succ_opt().unwrap();

    let err = pipeline.run_date(next_day).await.unwrap_err();
    assert!(matches!(err, IngestError::SourceFetch { .. }));
    assert!(store.races().await.is_empty());

    let run = pipeline.run_range(race_day(), next_day).await;
    assert_eq!(run.dates.len(), 2);
    assert_eq!(run.dates[0].status, DateStatus::Succeeded);
    assert_eq!(run.dates[1].status, DateStatus::Failed);
    assert!(run.dates[1].error.is_some());
    assert_eq!(store.races().await.len(), 4);

    let reports_dir = write_run_reports(&pipeline.config().reports_dir, &run)
        .await
        .unwrap();
    assert!(reports_dir.join("summary.json").exists());
    assert!(reports_dir.join("daily_brief.md").exists());
    assert!(reports_dir.join("snapshots/races.parquet").exists());
}
