//! Per-run report files under `<reports>/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use paddock_core::{MarketPrices, ReconciledRace, ReconciledRunner};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::pipeline::{DateStatus, RunReport};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunTotals {
    pub dates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub races: usize,
    pub matched: usize,
    pub runners: usize,
    pub runners_priced: usize,
    pub match_rate: f64,
}

impl RunTotals {
    pub fn from_run(run: &RunReport) -> Self {
        let mut totals = Self {
            dates: run.dates.len(),
            succeeded: run.succeeded(),
            failed: run.failed(),
            ..Default::default()
        };
        for report in run.reports() {
            totals.races += report.matching.races;
            totals.matched += report.matching.matched;
            totals.runners += report.matching.runners;
            totals.runners_priced += report.matching.runners_priced;
        }
        if totals.races > 0 {
            totals.match_rate = totals.matched as f64 / totals.races as f64;
        }
        totals
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `summary.json`, `daily_brief.md` and the Parquet snapshots of the
/// reconciled races and runners. Returns the run's report directory.
pub async fn write_run_reports(reports_root: &Path, run: &RunReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(run.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let totals = RunTotals::from_run(run);
    let summary = serde_json::to_vec_pretty(&serde_json::json!({
        "run": run,
        "totals": totals,
    }))
    .context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), summary)
        .await
        .context("writing summary.json")?;

    fs::write(reports_dir.join("daily_brief.md"), render_brief(run, &totals))
        .await
        .context("writing daily_brief.md")?;

    export_snapshots(&reports_dir, run).await?;
    Ok(reports_dir)
}

fn render_brief(run: &RunReport, totals: &RunTotals) -> String {
    let mut lines = vec![
        "# Paddock Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!(
            "- Dates: {} ({} succeeded, {} failed)",
            totals.dates, totals.succeeded, totals.failed
        ),
        format!(
            "- Races matched: {}/{} ({:.1}%)",
            totals.matched,
            totals.races,
            totals.match_rate * 100.0
        ),
        format!("- Runners priced: {}/{}", totals.runners_priced, totals.runners),
        String::new(),
        "## Dates".to_string(),
        "| date | status | races | matched | skipped | note |".to_string(),
        "|---|---|---|---|---|---|".to_string(),
    ];

    for outcome in &run.dates {
        let line = match (&outcome.report, outcome.status) {
            (Some(report), DateStatus::Succeeded) => format!(
                "| {} | ok | {} | {} | {} | {} |",
                outcome.date,
                report.matching.races,
                report.matching.matched,
                report.skipped_results.len() + report.skipped_price_feed.len(),
                if report.matching.double_claims > 0 {
                    format!("{} double claims", report.matching.double_claims)
                } else {
                    String::new()
                }
            ),
            _ => format!(
                "| {} | failed | - | - | - | {} |",
                outcome.date,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        };
        lines.push(line);
    }

    let unmatched: Vec<String> = run
        .reports()
        .flat_map(|r| {
            r.matching
                .unmatched
                .iter()
                .map(move |u| format!("- {} {} {} {}", r.date, u.course, u.off_time, u.race_name))
        })
        .collect();
    if !unmatched.is_empty() {
        lines.push(String::new());
        lines.push("## Unmatched Races".to_string());
        lines.extend(unmatched);
    }

    let near_misses: Vec<String> = run
        .reports()
        .flat_map(|r| r.matching.near_misses.iter())
        .map(|n| format!("- {} ~ {} ({:.2})", n.horse, n.closest, n.similarity))
        .collect();
    if !near_misses.is_empty() {
        lines.push(String::new());
        lines.push("## Runner Near Misses".to_string());
        lines.extend(near_misses);
    }

    lines.push(String::new());
    lines.join("\n")
}

async fn export_snapshots(reports_dir: &Path, run: &RunReport) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let races: Vec<&ReconciledRace> = run.races().collect();
    let runners: Vec<(&str, &ReconciledRunner)> = races
        .iter()
        .flat_map(|race| race.runners.iter().map(move |r| (race.race_key.as_str(), r)))
        .collect();

    let races_path = snapshot_dir.join("races.parquet");
    let runners_path = snapshot_dir.join("runners.parquet");
    write_parquet(&races_path, races_batch(&races)?)?;
    write_parquet(&runners_path, runners_batch(&runners)?)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("races", reports_dir, &races_path, races.len())?,
            manifest_entry("runners", reports_dir, &runners_path, runners.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn races_batch(races: &[&ReconciledRace]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("race_key", DataType::Utf8, false),
        ArrowField::new("race_date", DataType::Utf8, false),
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("course", DataType::Utf8, false),
        ArrowField::new("off_time", DataType::Utf8, false),
        ArrowField::new("race_name", DataType::Utf8, false),
        ArrowField::new("race_type", DataType::Utf8, false),
        ArrowField::new("handicap", DataType::Boolean, false),
        ArrowField::new("course_id", DataType::Int64, true),
        ArrowField::new("price_event_id", DataType::Utf8, true),
        ArrowField::new("match_tier", DataType::Utf8, true),
        ArrowField::new("match_jaccard", DataType::Float64, true),
        ArrowField::new("match_time_diff", DataType::UInt32, true),
    ]));

    let text = |f: fn(&ReconciledRace) -> &str| {
        StringArray::from(races.iter().map(|r| Some(f(*r))).collect::<Vec<_>>())
    };
    let dates = StringArray::from(
        races
            .iter()
            .map(|r| Some(r.date.format("%Y-%m-%d").to_string()))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|r| r.race_key.as_str())),
            Arc::new(dates),
            Arc::new(text(|r| r.region.as_str())),
            Arc::new(text(|r| r.course.as_str())),
            Arc::new(text(|r| r.off_time.as_str())),
            Arc::new(text(|r| r.race_name.as_str())),
            Arc::new(text(|r| r.race_type.as_str())),
            Arc::new(BooleanArray::from(races.iter().map(|r| r.handicap).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(races.iter().map(|r| r.course_id).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                races
                    .iter()
                    .map(|r| r.price_event_id.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                races
                    .iter()
                    .map(|r| r.confidence.map(|c| c.tier.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                races
                    .iter()
                    .map(|r| r.confidence.map(|c| c.jaccard))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                races
                    .iter()
                    .map(|r| r.confidence.map(|c| c.time_diff_minutes))
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building races record batch")
}

fn runners_batch(runners: &[(&str, &ReconciledRunner)]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("runner_key", DataType::Utf8, false),
        ArrowField::new("race_key", DataType::Utf8, false),
        ArrowField::new("horse", DataType::Utf8, false),
        ArrowField::new("saddle_number", DataType::UInt32, true),
        ArrowField::new("draw", DataType::UInt32, true),
        ArrowField::new("position", DataType::Utf8, true),
        ArrowField::new("horse_id", DataType::Int64, true),
        ArrowField::new("jockey_id", DataType::Int64, true),
        ArrowField::new("trainer_id", DataType::Int64, true),
        ArrowField::new("owner_id", DataType::Int64, true),
        ArrowField::new("win_bsp", DataType::Float64, true),
        ArrowField::new("win_ppwap", DataType::Float64, true),
        ArrowField::new("win_morning_wap", DataType::Float64, true),
        ArrowField::new("win_pp_traded_vol", DataType::Float64, true),
        ArrowField::new("place_bsp", DataType::Float64, true),
        ArrowField::new("place_ppwap", DataType::Float64, true),
    ]));

    let ids = |f: fn(&ReconciledRunner) -> Option<i64>| {
        Int64Array::from(runners.iter().map(|(_, r)| f(*r)).collect::<Vec<_>>())
    };
    let win = |f: fn(&MarketPrices) -> Option<f64>| {
        Float64Array::from(
            runners
                .iter()
                .map(|(_, r)| r.prices.as_ref().and_then(|p| f(&p.win)))
                .collect::<Vec<_>>(),
        )
    };
    let place = |f: fn(&MarketPrices) -> Option<f64>| {
        Float64Array::from(
            runners
                .iter()
                .map(|(_, r)| r.prices.as_ref().and_then(|p| f(&p.place)))
                .collect::<Vec<_>>(),
        )
    };

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                runners
                    .iter()
                    .map(|(_, r)| Some(r.runner_key.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                runners.iter().map(|(race_key, _)| Some(*race_key)).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                runners
                    .iter()
                    .map(|(_, r)| Some(r.result.horse.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                runners.iter().map(|(_, r)| r.result.number).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                runners.iter().map(|(_, r)| r.result.draw).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                runners
                    .iter()
                    .map(|(_, r)| r.result.position.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(ids(|r| r.dimension_ids.horse_id)),
            Arc::new(ids(|r| r.dimension_ids.jockey_id)),
            Arc::new(ids(|r| r.dimension_ids.trainer_id)),
            Arc::new(ids(|r| r.dimension_ids.owner_id)),
            Arc::new(win(|m| m.bsp)),
            Arc::new(win(|m| m.ppwap)),
            Arc::new(win(|m| m.morning_wap)),
            Arc::new(win(|m| m.pp_traded_vol)),
            Arc::new(place(|m| m.bsp)),
            Arc::new(place(|m| m.ppwap)),
        ],
    )
    .context("building runners record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown overview of the most recent `runs` report directories.
pub fn report_recent_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Paddock Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("summary.json");
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        let totals = &summary["totals"];
        let count = |field: &str| totals.get(field).and_then(|v| v.as_u64()).unwrap_or(0);
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- dates: {} ({} failed)",
            count("dates"),
            count("failed")
        ));
        lines.push(format!("- races matched: {}/{}", count("matched"), count("races")));
        lines.push(format!(
            "- runners priced: {}/{}",
            count("runners_priced"),
            count("runners")
        ));
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- snapshot manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchSummary;
    use crate::pipeline::{DateOutcome, DateReport};
    use crate::writer::PersistOutcome;
    use chrono::{NaiveDate, Utc};
    use paddock_core::{
        MatchConfidence, MatchTier, PriceFields, RaceType, Region, ResultsRace, ResultsRunner,
    };
    use uuid::Uuid;

    fn sample_run() -> RunReport {
        let date = NaiveDate::from_ymd_opt(2024, 1, 13).unwrap();
        let mut race = ReconciledRace::from_results(ResultsRace {
            date,
            region: Region::Gb,
            course: "Ascot".into(),
            off_time: "14:30".into(),
            race_name: "Handicap Chase".into(),
            race_type: RaceType::Chase,
            distance: None,
            going: None,
            race_class: None,
            runners: vec![
                ResultsRunner {
                    horse: "Frankel".into(),
                    number: Some(1),
                    ..Default::default()
                },
                ResultsRunner {
                    horse: "Enable".into(),
                    number: Some(2),
                    ..Default::default()
                },
            ],
        });
        race.confidence = Some(MatchConfidence {
            tier: MatchTier::CourseTime,
            jaccard: 1.0,
            time_diff_minutes: 1,
        });
        race.runners[0].prices = Some(PriceFields::default());

        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dates: vec![
                DateOutcome {
                    date,
                    status: DateStatus::Succeeded,
                    error: None,
                    report: Some(DateReport {
                        date,
                        attempts: 1,
                        artifacts: vec![],
                        skipped_results: vec![],
                        skipped_price_feed: vec![],
                        matching: MatchSummary {
                            races: 1,
                            matched: 1,
                            runners: 2,
                            runners_priced: 1,
                            ..Default::default()
                        },
                        persisted: PersistOutcome::default(),
                        races: vec![race],
                    }),
                },
                DateOutcome {
                    date: date.succ_opt().unwrap(),
                    status: DateStatus::Failed,
                    error: Some("source price-feed unavailable".into()),
                    report: None,
                },
            ],
        }
    }

    #[test]
    fn totals_aggregate_successful_dates() {
        let totals = RunTotals::from_run(&sample_run());
        assert_eq!(totals.dates, 2);
        assert_eq!(totals.succeeded, 1);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.runners_priced, 1);
        assert_eq!(totals.match_rate, 1.0);
    }

    #[tokio::test]
    async fn run_reports_and_manifest_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let run = sample_run();
        let reports_dir = write_run_reports(dir.path(), &run).await.unwrap();

        assert!(reports_dir.join("summary.json").exists());
        let brief = std::fs::read_to_string(reports_dir.join("daily_brief.md")).unwrap();
        assert!(brief.contains("Races matched: 1/1"));
        assert!(brief.contains("| 2024-01-14 | failed |"));

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(reports_dir.join("snapshots/manifest.json")).unwrap(),
        )
        .unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1]["rows"], 2);
        assert_eq!(files[0]["sha256"].as_str().unwrap().len(), 64);

        let overview = report_recent_runs(dir.path(), 5).unwrap();
        assert!(overview.contains(&run.run_id.to_string()));
        assert!(overview.contains("races matched: 1/1"));
    }
}
