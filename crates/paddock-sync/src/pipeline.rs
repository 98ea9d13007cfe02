use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use paddock_adapters::{AdapterContext, AdapterError, PriceFeedAdapter, RawPayload, ResultsAdapter, SkippedRecord, SourceAdapter};
use paddock_core::ReconciledRace;
use paddock_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher, RaceStore};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::matcher::{match_day, DayMatch, MatchSummary};
use crate::reports::write_run_reports;
use crate::writer::{persist_batch, PersistOutcome};
use crate::{IngestConfig, IngestError, SourceRegistry};

/// Everything one date produced.
#[derive(Debug, Clone, Serialize)]
pub struct DateReport {
    pub date: NaiveDate,
    pub attempts: usize,
    pub artifacts: Vec<String>,
    pub skipped_results: Vec<SkippedRecord>,
    pub skipped_price_feed: Vec<SkippedRecord>,
    pub matching: MatchSummary,
    pub persisted: PersistOutcome,
    #[serde(skip)]
    pub races: Vec<ReconciledRace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DateOutcome {
    pub date: NaiveDate,
    pub status: DateStatus,
    pub error: Option<String>,
    pub report: Option<DateReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dates: Vec<DateOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.count(DateStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(DateStatus::Failed)
    }

    fn count(&self, status: DateStatus) -> usize {
        self.dates.iter().filter(|d| d.status == status).count()
    }

    pub fn reports(&self) -> impl Iterator<Item = &DateReport> {
        self.dates.iter().filter_map(|d| d.report.as_ref())
    }

    /// Reconciled races of every successful date.
    pub fn races(&self) -> impl Iterator<Item = &ReconciledRace> {
        self.reports().flat_map(|r| r.races.iter())
    }
}

struct Prepared {
    day: DayMatch,
    artifacts: Vec<String>,
    skipped_results: Vec<SkippedRecord>,
    skipped_price_feed: Vec<SkippedRecord>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    store: Arc<dyn RaceStore>,
    http: HttpFetcher,
    artifacts: ArtifactStore,
    results: ResultsAdapter,
    prices: PriceFeedAdapter,
    date_retry: BackoffPolicy,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig, registry: &SourceRegistry, store: Arc<dyn RaceStore>) -> Result<Self> {
        let (results, prices) = registry.adapters(&config.workspace_root)?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            date_retry: BackoffPolicy {
                max_retries: config.date_attempts.saturating_sub(1),
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
            config,
            store,
            http,
            results,
            prices,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingests one date under a fresh run id.
    pub async fn run_date(&self, date: NaiveDate) -> Result<DateReport, IngestError> {
        self.ingest_date(Uuid::new_v4(), date).await
    }

    /// Ingests `from..=to` one date at a time. A failed date is recorded and
    /// the run moves on.
    pub async fn run_range(&self, from: NaiveDate, to: NaiveDate) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut dates = Vec::new();

        for date in from.iter_days().take_while(|d| *d <= to) {
            let outcome = match self.ingest_date(run_id, date).await {
                Ok(report) => {
                    info!(
                        %run_id,
                        %date,
                        races = report.matching.races,
                        matched = report.matching.matched,
                        match_rate = report.matching.match_rate(),
                        "date ingested"
                    );
                    DateOutcome {
                        date,
                        status: DateStatus::Succeeded,
                        error: None,
                        report: Some(report),
                    }
                }
                Err(err) => {
                    warn!(%run_id, %date, error = %err, "date failed; continuing with next date");
                    DateOutcome {
                        date,
                        status: DateStatus::Failed,
                        error: Some(err.to_string()),
                        report: None,
                    }
                }
            };
            dates.push(outcome);
        }

        let run = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dates,
        };
        info!(%run_id, succeeded = run.succeeded(), failed = run.failed(), "ingestion run finished");
        run
    }

    async fn ingest_date(&self, run_id: Uuid, date: NaiveDate) -> Result<DateReport, IngestError> {
        let mut attempt = 1;
        loop {
            let span = info_span!("ingest_date", %run_id, %date, attempt);
            match self.attempt_date(run_id, date, attempt).instrument(span).await {
                Err(err @ IngestError::Timeout { .. }) if attempt < self.config.date_attempts => {
                    let delay = self.date_retry.delay_for_attempt(attempt - 1);
                    warn!(%run_id, %date, attempt, error = %err, ?delay, "retrying whole date");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn attempt_date(
        &self,
        run_id: Uuid,
        date: NaiveDate,
        attempt: usize,
    ) -> Result<DateReport, IngestError> {
        let budget = self.config.date_budget;
        let deadline = Instant::now() + budget;
        let Prepared {
            mut day,
            artifacts,
            skipped_results,
            skipped_price_feed,
        } = timeout_at(deadline, self.prepare(run_id, date))
            .await
            .map_err(|_| IngestError::Timeout { date, budget })??;

        let persisted = persist_batch(self.store.as_ref(), date, &mut day.races, deadline, budget).await?;
        Ok(DateReport {
            date,
            attempts: attempt,
            artifacts,
            skipped_results,
            skipped_price_feed,
            matching: day.summary,
            persisted,
            races: day.races,
        })
    }

    async fn prepare(&self, run_id: Uuid, date: NaiveDate) -> Result<Prepared, IngestError> {
        let ctx = AdapterContext {
            run_id,
            race_date: date,
        };
        let (results_payload, price_payload) = tokio::join!(
            self.results.fetch(&self.http, &ctx),
            self.prices.fetch(&self.http, &ctx)
        );
        let results_payload = results_payload.map_err(|e| source_error(&self.results, date, e))?;
        let price_payload = price_payload.map_err(|e| source_error(&self.prices, date, e))?;

        let artifacts = vec![
            self.archive(date, &results_payload).await?,
            self.archive(date, &price_payload).await?,
        ];

        let results = self
            .results
            .parse(date, &results_payload)
            .map_err(|e| source_error(&self.results, date, e))?;
        let prices = self
            .prices
            .parse(date, &price_payload)
            .map_err(|e| source_error(&self.prices, date, e))?;
        if !results.skipped.is_empty() || !prices.skipped.is_empty() {
            warn!(
                %date,
                results_skipped = results.skipped.len(),
                price_feed_skipped = prices.skipped.len(),
                "records skipped while parsing"
            );
        }

        let day = match_day(date, results.records, &prices.records, &self.config.matching);
        Ok(Prepared {
            day,
            artifacts,
            skipped_results: results.skipped,
            skipped_price_feed: prices.skipped,
        })
    }

    async fn archive(&self, date: NaiveDate, payload: &RawPayload) -> Result<String, IngestError> {
        let stored = self
            .artifacts
            .store_bytes(payload.payload_date, &payload.source_id, "json", &payload.body)
            .await
            .map_err(|e| IngestError::Artifact {
                source_id: payload.source_id.clone(),
                date,
                reason: format!("{e:#}"),
            })?;
        Ok(stored.relative_path.display().to_string())
    }
}

fn source_error<A: SourceAdapter>(adapter: &A, date: NaiveDate, source: AdapterError) -> IngestError {
    IngestError::SourceFetch {
        source_id: adapter.source_id().to_string(),
        date,
        source,
    }
}

/// Cron job that ingests the previous calendar day and writes its reports.
pub async fn maybe_build_scheduler(pipeline: Arc<IngestPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let Some(yesterday) = Utc::now().date_naive().pred_opt() else {
                return;
            };
            let run = pipeline.run_range(yesterday, yesterday).await;
            if let Err(err) = write_run_reports(&pipeline.config.reports_dir, &run).await {
                warn!(run_id = %run.run_id, error = %err, "writing scheduled run reports");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
