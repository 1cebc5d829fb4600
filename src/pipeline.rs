//! Orchestration of aggregation, training, forecasting and anomaly checks.
//!
//! Every entry point is callable from the CLI and from scheduled jobs with
//! the same semantics. A single in-process guard serializes the operations
//! that touch the weekly table.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::aggregate::{self, AggregationSummary};
use crate::anomaly;
use crate::error::{PipelineError, Result};
use crate::forecast;
use crate::model_store::ModelStore;
use crate::models::{DailyCase, Notification, PredictionFilter, PredictionRecord, WeeklyCase};
use crate::store::CaseStore;
use crate::yearweek::YearWeek;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub confidence_level: f64,
    pub sigma_multiplier: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            sigma_multiplier: 2.0,
        }
    }
}

#[derive(Debug)]
pub enum CodeOutcome {
    Trained { version: String, predictions: usize },
    Skipped { reason: String },
    Failed { error: PipelineError },
}

#[derive(Debug)]
pub struct CodeReport {
    pub code: String,
    pub outcome: CodeOutcome,
}

#[derive(Debug, Default)]
pub struct TrainingReport {
    pub codes: Vec<CodeReport>,
}

impl TrainingReport {
    pub fn trained(&self) -> usize {
        self.count(|o| matches!(o, CodeOutcome::Trained { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CodeOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CodeOutcome::Failed { .. }))
    }

    pub fn outcome(&self, code: &str) -> Option<&CodeOutcome> {
        self.codes
            .iter()
            .find(|report| report.code == code)
            .map(|report| &report.outcome)
    }

    fn count(&self, predicate: impl Fn(&CodeOutcome) -> bool) -> usize {
        self.codes.iter().filter(|r| predicate(&r.outcome)).count()
    }
}

impl fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} trained, {} skipped, {} failed",
            self.trained(),
            self.skipped(),
            self.failed()
        )?;
        for report in &self.codes {
            match &report.outcome {
                CodeOutcome::Trained {
                    version,
                    predictions,
                } => writeln!(f, "- {}: {} predictions ({})", report.code, predictions, version)?,
                CodeOutcome::Skipped { reason } => writeln!(f, "- {}: skipped, {}", report.code, reason)?,
                CodeOutcome::Failed { error } => writeln!(f, "- {}: failed, {}", report.code, error)?,
            }
        }
        Ok(())
    }
}

pub struct Pipeline {
    store: Arc<dyn CaseStore>,
    models: ModelStore,
    settings: PipelineSettings,
    clock: Clock,
    guard: Mutex<()>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn CaseStore>, models: ModelStore, settings: PipelineSettings) -> Self {
        Self {
            store,
            models,
            settings,
            clock: Arc::new(Utc::now),
            guard: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Records one day's count. Returns `false` if (code, date) already exists.
    pub async fn submit_daily_case(&self, date: NaiveDate, code: &str, cases: i32) -> Result<bool> {
        let code = code.trim();
        if code.is_empty() {
            return Err(PipelineError::InvalidInput("disease code is empty".to_string()));
        }
        if cases < 0 {
            return Err(PipelineError::InvalidInput(format!(
                "case count must be non-negative, got {cases}"
            )));
        }

        let inserted = self
            .store
            .insert_daily_case(&DailyCase::new(code, date, cases))
            .await?;
        if !inserted {
            info!(code, %date, "daily case already recorded, ignoring");
        }
        Ok(inserted)
    }

    /// Bulk-loads `date,code,cases` rows. Returns how many were new.
    pub async fn import_csv(&self, path: &Path) -> Result<usize> {
        #[derive(serde::Deserialize)]
        struct CsvRow {
            date: NaiveDate,
            code: String,
            cases: i32,
        }

        let mut reader = csv::Reader::from_path(path)?;
        let mut inserted = 0usize;
        let mut skipped = 0usize;

        for result in reader.deserialize::<CsvRow>() {
            let row = result?;
            if self.submit_daily_case(row.date, &row.code, row.cases).await? {
                inserted += 1;
            } else {
                skipped += 1;
            }
        }

        info!(path = %path.display(), inserted, skipped, "daily cases imported");
        Ok(inserted)
    }

    /// Recomputes weekly totals; failures propagate.
    pub async fn run_weekly_aggregation(&self, target: Option<YearWeek>) -> Result<AggregationSummary> {
        let _guard = self.guard.lock().await;
        aggregate::aggregate(self.store.as_ref(), target)
            .await
            .inspect_err(|err| error!(error = %err, "weekly aggregation failed"))
    }

    /// Aggregates the latest week present in the daily table, if any.
    pub async fn aggregate_latest(&self) -> Result<Option<AggregationSummary>> {
        match self.store.latest_daily_yearweek().await? {
            Some(week) => self.run_weekly_aggregation(Some(week)).await.map(Some),
            None => {
                warn!("no daily cases recorded");
                Ok(None)
            }
        }
    }

    /// Trains and forecasts every code with weekly data. Per-code failures
    /// are recorded in the report and never abort the cycle.
    pub async fn run_training_cycle(&self, forecast_steps: usize) -> Result<TrainingReport> {
        let _guard = self.guard.lock().await;
        let codes = self.store.weekly_codes().await?;
        info!(codes = codes.len(), forecast_steps, "starting training cycle");

        let now = (self.clock)();
        let mut report = TrainingReport::default();
        for code in codes {
            let outcome = match self.train_code(&code, forecast_steps, now).await {
                Ok(outcome) => outcome,
                Err(PipelineError::InsufficientData { .. }) => CodeOutcome::Skipped {
                    reason: "no weekly data".to_string(),
                },
                Err(error) => CodeOutcome::Failed { error },
            };

            match &outcome {
                CodeOutcome::Trained {
                    version,
                    predictions,
                } => info!(code = %code, version = %version, predictions, "code processed"),
                CodeOutcome::Skipped { reason } => warn!(code = %code, reason = %reason, "code skipped"),
                CodeOutcome::Failed { error } => error!(code = %code, error = %error, "code failed"),
            }
            report.codes.push(CodeReport { code, outcome });
        }

        info!(
            trained = report.trained(),
            skipped = report.skipped(),
            failed = report.failed(),
            "training cycle finished"
        );
        Ok(report)
    }

    async fn train_code(&self, code: &str, steps: usize, now: DateTime<Utc>) -> Result<CodeOutcome> {
        let series = self.store.weekly_series(code).await?;
        if series.is_empty() {
            return Ok(CodeOutcome::Skipped {
                reason: "no weekly data".to_string(),
            });
        }

        let artifact = self.models.train(code, &series, now.date_naive())?;
        // Forecasts continue the trained window even if newer weeks landed since.
        let records = forecast::forecast_and_persist(
            self.store.as_ref(),
            &artifact,
            artifact.last_yearweek,
            steps,
            self.settings.confidence_level,
            now,
        )
        .await?;

        Ok(CodeOutcome::Trained {
            version: artifact.version,
            predictions: records.len(),
        })
    }

    /// Forecasts again from a stored model version without retraining,
    /// starting after the latest aggregated week of the code.
    pub async fn reforecast(&self, code: &str, version: &str, steps: usize) -> Result<Vec<PredictionRecord>> {
        let _guard = self.guard.lock().await;
        let artifact = self.models.load(code, version)?;
        let last_week = self
            .store
            .latest_weekly_yearweek(code)
            .await?
            .unwrap_or(artifact.last_yearweek);
        forecast::forecast_and_persist(
            self.store.as_ref(),
            &artifact,
            last_week,
            steps,
            self.settings.confidence_level,
            (self.clock)(),
        )
        .await
    }

    pub async fn check_and_notify(&self, target: Option<YearWeek>) -> Result<usize> {
        let _guard = self.guard.lock().await;
        let created = anomaly::check_and_notify(
            self.store.as_ref(),
            target,
            self.settings.sigma_multiplier,
            (self.clock)(),
        )
        .await?;
        info!(created, "anomaly check finished");
        Ok(created)
    }

    pub async fn get_predictions(&self, filter: &PredictionFilter) -> Result<Vec<PredictionRecord>> {
        self.store.predictions(filter).await
    }

    pub async fn get_weekly_stats(&self, yearweek: Option<YearWeek>) -> Result<Vec<WeeklyCase>> {
        self.store.weekly_stats(yearweek).await
    }

    /// Latest yearweek in the daily table.
    pub async fn get_latest_yearweek(&self) -> Result<Option<YearWeek>> {
        self.store.latest_daily_yearweek().await
    }

    pub async fn recent_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        self.store.recent_notifications(limit).await
    }
}
