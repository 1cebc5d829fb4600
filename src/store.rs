//! Storage seam for the pipeline.
//!
//! Every read and write the core performs goes through [`CaseStore`]. The
//! production implementation is [`crate::db::PgStore`]; tests use the
//! in-memory store.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DailyCase, Notification, PredictionFilter, PredictionRecord, WeeklyCase};
use crate::yearweek::YearWeek;

#[cfg(test)]
pub mod memory;

/// Which (code, yearweek) groups an aggregation run recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationScope {
    /// Every code with daily rows in this week, overwriting existing totals.
    Week(YearWeek),
    /// Only groups that have daily rows but no weekly row yet.
    Pending,
}

impl fmt::Display for AggregationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationScope::Week(week) => write!(f, "week {week}"),
            AggregationScope::Pending => f.write_str("pending weeks"),
        }
    }
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Inserts a daily row. Returns `false` when (code, date) already exists.
    async fn insert_daily_case(&self, case: &DailyCase) -> Result<bool>;

    /// Recomputes weekly totals for `scope` atomically and returns the
    /// upserted rows.
    async fn aggregate(&self, scope: AggregationScope) -> Result<Vec<WeeklyCase>>;

    /// Latest yearweek present in the daily table.
    async fn latest_daily_yearweek(&self) -> Result<Option<YearWeek>>;

    /// Distinct codes present in the weekly table, sorted.
    async fn weekly_codes(&self) -> Result<Vec<String>>;

    /// Weekly series for `code`, ordered by yearweek ascending.
    async fn weekly_series(&self, code: &str) -> Result<Vec<WeeklyCase>>;

    async fn latest_weekly_yearweek(&self, code: &str) -> Result<Option<YearWeek>>;

    /// All weekly rows, or those of one week, ordered by week desc then cases desc.
    async fn weekly_stats(&self, yearweek: Option<YearWeek>) -> Result<Vec<WeeklyCase>>;

    /// Upserts on (code, yearweek, model_version), replacing values in place.
    async fn upsert_predictions(&self, records: &[PredictionRecord]) -> Result<()>;

    async fn predictions(&self, filter: &PredictionFilter) -> Result<Vec<PredictionRecord>>;

    /// Latest yearweek among forecast (non-realized) predictions.
    async fn latest_forecast_yearweek(&self) -> Result<Option<YearWeek>>;

    /// The most recently created forecast for `yearweek`, one per code.
    async fn latest_forecasts_for_week(&self, yearweek: YearWeek) -> Result<Vec<PredictionRecord>>;

    /// Weekly cases for `code` at ISO week `week` in years before `before_year`.
    async fn historical_week_cases(&self, code: &str, week: u32, before_year: i32)
        -> Result<Vec<i64>>;

    /// Inserts unless (code, yearweek) already has a notification.
    async fn insert_notification(&self, notification: &Notification) -> Result<bool>;

    async fn recent_notifications(&self, limit: usize) -> Result<Vec<Notification>>;
}
