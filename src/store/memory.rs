use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{AggregationScope, CaseStore};
use crate::aggregate::fold_daily;
use crate::error::{PipelineError, Result};
use crate::models::{DailyCase, Notification, PredictionFilter, PredictionRecord, WeeklyCase};
use crate::yearweek::YearWeek;

/// HashMap-backed store with failure injection for pipeline tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    daily: BTreeMap<(String, NaiveDate), DailyCase>,
    weekly: BTreeMap<(String, YearWeek), WeeklyCase>,
    predictions: BTreeMap<(String, YearWeek, String), PredictionRecord>,
    notifications: Vec<Notification>,
    failing_series: HashSet<String>,
    listed_without_rows: BTreeSet<String>,
    late_rows: Vec<WeeklyCase>,
    fail_aggregation: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }

    pub fn put_weekly(&self, code: &str, yearweek: &str, cases: i64) {
        let yearweek: YearWeek = yearweek.parse().expect("valid yearweek");
        self.lock().weekly.insert(
            (code.to_string(), yearweek),
            WeeklyCase {
                code: code.to_string(),
                yearweek,
                cases,
                monday_of_week: yearweek.monday(),
            },
        );
    }

    /// Makes `weekly_series` fail for `code` with a storage error.
    pub fn fail_series_for(&self, code: &str) {
        self.lock().failing_series.insert(code.to_string());
    }

    /// Lists `code` among weekly codes although it has no rows, as when rows
    /// vanish between enumeration and load.
    pub fn list_code_without_rows(&self, code: &str) {
        self.lock().listed_without_rows.insert(code.to_string());
    }

    /// Adds a weekly row right after the next series load of its code, as a
    /// concurrent aggregation committing mid-training would.
    pub fn add_weekly_after_series_load(&self, code: &str, yearweek: &str, cases: i64) {
        let yearweek: YearWeek = yearweek.parse().expect("valid yearweek");
        self.lock().late_rows.push(WeeklyCase {
            code: code.to_string(),
            yearweek,
            cases,
            monday_of_week: yearweek.monday(),
        });
    }

    pub fn fail_aggregation(&self) {
        self.lock().fail_aggregation = true;
    }

    pub fn weekly_rows(&self) -> Vec<WeeklyCase> {
        self.lock().weekly.values().cloned().collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn insert_daily_case(&self, case: &DailyCase) -> Result<bool> {
        let mut inner = self.lock();
        let key = (case.code.clone(), case.date);
        if inner.daily.contains_key(&key) {
            return Ok(false);
        }
        inner.daily.insert(key, case.clone());
        Ok(true)
    }

    async fn aggregate(&self, scope: AggregationScope) -> Result<Vec<WeeklyCase>> {
        let mut inner = self.lock();
        if inner.fail_aggregation {
            return Err(PipelineError::Aggregation(sqlx::Error::Protocol(
                "injected aggregation failure".to_string(),
            )));
        }

        let selected: Vec<&DailyCase> = inner
            .daily
            .values()
            .filter(|row| match scope {
                AggregationScope::Week(week) => row.yearweek == week,
                AggregationScope::Pending => !inner
                    .weekly
                    .contains_key(&(row.code.clone(), row.yearweek)),
            })
            .collect();
        let folded = fold_daily(selected);

        for row in &folded {
            inner
                .weekly
                .insert((row.code.clone(), row.yearweek), row.clone());
        }
        Ok(folded)
    }

    async fn latest_daily_yearweek(&self) -> Result<Option<YearWeek>> {
        Ok(self.lock().daily.values().map(|row| row.yearweek).max())
    }

    async fn weekly_codes(&self) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut codes: BTreeSet<String> = inner.weekly.keys().map(|(code, _)| code.clone()).collect();
        codes.extend(inner.listed_without_rows.iter().cloned());
        Ok(codes.into_iter().collect())
    }

    async fn weekly_series(&self, code: &str) -> Result<Vec<WeeklyCase>> {
        let mut inner = self.lock();
        if inner.failing_series.contains(code) {
            return Err(PipelineError::Storage(sqlx::Error::Protocol(format!(
                "injected series failure for {code}"
            ))));
        }
        let series: Vec<WeeklyCase> = inner
            .weekly
            .values()
            .filter(|row| row.code == code)
            .cloned()
            .collect();

        let (late, kept): (Vec<WeeklyCase>, Vec<WeeklyCase>) =
            std::mem::take(&mut inner.late_rows)
                .into_iter()
                .partition(|row| row.code == code);
        inner.late_rows = kept;
        for row in late {
            inner.weekly.insert((row.code.clone(), row.yearweek), row);
        }
        Ok(series)
    }

    async fn latest_weekly_yearweek(&self, code: &str) -> Result<Option<YearWeek>> {
        Ok(self
            .lock()
            .weekly
            .values()
            .filter(|row| row.code == code)
            .map(|row| row.yearweek)
            .max())
    }

    async fn weekly_stats(&self, yearweek: Option<YearWeek>) -> Result<Vec<WeeklyCase>> {
        let mut rows: Vec<WeeklyCase> = self
            .lock()
            .weekly
            .values()
            .filter(|row| yearweek.map_or(true, |week| row.yearweek == week))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.yearweek.cmp(&a.yearweek).then(b.cases.cmp(&a.cases)));
        Ok(rows)
    }

    async fn upsert_predictions(&self, records: &[PredictionRecord]) -> Result<()> {
        let mut inner = self.lock();
        for record in records {
            inner.predictions.insert(
                (
                    record.code.clone(),
                    record.yearweek,
                    record.model_version.clone(),
                ),
                record.clone(),
            );
        }
        Ok(())
    }

    async fn predictions(&self, filter: &PredictionFilter) -> Result<Vec<PredictionRecord>> {
        let mut rows: Vec<PredictionRecord> = self
            .lock()
            .predictions
            .values()
            .filter(|p| filter.code.as_ref().map_or(true, |code| &p.code == code))
            .filter(|p| {
                filter
                    .model_version
                    .as_ref()
                    .map_or(true, |version| &p.model_version == version)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code).then(a.yearweek.cmp(&b.yearweek)));
        Ok(rows)
    }

    async fn latest_forecast_yearweek(&self) -> Result<Option<YearWeek>> {
        Ok(self
            .lock()
            .predictions
            .values()
            .filter(|p| !p.is_actual)
            .map(|p| p.yearweek)
            .max())
    }

    async fn latest_forecasts_for_week(&self, yearweek: YearWeek) -> Result<Vec<PredictionRecord>> {
        let mut latest: BTreeMap<String, PredictionRecord> = BTreeMap::new();
        for p in self
            .lock()
            .predictions
            .values()
            .filter(|p| p.yearweek == yearweek && !p.is_actual)
        {
            let newer = match latest.get(&p.code) {
                Some(current) => {
                    (p.created_at, &p.model_version) > (current.created_at, &current.model_version)
                }
                None => true,
            };
            if newer {
                latest.insert(p.code.clone(), p.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn historical_week_cases(
        &self,
        code: &str,
        week: u32,
        before_year: i32,
    ) -> Result<Vec<i64>> {
        Ok(self
            .lock()
            .weekly
            .values()
            .filter(|row| row.code == code && row.yearweek.week() == week)
            .filter(|row| row.yearweek.year() < before_year)
            .map(|row| row.cases)
            .collect())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<bool> {
        let mut inner = self.lock();
        let exists = inner
            .notifications
            .iter()
            .any(|n| n.code == notification.code && n.yearweek == notification.yearweek);
        if exists {
            return Ok(false);
        }
        inner.notifications.push(notification.clone());
        Ok(true)
    }

    async fn recent_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let mut rows = self.lock().notifications.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }
}
