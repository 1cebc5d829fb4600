use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::{PipelineError, Result};
use crate::models::{DailyCase, Notification, PredictionFilter, PredictionRecord, WeeklyCase};
use crate::store::{AggregationScope, CaseStore};
use crate::yearweek::{generate_yearweek, YearWeek};

/// Advisory lock key serializing aggregation across processes.
const AGGREGATION_LOCK: i64 = 0x5752_454b_4c59;

const WEEKLY_UPSERT_TAIL: &str = r#"
    GROUP BY dc.icd10_code, dc.yearweek
    ON CONFLICT (icd10_code, yearweek) DO UPDATE
    SET cases = EXCLUDED.cases, mondayofweek = EXCLUDED.mondayofweek
    RETURNING icd10_code, yearweek, cases, mondayofweek
"#;

const PREDICTION_COLUMNS: &str = "icd10_code, yearweek, model_version, predicted_cases, \
     confidence_lower, confidence_upper, mondayofweek, created_at, is_actual";

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_yearweek(raw: &str) -> Result<YearWeek> {
    raw.parse()
}

fn weekly_from_row(row: &PgRow) -> Result<WeeklyCase> {
    Ok(WeeklyCase {
        code: row.try_get("icd10_code")?,
        yearweek: parse_yearweek(row.try_get("yearweek")?)?,
        cases: row.try_get("cases")?,
        monday_of_week: row.try_get("mondayofweek")?,
    })
}

fn prediction_from_row(row: &PgRow) -> Result<PredictionRecord> {
    Ok(PredictionRecord {
        code: row.try_get("icd10_code")?,
        yearweek: parse_yearweek(row.try_get("yearweek")?)?,
        model_version: row.try_get("model_version")?,
        predicted_cases: row.try_get("predicted_cases")?,
        confidence_lower: row.try_get("confidence_lower")?,
        confidence_upper: row.try_get("confidence_upper")?,
        monday_of_week: row.try_get("mondayofweek")?,
        created_at: row.try_get("created_at")?,
        is_actual: row.try_get("is_actual")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification> {
    Ok(Notification {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        code: row.try_get("icd10_code")?,
        yearweek: parse_yearweek(row.try_get("yearweek")?)?,
        message: row.try_get("message")?,
    })
}

fn latest_from_row(row: &PgRow) -> Result<Option<YearWeek>> {
    let latest: Option<String> = row.try_get("latest")?;
    latest.as_deref().map(parse_yearweek).transpose()
}

#[async_trait]
impl CaseStore for PgStore {
    async fn insert_daily_case(&self, case: &DailyCase) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO surveillance.daily_case (icd10_code, date, cases, yearweek)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (icd10_code, date) DO NOTHING
            "#,
        )
        .bind(&case.code)
        .bind(case.date)
        .bind(case.cases)
        .bind(generate_yearweek(case.date))
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Persistence)?;

        Ok(result.rows_affected() > 0)
    }

    async fn aggregate(&self, scope: AggregationScope) -> Result<Vec<WeeklyCase>> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::Aggregation)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AGGREGATION_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::Aggregation)?;

        let rows = match scope {
            AggregationScope::Week(week) => {
                let sql = format!(
                    r#"
                    INSERT INTO surveillance.weekly_case (icd10_code, yearweek, cases, mondayofweek)
                    SELECT dc.icd10_code, dc.yearweek, SUM(dc.cases)::BIGINT,
                           MIN(DATE_TRUNC('week', dc.date)::date)
                    FROM surveillance.daily_case dc
                    WHERE dc.yearweek = $1
                    {WEEKLY_UPSERT_TAIL}
                    "#
                );
                sqlx::query(&sql)
                    .bind(week.to_string())
                    .fetch_all(&mut *tx)
                    .await
            }
            AggregationScope::Pending => {
                let sql = format!(
                    r#"
                    INSERT INTO surveillance.weekly_case (icd10_code, yearweek, cases, mondayofweek)
                    SELECT dc.icd10_code, dc.yearweek, SUM(dc.cases)::BIGINT,
                           MIN(DATE_TRUNC('week', dc.date)::date)
                    FROM surveillance.daily_case dc
                    WHERE NOT EXISTS (
                        SELECT 1 FROM surveillance.weekly_case wc
                        WHERE wc.yearweek = dc.yearweek AND wc.icd10_code = dc.icd10_code
                    )
                    {WEEKLY_UPSERT_TAIL}
                    "#
                );
                sqlx::query(&sql).fetch_all(&mut *tx).await
            }
        }
        .map_err(PipelineError::Aggregation)?;

        let weekly = rows
            .iter()
            .map(weekly_from_row)
            .collect::<Result<Vec<_>>>()?;
        tx.commit().await.map_err(PipelineError::Aggregation)?;
        Ok(weekly)
    }

    async fn latest_daily_yearweek(&self) -> Result<Option<YearWeek>> {
        let row = sqlx::query("SELECT MAX(yearweek) AS latest FROM surveillance.daily_case")
            .fetch_one(&self.pool)
            .await?;
        latest_from_row(&row)
    }

    async fn weekly_codes(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT icd10_code FROM surveillance.weekly_case ORDER BY icd10_code",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("icd10_code").map_err(PipelineError::from))
            .collect()
    }

    async fn weekly_series(&self, code: &str) -> Result<Vec<WeeklyCase>> {
        let rows = sqlx::query(
            r#"
            SELECT icd10_code, yearweek, cases, mondayofweek
            FROM surveillance.weekly_case
            WHERE icd10_code = $1
            ORDER BY yearweek ASC
            "#,
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(weekly_from_row).collect()
    }

    async fn latest_weekly_yearweek(&self, code: &str) -> Result<Option<YearWeek>> {
        let row = sqlx::query(
            "SELECT MAX(yearweek) AS latest FROM surveillance.weekly_case WHERE icd10_code = $1",
        )
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        latest_from_row(&row)
    }

    async fn weekly_stats(&self, yearweek: Option<YearWeek>) -> Result<Vec<WeeklyCase>> {
        let rows = sqlx::query(
            r#"
            SELECT icd10_code, yearweek, cases, mondayofweek
            FROM surveillance.weekly_case
            WHERE $1::TEXT IS NULL OR yearweek = $1
            ORDER BY yearweek DESC, cases DESC
            "#,
        )
        .bind(yearweek.map(|week| week.to_string()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(weekly_from_row).collect()
    }

    async fn upsert_predictions(&self, records: &[PredictionRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::Persistence)?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO surveillance.predictions
                (icd10_code, yearweek, model_version, predicted_cases, confidence_lower,
                 confidence_upper, mondayofweek, created_at, is_actual)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (icd10_code, yearweek, model_version) DO UPDATE
                SET predicted_cases = EXCLUDED.predicted_cases,
                    confidence_lower = EXCLUDED.confidence_lower,
                    confidence_upper = EXCLUDED.confidence_upper,
                    mondayofweek = EXCLUDED.mondayofweek,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(&record.code)
            .bind(record.yearweek.to_string())
            .bind(&record.model_version)
            .bind(record.predicted_cases)
            .bind(record.confidence_lower)
            .bind(record.confidence_upper)
            .bind(record.monday_of_week)
            .bind(record.created_at)
            .bind(record.is_actual)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::Persistence)?;
        }

        tx.commit().await.map_err(PipelineError::Persistence)?;
        Ok(())
    }

    async fn predictions(&self, filter: &PredictionFilter) -> Result<Vec<PredictionRecord>> {
        let sql = format!(
            r#"
            SELECT {PREDICTION_COLUMNS}
            FROM surveillance.predictions
            WHERE ($1::TEXT IS NULL OR icd10_code = $1)
              AND ($2::TEXT IS NULL OR model_version = $2)
            ORDER BY icd10_code, yearweek ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.code.as_deref())
            .bind(filter.model_version.as_deref())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(prediction_from_row).collect()
    }

    async fn latest_forecast_yearweek(&self) -> Result<Option<YearWeek>> {
        let row = sqlx::query(
            "SELECT MAX(yearweek) AS latest FROM surveillance.predictions WHERE is_actual = FALSE",
        )
        .fetch_one(&self.pool)
        .await?;
        latest_from_row(&row)
    }

    async fn latest_forecasts_for_week(&self, yearweek: YearWeek) -> Result<Vec<PredictionRecord>> {
        let sql = format!(
            r#"
            SELECT DISTINCT ON (icd10_code) {PREDICTION_COLUMNS}
            FROM surveillance.predictions
            WHERE yearweek = $1 AND is_actual = FALSE
            ORDER BY icd10_code, created_at DESC, model_version DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(yearweek.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(prediction_from_row).collect()
    }

    async fn historical_week_cases(
        &self,
        code: &str,
        week: u32,
        before_year: i32,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT cases
            FROM surveillance.weekly_case
            WHERE icd10_code = $1
              AND RIGHT(yearweek, 2) = $2
              AND CAST(LEFT(yearweek, 4) AS INTEGER) < $3
            ORDER BY yearweek
            "#,
        )
        .bind(code)
        .bind(format!("{week:02}"))
        .bind(before_year)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("cases").map_err(PipelineError::from))
            .collect()
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO surveillance.notifications (id, created_at, icd10_code, yearweek, message)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (icd10_code, yearweek) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(notification.created_at)
        .bind(&notification.code)
        .bind(notification.yearweek.to_string())
        .bind(&notification.message)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Persistence)?;

        Ok(result.rows_affected() > 0)
    }

    async fn recent_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, icd10_code, yearweek, message
            FROM surveillance.notifications
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(notification_from_row).collect()
    }
}
