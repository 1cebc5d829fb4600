//! Multi-step forecasts from trained artifacts and the prediction rows
//! they are persisted as.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::model_store::ModelArtifact;
use crate::models::PredictionRecord;
use crate::sarima::ForecastPoint;
use crate::store::CaseStore;
use crate::yearweek::YearWeek;

/// The next `steps` weeks beyond the training window, in order.
pub fn forecast(
    artifact: &ModelArtifact,
    steps: usize,
    confidence_level: f64,
) -> Result<Vec<ForecastPoint>> {
    Ok(artifact.model.forecast(steps, confidence_level)?)
}

/// Step `i` (1-based) targets `last_week + i`; its Monday is the Monday of
/// that target week.
pub fn prediction_records(
    artifact: &ModelArtifact,
    last_week: YearWeek,
    points: &[ForecastPoint],
    created_at: DateTime<Utc>,
) -> Vec<PredictionRecord> {
    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let target = last_week.plus_weeks(i as i64 + 1);
            PredictionRecord {
                code: artifact.code.clone(),
                yearweek: target,
                model_version: artifact.version.clone(),
                predicted_cases: point.predicted,
                confidence_lower: point.lower,
                confidence_upper: point.upper,
                monday_of_week: target.monday(),
                created_at,
                is_actual: false,
            }
        })
        .collect()
}

/// Forecasts and upserts predictions for the `steps` weeks after `last_week`.
pub async fn forecast_and_persist(
    store: &dyn CaseStore,
    artifact: &ModelArtifact,
    last_week: YearWeek,
    steps: usize,
    confidence_level: f64,
    created_at: DateTime<Utc>,
) -> Result<Vec<PredictionRecord>> {
    let points = forecast(artifact, steps, confidence_level)?;
    let records = prediction_records(artifact, last_week, &points, created_at);
    store.upsert_predictions(&records).await?;
    info!(
        code = %artifact.code,
        version = %artifact.version,
        from = %last_week,
        steps = records.len(),
        "predictions saved"
    );
    Ok(records)
}
