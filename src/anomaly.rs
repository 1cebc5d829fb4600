//! Same-week historical baselines and the control-limit test that raises
//! notifications.

use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Notification, PredictionRecord};
use crate::store::CaseStore;
use crate::yearweek::YearWeek;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub mean: f64,
    pub stdev: f64,
    pub samples: usize,
}

impl Baseline {
    /// `None` without history. A single point has a zero standard deviation.
    pub fn from_history(cases: &[i64]) -> Option<Self> {
        if cases.is_empty() {
            return None;
        }
        let values: Vec<f64> = cases.iter().map(|c| *c as f64).collect();
        let mean = values.iter().mean();
        let stdev = values.iter().std_dev();
        Some(Self {
            mean,
            stdev: if stdev.is_finite() { stdev } else { 0.0 },
            samples: values.len(),
        })
    }

    pub fn threshold(&self, sigma_multiplier: f64) -> f64 {
        self.mean + sigma_multiplier * self.stdev
    }
}

/// Strictly above `mean + k * stdev`.
pub fn exceeds(predicted: f64, baseline: &Baseline, sigma_multiplier: f64) -> bool {
    predicted > baseline.threshold(sigma_multiplier)
}

pub fn anomaly_message(prediction: &PredictionRecord, threshold: f64, sigma_multiplier: f64) -> String {
    format!(
        "Predicted anomaly for week {}: ICD10 {} predicted_cases={:.2} > threshold(mean+{}*stdev)={:.2}. \
         Cases for this week are forecast to be anomalous.",
        prediction.yearweek, prediction.code, prediction.predicted_cases, sigma_multiplier, threshold
    )
}

/// Tests the latest forecast of every code in the target week against its
/// same-week baseline from earlier years. Without a target the latest
/// forecast week is used. Returns the number of notifications created.
pub async fn check_and_notify(
    store: &dyn CaseStore,
    target: Option<YearWeek>,
    sigma_multiplier: f64,
    now: DateTime<Utc>,
) -> Result<usize> {
    let target = match target {
        Some(week) => week,
        None => match store.latest_forecast_yearweek().await? {
            Some(week) => week,
            None => {
                debug!("no forecasts stored, nothing to check");
                return Ok(0);
            }
        },
    };

    let forecasts = store.latest_forecasts_for_week(target).await?;
    let mut created = 0;

    for prediction in &forecasts {
        let history = store
            .historical_week_cases(&prediction.code, target.week(), target.year())
            .await?;
        let Some(baseline) = Baseline::from_history(&history) else {
            debug!(code = %prediction.code, week = %target.week_code(), "no same-week history");
            continue;
        };

        let threshold = baseline.threshold(sigma_multiplier);
        if !exceeds(prediction.predicted_cases, &baseline, sigma_multiplier) {
            continue;
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            created_at: now,
            code: prediction.code.clone(),
            yearweek: target,
            message: anomaly_message(prediction, threshold, sigma_multiplier),
        };
        if store.insert_notification(&notification).await? {
            created += 1;
            info!(
                code = %prediction.code,
                yearweek = %target,
                predicted = prediction.predicted_cases,
                threshold,
                samples = baseline.samples,
                "anomaly notification created"
            );
        } else {
            debug!(code = %prediction.code, yearweek = %target, "notification already exists");
        }
    }

    Ok(created)
}
