use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::yearweek::YearWeek;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCase {
    pub code: String,
    pub date: NaiveDate,
    pub cases: i32,
    pub yearweek: YearWeek,
}

impl DailyCase {
    pub fn new(code: impl Into<String>, date: NaiveDate, cases: i32) -> Self {
        Self {
            code: code.into(),
            date,
            cases,
            yearweek: YearWeek::from_date(date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyCase {
    pub code: String,
    pub yearweek: YearWeek,
    pub cases: i64,
    pub monday_of_week: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub code: String,
    pub yearweek: YearWeek,
    pub model_version: String,
    pub predicted_cases: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub monday_of_week: NaiveDate,
    pub created_at: DateTime<Utc>,
    /// `false` for forecasts, `true` once a realized value is recorded.
    pub is_actual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub code: String,
    pub yearweek: YearWeek,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionFilter {
    pub code: Option<String>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeSummary {
    pub code: String,
    pub cases: i64,
    pub share: f64,
}
