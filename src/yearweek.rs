//! ISO week keys in `YYYYWW` form.
//!
//! A [`YearWeek`] is stored as the Monday of its ISO week, so ordering is
//! chronological and week arithmetic is plain date arithmetic. The year
//! component is the ISO week-year: 2024-12-30 belongs to `202501`.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearWeek(NaiveDate);

impl YearWeek {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(monday_of_week(date))
    }

    /// Returns `None` when `week` does not exist in the ISO `year`.
    pub fn new(year: i32, week: u32) -> Option<Self> {
        NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).map(Self)
    }

    pub fn year(&self) -> i32 {
        self.0.iso_week().year()
    }

    pub fn week(&self) -> u32 {
        self.0.iso_week().week()
    }

    /// Two-digit week component, as used for same-week baselines.
    pub fn week_code(&self) -> String {
        format!("{:02}", self.week())
    }

    pub fn monday(&self) -> NaiveDate {
        self.0
    }

    pub fn plus_weeks(&self, weeks: i64) -> Self {
        Self(self.0 + Duration::weeks(weeks))
    }

    pub fn next(&self) -> Self {
        self.plus_weeks(1)
    }
}

impl fmt::Display for YearWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year(), self.week())
    }
}

impl FromStr for YearWeek {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::InvalidYearWeek(value.to_string());
        let trimmed = value.trim();
        if trimmed.len() != 6 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let year: i32 = trimmed[..4].parse().map_err(|_| invalid())?;
        let week: u32 = trimmed[4..].parse().map_err(|_| invalid())?;
        Self::new(year, week).ok_or_else(invalid)
    }
}

impl Serialize for YearWeek {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearWeek {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub fn generate_yearweek(date: NaiveDate) -> String {
    YearWeek::from_date(date).to_string()
}

pub fn monday_of_week(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}
