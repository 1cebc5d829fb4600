//! Daily to weekly roll-up.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::info;

use crate::error::Result;
use crate::models::{DailyCase, WeeklyCase};
use crate::store::{AggregationScope, CaseStore};
use crate::yearweek::{monday_of_week, YearWeek};

#[derive(Debug, Clone)]
pub struct AggregationSummary {
    pub scope: AggregationScope,
    pub rows: Vec<WeeklyCase>,
}

impl AggregationSummary {
    pub fn weeks_touched(&self) -> usize {
        let mut weeks: Vec<YearWeek> = self.rows.iter().map(|row| row.yearweek).collect();
        weeks.sort();
        weeks.dedup();
        weeks.len()
    }
}

/// Folds daily rows into one weekly total per (code, yearweek). The Monday
/// is the earliest week-truncated date among the contributing rows.
pub fn fold_daily<'a, I>(rows: I) -> Vec<WeeklyCase>
where
    I: IntoIterator<Item = &'a DailyCase>,
{
    let mut groups: BTreeMap<(String, YearWeek), (i64, NaiveDate)> = BTreeMap::new();

    for row in rows {
        let monday = monday_of_week(row.date);
        let entry = groups
            .entry((row.code.clone(), row.yearweek))
            .or_insert((0, monday));
        entry.0 += i64::from(row.cases);
        entry.1 = entry.1.min(monday);
    }

    groups
        .into_iter()
        .map(|((code, yearweek), (cases, monday_of_week))| WeeklyCase {
            code,
            yearweek,
            cases,
            monday_of_week,
        })
        .collect()
}

/// Recomputes weekly totals. With a target week every code in that week is
/// overwritten; without one only groups missing a weekly row are filled.
pub async fn aggregate(
    store: &dyn CaseStore,
    target: Option<YearWeek>,
) -> Result<AggregationSummary> {
    let scope = match target {
        Some(week) => AggregationScope::Week(week),
        None => AggregationScope::Pending,
    };

    let rows = store.aggregate(scope).await?;
    match scope {
        AggregationScope::Week(week) => {
            info!(yearweek = %week, codes = rows.len(), "aggregated week")
        }
        AggregationScope::Pending => info!(groups = rows.len(), "aggregated pending weeks"),
    }

    Ok(AggregationSummary { scope, rows })
}
