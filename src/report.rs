use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::{CodeSummary, Notification, PredictionRecord, WeeklyCase};
use crate::yearweek::YearWeek;

/// Totals per code with each code's share of all cases, largest first.
pub fn summarize_by_code(rows: &[WeeklyCase]) -> Vec<CodeSummary> {
    let mut totals: BTreeMap<&str, i64> = BTreeMap::new();
    for row in rows {
        *totals.entry(row.code.as_str()).or_insert(0) += row.cases;
    }

    let overall: i64 = totals.values().sum();
    let mut summaries: Vec<CodeSummary> = totals
        .into_iter()
        .map(|(code, cases)| CodeSummary {
            code: code.to_string(),
            cases,
            share: if overall == 0 {
                0.0
            } else {
                cases as f64 / overall as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.cases.cmp(&a.cases).then(a.code.cmp(&b.code)));
    summaries
}

/// Most recent forecast per (code, week) for weeks after `after`, in week order.
pub fn upcoming_forecasts(predictions: &[PredictionRecord], after: Option<YearWeek>) -> Vec<PredictionRecord> {
    let mut latest: BTreeMap<(YearWeek, &str), &PredictionRecord> = BTreeMap::new();
    for prediction in predictions {
        if prediction.is_actual || after.is_some_and(|week| prediction.yearweek <= week) {
            continue;
        }
        latest
            .entry((prediction.yearweek, prediction.code.as_str()))
            .and_modify(|current| {
                if (prediction.created_at, &prediction.model_version)
                    > (current.created_at, &current.model_version)
                {
                    *current = prediction;
                }
            })
            .or_insert(prediction);
    }
    latest.into_values().cloned().collect()
}

pub fn build_report(
    week: Option<YearWeek>,
    weekly: &[WeeklyCase],
    predictions: &[PredictionRecord],
    notifications: &[Notification],
) -> String {
    let summaries = summarize_by_code(weekly);
    let upcoming = upcoming_forecasts(predictions, week);

    let mut output = String::new();

    let _ = writeln!(output, "# Disease Surveillance Report");
    match week {
        Some(week) => {
            let _ = writeln!(output, "Generated for week {} (starting {})", week, week.monday());
        }
        None => {
            let _ = writeln!(output, "No aggregated weeks yet.");
        }
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Case Totals");

    if summaries.is_empty() {
        let _ = writeln!(output, "No weekly cases recorded for this week.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} cases ({:.1}% of week)",
                summary.code,
                summary.cases,
                summary.share * 100.0
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Upcoming Forecasts");

    if upcoming.is_empty() {
        let _ = writeln!(output, "No forecasts beyond this week.");
    } else {
        for prediction in upcoming.iter().take(20) {
            let _ = writeln!(
                output,
                "- {} {}: {:.1} cases (interval {:.1} to {:.1}, model {})",
                prediction.code,
                prediction.yearweek,
                prediction.predicted_cases,
                prediction.confidence_lower,
                prediction.confidence_upper,
                prediction.model_version
            );
        }
    }

    let mut recent = notifications.to_vec();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Notifications");

    if recent.is_empty() {
        let _ = writeln!(output, "No anomaly notifications.");
    } else {
        for notification in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} ({}) on {}: {}",
                notification.code,
                notification.yearweek,
                notification.created_at.date_naive(),
                notification.message
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    fn week(raw: &str) -> YearWeek {
        raw.parse().unwrap()
    }

    fn weekly(code: &str, cases: i64) -> WeeklyCase {
        WeeklyCase {
            code: code.to_string(),
            yearweek: week("202410"),
            cases,
            monday_of_week: week("202410").monday(),
        }
    }

    fn prediction(code: &str, yw: &str, version: &str, predicted: f64, created_at: DateTime<Utc>) -> PredictionRecord {
        PredictionRecord {
            code: code.to_string(),
            yearweek: week(yw),
            model_version: version.to_string(),
            predicted_cases: predicted,
            confidence_lower: predicted - 2.0,
            confidence_upper: predicted + 2.0,
            monday_of_week: week(yw).monday(),
            created_at,
            is_actual: false,
        }
    }

    #[test]
    fn summaries_are_sorted_by_cases() {
        let summaries = summarize_by_code(&[weekly("B05", 10), weekly("A90", 30), weekly("J10", 10)]);
        let codes: Vec<&str> = summaries.iter().map(|s| s.code.as_str()).collect();
        assert_eq!(codes, vec!["A90", "B05", "J10"]);
        assert!((summaries[0].share - 0.6).abs() < 1e-9);
    }

    #[test]
    fn upcoming_keeps_latest_forecast_after_the_week() {
        let old = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let predictions = vec![
            prediction("A90", "202410", "v1", 5.0, old),
            prediction("A90", "202411", "v1", 6.0, old),
            prediction("A90", "202411", "v2", 7.0, new),
            prediction("A90", "202412", "v2", 8.0, new),
        ];

        let upcoming = upcoming_forecasts(&predictions, Some(week("202410")));
        assert_eq!(upcoming.len(), 2);
        assert_eq!(upcoming[0].yearweek, week("202411"));
        assert_eq!(upcoming[0].model_version, "v2");
        assert_eq!(upcoming[1].yearweek, week("202412"));
    }

    #[test]
    fn report_lists_every_section() {
        let created = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        let notification = Notification {
            id: Uuid::new_v4(),
            created_at: created,
            code: "A90".to_string(),
            yearweek: week("202411"),
            message: "Predicted anomaly for week 202411".to_string(),
        };
        let report = build_report(
            Some(week("202410")),
            &[weekly("A90", 12)],
            &[prediction("A90", "202411", "v1", 20.0, created)],
            &[notification],
        );

        assert!(report.starts_with("# Disease Surveillance Report"));
        assert!(report.contains("Generated for week 202410 (starting 2024-03-04)"));
        assert!(report.contains("- A90: 12 cases (100.0% of week)"));
        assert!(report.contains("- A90 202411: 20.0 cases (interval 18.0 to 22.0, model v1)"));
        assert!(report.contains("- A90 (202411) on 2024-03-11: Predicted anomaly for week 202411"));
    }

    #[test]
    fn empty_report_says_so() {
        let report = build_report(None, &[], &[], &[]);
        assert!(report.contains("No aggregated weeks yet."));
        assert!(report.contains("No weekly cases recorded for this week."));
        assert!(report.contains("No forecasts beyond this week."));
        assert!(report.contains("No anomaly notifications."));
    }
}
