//! Calendar-driven job runner. Each started job owns a tokio task that
//! sleeps until its next trigger time, runs, and loops until cancelled.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Datelike, Days, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::yearweek::YearWeek;

#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// `fired_at` is the local wall-clock time the trigger fired for.
    async fn run(&self, fired_at: NaiveDateTime) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    /// Last day of every month.
    MonthEnd { hour: u32, minute: u32 },
}

impl Trigger {
    /// First fire time strictly after `after`, in local wall-clock time.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        match *self {
            Trigger::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                let today = after.date();
                let ahead = (7 + weekday.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
                let candidate = today.checked_add_days(Days::new(ahead.into()))?.and_time(time);
                if candidate > after {
                    Some(candidate)
                } else {
                    candidate.checked_add_days(Days::new(7))
                }
            }
            Trigger::MonthEnd { hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                let candidate = last_day_of_month(after.year(), after.month())?.and_time(time);
                if candidate > after {
                    return Some(candidate);
                }
                let (year, month) = if after.month() == 12 {
                    (after.year() + 1, 1)
                } else {
                    (after.year(), after.month() + 1)
                };
                Some(last_day_of_month(year, month)?.and_time(time))
            }
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    first_of_next.pred_opt()
}

struct Entry {
    job: Arc<dyn Job>,
    trigger: Trigger,
    token: Option<CancellationToken>,
}

impl Entry {
    fn running(&self) -> bool {
        self.token.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub next_run: Option<NaiveDateTime>,
}

/// Holds registered jobs and their run state. Must be started from within
/// a tokio runtime.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<BTreeMap<String, Entry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job, replacing (and stopping) any job with the same id.
    pub fn register(&self, job: Arc<dyn Job>, trigger: Trigger) {
        let id = job.id().to_string();
        let mut jobs = self.lock();
        if let Some(mut previous) = jobs.remove(&id) {
            previous.cancel();
        }
        info!(job = %id, ?trigger, "job registered");
        jobs.insert(
            id,
            Entry {
                job,
                trigger,
                token: None,
            },
        );
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn start(&self) {
        let mut jobs = self.lock();
        for entry in jobs.values_mut() {
            spawn_entry(entry);
        }
        info!(jobs = jobs.len(), "scheduler started");
    }

    pub fn stop(&self) {
        let mut jobs = self.lock();
        for entry in jobs.values_mut() {
            entry.cancel();
        }
        info!("scheduler stopped");
    }

    /// Returns `false` for an unknown id.
    pub fn start_job(&self, id: &str) -> bool {
        match self.lock().get_mut(id) {
            Some(entry) => {
                spawn_entry(entry);
                true
            }
            None => false,
        }
    }

    /// Returns `false` for an unknown id.
    pub fn stop_job(&self, id: &str) -> bool {
        match self.lock().get_mut(id) {
            Some(entry) => {
                entry.cancel();
                info!(job = %id, "job stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().get(id).is_some_and(Entry::running)
    }

    /// Next fire time of a running job.
    pub fn next_run(&self, id: &str) -> Option<NaiveDateTime> {
        self.next_run_after(id, Local::now().naive_local())
    }

    fn next_run_after(&self, id: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let jobs = self.lock();
        let entry = jobs.get(id).filter(|entry| entry.running())?;
        entry.trigger.next_after(now)
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.status_at(Local::now().naive_local())
    }

    fn status_at(&self, now: NaiveDateTime) -> Vec<JobStatus> {
        let jobs: Vec<(String, String)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.job.name().to_string()))
            .collect();

        jobs.into_iter()
            .map(|(id, name)| JobStatus {
                running: self.is_running(&id),
                next_run: self.next_run_after(&id, now),
                id,
                name,
            })
            .collect()
    }

    /// Runs a job immediately through the same path as a scheduled fire,
    /// returning its result instead of swallowing it.
    pub async fn run_now(&self, id: &str) -> Result<()> {
        let job = self
            .lock()
            .get(id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown job `{id}`")))?;
        execute(job.as_ref(), Local::now().naive_local()).await
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.lock().values_mut() {
            entry.cancel();
        }
    }
}

fn spawn_entry(entry: &mut Entry) {
    if entry.running() {
        return;
    }
    let token = CancellationToken::new();
    tokio::spawn(run_loop(entry.job.clone(), entry.trigger, token.clone()));
    entry.token = Some(token);
}

async fn run_loop(job: Arc<dyn Job>, trigger: Trigger, token: CancellationToken) {
    loop {
        let now = Local::now().naive_local();
        let Some(next) = trigger.next_after(now) else {
            warn!(job = job.id(), ?trigger, "trigger has no next fire time");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(job = job.id(), next = %next, "waiting for next run");

        tokio::select! {
            _ = token.cancelled() => {
                debug!(job = job.id(), "job loop cancelled");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        // Failures are already logged; the loop keeps its schedule.
        let _ = execute(job.as_ref(), next).await;
    }
}

async fn execute(job: &dyn Job, fired_at: NaiveDateTime) -> Result<()> {
    let started = Instant::now();
    info!(job = job.id(), name = job.name(), fired_at = %fired_at, "job started");
    let result = job.run(fired_at).await;
    match &result {
        Ok(()) => info!(
            job = job.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        ),
        Err(err) => error!(job = job.id(), error = %err, "job failed"),
    }
    result
}

pub const WEEKLY_AGGREGATION_JOB: &str = "weekly_aggregation";
pub const MONTHLY_TRAINING_JOB: &str = "monthly_training";

/// Aggregates the week containing the local fire date, so a Sunday-night
/// fire closes the week that is ending.
pub struct WeeklyAggregationJob {
    pipeline: Arc<Pipeline>,
}

impl WeeklyAggregationJob {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Job for WeeklyAggregationJob {
    fn id(&self) -> &str {
        WEEKLY_AGGREGATION_JOB
    }

    fn name(&self) -> &str {
        "Weekly case aggregation"
    }

    async fn run(&self, fired_at: NaiveDateTime) -> Result<()> {
        let week = YearWeek::from_date(fired_at.date());
        let summary = self.pipeline.run_weekly_aggregation(Some(week)).await?;
        info!(yearweek = %week, rows = summary.rows.len(), "weekly aggregation complete");
        Ok(())
    }
}

/// Retrains every code and forecasts `steps` weeks ahead.
pub struct MonthlyTrainingJob {
    pipeline: Arc<Pipeline>,
    steps: usize,
}

impl MonthlyTrainingJob {
    pub fn new(pipeline: Arc<Pipeline>, steps: usize) -> Self {
        Self { pipeline, steps }
    }
}

#[async_trait]
impl Job for MonthlyTrainingJob {
    fn id(&self) -> &str {
        MONTHLY_TRAINING_JOB
    }

    fn name(&self) -> &str {
        "Monthly model training"
    }

    async fn run(&self, _fired_at: NaiveDateTime) -> Result<()> {
        let report = self.pipeline.run_training_cycle(self.steps).await?;
        if report.failed() > 0 {
            warn!(failed = report.failed(), "training cycle finished with failures");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_store::ModelStore;
    use crate::pipeline::PipelineSettings;
    use crate::sarima::ModelSpec;
    use crate::store::memory::MemoryStore;
    use crate::store::CaseStore;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    const SUNDAY_NIGHT: Trigger = Trigger::Weekly {
        weekday: Weekday::Sun,
        hour: 23,
        minute: 59,
    };

    const MONTH_END: Trigger = Trigger::MonthEnd { hour: 23, minute: 0 };

    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
    }

    impl CountingJob {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn id(&self) -> &str {
            "counting"
        }

        fn name(&self) -> &str {
            "Counting job"
        }

        async fn run(&self, _fired_at: NaiveDateTime) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::InvalidInput("boom".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn weekly_trigger_fires_on_sunday_night() {
        // Wednesday
        assert_eq!(SUNDAY_NIGHT.next_after(at(2024, 1, 3, 12, 0)), Some(at(2024, 1, 7, 23, 59)));
        // Sunday before the fire time
        assert_eq!(SUNDAY_NIGHT.next_after(at(2024, 1, 7, 23, 0)), Some(at(2024, 1, 7, 23, 59)));
        // Exactly at the fire time moves to the next week
        assert_eq!(SUNDAY_NIGHT.next_after(at(2024, 1, 7, 23, 59)), Some(at(2024, 1, 14, 23, 59)));
        // Across a year boundary
        assert_eq!(SUNDAY_NIGHT.next_after(at(2024, 12, 30, 0, 0)), Some(at(2025, 1, 5, 23, 59)));
    }

    #[test]
    fn month_end_trigger_handles_short_months() {
        assert_eq!(MONTH_END.next_after(at(2024, 2, 10, 8, 0)), Some(at(2024, 2, 29, 23, 0)));
        assert_eq!(MONTH_END.next_after(at(2023, 2, 28, 22, 0)), Some(at(2023, 2, 28, 23, 0)));
        assert_eq!(MONTH_END.next_after(at(2023, 2, 28, 23, 30)), Some(at(2023, 3, 31, 23, 0)));
        assert_eq!(MONTH_END.next_after(at(2024, 12, 31, 23, 0)), Some(at(2025, 1, 31, 23, 0)));
        assert_eq!(MONTH_END.next_after(at(2024, 4, 1, 0, 0)), Some(at(2024, 4, 30, 23, 0)));
    }

    #[test]
    fn invalid_trigger_time_has_no_next_run() {
        let trigger = Trigger::MonthEnd { hour: 25, minute: 0 };
        assert_eq!(trigger.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[tokio::test]
    async fn lifecycle_controls_next_run() {
        let scheduler = Scheduler::new();
        scheduler.register(CountingJob::new(false), SUNDAY_NIGHT);
        let now = at(2024, 1, 3, 12, 0);

        assert!(!scheduler.is_running("counting"));
        assert_eq!(scheduler.next_run_after("counting", now), None);

        scheduler.start();
        assert!(scheduler.is_running("counting"));
        assert_eq!(scheduler.next_run_after("counting", now), Some(at(2024, 1, 7, 23, 59)));
        assert!(scheduler.next_run("counting").is_some());

        assert!(scheduler.stop_job("counting"));
        assert!(!scheduler.is_running("counting"));
        assert_eq!(scheduler.next_run("counting"), None);

        assert!(scheduler.start_job("counting"));
        assert!(scheduler.is_running("counting"));
        scheduler.stop();
        assert!(!scheduler.is_running("counting"));

        assert!(!scheduler.start_job("missing"));
        assert!(!scheduler.stop_job("missing"));
    }

    #[tokio::test]
    async fn status_reports_each_job() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(MemoryStore::new()),
            ModelStore::new(dir.path(), ModelSpec::default()),
            PipelineSettings::default(),
        ));
        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(WeeklyAggregationJob::new(pipeline.clone())), SUNDAY_NIGHT);
        scheduler.register(Arc::new(MonthlyTrainingJob::new(pipeline, 4)), MONTH_END);
        assert!(scheduler.start_job(MONTHLY_TRAINING_JOB));

        let status = scheduler.status_at(at(2024, 2, 10, 8, 0));
        assert_eq!(
            status,
            vec![
                JobStatus {
                    id: MONTHLY_TRAINING_JOB.to_string(),
                    name: "Monthly model training".to_string(),
                    running: true,
                    next_run: Some(at(2024, 2, 29, 23, 0)),
                },
                JobStatus {
                    id: WEEKLY_AGGREGATION_JOB.to_string(),
                    name: "Weekly case aggregation".to_string(),
                    running: false,
                    next_run: None,
                },
            ]
        );
        scheduler.stop();
    }

    #[tokio::test]
    async fn run_now_executes_and_reports_failures() {
        let scheduler = Scheduler::new();
        let job = CountingJob::new(true);
        scheduler.register(job.clone(), MONTH_END);

        assert!(scheduler.run_now("counting").await.is_err());
        assert!(scheduler.run_now("counting").await.is_err());
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        assert!(scheduler.run_now("missing").await.is_err());
    }

    #[tokio::test]
    async fn re_registering_replaces_the_job() {
        let scheduler = Scheduler::new();
        let first = CountingJob::new(false);
        let second = CountingJob::new(false);
        scheduler.register(first.clone(), SUNDAY_NIGHT);
        scheduler.start();
        scheduler.register(second.clone(), MONTH_END);

        assert_eq!(scheduler.job_ids(), vec!["counting".to_string()]);
        assert!(!scheduler.is_running("counting"));
        scheduler.run_now("counting").await.unwrap();
        assert_eq!(first.runs.load(Ordering::SeqCst), 0);
        assert_eq!(second.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn weekly_job_closes_the_local_week_west_of_utc() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        // Sunday 23:59 at UTC-5 is already Monday in UTC.
        let pipeline = Arc::new(
            Pipeline::new(store.clone(), ModelStore::new(dir.path(), ModelSpec::default()), PipelineSettings::default())
                .with_clock(Arc::new(|| Utc.with_ymd_and_hms(2024, 1, 8, 4, 59, 0).unwrap())),
        );
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        pipeline.submit_daily_case(day, "A90", 4).await.unwrap();

        let fired_at = SUNDAY_NIGHT.next_after(at(2024, 1, 7, 9, 0)).unwrap();
        WeeklyAggregationJob::new(pipeline.clone()).run(fired_at).await.unwrap();

        let rows = store.weekly_stats(None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].yearweek.to_string(), "202401");
        assert_eq!(rows[0].cases, 4);
    }

    #[tokio::test]
    async fn monthly_job_trains_and_forecasts_every_code() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put_weekly("A90", "202401", 4);
        let pipeline = Arc::new(
            Pipeline::new(store.clone(), ModelStore::new(dir.path(), ModelSpec::default()), PipelineSettings::default())
                .with_clock(Arc::new(|| Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap())),
        );

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(MonthlyTrainingJob::new(pipeline, 4)), MONTH_END);
        scheduler.run_now(MONTHLY_TRAINING_JOB).await.unwrap();

        assert_eq!(
            store.predictions(&Default::default()).await.unwrap().len(),
            4
        );
    }
}
