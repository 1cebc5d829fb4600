use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

mod aggregate;
mod anomaly;
mod config;
mod db;
mod error;
mod forecast;
mod logging;
mod model_store;
mod models;
mod pipeline;
mod report;
mod sarima;
mod scheduler;
mod store;
mod yearweek;

use crate::config::Settings;
use crate::model_store::ModelStore;
use crate::models::PredictionFilter;
use crate::pipeline::Pipeline;
use crate::scheduler::{MonthlyTrainingJob, Scheduler, WeeklyAggregationJob};
use crate::yearweek::YearWeek;

#[derive(Parser)]
#[command(name = "case-surveillance")]
#[command(about = "Weekly disease case aggregation, forecasting and anomaly alerts", long_about = None)]
struct Cli {
    /// TOML settings file (defaults to ./case-surveillance.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Record one day's case count for a disease code
    Submit {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        code: String,
        #[arg(long)]
        cases: i32,
    },
    /// Import daily cases from a CSV file (date,code,cases)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Roll daily cases into weekly totals (default: every pending week)
    #[command(group(
        ArgGroup::new("target")
            .args(["week", "latest", "current"])
            .multiple(false)
    ))]
    Aggregate {
        /// Yearweek to recompute, e.g. 202403
        #[arg(long)]
        week: Option<YearWeek>,
        /// Recompute the newest week present in the daily cases
        #[arg(long)]
        latest: bool,
        /// Recompute the week containing today
        #[arg(long)]
        current: bool,
    },
    /// Train a model per code and forecast ahead
    Train {
        #[arg(long)]
        steps: Option<usize>,
    },
    /// Forecast again from a stored model version
    Forecast {
        #[arg(long)]
        code: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        steps: Option<usize>,
    },
    /// Test forecasts against same-week history and raise notifications
    Check {
        #[arg(long)]
        week: Option<YearWeek>,
    },
    /// List stored predictions as JSON
    Predictions {
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        version: Option<String>,
    },
    /// List weekly totals as JSON
    Stats {
        #[arg(long)]
        week: Option<YearWeek>,
    },
    /// Print the newest yearweek present in the daily cases
    LatestWeek,
    /// List recent anomaly notifications as JSON
    Notifications {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Generate a markdown surveillance report
    Report {
        #[arg(long)]
        week: Option<YearWeek>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Run the weekly aggregation and monthly training jobs until interrupted
    #[command(group(
        ArgGroup::new("mode")
            .args(["status", "run_now"])
            .multiple(false)
    ))]
    Schedule {
        /// Print each job's state and next run as JSON, then exit
        #[arg(long)]
        status: bool,
        /// Run one job immediately, then exit
        #[arg(long, value_name = "JOB")]
        run_now: Option<String>,
        /// Start only these jobs
        #[arg(long, value_name = "JOB")]
        only: Vec<String>,
        /// Leave these jobs stopped
        #[arg(long, value_name = "JOB")]
        skip: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    logging::init(&settings.log_level).context("failed to initialize logging")?;

    let pool = db::connect(settings.database_url()?, settings.database.max_connections)
        .await
        .context("failed to connect to Postgres")?;

    let models = ModelStore::new(&settings.model.dir, settings.model_spec());
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(db::PgStore::new(pool.clone())),
        models,
        settings.pipeline_settings(),
    ));

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Submit { date, code, cases } => {
            if pipeline.submit_daily_case(date, &code, cases).await? {
                println!("Recorded {cases} cases of {code} on {date}.");
            } else {
                println!("{code} on {date} was already recorded; left unchanged.");
            }
        }
        Commands::Import { csv } => {
            let inserted = pipeline
                .import_csv(&csv)
                .await
                .with_context(|| format!("failed to import {}", csv.display()))?;
            println!("Inserted {inserted} daily cases from {}.", csv.display());
        }
        Commands::Aggregate {
            week,
            latest,
            current,
        } => {
            let summary = if latest {
                pipeline.aggregate_latest().await?
            } else if current {
                let week = YearWeek::from_date(Local::now().date_naive());
                Some(pipeline.run_weekly_aggregation(Some(week)).await?)
            } else {
                Some(pipeline.run_weekly_aggregation(week).await?)
            };

            match summary {
                Some(summary) => println!(
                    "Upserted {} weekly rows across {} weeks ({}).",
                    summary.rows.len(),
                    summary.weeks_touched(),
                    summary.scope
                ),
                None => println!("No daily cases recorded."),
            }
        }
        Commands::Train { steps } => {
            let report = pipeline
                .run_training_cycle(steps.unwrap_or(settings.forecast_steps))
                .await?;
            print!("{report}");
        }
        Commands::Forecast {
            code,
            version,
            steps,
        } => {
            let records = pipeline
                .reforecast(&code, &version, steps.unwrap_or(settings.forecast_steps))
                .await
                .with_context(|| format!("failed to forecast {code} with model {version}"))?;
            print_json(&records)?;
        }
        Commands::Check { week } => {
            let created = pipeline.check_and_notify(week).await?;
            println!("Created {created} notifications.");
        }
        Commands::Predictions { code, version } => {
            let filter = PredictionFilter {
                code,
                model_version: version,
            };
            print_json(&pipeline.get_predictions(&filter).await?)?;
        }
        Commands::Stats { week } => {
            print_json(&pipeline.get_weekly_stats(week).await?)?;
        }
        Commands::LatestWeek => match pipeline.get_latest_yearweek().await? {
            Some(week) => println!("{week}"),
            None => println!("No daily cases recorded."),
        },
        Commands::Notifications { limit } => {
            print_json(&pipeline.recent_notifications(limit).await?)?;
        }
        Commands::Report { week, out } => {
            let week = match week {
                Some(week) => Some(week),
                None => pipeline.get_latest_yearweek().await?,
            };
            let weekly = match week {
                Some(week) => pipeline.get_weekly_stats(Some(week)).await?,
                None => Vec::new(),
            };
            let predictions = pipeline.get_predictions(&PredictionFilter::default()).await?;
            let notifications = pipeline.recent_notifications(10).await?;

            let report = report::build_report(week, &weekly, &predictions, &notifications);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write report to {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Schedule {
            status,
            run_now,
            only,
            skip,
        } => {
            let scheduler = Scheduler::new();
            scheduler.register(
                Arc::new(WeeklyAggregationJob::new(pipeline.clone())),
                settings.weekly_trigger(),
            );
            scheduler.register(
                Arc::new(MonthlyTrainingJob::new(pipeline.clone(), settings.forecast_steps)),
                settings.monthly_trigger(),
            );

            if let Some(id) = run_now {
                scheduler
                    .run_now(&id)
                    .await
                    .with_context(|| format!("job {id} failed"))?;
                println!("Job {id} finished.");
                return Ok(());
            }

            if only.is_empty() {
                scheduler.start();
            } else {
                for id in &only {
                    anyhow::ensure!(scheduler.start_job(id), "unknown job `{id}`");
                }
            }
            for id in &skip {
                anyhow::ensure!(scheduler.stop_job(id), "unknown job `{id}`");
            }

            if status {
                print_json(&scheduler.status())?;
                scheduler.stop();
                return Ok(());
            }

            for id in scheduler.job_ids() {
                match scheduler.next_run(&id) {
                    Some(next) => info!(job = %id, next_run = %next, "job scheduled"),
                    None => info!(job = %id, "job not started"),
                }
            }

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            scheduler.stop();
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
