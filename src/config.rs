//! Layered settings: defaults, then an optional TOML file, then
//! `SURVEILLANCE__*` environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Weekday;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineSettings;
use crate::sarima::ModelSpec;
use crate::scheduler::Trigger;

const DEFAULT_CONFIG_FILE: &str = "case-surveillance";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub model: ModelSettings,
    pub forecast_steps: usize,
    pub anomaly: AnomalySettings,
    pub schedule: ScheduleSettings,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub dir: PathBuf,
    pub ar_order: usize,
    /// Weeks per seasonal cycle.
    pub seasonal_period: usize,
    pub confidence_level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySettings {
    pub sigma_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub weekly_weekday: Weekday,
    pub weekly_hour: u32,
    pub weekly_minute: u32,
    pub monthly_hour: u32,
    pub monthly_minute: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings {
                url: None,
                max_connections: 5,
            },
            model: ModelSettings {
                dir: PathBuf::from("models"),
                ar_order: 2,
                seasonal_period: 52,
                confidence_level: 0.95,
            },
            forecast_steps: 4,
            anomaly: AnomalySettings {
                sigma_multiplier: 2.0,
            },
            schedule: ScheduleSettings {
                weekly_weekday: Weekday::Sun,
                weekly_hour: 23,
                weekly_minute: 59,
                monthly_hour: 23,
                monthly_minute: 0,
            },
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings. `DATABASE_URL` fills the database url when no other
    /// source set it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let mut settings: Settings = builder
            .add_source(
                Environment::with_prefix("SURVEILLANCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        if settings.database.url.is_none() {
            settings.database.url = std::env::var("DATABASE_URL").ok();
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.model_spec()
            .validate()
            .context("invalid model configuration")?;
        anyhow::ensure!(
            self.model.confidence_level > 0.0 && self.model.confidence_level < 1.0,
            "model.confidence_level must be in (0, 1), got {}",
            self.model.confidence_level
        );
        anyhow::ensure!(
            self.anomaly.sigma_multiplier >= 0.0,
            "anomaly.sigma_multiplier must be non-negative"
        );
        anyhow::ensure!(
            self.schedule.weekly_hour < 24
                && self.schedule.monthly_hour < 24
                && self.schedule.weekly_minute < 60
                && self.schedule.monthly_minute < 60,
            "schedule times must be valid hours and minutes"
        );
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }

    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            ar_order: self.model.ar_order,
            seasonal_period: self.model.seasonal_period,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            confidence_level: self.model.confidence_level,
            sigma_multiplier: self.anomaly.sigma_multiplier,
        }
    }

    pub fn weekly_trigger(&self) -> Trigger {
        Trigger::Weekly {
            weekday: self.schedule.weekly_weekday,
            hour: self.schedule.weekly_hour,
            minute: self.schedule.weekly_minute,
        }
    }

    pub fn monthly_trigger(&self) -> Trigger {
        Trigger::MonthEnd {
            hour: self.schedule.monthly_hour,
            minute: self.schedule.monthly_minute,
        }
    }
}
