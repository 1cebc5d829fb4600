//! Training, versioning and persistence of per-code model artifacts.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::models::WeeklyCase;
use crate::sarima::{ModelSpec, SeasonalArima};
use crate::yearweek::YearWeek;

const FINGERPRINT_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub code: String,
    pub version: String,
    pub trained_on: NaiveDate,
    pub observations: usize,
    /// Latest week of the training series.
    pub last_yearweek: YearWeek,
    pub model: SeasonalArima,
}

pub struct ModelStore {
    dir: PathBuf,
    spec: ModelSpec,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>, spec: ModelSpec) -> Self {
        Self {
            dir: dir.into(),
            spec,
        }
    }

    /// Fits a model to the full series of `code` and saves it.
    pub fn train(
        &self,
        code: &str,
        series: &[WeeklyCase],
        trained_on: NaiveDate,
    ) -> Result<ModelArtifact> {
        let Some(last) = series.iter().map(|row| row.yearweek).max() else {
            return Err(PipelineError::InsufficientData {
                code: code.to_string(),
            });
        };

        let values: Vec<f64> = series.iter().map(|row| row.cases as f64).collect();
        let model = SeasonalArima::fit(&values, self.spec)?;
        let artifact = ModelArtifact {
            code: code.to_string(),
            version: model_version(code, trained_on, series, self.spec),
            trained_on,
            observations: series.len(),
            last_yearweek: last,
            model,
        };

        let path = self.save(&artifact)?;
        info!(
            code,
            version = %artifact.version,
            observations = artifact.observations,
            seasonal = artifact.model.is_seasonal(),
            seasonal_ma = artifact.model.seasonal_ma(),
            sigma2 = artifact.model.sigma2(),
            path = %path.display(),
            "model trained and saved"
        );
        Ok(artifact)
    }

    pub fn save(&self, artifact: &ModelArtifact) -> Result<PathBuf> {
        let path = self.artifact_path(&artifact.code, &artifact.version);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| PipelineError::Artifact {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let payload = serde_json::to_vec(artifact)?;
        fs::write(&path, payload).map_err(|source| PipelineError::Artifact {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load(&self, code: &str, version: &str) -> Result<ModelArtifact> {
        let path = self.artifact_path(code, version);
        let payload = match fs::read(&path) {
            Ok(payload) => payload,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::ModelNotFound {
                    code: code.to_string(),
                    version: version.to_string(),
                })
            }
            Err(source) => return Err(PipelineError::Artifact { path, source }),
        };

        let artifact: ModelArtifact = serde_json::from_slice(&payload)?;
        if artifact.code != code || artifact.version != version {
            return Err(PipelineError::ModelNotFound {
                code: code.to_string(),
                version: version.to_string(),
            });
        }
        debug!(code, version, path = %path.display(), "model loaded");
        Ok(artifact)
    }

    fn artifact_path(&self, code: &str, version: &str) -> PathBuf {
        self.dir
            .join(path_component(code))
            .join(format!("{}.json", path_component(version)))
    }
}

/// `{code}_{YYYYMMDD}_{observations}_{fingerprint}`; the fingerprint hashes
/// the code, the model parameters and every observation.
pub fn model_version(
    code: &str,
    trained_on: NaiveDate,
    series: &[WeeklyCase],
    spec: ModelSpec,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.update(spec.ar_order.to_le_bytes());
    hasher.update(spec.seasonal_period.to_le_bytes());
    for row in series {
        hasher.update(row.yearweek.to_string().as_bytes());
        hasher.update(row.cases.to_le_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());

    format!(
        "{}_{}_{}_{}",
        code,
        trained_on.format("%Y%m%d"),
        series.len(),
        &digest[..FINGERPRINT_LEN]
    )
}

fn path_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
