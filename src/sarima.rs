//! Seasonal ARIMA(p,0,0)(0,1,1)_s for weekly case series.
//!
//! The model combines:
//!
//! - **Seasonal differencing**: `w_t = y_t - y_{t-s}` removes the repeating cycle
//! - **AR(p)**: short-term autocorrelation of the differenced series
//! - **Seasonal MA(1)**: last season's forecast error carried into this one
//!
//! Fitting is closed form (Yule-Walker for the AR part, lag-`s` residual
//! autocorrelation for the seasonal MA part) so a fitted model is fully
//! determined by its input. Coefficients are clamped rather than rejected
//! when the series is too short or irregular to be stationary.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

const MAX_AR_ORDER: usize = 10;
const MA_BOUND: f64 = 0.99;
const EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot fit a model to an empty series")]
    EmptySeries,

    #[error("series contains NaN or infinite values")]
    NonFinite,

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Non-seasonal autoregressive order (p).
    pub ar_order: usize,
    /// Length of one seasonal cycle in weeks (s).
    pub seasonal_period: usize,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            ar_order: 2,
            seasonal_period: 52,
        }
    }
}

impl ModelSpec {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.ar_order > MAX_AR_ORDER {
            return Err(ModelError::InvalidParameter {
                name: "ar_order",
                reason: format!("AR order must be <= {MAX_AR_ORDER}"),
            });
        }
        if self.seasonal_period < 2 {
            return Err(ModelError::InvalidParameter {
                name: "seasonal_period",
                reason: "seasonal period must be at least 2".to_string(),
            });
        }
        Ok(())
    }
}

/// One forecast step with its two-sided confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub predicted: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalArima {
    spec: ModelSpec,
    /// False when the series is too short to difference by a full season.
    seasonal: bool,
    ar_coeffs: Vec<f64>,
    seasonal_ma: f64,
    /// Mean of the working series.
    mean: f64,
    /// Innovation variance.
    sigma2: f64,
    history: Vec<f64>,
    /// Seasonally differenced series, or the history itself when not seasonal.
    working: Vec<f64>,
    residuals: Vec<f64>,
}

impl SeasonalArima {
    pub fn fit(series: &[f64], spec: ModelSpec) -> Result<Self, ModelError> {
        spec.validate()?;
        if series.is_empty() {
            return Err(ModelError::EmptySeries);
        }
        if series.iter().any(|x| !x.is_finite()) {
            return Err(ModelError::NonFinite);
        }

        let p = spec.ar_order;
        let s = spec.seasonal_period;
        let seasonal = series.len() > s + p;

        let working: Vec<f64> = if seasonal {
            (s..series.len()).map(|t| series[t] - series[t - s]).collect()
        } else {
            series.to_vec()
        };
        let mean = working.iter().sum::<f64>() / working.len() as f64;
        let ar_coeffs = yule_walker(&working, p);

        let seasonal_ma = if seasonal {
            let first_pass = conditional_residuals(&working, mean, &ar_coeffs, 0.0, s);
            let usable = &first_pass[p.min(first_pass.len())..];
            lag_correlation(usable, s).clamp(-MA_BOUND, MA_BOUND)
        } else {
            0.0
        };

        let residuals = conditional_residuals(&working, mean, &ar_coeffs, seasonal_ma, s);
        let sigma2 = innovation_variance(&residuals, &working, mean, p);

        Ok(Self {
            spec,
            seasonal,
            ar_coeffs,
            seasonal_ma,
            mean,
            sigma2,
            history: series.to_vec(),
            working,
            residuals,
        })
    }

    /// Point forecasts and intervals for the next `steps` periods. No refit.
    pub fn forecast(
        &self,
        steps: usize,
        confidence_level: f64,
    ) -> Result<Vec<ForecastPoint>, ModelError> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(ModelError::InvalidParameter {
                name: "confidence_level",
                reason: format!("{confidence_level} is outside (0, 1)"),
            });
        }
        let z = Normal::new(0.0, 1.0)
            .map_err(|e| ModelError::InvalidParameter {
                name: "confidence_level",
                reason: e.to_string(),
            })?
            .inverse_cdf(0.5 + confidence_level / 2.0);

        let means = self.point_forecasts(steps);
        let psi = self.psi_weights(steps);

        let mut cumulative = 0.0;
        Ok(means
            .into_iter()
            .zip(psi)
            .map(|(predicted, weight)| {
                cumulative += weight * weight;
                let half_width = z * (self.sigma2 * cumulative).sqrt();
                ForecastPoint {
                    predicted,
                    lower: predicted - half_width,
                    upper: predicted + half_width,
                }
            })
            .collect())
    }

    fn point_forecasts(&self, steps: usize) -> Vec<f64> {
        let s = self.spec.seasonal_period;
        let mut levels = self.history.clone();
        let mut working = self.working.clone();
        let mut shocks = self.residuals.clone();
        let mut out = Vec::with_capacity(steps);

        for _ in 0..steps {
            let t = working.len();
            let mut next = self.mean;
            for (j, phi) in self.ar_coeffs.iter().enumerate() {
                if let Some(prev) = t.checked_sub(j + 1) {
                    next += phi * (working[prev] - self.mean);
                }
            }
            if self.seasonal && t >= s {
                next += self.seasonal_ma * shocks[t - s];
            }
            working.push(next);
            shocks.push(0.0);

            let level = if self.seasonal {
                next + levels[levels.len() - s]
            } else {
                next
            };
            levels.push(level);
            out.push(level);
        }

        out
    }

    /// MA(infinity) weights of the full model on the level scale.
    fn psi_weights(&self, steps: usize) -> Vec<f64> {
        let s = self.spec.seasonal_period;
        let ar = self.expanded_ar();
        let mut psi: Vec<f64> = Vec::with_capacity(steps);

        for j in 0..steps {
            let mut value = if j == 0 {
                1.0
            } else if self.seasonal && j == s {
                self.seasonal_ma
            } else {
                0.0
            };
            for k in 1..=j.min(ar.len() - 1) {
                value += ar[k] * psi[j - k];
            }
            psi.push(value);
        }

        psi
    }

    /// Coefficients of `phi(B)(1 - B^s)` moved to the right-hand side,
    /// indexed by lag (index 0 unused).
    fn expanded_ar(&self) -> Vec<f64> {
        let p = self.ar_coeffs.len();
        let s = self.spec.seasonal_period;
        let mut ar = vec![0.0; if self.seasonal { s + p + 1 } else { p + 1 }];
        for (j, phi) in self.ar_coeffs.iter().enumerate() {
            ar[j + 1] += phi;
            if self.seasonal {
                ar[j + 1 + s] -= phi;
            }
        }
        if self.seasonal {
            ar[s] += 1.0;
        }
        ar
    }

    pub fn is_seasonal(&self) -> bool {
        self.seasonal
    }

    pub fn seasonal_ma(&self) -> f64 {
        self.seasonal_ma
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }
}

/// AR coefficients from the Yule-Walker equations via Levinson-Durbin.
fn yule_walker(data: &[f64], order: usize) -> Vec<f64> {
    let n = data.len();
    let mut coeffs = vec![0.0; order];
    if order == 0 || n <= order {
        return coeffs;
    }

    let mean = data.iter().sum::<f64>() / n as f64;
    let centered: Vec<f64> = data.iter().map(|x| x - mean).collect();
    let autocov: Vec<f64> = (0..=order)
        .map(|k| (k..n).map(|i| centered[i] * centered[i - k]).sum::<f64>() / n as f64)
        .collect();

    if autocov[0] < EPSILON {
        return coeffs;
    }

    let mut error = autocov[0];
    for k in 0..order {
        let mut acc = autocov[k + 1];
        for j in 0..k {
            acc -= coeffs[j] * autocov[k - j];
        }
        let reflection = acc / error;
        let previous = coeffs.clone();
        coeffs[k] = reflection;
        for j in 0..k {
            coeffs[j] = previous[j] - reflection * previous[k - 1 - j];
        }
        error *= 1.0 - reflection * reflection;
        if error < EPSILON {
            break;
        }
    }

    coeffs
}

/// One-step residuals conditioned on zero pre-sample shocks.
fn conditional_residuals(
    working: &[f64],
    mean: f64,
    ar_coeffs: &[f64],
    seasonal_ma: f64,
    period: usize,
) -> Vec<f64> {
    let p = ar_coeffs.len();
    let mut residuals = vec![0.0; working.len()];
    for t in p..working.len() {
        let mut fitted = mean;
        for (j, phi) in ar_coeffs.iter().enumerate() {
            fitted += phi * (working[t - j - 1] - mean);
        }
        if t >= period {
            fitted += seasonal_ma * residuals[t - period];
        }
        residuals[t] = working[t] - fitted;
    }
    residuals
}

fn lag_correlation(data: &[f64], lag: usize) -> f64 {
    let n = data.len();
    if n <= lag {
        return 0.0;
    }
    let mean = data.iter().sum::<f64>() / n as f64;
    let centered: Vec<f64> = data.iter().map(|x| x - mean).collect();
    let variance = centered.iter().map(|x| x * x).sum::<f64>() / n as f64;
    if variance < EPSILON {
        return 0.0;
    }
    let covariance = (lag..n).map(|i| centered[i] * centered[i - lag]).sum::<f64>() / n as f64;
    covariance / variance
}

fn innovation_variance(residuals: &[f64], working: &[f64], mean: f64, ar_order: usize) -> f64 {
    if residuals.len() > ar_order {
        let effective = &residuals[ar_order..];
        effective.iter().map(|e| e * e).sum::<f64>() / effective.len() as f64
    } else {
        working.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / working.len() as f64
    }
}
