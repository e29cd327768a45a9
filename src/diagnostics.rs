//! Model-selection criteria and per-target fit diagnostics.

use serde::{Deserialize, Deserializer, Serialize};
use std::f64::consts::PI;

/// Corrected AIC of a Gaussian local model from its residual sum of squares
/// and the trace of the hat matrix. `+inf` once the correction term's
/// denominator is no longer positive.
pub fn compute_aicc_linear(rss: f64, trace_hat: f64, n_samples: usize) -> f64 {
    let n = n_samples as f64;
    let denom = n - trace_hat - 2.0;
    if !(denom > 0.0) {
        return f64::INFINITY;
    }
    n * (rss / n).ln() + n * (2.0 * PI).ln() + n * (n + trace_hat) / denom
}

/// Corrected AIC of a GLM local model:
/// `-2 LL + 2k + 2k(k+1) / (N_eff - k - 1)` with `N_eff = N - tr(H)` and
/// `k` the number of features.
pub fn compute_aicc_glm(
    log_likelihood: f64,
    trace_hat: f64,
    n_samples: usize,
    n_features: usize,
) -> f64 {
    let k = n_features as f64;
    let n_eff = n_samples as f64 - trace_hat;
    let denom = n_eff - k - 1.0;
    if !(denom > 0.0) {
        return f64::INFINITY;
    }
    -2.0 * log_likelihood + 2.0 * k + 2.0 * k * (k + 1.0) / denom
}

pub fn r_squared(rss: f64, tss: f64) -> f64 {
    if tss > 0.0 { 1.0 - rss / tss } else { f64::NAN }
}

/// JSON has no encoding for non-finite floats, so they are written as
/// `null`; read them back as NaN.
fn null_as_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Scalar summary of one fitted target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDiagnostics {
    #[serde(deserialize_with = "null_as_nan")]
    pub aicc: f64,
    /// Effective number of parameters, the trace of the hat matrix.
    #[serde(deserialize_with = "null_as_nan")]
    pub enp: f64,
    pub r_squared: Option<f64>,
    pub deviance: Option<f64>,
    pub sigma_squared: Option<f64>,
    pub n_fitted: usize,
}

/// Report a target's diagnostics through the log.
pub fn output_diagnostics(label: &str, diagnostics: &TargetDiagnostics) {
    log::info!(
        "Corrected Akaike information criterion for {label} model: {}",
        diagnostics.aicc
    );
    log::info!(
        "Effective number of parameters for {label} model: {}",
        diagnostics.enp
    );
    if let Some(r2) = diagnostics.r_squared {
        log::info!("R-squared for {label} model: {r2}");
    }
    if let Some(deviance) = diagnostics.deviance {
        log::info!("Deviance for {label} model: {deviance}");
    }
}
