//! Response families: IRLS working quantities, deviance and likelihood.

use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::linalg::utils::KahanSum;
use crate::types::{FamilyKind, LinkFunction};

const MIN_WEIGHT: f64 = 1e-12;
const MIN_D_FOR_Z: f64 = 1e-6;
const MIN_MEAN: f64 = 1e-10;
const MAX_ETA: f64 = 30.0;
const MIN_ALPHA: f64 = 1e-8;
const MAX_ALPHA: f64 = 1e8;

/// Working-model capabilities needed by the local estimator and the scorers.
pub trait WorkingLikelihood {
    /// One IRLS step: fills the mean, combined working weights and working
    /// response for the current linear predictor.
    fn irls_update(
        &self,
        y: ArrayView1<'_, f64>,
        eta: &Array1<f64>,
        prior_weights: ArrayView1<'_, f64>,
        mu: &mut Array1<f64>,
        weights: &mut Array1<f64>,
        z: &mut Array1<f64>,
    );

    /// Log-likelihood of a single observation at mean `mu`.
    fn unit_log_likelihood(&self, y: f64, mu: f64) -> f64;

    /// Deviance contribution of a single observation at mean `mu`.
    fn unit_deviance(&self, y: f64, mu: f64) -> f64;
}

/// Distribution of the response, selected once from the configuration. The
/// negative binomial variant carries its current dispersion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Family {
    Gaussian,
    Poisson,
    /// Variance `mu + mu^2 / theta`.
    NegativeBinomial { theta: f64 },
}

impl Family {
    /// Runtime family for `kind`. The negative binomial dispersion starts from
    /// a moment estimate on the response.
    pub fn from_kind(kind: FamilyKind, y: ArrayView1<'_, f64>) -> Self {
        match kind {
            FamilyKind::Gaussian => Family::Gaussian,
            FamilyKind::Poisson => Family::Poisson,
            FamilyKind::NegativeBinomial => Family::NegativeBinomial {
                theta: initial_theta(y),
            },
        }
    }

    pub fn kind(&self) -> FamilyKind {
        match self {
            Family::Gaussian => FamilyKind::Gaussian,
            Family::Poisson => FamilyKind::Poisson,
            Family::NegativeBinomial { .. } => FamilyKind::NegativeBinomial,
        }
    }

    pub fn link(&self) -> LinkFunction {
        self.kind().link()
    }

    pub fn is_gaussian(&self) -> bool {
        matches!(self, Family::Gaussian)
    }

    pub fn theta(&self) -> Option<f64> {
        match self {
            Family::NegativeBinomial { theta } => Some(*theta),
            _ => None,
        }
    }

    /// Link-scale value of a mean.
    #[inline]
    pub fn link_value(&self, mu: f64) -> f64 {
        match self.link() {
            LinkFunction::Identity => mu,
            LinkFunction::Log => mu.max(MIN_MEAN).ln(),
        }
    }

    /// Inverse link applied to one linear predictor.
    #[inline]
    pub fn inverse_link(&self, eta: f64) -> f64 {
        match self.link() {
            LinkFunction::Identity => eta,
            LinkFunction::Log => eta.clamp(-MAX_ETA, MAX_ETA).exp(),
        }
    }

    /// Response-scale prediction for a vector of linear predictors.
    pub fn predict(&self, eta: ArrayView1<'_, f64>) -> Array1<f64> {
        eta.mapv(|e| self.inverse_link(e))
    }

    pub fn variance(&self, mu: f64) -> f64 {
        match self {
            Family::Gaussian => 1.0,
            Family::Poisson => mu,
            Family::NegativeBinomial { theta } => mu + mu * mu / theta,
        }
    }

    /// Starting mean for IRLS when no initial coefficients are supplied.
    pub fn initial_mean(&self, y: ArrayView1<'_, f64>) -> Array1<f64> {
        let mean = y.mean().unwrap_or(0.0);
        y.mapv(|v| ((v + mean) / 2.0).max(0.1))
    }

    /// Total deviance. Gaussian deviance is the residual sum of squares.
    pub fn deviance(&self, y: ArrayView1<'_, f64>, mu: ArrayView1<'_, f64>) -> f64 {
        Zip::from(y)
            .and(mu)
            .fold(KahanSum::default(), |mut acc, &yi, &mi| {
                acc.add(self.unit_deviance(yi, mi));
                acc
            })
            .sum()
    }

    /// Total log-likelihood. The Gaussian case profiles out the residual
    /// variance.
    pub fn log_likelihood(&self, y: ArrayView1<'_, f64>, mu: ArrayView1<'_, f64>) -> f64 {
        if self.is_gaussian() {
            let n = y.len() as f64;
            let rss = self.deviance(y, mu);
            return -0.5 * n * ((2.0 * std::f64::consts::PI * rss / n).ln() + 1.0);
        }
        Zip::from(y)
            .and(mu)
            .fold(KahanSum::default(), |mut acc, &yi, &mi| {
                acc.add(self.unit_log_likelihood(yi, mi));
                acc
            })
            .sum()
    }

    /// Fixed-point dispersion update from the deviance at the current fit:
    /// `alpha <- alpha * D / dof`, with `theta = 1 / alpha`. Other families
    /// are returned unchanged.
    pub fn with_updated_dispersion(
        &self,
        y: ArrayView1<'_, f64>,
        mu: ArrayView1<'_, f64>,
        dof: f64,
    ) -> Self {
        match self {
            Family::NegativeBinomial { theta } => {
                if !(dof > 0.0) {
                    log::warn!("skipping dispersion update: non-positive residual degrees of freedom {dof:.3}");
                    return *self;
                }
                let deviance = self.deviance(y, mu);
                let alpha = (1.0 / theta) * deviance / dof;
                if !alpha.is_finite() {
                    log::warn!("skipping dispersion update: non-finite deviance {deviance}");
                    return *self;
                }
                let alpha = alpha.clamp(MIN_ALPHA, MAX_ALPHA);
                log::debug!("negative binomial dispersion updated: theta {:.6} -> {:.6}", theta, 1.0 / alpha);
                Family::NegativeBinomial { theta: 1.0 / alpha }
            }
            other => *other,
        }
    }
}

/// Moment estimate of the negative binomial size parameter.
pub fn initial_theta(y: ArrayView1<'_, f64>) -> f64 {
    let n = y.len();
    if n < 2 {
        return 1e6;
    }
    let mean = y.mean().unwrap_or(0.0);
    let var = y.var(1.0);
    let alpha = if mean > 0.0 {
        ((var - mean) / (mean * mean)).max(1e-6)
    } else {
        1e-6
    };
    1.0 / alpha.clamp(MIN_ALPHA, MAX_ALPHA)
}

#[inline]
fn xlogy_ratio(y: f64, mu: f64) -> f64 {
    if y > 0.0 {
        y * (y / mu.max(MIN_MEAN)).ln()
    } else {
        0.0
    }
}

impl WorkingLikelihood for Family {
    fn irls_update(
        &self,
        y: ArrayView1<'_, f64>,
        eta: &Array1<f64>,
        prior_weights: ArrayView1<'_, f64>,
        mu: &mut Array1<f64>,
        weights: &mut Array1<f64>,
        z: &mut Array1<f64>,
    ) {
        for i in 0..eta.len() {
            match self {
                Family::Gaussian => {
                    mu[i] = eta[i];
                    weights[i] = prior_weights[i];
                    z[i] = y[i];
                }
                Family::Poisson | Family::NegativeBinomial { .. } => {
                    let e = eta[i].clamp(-MAX_ETA, MAX_ETA);
                    let mu_i = e.exp().max(MIN_MEAN);
                    mu[i] = mu_i;
                    // Log link: dmu/deta = mu, so the Fisher weight is mu^2 / V(mu).
                    let fisher_w = (mu_i * mu_i / self.variance(mu_i)).max(MIN_WEIGHT);
                    weights[i] = prior_weights[i] * fisher_w;
                    z[i] = e + (y[i] - mu_i) / mu_i.max(MIN_D_FOR_Z);
                }
            }
        }
    }

    fn unit_log_likelihood(&self, y: f64, mu: f64) -> f64 {
        let mu = mu.max(MIN_MEAN);
        match self {
            Family::Gaussian => -0.5 * ((2.0 * std::f64::consts::PI).ln() + (y - mu) * (y - mu)),
            Family::Poisson => {
                let y_term = if y > 0.0 { y * mu.ln() } else { 0.0 };
                y_term - mu - ln_gamma(y + 1.0)
            }
            Family::NegativeBinomial { theta } => {
                let theta = *theta;
                let y_term = if y > 0.0 { y * (mu / (theta + mu)).ln() } else { 0.0 };
                ln_gamma(y + theta) - ln_gamma(theta) - ln_gamma(y + 1.0)
                    + theta * (theta / (theta + mu)).ln()
                    + y_term
            }
        }
    }

    fn unit_deviance(&self, y: f64, mu: f64) -> f64 {
        match self {
            Family::Gaussian => (y - mu) * (y - mu),
            Family::Poisson => 2.0 * (xlogy_ratio(y, mu) - (y - mu)),
            Family::NegativeBinomial { theta } => {
                let theta = *theta;
                let mu = mu.max(MIN_MEAN);
                2.0 * (xlogy_ratio(y, mu) - (y + theta) * ((y + theta) / (mu + theta)).ln())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn poisson_deviance_handles_zero_counts() {
        let family = Family::Poisson;
        let y = array![0.0, 2.0, 5.0];
        let mu = array![0.5, 2.0, 4.0];
        let dev = family.deviance(y.view(), mu.view());
        let expected = 2.0 * (0.5 + 0.0 + (5.0 * (5.0f64 / 4.0).ln() - 1.0));
        assert_abs_diff_eq!(dev, expected, epsilon = 1e-12);
        assert!(dev.is_finite());
    }

    #[test]
    fn deviance_is_zero_at_saturated_fit() {
        let y = array![0.0, 1.0, 7.0, 30.0];
        let mu = y.mapv(|v: f64| v.max(1e-12));
        for family in [Family::Poisson, Family::NegativeBinomial { theta: 3.0 }] {
            assert_abs_diff_eq!(family.deviance(y.view(), mu.view()), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn negative_binomial_approaches_poisson_for_large_theta() {
        let nb = Family::NegativeBinomial { theta: 1e6 };
        let pois = Family::Poisson;
        for (y, mu) in [(0.0, 1.3), (3.0, 2.2), (12.0, 9.0)] {
            assert_abs_diff_eq!(
                nb.unit_log_likelihood(y, mu),
                pois.unit_log_likelihood(y, mu),
                epsilon = 1e-4
            );
            assert_abs_diff_eq!(nb.unit_deviance(y, mu), pois.unit_deviance(y, mu), epsilon = 1e-4);
        }
    }

    #[test]
    fn poisson_log_likelihood_matches_pmf() {
        let family = Family::Poisson;
        // P(Y = 3 | mu = 2) = e^-2 2^3 / 3!
        let expected = (-2.0f64).exp() * 8.0 / 6.0;
        assert_abs_diff_eq!(family.unit_log_likelihood(3.0, 2.0).exp(), expected, epsilon = 1e-12);
    }

    #[test]
    fn irls_vectors_for_log_link() {
        let family = Family::Poisson;
        let y = array![3.0, 0.0];
        let eta = array![0.0, 1.0];
        let prior = array![1.0, 2.0];
        let mut mu = Array1::zeros(2);
        let mut w = Array1::zeros(2);
        let mut z = Array1::zeros(2);
        family.irls_update(y.view(), &eta, prior.view(), &mut mu, &mut w, &mut z);
        assert_abs_diff_eq!(mu[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z[0], 2.0, epsilon = 1e-12);
        let e = 1.0f64.exp();
        assert_abs_diff_eq!(w[1], 2.0 * e, epsilon = 1e-12);
        assert_abs_diff_eq!(z[1], 1.0 - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn moment_theta_reflects_overdispersion() {
        let y = array![0.0, 0.0, 1.0, 9.0, 0.0, 14.0, 2.0, 0.0];
        let theta = initial_theta(y.view());
        let mean = y.mean().unwrap();
        let var = y.var(1.0);
        assert_abs_diff_eq!(theta, mean * mean / (var - mean), epsilon = 1e-9);
    }

    #[test]
    fn dispersion_update_scales_alpha_by_deviance_ratio() {
        let family = Family::NegativeBinomial { theta: 2.0 };
        let y = array![0.0, 3.0, 8.0, 1.0, 5.0];
        let mu = array![1.0, 2.5, 6.0, 1.5, 4.0];
        let dev = family.deviance(y.view(), mu.view());
        let updated = family.with_updated_dispersion(y.view(), mu.view(), 3.0);
        let alpha = updated.theta().map(|t| 1.0 / t).unwrap();
        assert_abs_diff_eq!(alpha, 0.5 * dev / 3.0, epsilon = 1e-12);
        assert_eq!(
            Family::Poisson.with_updated_dispersion(y.view(), mu.view(), 3.0),
            Family::Poisson
        );
    }
}
