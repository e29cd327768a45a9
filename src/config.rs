//! Run configuration and its validation.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::kernel::distance_extent;
use crate::types::{BandwidthMode, FamilyKind, KernelKind};

/// Problems with the run configuration. These are raised once, before any
/// fitting pass starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown distribution family '{0}'; expected one of gaussian, poisson, nb")]
    UnknownFamily(String),
    #[error(
        "unknown kernel '{0}'; expected one of bisquare, exponential, gaussian, quadratic, triangular, uniform"
    )]
    UnknownKernel(String),
    #[error(
        "kernel '{0}' does not hard-threshold and cannot guarantee k neighbours with an adaptive bandwidth; use bisquare or uniform, a fixed bandwidth, or set allow_smooth_adaptive"
    )]
    SmoothKernelWithAdaptiveBandwidth(KernelKind),
    #[error("minimum bandwidth {minbw} must be smaller than maximum bandwidth {maxbw}")]
    EmptySearchRange { minbw: f64, maxbw: f64 },
    #[error("bandwidth must be positive and finite, got {0}")]
    InvalidBandwidth(f64),
    #[error("adaptive bandwidth must be a whole number of neighbours, got {0}")]
    FractionalNeighbourCount(f64),
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("no target variables were configured")]
    MissingTargets,
    #[error("failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn default_tolerance() -> f64 {
    1e-3
}

fn default_max_iter() -> usize {
    500
}

fn default_patience() -> usize {
    5
}

fn default_search_patience() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_chunks() -> usize {
    1
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_rollback_window() -> usize {
    3
}

fn default_seed() -> u64 {
    888
}

/// Immutable description of one regression run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "ModelConfig::default_family")]
    pub family: FamilyKind,
    #[serde(default = "ModelConfig::default_kernel")]
    pub kernel: KernelKind,
    /// `true`: bandwidth is a distance. `false`: bandwidth is a neighbour count.
    #[serde(default)]
    pub bw_fixed: bool,
    /// Skip the bandwidth search and fit at this bandwidth.
    #[serde(default)]
    pub bw: Option<f64>,
    #[serde(default)]
    pub minbw: Option<f64>,
    #[serde(default)]
    pub maxbw: Option<f64>,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Backfitting rounds a feature's bandwidth must stay put before its
    /// search is skipped.
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Golden-section rounds without progress before the search stops.
    #[serde(default = "default_search_patience")]
    pub search_patience: usize,
    #[serde(default)]
    pub multicollinear_threshold: Option<f64>,
    #[serde(default = "default_true")]
    pub fit_intercept: bool,
    #[serde(default)]
    pub exclude_self: bool,
    #[serde(default)]
    pub subsample: bool,
    #[serde(default)]
    pub multiscale: bool,
    #[serde(default)]
    pub multiscale_params_only: bool,
    /// Row chunks per worker for the multiscale metrics pass.
    #[serde(default = "default_chunks")]
    pub chunks: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Kernel weights at or below this value are dropped from the sparse
    /// weight vectors.
    #[serde(default)]
    pub weight_threshold: f64,
    /// Number of score deltas inspected by the backfitting local-minimum guard.
    #[serde(default = "default_rollback_window")]
    pub rollback_window: usize,
    #[serde(default)]
    pub allow_smooth_adaptive: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub covariates: Option<Vec<String>>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            family: Self::default_family(),
            kernel: Self::default_kernel(),
            bw_fixed: false,
            bw: None,
            minbw: None,
            maxbw: None,
            tolerance: default_tolerance(),
            max_iter: default_max_iter(),
            patience: default_patience(),
            search_patience: default_search_patience(),
            multicollinear_threshold: None,
            fit_intercept: true,
            exclude_self: false,
            subsample: false,
            multiscale: false,
            multiscale_params_only: false,
            chunks: default_chunks(),
            workers: default_workers(),
            weight_threshold: 0.0,
            rollback_window: default_rollback_window(),
            allow_smooth_adaptive: false,
            seed: default_seed(),
            targets: Vec::new(),
            covariates: None,
        }
    }
}

/// Closed interval searched by the golden-section optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchRange {
    pub lower: f64,
    pub upper: f64,
}

impl ModelConfig {
    fn default_family() -> FamilyKind {
        FamilyKind::Gaussian
    }

    fn default_kernel() -> KernelKind {
        KernelKind::Bisquare
    }

    pub fn from_json_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn bandwidth_mode(&self) -> BandwidthMode {
        BandwidthMode::from_fixed_flag(self.bw_fixed)
    }

    /// Checks every setting that can be judged without data. Call once before
    /// any fitting pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::MissingTargets);
        }
        if !self.bw_fixed && !self.kernel.suits_adaptive_bandwidth() {
            if self.allow_smooth_adaptive {
                log::warn!(
                    "kernel '{}' combined with an adaptive bandwidth does not hard-threshold; neighbour counts are approximate",
                    self.kernel
                );
            } else {
                return Err(ConfigError::SmoothKernelWithAdaptiveBandwidth(self.kernel));
            }
        }
        if let Some(bw) = self.bw {
            if !(bw.is_finite() && bw > 0.0) {
                return Err(ConfigError::InvalidBandwidth(bw));
            }
            if !self.bw_fixed && bw.fract() != 0.0 {
                return Err(ConfigError::FractionalNeighbourCount(bw));
            }
        }
        for (name, value) in [("minbw", self.minbw), ("maxbw", self.maxbw)] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return Err(ConfigError::NonPositive { name, value: v });
                }
            }
        }
        if let (Some(minbw), Some(maxbw)) = (self.minbw, self.maxbw) {
            if minbw >= maxbw {
                return Err(ConfigError::EmptySearchRange { minbw, maxbw });
            }
        }
        if !(self.tolerance > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "tolerance",
                value: self.tolerance,
            });
        }
        for (name, value) in [
            ("max_iter", self.max_iter),
            ("chunks", self.chunks),
            ("workers", self.workers),
            ("rollback_window", self.rollback_window),
        ] {
            if value == 0 {
                return Err(ConfigError::NonPositive {
                    name,
                    value: value as f64,
                });
            }
        }
        if let Some(threshold) = self.multicollinear_threshold {
            if !(threshold > 0.0) {
                return Err(ConfigError::NonPositive {
                    name: "multicollinear_threshold",
                    value: threshold,
                });
            }
        }
        if self.weight_threshold < 0.0 || !self.weight_threshold.is_finite() {
            return Err(ConfigError::NonPositive {
                name: "weight_threshold",
                value: self.weight_threshold,
            });
        }
        Ok(())
    }

    /// Resolve the bandwidth search interval for a sample set.
    ///
    /// Fixed mode defaults to `[min nearest-neighbour distance / 2, 2 * max
    /// pairwise distance]`; adaptive mode defaults to `[5, 100]` neighbours,
    /// capped by the number of other samples. Configured bounds override either
    /// side.
    pub fn resolve_search_range(
        &self,
        coords: ArrayView2<'_, f64>,
        n_features: usize,
    ) -> Result<SearchRange, ConfigError> {
        let n_samples = coords.nrows();
        let (lower, upper) = match self.bandwidth_mode() {
            BandwidthMode::Fixed => {
                let need_extent = self.minbw.is_none() || self.maxbw.is_none();
                let (min_nn, max_pair) = if need_extent {
                    distance_extent(coords)
                } else {
                    (0.0, 0.0)
                };
                (
                    self.minbw.unwrap_or(min_nn / 2.0),
                    self.maxbw.unwrap_or(2.0 * max_pair),
                )
            }
            BandwidthMode::Adaptive => {
                let cap = n_samples.saturating_sub(1) as f64;
                let upper = self.maxbw.unwrap_or_else(|| cap.min(100.0));
                let floor = (n_features + 1).max(2) as f64;
                let lower = self.minbw.unwrap_or_else(|| {
                    if 5.0 < upper {
                        5.0
                    } else {
                        floor.min(upper - 1.0)
                    }
                });
                (lower, upper)
            }
        };
        if !(lower < upper) || !lower.is_finite() || !upper.is_finite() {
            return Err(ConfigError::EmptySearchRange {
                minbw: lower,
                maxbw: upper,
            });
        }
        Ok(SearchRange { lower, upper })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn base() -> ModelConfig {
        ModelConfig {
            targets: vec!["y".to_string()],
            ..ModelConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg: ModelConfig = serde_json::from_str(r#"{"targets": ["y"]}"#).unwrap();
        assert_eq!(cfg.family, FamilyKind::Gaussian);
        assert_eq!(cfg.kernel, KernelKind::Bisquare);
        assert!(!cfg.bw_fixed);
        assert_eq!(cfg.tolerance, 1e-3);
        assert_eq!(cfg.max_iter, 500);
        assert_eq!(cfg.patience, 5);
        assert_eq!(cfg.search_patience, 3);
        assert_eq!(cfg.chunks, 1);
        assert!(cfg.fit_intercept);
        assert!(cfg.multicollinear_threshold.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn family_is_parsed_by_short_name() {
        let cfg: ModelConfig =
            serde_json::from_str(r#"{"targets": ["y"], "family": "nb", "kernel": "uniform"}"#)
                .unwrap();
        assert_eq!(cfg.family, FamilyKind::NegativeBinomial);
        assert_eq!(cfg.kernel, KernelKind::Uniform);
    }

    #[test]
    fn rejects_inverted_search_range() {
        let cfg = ModelConfig {
            minbw: Some(50.0),
            maxbw: Some(10.0),
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptySearchRange { .. })
        ));
    }

    #[test]
    fn rejects_smooth_kernel_with_adaptive_bandwidth() {
        let cfg = ModelConfig {
            kernel: KernelKind::Gaussian,
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SmoothKernelWithAdaptiveBandwidth(KernelKind::Gaussian))
        ));
        let allowed = ModelConfig {
            allow_smooth_adaptive: true,
            ..cfg
        };
        allowed.validate().unwrap();
        let fixed = ModelConfig {
            kernel: KernelKind::Gaussian,
            bw_fixed: true,
            ..base()
        };
        fixed.validate().unwrap();
    }

    #[test]
    fn rejects_missing_targets_and_fractional_neighbours() {
        assert!(matches!(
            ModelConfig::default().validate(),
            Err(ConfigError::MissingTargets)
        ));
        let cfg = ModelConfig {
            bw: Some(7.5),
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::FractionalNeighbourCount(_))
        ));
    }

    #[test]
    fn fixed_search_range_spans_neighbour_and_diameter_distances() {
        let coords = array![[0.0, 0.0], [1.0, 0.0], [3.0, 0.0], [3.0, 4.0]];
        let cfg = ModelConfig {
            bw_fixed: true,
            ..base()
        };
        let range = cfg.resolve_search_range(coords.view(), 2).unwrap();
        assert!((range.lower - 0.5).abs() < 1e-12);
        assert!((range.upper - 10.0).abs() < 1e-12);
    }

    #[test]
    fn adaptive_search_range_is_capped_by_sample_count() {
        let coords = ndarray::Array2::<f64>::zeros((40, 2));
        let range = base().resolve_search_range(coords.view(), 3).unwrap();
        assert_eq!(range.lower, 5.0);
        assert_eq!(range.upper, 39.0);
    }
}
