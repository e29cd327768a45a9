//! Shared enums and ndarray newtypes.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use crate::config::ConfigError;

/// Link between the linear predictor and the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFunction {
    Identity,
    Log,
}

/// Distribution selector carried by the configuration. The runtime family
/// (with its dispersion state) lives in [`crate::families::Family`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyKind {
    Gaussian,
    Poisson,
    #[serde(rename = "nb")]
    NegativeBinomial,
}

impl FamilyKind {
    pub fn link(self) -> LinkFunction {
        match self {
            FamilyKind::Gaussian => LinkFunction::Identity,
            FamilyKind::Poisson | FamilyKind::NegativeBinomial => LinkFunction::Log,
        }
    }

    pub fn is_gaussian(self) -> bool {
        matches!(self, FamilyKind::Gaussian)
    }

    /// Header label of the per-sample diagnostic column.
    pub fn diagnostic_label(self) -> &'static str {
        if self.is_gaussian() {
            "residual"
        } else {
            "prediction"
        }
    }
}

impl FromStr for FamilyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gaussian" => Ok(FamilyKind::Gaussian),
            "poisson" => Ok(FamilyKind::Poisson),
            "nb" | "negative_binomial" | "negbinom" => Ok(FamilyKind::NegativeBinomial),
            other => Err(ConfigError::UnknownFamily(other.to_string())),
        }
    }
}

impl fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FamilyKind::Gaussian => "gaussian",
            FamilyKind::Poisson => "poisson",
            FamilyKind::NegativeBinomial => "nb",
        };
        f.write_str(name)
    }
}

/// Shape of the spatial kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelKind {
    Bisquare,
    Exponential,
    Gaussian,
    Quadratic,
    Triangular,
    Uniform,
}

impl KernelKind {
    /// Kernels that admit exactly `k` neighbours under an adaptive bandwidth.
    pub fn suits_adaptive_bandwidth(self) -> bool {
        matches!(self, KernelKind::Bisquare | KernelKind::Uniform)
    }
}

impl FromStr for KernelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bisquare" => Ok(KernelKind::Bisquare),
            "exponential" => Ok(KernelKind::Exponential),
            "gaussian" => Ok(KernelKind::Gaussian),
            "quadratic" => Ok(KernelKind::Quadratic),
            "triangular" => Ok(KernelKind::Triangular),
            "uniform" => Ok(KernelKind::Uniform),
            other => Err(ConfigError::UnknownKernel(other.to_string())),
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelKind::Bisquare => "bisquare",
            KernelKind::Exponential => "exponential",
            KernelKind::Gaussian => "gaussian",
            KernelKind::Quadratic => "quadratic",
            KernelKind::Triangular => "triangular",
            KernelKind::Uniform => "uniform",
        };
        f.write_str(name)
    }
}

/// How a scalar bandwidth is interpreted by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandwidthMode {
    /// Bandwidth is a distance.
    Fixed,
    /// Bandwidth is a whole number of nearest neighbours.
    Adaptive,
}

impl BandwidthMode {
    pub fn from_fixed_flag(bw_fixed: bool) -> Self {
        if bw_fixed {
            BandwidthMode::Fixed
        } else {
            BandwidthMode::Adaptive
        }
    }

    /// Snap a candidate bandwidth onto the grid this mode searches over.
    #[inline]
    pub fn normalize(self, bw: f64) -> f64 {
        match self {
            BandwidthMode::Fixed => bw,
            BandwidthMode::Adaptive => bw.round(),
        }
    }
}

macro_rules! array_newtype {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name(pub $inner);

        impl Deref for $name {
            type Target = $inner;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }

        impl AsRef<$inner> for $name {
            fn as_ref(&self) -> &$inner {
                &self.0
            }
        }

        impl From<$inner> for $name {
            fn from(values: $inner) -> Self {
                Self(values)
            }
        }

        impl From<$name> for $inner {
            fn from(values: $name) -> Self {
                values.0
            }
        }
    };
}

array_newtype!(
    /// Local coefficients of one sample, one entry per feature.
    Coefficients,
    Array1<f64>
);

array_newtype!(
    /// Link-scale prediction per sample.
    LinearPredictor,
    Array1<f64>
);

array_newtype!(
    /// N x P table of per-sample local coefficients.
    CoefficientTable,
    Array2<f64>
);

impl CoefficientTable {
    pub fn zeros(n_samples: usize, n_features: usize) -> Self {
        Self(Array2::zeros((n_samples, n_features)))
    }

    /// Row-wise `sum_j X_ij * B_ij`.
    pub fn linear_predictor(&self, x: ArrayView2<'_, f64>) -> LinearPredictor {
        LinearPredictor((&x * &self.0).sum_axis(ndarray::Axis(1)))
    }
}
