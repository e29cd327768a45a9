//! Spatial kernel weights.
//!
//! For a focal sample the kernel turns Euclidean distances into non-negative
//! weights. A fixed bandwidth is a distance; an adaptive bandwidth is a
//! neighbour count `k`, turned into a per-sample radius equal to the distance
//! of the `k`-th nearest other sample. Weights are stored sparsely: only
//! strictly positive entries (above the configured threshold) are kept.

use ndarray::ArrayView2;
use thiserror::Error;

use crate::linalg::utils::planar_distance;
use crate::types::{BandwidthMode, KernelKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("coordinates must have exactly two columns, got {0}")]
    MalformedCoordinates(usize),
    #[error("sample index {index} out of range for {n_samples} samples")]
    IndexOutOfRange { index: usize, n_samples: usize },
    #[error("bandwidth {0} is not a positive finite value")]
    InvalidBandwidth(f64),
    #[error("sample {index} has no neighbours with positive weight at bandwidth {bandwidth}")]
    NoNeighbours { index: usize, bandwidth: f64 },
}

/// Kernel evaluation options shared by every focal sample of a pass.
#[derive(Debug, Clone, Copy)]
pub struct KernelSpec {
    pub kind: KernelKind,
    pub mode: BandwidthMode,
    pub exclude_self: bool,
    pub threshold: f64,
}

/// Sparse weight vector of one focal sample over the full sample set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialWeights {
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl SpatialWeights {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Position of sample `index` inside the support, if it carries weight.
    pub fn position_of(&self, index: usize) -> Option<usize> {
        self.indices.binary_search(&index).ok()
    }

    /// Dense length-`n` representation.
    pub fn to_dense(&self, n: usize) -> Vec<f64> {
        let mut dense = vec![0.0; n];
        for (&i, &w) in self.indices.iter().zip(&self.values) {
            dense[i] = w;
        }
        dense
    }
}

/// Kernel value at scaled distance `u = d / bandwidth`.
#[inline]
pub fn kernel_value(kind: KernelKind, u: f64) -> f64 {
    let inside = u < 1.0;
    match kind {
        KernelKind::Bisquare => {
            if inside {
                let t = 1.0 - u * u;
                t * t
            } else {
                0.0
            }
        }
        KernelKind::Quadratic => {
            if inside {
                1.0 - u * u
            } else {
                0.0
            }
        }
        KernelKind::Triangular => {
            if inside {
                1.0 - u
            } else {
                0.0
            }
        }
        KernelKind::Uniform => {
            if inside {
                1.0
            } else {
                0.0
            }
        }
        KernelKind::Exponential => (-u).exp(),
        KernelKind::Gaussian => (-0.5 * u * u).exp(),
    }
}

pub(crate) fn check_coordinates(coords: ArrayView2<'_, f64>) -> Result<(), KernelError> {
    if coords.ncols() != 2 {
        return Err(KernelError::MalformedCoordinates(coords.ncols()));
    }
    Ok(())
}

#[inline]
fn point(coords: ArrayView2<'_, f64>, i: usize) -> (f64, f64) {
    (coords[[i, 0]], coords[[i, 1]])
}

/// Distances from `focal` to every sample.
pub fn distances_from(coords: ArrayView2<'_, f64>, focal: usize) -> Vec<f64> {
    let origin = point(coords, focal);
    (0..coords.nrows())
        .map(|j| planar_distance(origin, point(coords, j)))
        .collect()
}

/// Kernel radius for `focal`: the bandwidth itself in fixed mode, or the
/// distance to the `k`-th nearest other sample in adaptive mode.
pub fn kernel_radius(distances: &[f64], focal: usize, bandwidth: f64, mode: BandwidthMode) -> f64 {
    match mode {
        BandwidthMode::Fixed => bandwidth,
        BandwidthMode::Adaptive => {
            let mut others: Vec<f64> = distances
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != focal)
                .map(|(_, &d)| d)
                .collect();
            if others.is_empty() {
                return 0.0;
            }
            let k = (bandwidth.round().max(1.0) as usize).min(others.len());
            let (_, kth, _) = others.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
            *kth
        }
    }
}

/// Weights of every sample relative to `focal` at `bandwidth`.
pub fn compute_weights(
    focal: usize,
    coords: ArrayView2<'_, f64>,
    bandwidth: f64,
    spec: &KernelSpec,
) -> Result<SpatialWeights, KernelError> {
    check_coordinates(coords)?;
    let n_samples = coords.nrows();
    if focal >= n_samples {
        return Err(KernelError::IndexOutOfRange {
            index: focal,
            n_samples,
        });
    }
    if !(bandwidth.is_finite() && bandwidth > 0.0) {
        return Err(KernelError::InvalidBandwidth(bandwidth));
    }

    let distances = distances_from(coords, focal);
    let radius = kernel_radius(&distances, focal, bandwidth, spec.mode);

    let mut weights = SpatialWeights::default();
    for (j, &d) in distances.iter().enumerate() {
        if j == focal && spec.exclude_self {
            continue;
        }
        let w = if radius > 0.0 {
            kernel_value(spec.kind, d / radius)
        } else if d == 0.0 {
            kernel_value(spec.kind, 0.0)
        } else {
            0.0
        };
        if w > spec.threshold {
            weights.indices.push(j);
            weights.values.push(w);
        }
    }

    if weights.is_empty() {
        return Err(KernelError::NoNeighbours {
            index: focal,
            bandwidth,
        });
    }
    Ok(weights)
}

/// `(min nearest-neighbour distance, max pairwise distance)` over a sample set.
pub fn distance_extent(coords: ArrayView2<'_, f64>) -> (f64, f64) {
    let n = coords.nrows();
    let mut min_nn = f64::INFINITY;
    let mut max_pair = 0.0_f64;
    for i in 0..n {
        let mut nearest = f64::INFINITY;
        let origin = point(coords, i);
        for j in 0..n {
            if i == j {
                continue;
            }
            let d = planar_distance(origin, point(coords, j));
            nearest = nearest.min(d);
            max_pair = max_pair.max(d);
        }
        min_nn = min_nn.min(nearest);
    }
    if !min_nn.is_finite() {
        min_nn = 0.0;
    }
    (min_nn, max_pair)
}

/// Nearest candidate to sample `from`, ties going to the lowest index.
pub fn nearest_among(coords: ArrayView2<'_, f64>, from: usize, candidates: &[usize]) -> Option<usize> {
    let origin = point(coords, from);
    let mut best: Option<(usize, f64)> = None;
    for &c in candidates {
        let d = planar_distance(origin, point(coords, c));
        match best {
            Some((b, bd)) if d > bd || (d == bd && c > b) => {}
            _ => best = Some((c, d)),
        }
    }
    best.map(|(c, _)| c)
}
