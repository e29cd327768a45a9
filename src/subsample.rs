//! Stratified spatial subsampling.
//!
//! Samples are grouped by spatial k-means; inside each cluster non-zero and
//! zero responses are drawn separately so sparse targets keep their
//! expressing samples. Every sample that is not drawn is mapped to its
//! nearest drawn sample, which later lends it its fitted coefficients.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;

use crate::kernel::nearest_among;
use crate::linalg::utils::planar_distance;

const KMEANS_MAX_ITER: usize = 100;
const CLUSTER_FRACTION: f64 = 0.05;

/// Which samples were fitted, and which fitted sample stands in for each
/// sample that was not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsampleMap {
    /// Fitted sample indices, ascending.
    pub sampled: Vec<usize>,
    /// For every sample, the fitted sample whose results it receives (itself
    /// when it was fitted).
    pub nearest: Vec<usize>,
}

impl SubsampleMap {
    pub fn identity(n: usize) -> Self {
        Self {
            sampled: (0..n).collect(),
            nearest: (0..n).collect(),
        }
    }

    pub fn n_samples(&self) -> usize {
        self.nearest.len()
    }

    pub fn is_identity(&self) -> bool {
        self.sampled.len() == self.nearest.len()
    }

    pub fn is_sampled(&self, i: usize) -> bool {
        self.nearest[i] == i
    }

    /// Build the map from an explicit set of fitted samples.
    pub fn from_sampled(coords: ArrayView2<'_, f64>, mut sampled: Vec<usize>) -> Self {
        sampled.sort_unstable();
        sampled.dedup();
        let nearest = (0..coords.nrows())
            .map(|i| {
                if sampled.binary_search(&i).is_ok() {
                    i
                } else {
                    nearest_among(coords, i, &sampled).unwrap_or(i)
                }
            })
            .collect();
        Self { sampled, nearest }
    }

    /// Row of the derived (fitted) sample set that sample `i` takes its
    /// results from.
    pub fn source_row(&self, i: usize) -> usize {
        self.sampled
            .binary_search(&self.nearest[i])
            .unwrap_or_default()
    }

    /// Expand a table over the fitted samples to all samples by copying each
    /// unsampled sample's stand-in row.
    pub fn propagate_rows(&self, fitted: &Array2<f64>) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((self.n_samples(), fitted.ncols()));
        for i in 0..self.n_samples() {
            out.row_mut(i).assign(&fitted.row(self.source_row(i)));
        }
        out
    }

    /// Expand a per-sample vector, leaving `fill` for unsampled samples.
    pub fn propagate_fitted_only(&self, fitted: &Array1<f64>, fill: f64) -> Array1<f64> {
        Array1::from_shape_fn(self.n_samples(), |i| {
            if self.is_sampled(i) {
                fitted[self.source_row(i)]
            } else {
                fill
            }
        })
    }
}

fn point(coords: ArrayView2<'_, f64>, i: usize) -> (f64, f64) {
    (coords[[i, 0]], coords[[i, 1]])
}

/// Lloyd's k-means on planar coordinates. Centres start at samples spread
/// evenly along the x-then-y ordering. Returns a cluster label per sample.
pub fn spatial_kmeans(coords: ArrayView2<'_, f64>, k: usize) -> Vec<usize> {
    let n = coords.nrows();
    let k = k.clamp(1, n.max(1));
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        coords[[a, 0]]
            .total_cmp(&coords[[b, 0]])
            .then(coords[[a, 1]].total_cmp(&coords[[b, 1]]))
    });
    let mut centres: Vec<(f64, f64)> = (0..k)
        .map(|c| {
            let pos = (((c as f64 + 0.5) * n as f64 / k as f64) as usize).min(n - 1);
            point(coords, order[pos])
        })
        .collect();

    let mut labels = vec![usize::MAX; n];
    for iteration in 0..KMEANS_MAX_ITER {
        let mut changed = false;
        for (i, label) in labels.iter_mut().enumerate() {
            let p = point(coords, i);
            let mut best = (0usize, f64::INFINITY);
            for (c, &centre) in centres.iter().enumerate() {
                let d = planar_distance(p, centre);
                if d < best.1 {
                    best = (c, d);
                }
            }
            if *label != best.0 {
                *label = best.0;
                changed = true;
            }
        }
        if !changed {
            log::trace!("k-means settled after {iteration} iteration(s)");
            break;
        }
        let mut sums = vec![(0.0, 0.0, 0usize); k];
        for (i, &label) in labels.iter().enumerate() {
            let (x, y) = point(coords, i);
            sums[label].0 += x;
            sums[label].1 += y;
            sums[label].2 += 1;
        }
        for (centre, (sx, sy, count)) in centres.iter_mut().zip(sums) {
            // Empty clusters keep their previous centre.
            if count > 0 {
                *centre = (sx / count as f64, sy / count as f64);
            }
        }
    }
    labels
}

/// Draw a stratified subsample of the samples for one target.
///
/// Clusters number `max(1, floor(0.05 N))`. In a cluster with `nnz` non-zero
/// responses out of `m`, `ceil(nnz / 2 * nnz / m)` non-zero samples and
/// `max(2 * that, 3)` zero samples are drawn without replacement.
pub fn stratified_subsample(
    coords: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    seed: u64,
) -> SubsampleMap {
    let n = coords.nrows();
    let k = ((CLUSTER_FRACTION * n as f64).floor() as usize).max(1);
    let labels = spatial_kmeans(coords, k);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut sampled = Vec::new();
    for cluster in 0..k {
        let members: Vec<usize> = (0..n).filter(|&i| labels[i] == cluster).collect();
        if members.is_empty() {
            continue;
        }
        let (nonzero, zero): (Vec<usize>, Vec<usize>) =
            members.iter().copied().partition(|&i| y[i] != 0.0);
        let density = nonzero.len() as f64 / members.len() as f64;
        let nonzero_quota =
            ((((nonzero.len() as f64) / 2.0) * density).ceil() as usize).min(nonzero.len());
        let zero_quota = (2 * nonzero_quota).max(3).min(zero.len());

        for (pool, quota) in [(&nonzero, nonzero_quota), (&zero, zero_quota)] {
            if quota == 0 {
                continue;
            }
            let picks = index::sample(&mut rng, pool.len(), quota);
            sampled.extend(picks.into_iter().map(|pos| pool[pos]));
        }
    }

    let map = SubsampleMap::from_sampled(coords, sampled);
    log::info!(
        "subsampled {} of {n} samples across {k} spatial cluster(s)",
        map.sampled.len()
    );
    map
}
