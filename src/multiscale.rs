//! Multiscale backfitting.
//!
//! Every feature gets its own bandwidth. Starting from a single-bandwidth fit,
//! each round refits one feature at a time against the partial residual of
//! the others, searching that feature's bandwidth unless it has been stable
//! for long enough. All partial fits are weighted least squares on a working
//! response (the response itself for Gaussian models, the IRLS working
//! response of the seed fit otherwise), so the whole procedure is a linear
//! smoother and its hat matrix can be rebuilt exactly by replaying the
//! recorded bandwidth history.
//!
//! The hat matrix is `N x N` per feature, so the metrics pass rebuilds it one
//! block of columns at a time and only keeps the diagonal, the per-sample
//! leverage terms, and the effective parameter counts.

use std::collections::VecDeque;
use std::ops::Range;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use thiserror::Error;

use crate::coordinator::{Coordinator, FitFailure, partition};
use crate::estimate::{BandwidthSelectionError, LocalRegressionEngine};
use crate::families::Family;
use crate::kernel::{KernelSpec, compute_weights};
use crate::linalg::utils::KahanSum;
use crate::local::{LocalFitError, LocalFitOptions, fit_local};
use crate::types::CoefficientTable;

#[derive(Error, Debug)]
pub enum BackfitError {
    #[error("bandwidth search for feature '{feature}' failed in backfitting round {round}: {source}")]
    Bandwidth {
        feature: String,
        round: usize,
        #[source]
        source: BandwidthSelectionError,
    },
    #[error("partial fit for feature '{feature}' failed in backfitting round {round}: {source}")]
    PartialFit {
        feature: String,
        round: usize,
        #[source]
        source: FitFailure,
    },
    #[error("initial multiscale fit at bandwidth {bandwidth} failed: {source}")]
    InitialFit {
        bandwidth: f64,
        #[source]
        source: FitFailure,
    },
    #[error("backfitting score is not finite in round {round}")]
    NonFiniteScore { round: usize },
    #[error("hat matrix reconstruction failed: {0}")]
    Metrics(#[from] FitFailure),
}

#[derive(Debug, Clone, Copy)]
pub struct BackfitOptions {
    pub tolerance: f64,
    pub max_rounds: usize,
    /// Rounds a feature's bandwidth must stay unchanged before its search is
    /// skipped.
    pub patience: usize,
    /// Score deltas inspected by the local-minimum guard.
    pub rollback_window: usize,
}

/// Why backfitting stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfitStop {
    Converged,
    /// The score oscillated; the state of `restored_round` was kept.
    LocalMinimum { restored_round: usize },
    RoundCap,
}

/// Working regression shared by every partial fit of one target.
#[derive(Clone, Copy)]
pub struct WorkingProblem<'a> {
    pub response: ArrayView1<'a, f64>,
    pub x: ArrayView2<'a, f64>,
    pub coords: ArrayView2<'a, f64>,
    /// Fixed per-sample weights (IRLS weights of the seed fit); `None` means
    /// ones.
    pub prior_weights: Option<ArrayView1<'a, f64>>,
}

impl WorkingProblem<'_> {
    fn n_samples(&self) -> usize {
        self.response.len()
    }

    fn n_features(&self) -> usize {
        self.x.ncols()
    }

    fn prior(&self, i: usize) -> f64 {
        self.prior_weights.map_or(1.0, |w| w[i])
    }
}

#[derive(Debug, Clone)]
pub struct Backfit {
    pub initial_bandwidth: f64,
    pub bandwidths: Vec<f64>,
    /// Per-feature bandwidths of every kept round, in order.
    pub history: Vec<Vec<f64>>,
    pub coefficients: CoefficientTable,
    /// Per-feature contributions `x_j * beta_j` to the working response.
    pub partials: Array2<f64>,
    pub scores: Vec<f64>,
    pub stop: BackfitStop,
}

impl Backfit {
    /// Working-scale linear predictor, the row sums of the partials.
    pub fn linear_predictor(&self) -> Array1<f64> {
        self.partials.sum_axis(Axis(1))
    }
}

#[derive(Clone)]
struct Snapshot {
    round: usize,
    bandwidths: Vec<f64>,
    coefficients: CoefficientTable,
    partials: Array2<f64>,
}

/// Normalized RMS change between successive per-feature predictions.
fn backfit_score(old: &Array2<f64>, new: &Array2<f64>) -> f64 {
    let n = old.nrows() as f64;
    let change = Zip::from(old)
        .and(new)
        .fold(KahanSum::default(), |mut acc, &o, &v| {
            acc.add((v - o) * (v - o));
            acc
        })
        .sum();
    if change == 0.0 {
        return 0.0;
    }
    let total: f64 = new
        .sum_axis(Axis(1))
        .iter()
        .map(|v| v * v)
        .collect::<KahanSum>()
        .sum();
    ((change / n) / total).sqrt()
}

/// Round (index into `scores`) to restore when the last `window` score
/// deltas alternate up, down, up, ...: the better of the two rounds around
/// the first peak.
pub fn local_minimum(scores: &[f64], window: usize) -> Option<usize> {
    if window < 2 || scores.len() < window + 1 {
        return None;
    }
    let start = scores.len() - window - 1;
    let tail = &scores[start..];
    let alternates = tail.windows(2).enumerate().all(|(t, pair)| {
        let delta = pair[1] - pair[0];
        if t % 2 == 0 { delta > 0.0 } else { delta < 0.0 }
    });
    if !alternates {
        return None;
    }
    let (before, after) = (start, start + 2);
    Some(if scores[before] <= scores[after] { before } else { after })
}

/// Run backfitting from a single-bandwidth start at `initial_bandwidth`.
pub fn multiscale_backfitting(
    engine: &LocalRegressionEngine<'_>,
    problem: WorkingProblem<'_>,
    feature_names: &[String],
    initial_bandwidth: f64,
    options: &BackfitOptions,
) -> Result<Backfit, BackfitError> {
    let n = problem.n_samples();
    let p = problem.n_features();
    let pool = engine.pool();

    let seed_ctx = engine.context(
        problem.response,
        problem.x,
        problem.coords,
        problem.prior_weights,
        None,
        Family::Gaussian,
    );
    let mut coefficients = Coordinator::new(seed_ctx, pool)
        .fit_coefficients(initial_bandwidth)
        .map_err(|source| BackfitError::InitialFit {
            bandwidth: initial_bandwidth,
            source,
        })?;
    let mut partials = &problem.x * &*coefficients;
    let mut error = &problem.response - &partials.sum_axis(Axis(1));

    let mut bandwidths = vec![initial_bandwidth; p];
    let mut stable = vec![0usize; p];
    let mut history: Vec<Vec<f64>> = Vec::new();
    let mut scores: Vec<f64> = Vec::new();
    let mut snapshots: VecDeque<Snapshot> = VecDeque::new();
    let mut stop = BackfitStop::RoundCap;

    log::info!(
        "multiscale backfitting over {p} feature(s), initial bandwidth {initial_bandwidth}"
    );

    for round in 1..=options.max_rounds {
        let mut next_partials = partials.clone();
        for j in 0..p {
            let feature = &feature_names[j];
            let x_j = problem.x.slice(s![.., j..j + 1]);
            let partial_response = &partials.column(j) + &error;
            let ctx = engine.context(
                partial_response.view(),
                x_j,
                problem.coords.reborrow(),
                problem.prior_weights.as_ref().map(|w| w.view()),
                None,
                Family::Gaussian,
            );

            let bandwidth = if stable[j] > options.patience {
                bandwidths[j]
            } else {
                engine
                    .select_bandwidth(ctx)
                    .map_err(|source| BackfitError::Bandwidth {
                        feature: feature.clone(),
                        round,
                        source,
                    })?
            };
            let betas = Coordinator::new(ctx, pool)
                .fit_coefficients(bandwidth)
                .map_err(|source| BackfitError::PartialFit {
                    feature: feature.clone(),
                    round,
                    source,
                })?;

            let contribution = &problem.x.column(j) * &betas.column(0);
            error = &partial_response - &contribution;
            next_partials.column_mut(j).assign(&contribution);
            coefficients.column_mut(j).assign(&betas.column(0));

            if round > 1 && bandwidth == bandwidths[j] {
                stable[j] += 1;
            } else {
                stable[j] = 0;
            }
            bandwidths[j] = bandwidth;
        }

        history.push(bandwidths.clone());
        let score = backfit_score(&partials, &next_partials);
        partials = next_partials;
        if !score.is_finite() {
            return Err(BackfitError::NonFiniteScore { round });
        }
        scores.push(score);
        log::debug!("backfitting round {round}: score {score:.6e}, bandwidths {bandwidths:?}");

        snapshots.push_back(Snapshot {
            round,
            bandwidths: bandwidths.clone(),
            coefficients: coefficients.clone(),
            partials: partials.clone(),
        });
        while snapshots.len() > options.rollback_window + 1 {
            snapshots.pop_front();
        }

        if score < options.tolerance {
            log::info!("multiscale backfitting converged after {round} round(s)");
            stop = BackfitStop::Converged;
            break;
        }
        if let Some(best) = local_minimum(&scores, options.rollback_window) {
            let restored_round = best + 1;
            if let Some(snapshot) = snapshots.iter().find(|s| s.round == restored_round) {
                log::info!(
                    "backfitting score oscillates; restoring round {restored_round} (score {:.6e})",
                    scores[best]
                );
                bandwidths = snapshot.bandwidths.clone();
                coefficients = snapshot.coefficients.clone();
                partials = snapshot.partials.clone();
                history.truncate(restored_round);
                scores.truncate(restored_round);
                stop = BackfitStop::LocalMinimum { restored_round };
                break;
            }
        }
    }
    if stop == BackfitStop::RoundCap {
        log::warn!(
            "multiscale backfitting hit the round cap of {}; keeping the last round",
            options.max_rounds
        );
    }
    debug_assert_eq!(partials.nrows(), n);

    Ok(Backfit {
        initial_bandwidth,
        bandwidths,
        history,
        coefficients,
        partials,
        scores,
        stop,
    })
}

/// Per-chunk contribution to the multiscale metrics.
#[derive(Debug, Clone)]
pub struct ChunkMetrics {
    pub columns: Range<usize>,
    /// Diagonal hat contributions of the chunk's samples, per feature.
    pub enp: Array1<f64>,
    /// `sum_c B_j[i, c]^2 / v_c` over the chunk's columns.
    pub leverage: Array2<f64>,
    /// Own diagonal hat entry of each sample in `columns`, summed over
    /// features.
    pub influence: Vec<f64>,
}

/// Aggregated metrics of a finished backfit.
#[derive(Debug, Clone)]
pub struct MultiscaleMetrics {
    pub enp_per_feature: Array1<f64>,
    pub enp: f64,
    pub influence: Array1<f64>,
    /// Unscaled coefficient variances; standard errors are
    /// `sqrt(leverage * sigma^2)`.
    pub leverage: Array2<f64>,
}

fn singular(index: usize, bandwidth: f64, support: usize) -> FitFailure {
    FitFailure {
        index,
        bandwidth,
        source: LocalFitError::SingularDesign {
            ratio: 0.0,
            support,
        },
    }
}

/// Rebuild the columns `columns` of every feature's hat matrix by replaying
/// the backfitting history.
///
/// `B_j[i, c]` is the derivative of sample i's coefficient for feature j with
/// respect to the working response of sample `columns.start + c`. It starts
/// at the single-bandwidth projection and is then updated feature by feature,
/// round by round, exactly as the backfit updated the coefficients.
pub fn chunk_compute_metrics(
    problem: WorkingProblem<'_>,
    kernel: &KernelSpec,
    local: &LocalFitOptions,
    initial_bandwidth: f64,
    history: &[Vec<f64>],
    columns: Range<usize>,
) -> Result<ChunkMetrics, FitFailure> {
    let n = problem.n_samples();
    let p = problem.n_features();
    let width = columns.len();

    let mut maps: Vec<Array2<f64>> = vec![Array2::zeros((n, width)); p];
    for i in 0..n {
        let weights = compute_weights(i, problem.coords, initial_bandwidth, kernel).map_err(|err| {
            FitFailure {
                index: i,
                bandwidth: initial_bandwidth,
                source: err.into(),
            }
        })?;
        let fit = fit_local(
            problem.response,
            problem.x,
            &weights,
            &Family::Gaussian,
            None,
            problem.prior_weights,
            local,
        )
        .map_err(|source| FitFailure {
            index: i,
            bandwidth: initial_bandwidth,
            source,
        })?;
        for (pos, &m) in fit.support.iter().enumerate() {
            if columns.contains(&m) {
                for (j, map) in maps.iter_mut().enumerate() {
                    map[[i, m - columns.start]] = fit.pinv[[j, pos]];
                }
            }
        }
    }

    let scale_rows = |map: &Array2<f64>, j: usize| -> Array2<f64> {
        let mut out = map.clone();
        for (mut row, &xv) in out.rows_mut().into_iter().zip(problem.x.column(j).iter()) {
            row *= xv;
        }
        out
    };
    let mut partial_hats: Vec<Array2<f64>> = (0..p).map(|j| scale_rows(&maps[j], j)).collect();
    let mut error = Array2::<f64>::zeros((n, width));
    for c in 0..width {
        error[[columns.start + c, c]] = 1.0;
    }
    for hat in &partial_hats {
        error -= hat;
    }

    for round in history {
        for (j, &bandwidth) in round.iter().enumerate() {
            let projected = &partial_hats[j] + &error;
            let x_j = problem.x.column(j);
            for k in 0..n {
                let weights = compute_weights(k, problem.coords, bandwidth, kernel).map_err(|err| {
                    FitFailure {
                        index: k,
                        bandwidth,
                        source: err.into(),
                    }
                })?;
                let mut denom = KahanSum::default();
                for (&m, &w) in weights.indices.iter().zip(&weights.values) {
                    denom.add(w * problem.prior(m) * x_j[m] * x_j[m]);
                }
                let denom = denom.sum();
                if !(denom > 0.0) {
                    return Err(singular(k, bandwidth, weights.len()));
                }
                let mut row = Array1::<f64>::zeros(width);
                for (&m, &w) in weights.indices.iter().zip(&weights.values) {
                    let coef = w * problem.prior(m) * x_j[m] / denom;
                    if coef != 0.0 {
                        row.scaled_add(coef, &projected.row(m));
                    }
                }
                maps[j].row_mut(k).assign(&row);
            }
            partial_hats[j] = scale_rows(&maps[j], j);
            error = &projected - &partial_hats[j];
        }
    }

    let mut enp = Array1::<f64>::zeros(p);
    let mut influence = vec![0.0; width];
    for (j, hat) in partial_hats.iter().enumerate() {
        for c in 0..width {
            let diag = hat[[columns.start + c, c]];
            enp[j] += diag;
            influence[c] += diag;
        }
    }
    let mut leverage = Array2::<f64>::zeros((n, p));
    for (j, map) in maps.iter().enumerate() {
        for i in 0..n {
            leverage[[i, j]] = (0..width)
                .map(|c| map[[i, c]] * map[[i, c]] / problem.prior(columns.start + c))
                .sum();
        }
    }

    Ok(ChunkMetrics {
        columns,
        enp,
        leverage,
        influence,
    })
}

/// Metrics of a finished backfit, with the hat-matrix columns split into
/// `workers * chunks` blocks spread over the worker pool.
pub fn multiscale_compute_metrics(
    engine: &LocalRegressionEngine<'_>,
    problem: WorkingProblem<'_>,
    backfit: &Backfit,
    chunks: usize,
) -> Result<MultiscaleMetrics, BackfitError> {
    let n = problem.n_samples();
    let p = problem.n_features();
    let pool = engine.pool();
    let total_chunks = pool.workers() * chunks.max(1);
    let blocks = partition(n, total_chunks);
    log::info!("computing multiscale metrics over {total_chunks} chunk(s)");

    let kernel = engine.kernel_spec();
    let local = engine.local_options();
    let per_rank: Vec<Result<Vec<ChunkMetrics>, FitFailure>> =
        pool.scatter_gather(blocks.len(), |rank, block_range| {
            log::trace!("rank {rank} rebuilding hat blocks {block_range:?}");
            blocks[block_range]
                .iter()
                .filter(|cols| !cols.is_empty())
                .map(|cols| {
                    chunk_compute_metrics(
                        problem,
                        &kernel,
                        &local,
                        backfit.initial_bandwidth,
                        &backfit.history,
                        cols.clone(),
                    )
                })
                .collect()
        });

    let mut enp_per_feature = Array1::<f64>::zeros(p);
    let mut influence = Array1::<f64>::zeros(n);
    let mut leverage = Array2::<f64>::zeros((n, p));
    for chunk in per_rank.into_iter() {
        for metrics in chunk? {
            enp_per_feature += &metrics.enp;
            leverage += &metrics.leverage;
            for (c, value) in metrics.influence.iter().enumerate() {
                influence[metrics.columns.start + c] = *value;
            }
        }
    }
    let enp = enp_per_feature.iter().copied().collect::<KahanSum>().sum();
    log::debug!("effective parameters per feature: {enp_per_feature:?}");
    Ok(MultiscaleMetrics {
        enp_per_feature,
        enp,
        influence,
        leverage,
    })
}
