//! Parallel fit coordinator.
//!
//! One pass fits every sample of a target at a single bandwidth. The sample
//! index space is cut into contiguous chunks of `ceil(N / workers)`; each
//! worker fits its chunk sequentially against read-only shared inputs and
//! returns either a partial reduction or the error it hit. Partials are
//! gathered in rank order, so a failing worker can never leave the gather
//! incomplete.

use std::ops::Range;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::diagnostics::{TargetDiagnostics, compute_aicc_glm, compute_aicc_linear, r_squared};
use crate::families::{Family, WorkingLikelihood};
use crate::kernel::{KernelSpec, compute_weights};
use crate::linalg::utils::KahanSum;
use crate::local::{LocalFitError, LocalFitOptions, LocalFitRecord, fit_local};
use crate::types::CoefficientTable;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("failed to build worker pool with {workers} threads: {message}")]
    PoolBuild { workers: usize, message: String },
    #[error("worker count must be positive")]
    NoWorkers,
}

/// A local fit that failed during a pass.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("local fit for sample {index} at bandwidth {bandwidth} failed: {source}")]
pub struct FitFailure {
    pub index: usize,
    pub bandwidth: f64,
    #[source]
    pub source: LocalFitError,
}

/// How chunks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionBackend {
    /// Every chunk runs on the calling thread, in rank order.
    Serial,
    /// Chunks run concurrently on a fixed-size thread pool.
    Threaded,
}

/// Fixed pool of workers, sized once at startup.
pub struct WorkerPool {
    backend: ExecutionBackend,
    workers: usize,
    pool: Option<ThreadPool>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, CoordinatorError> {
        if workers == 0 {
            return Err(CoordinatorError::NoWorkers);
        }
        if workers == 1 {
            return Ok(Self::serial());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|rank| format!("swr-worker-{rank}"))
            .build()
            .map_err(|err| CoordinatorError::PoolBuild {
                workers,
                message: err.to_string(),
            })?;
        Ok(Self {
            backend: ExecutionBackend::Threaded,
            workers,
            pool: Some(pool),
        })
    }

    /// Single-threaded simulation of a `workers`-rank pool. Chunking matches
    /// the threaded backend exactly.
    pub fn simulated(workers: usize) -> Self {
        Self {
            backend: ExecutionBackend::Serial,
            workers: workers.max(1),
            pool: None,
        }
    }

    pub fn serial() -> Self {
        Self::simulated(1)
    }

    pub fn backend(&self) -> ExecutionBackend {
        self.backend
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` once per rank over contiguous chunks of `0..n` and gather
    /// the outputs in rank order.
    pub fn scatter_gather<T, F>(&self, n: usize, task: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize, Range<usize>) -> T + Sync,
    {
        let chunks = partition(n, self.workers);
        match (&self.backend, &self.pool) {
            (ExecutionBackend::Threaded, Some(pool)) => pool.install(|| {
                chunks
                    .into_par_iter()
                    .enumerate()
                    .map(|(rank, range)| task(rank, range))
                    .collect()
            }),
            _ => chunks
                .into_iter()
                .enumerate()
                .map(|(rank, range)| task(rank, range))
                .collect(),
        }
    }
}

/// Contiguous chunks of `ceil(n / workers)` indices. Trailing ranks may get
/// an empty chunk.
pub fn partition(n: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let chunk = n.div_ceil(workers).max(1);
    (0..workers)
        .map(|rank| {
            let start = (rank * chunk).min(n);
            let end = ((rank + 1) * chunk).min(n);
            start..end
        })
        .collect()
}

/// Lifecycle of one coordinator pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Partitioned,
    LocalFitting,
    Aggregating,
    Scoring,
    Finalized,
}

struct PassTracker {
    state: PassState,
    bandwidth: f64,
}

impl PassTracker {
    fn start(bandwidth: f64) -> Self {
        log::trace!("pass at bandwidth {bandwidth}: {:?}", PassState::Partitioned);
        Self {
            state: PassState::Partitioned,
            bandwidth,
        }
    }

    fn advance(&mut self, next: PassState) {
        let allowed = matches!(
            (self.state, next),
            (PassState::Partitioned, PassState::LocalFitting)
                | (PassState::LocalFitting, PassState::Aggregating)
                | (PassState::Aggregating, PassState::Scoring)
                | (PassState::Aggregating, PassState::Finalized)
        );
        debug_assert!(allowed, "invalid pass transition {:?} -> {:?}", self.state, next);
        log::trace!("pass at bandwidth {}: {:?} -> {:?}", self.bandwidth, self.state, next);
        self.state = next;
    }
}

/// Read-only inputs shared by every worker for the duration of a pass.
#[derive(Clone, Copy)]
pub struct FitContext<'a> {
    pub y: ArrayView1<'a, f64>,
    pub x: ArrayView2<'a, f64>,
    pub coords: ArrayView2<'a, f64>,
    /// Per-sample prior weights of a working problem; `None` means ones.
    pub prior_weights: Option<ArrayView1<'a, f64>>,
    pub init_betas: Option<ArrayView1<'a, f64>>,
    pub family: Family,
    pub kernel: KernelSpec,
    pub local: LocalFitOptions,
}

impl FitContext<'_> {
    pub fn n_samples(&self) -> usize {
        self.y.len()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    fn prior(&self, i: usize) -> f64 {
        self.prior_weights.map_or(1.0, |w| w[i])
    }

    fn fit_sample(&self, i: usize, bandwidth: f64) -> Result<LocalFitRecord, FitFailure> {
        let fail = |source: LocalFitError| FitFailure {
            index: i,
            bandwidth,
            source,
        };
        let weights = compute_weights(i, self.coords, bandwidth, &self.kernel)
            .map_err(|err| fail(err.into()))?;
        let fit = fit_local(
            self.y,
            self.x,
            &weights,
            &self.family,
            self.init_betas,
            self.prior_weights,
            &self.local,
        )
        .map_err(fail)?;
        Ok(fit.record(i, self.y[i], self.x.row(i), &self.family))
    }
}

/// Ask for the model-selection score at one bandwidth.
#[derive(Debug, Clone, Copy)]
pub struct ScoreRequest {
    pub bandwidth: f64,
}

#[derive(Debug, Clone)]
pub enum ScoreResponse {
    Score { aicc: f64, trace_hat: f64 },
    /// A local fit failed, so this bandwidth cannot be scored.
    Invalid(FitFailure),
}

impl ScoreResponse {
    /// AICc, or NaN for an invalid bandwidth.
    pub fn aicc(&self) -> f64 {
        match self {
            ScoreResponse::Score { aicc, .. } => *aicc,
            ScoreResponse::Invalid(_) => f64::NAN,
        }
    }
}

/// Ask for the full per-sample fit at the accepted bandwidth.
#[derive(Debug, Clone, Copy)]
pub struct FitRequest {
    pub bandwidth: f64,
}

/// Per-sample results and scalar diagnostics of a finalized pass.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub bandwidth: f64,
    pub coefficients: CoefficientTable,
    pub standard_errors: Array2<f64>,
    /// Residual (Gaussian) or fitted mean (GLM) per sample.
    pub diagnostic: Array1<f64>,
    pub fitted: Array1<f64>,
    pub influence: Array1<f64>,
    pub diagnostics: TargetDiagnostics,
}

#[derive(Default)]
struct ScorePartial {
    rss: KahanSum,
    log_likelihood: KahanSum,
    trace: KahanSum,
}

pub struct Coordinator<'a, 'p> {
    ctx: FitContext<'a>,
    pool: &'p WorkerPool,
}

impl<'a, 'p> Coordinator<'a, 'p> {
    pub fn new(ctx: FitContext<'a>, pool: &'p WorkerPool) -> Self {
        Self { ctx, pool }
    }

    pub fn context(&self) -> &FitContext<'a> {
        &self.ctx
    }

    fn gather<T, F>(&self, bandwidth: f64, task: F) -> Result<Vec<T>, FitFailure>
    where
        T: Send,
        F: Fn(usize) -> Result<T, FitFailure> + Sync,
    {
        let ctx = &self.ctx;
        let partials: Vec<Result<Vec<T>, FitFailure>> =
            self.pool.scatter_gather(ctx.n_samples(), |rank, range| {
                log::trace!("rank {rank} fitting samples {range:?} at bandwidth {bandwidth}");
                range.map(&task).collect()
            });
        let mut out = Vec::with_capacity(ctx.n_samples());
        for partial in partials {
            out.extend(partial?);
        }
        Ok(out)
    }

    /// Scoring pass: reduce residuals or log-likelihood plus the hat trace
    /// into an AICc.
    pub fn score(&self, request: ScoreRequest) -> ScoreResponse {
        let ctx = &self.ctx;
        let bandwidth = request.bandwidth;
        let mut pass = PassTracker::start(bandwidth);
        pass.advance(PassState::LocalFitting);

        let partials: Vec<Result<ScorePartial, FitFailure>> =
            self.pool.scatter_gather(ctx.n_samples(), |_, range| {
                let mut partial = ScorePartial::default();
                for i in range {
                    let record = ctx.fit_sample(i, bandwidth)?;
                    partial.trace.add(record.hat);
                    if ctx.family.is_gaussian() {
                        partial
                            .rss
                            .add(ctx.prior(i) * record.diagnostic * record.diagnostic);
                    } else {
                        partial
                            .log_likelihood
                            .add(ctx.family.unit_log_likelihood(ctx.y[i], record.fitted));
                    }
                }
                Ok(partial)
            });

        pass.advance(PassState::Aggregating);
        let mut total = ScorePartial::default();
        for partial in partials {
            match partial {
                Ok(p) => {
                    total.rss.merge(p.rss);
                    total.log_likelihood.merge(p.log_likelihood);
                    total.trace.merge(p.trace);
                }
                Err(failure) => {
                    log::debug!("bandwidth {bandwidth} invalid: {failure}");
                    return ScoreResponse::Invalid(failure);
                }
            }
        }
        pass.advance(PassState::Scoring);

        let n = ctx.n_samples();
        let trace_hat = total.trace.sum();
        let aicc = if ctx.family.is_gaussian() {
            compute_aicc_linear(total.rss.sum(), trace_hat, n)
        } else {
            compute_aicc_glm(total.log_likelihood.sum(), trace_hat, n, ctx.n_features())
        };
        ScoreResponse::Score { aicc, trace_hat }
    }

    pub fn score_value(&self, bandwidth: f64) -> f64 {
        self.score(ScoreRequest { bandwidth }).aicc()
    }

    /// Coefficients only, for the backfitting partial fits.
    pub fn fit_coefficients(&self, bandwidth: f64) -> Result<CoefficientTable, FitFailure> {
        let ctx = &self.ctx;
        let rows = self.gather(bandwidth, |i| ctx.fit_sample(i, bandwidth).map(|r| r.betas))?;
        let mut table = CoefficientTable::zeros(rows.len(), ctx.n_features());
        for (i, betas) in rows.iter().enumerate() {
            table.row_mut(i).assign(&**betas);
        }
        Ok(table)
    }

    /// Finalized pass at the accepted bandwidth.
    pub fn fit(&self, request: FitRequest) -> Result<FitResult, FitFailure> {
        let ctx = &self.ctx;
        let bandwidth = request.bandwidth;
        let mut pass = PassTracker::start(bandwidth);
        pass.advance(PassState::LocalFitting);
        let records = self.gather(bandwidth, |i| ctx.fit_sample(i, bandwidth))?;
        pass.advance(PassState::Aggregating);

        let n = ctx.n_samples();
        let p = ctx.n_features();
        let mut coefficients = CoefficientTable::zeros(n, p);
        let mut leverage = Array2::<f64>::zeros((n, p));
        let mut inverse_hessian = Array2::<f64>::zeros((n, p));
        let mut diagnostic = Array1::<f64>::zeros(n);
        let mut fitted = Array1::<f64>::zeros(n);
        let mut influence = Array1::<f64>::zeros(n);
        for (i, record) in records.iter().enumerate() {
            coefficients.row_mut(i).assign(&*record.betas);
            leverage.row_mut(i).assign(&record.leverage);
            inverse_hessian.row_mut(i).assign(&record.inverse_hessian_diag);
            diagnostic[i] = record.diagnostic;
            fitted[i] = record.fitted;
            influence[i] = record.hat;
        }
        let enp: f64 = influence.iter().copied().collect::<KahanSum>().sum();

        let (standard_errors, diagnostics) = if ctx.family.is_gaussian() {
            let prior = |i: usize| ctx.prior(i);
            let weight_sum: f64 = (0..n).map(prior).sum();
            let y_bar = (0..n).map(|i| prior(i) * ctx.y[i]).sum::<f64>() / weight_sum;
            let rss: f64 = (0..n)
                .map(|i| prior(i) * diagnostic[i] * diagnostic[i])
                .collect::<KahanSum>()
                .sum();
            let tss: f64 = (0..n)
                .map(|i| prior(i) * (ctx.y[i] - y_bar).powi(2))
                .collect::<KahanSum>()
                .sum();
            let sigma_squared = rss / (n as f64 - enp);
            let se = leverage.mapv(|l| (l * sigma_squared).sqrt());
            (
                se,
                TargetDiagnostics {
                    aicc: compute_aicc_linear(rss, enp, n),
                    enp,
                    r_squared: Some(r_squared(rss, tss)),
                    deviance: None,
                    sigma_squared: Some(sigma_squared),
                    n_fitted: n,
                },
            )
        } else {
            let deviance = ctx.family.deviance(ctx.y, fitted.view());
            let log_likelihood: f64 = (0..n)
                .map(|i| ctx.family.unit_log_likelihood(ctx.y[i], fitted[i]))
                .collect::<KahanSum>()
                .sum();
            let se = inverse_hessian.mapv(|v| v.max(0.0).sqrt());
            (
                se,
                TargetDiagnostics {
                    aicc: compute_aicc_glm(log_likelihood, enp, n, p),
                    enp,
                    r_squared: None,
                    deviance: Some(deviance),
                    sigma_squared: None,
                    n_fitted: n,
                },
            )
        };
        pass.advance(PassState::Finalized);

        Ok(FitResult {
            bandwidth,
            coefficients,
            standard_errors,
            diagnostic,
            fitted,
            influence,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BandwidthMode, KernelKind};
    use ndarray::Array2;

    fn grid(nx: usize, ny: usize) -> Array2<f64> {
        Array2::from_shape_fn((nx * ny, 2), |(i, j)| {
            if j == 0 { (i % nx) as f64 } else { (i / nx) as f64 }
        })
    }

    fn context<'a>(
        y: &'a Array1<f64>,
        x: &'a Array2<f64>,
        coords: &'a Array2<f64>,
        family: Family,
    ) -> FitContext<'a> {
        FitContext {
            y: y.view(),
            x: x.view(),
            coords: coords.view(),
            prior_weights: None,
            init_betas: None,
            family,
            kernel: KernelSpec {
                kind: KernelKind::Bisquare,
                mode: BandwidthMode::Adaptive,
                exclude_self: false,
                threshold: 0.0,
            },
            local: LocalFitOptions::default(),
        }
    }

    #[test]
    fn partition_covers_indices_in_rank_order() {
        let chunks = partition(10, 3);
        assert_eq!(chunks, vec![0..4, 4..8, 8..10]);
        let chunks = partition(2, 4);
        assert_eq!(chunks, vec![0..1, 1..2, 2..2, 2..2]);
        let covered: Vec<usize> = partition(17, 5).into_iter().flatten().collect();
        assert_eq!(covered, (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn scatter_gather_preserves_rank_order_on_threads() {
        let pool = WorkerPool::new(4).unwrap();
        let out = pool.scatter_gather(23, |_, range| range.collect::<Vec<_>>());
        let flat: Vec<usize> = out.into_iter().flatten().collect();
        assert_eq!(flat, (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn threaded_and_serial_backends_agree() {
        let coords = grid(6, 5);
        let n = coords.nrows();
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { coords[[i, 0]] });
        let y = Array1::from_shape_fn(n, |i| 1.0 + 0.5 * coords[[i, 0]] + 0.1 * ((i * 7) % 5) as f64);
        let ctx = context(&y, &x, &coords, Family::Gaussian);

        let serial = WorkerPool::simulated(3);
        let threaded = WorkerPool::new(3).unwrap();
        assert_eq!(serial.backend(), ExecutionBackend::Serial);
        assert_eq!(threaded.backend(), ExecutionBackend::Threaded);
        assert_eq!(WorkerPool::new(1).unwrap().backend(), ExecutionBackend::Serial);
        let a = Coordinator::new(ctx, &serial).score_value(12.0);
        let b = Coordinator::new(ctx, &threaded).score_value(12.0);
        assert!((a - b).abs() < 1e-9);

        let fa = Coordinator::new(ctx, &serial).fit(FitRequest { bandwidth: 12.0 }).unwrap();
        let fb = Coordinator::new(ctx, &threaded).fit(FitRequest { bandwidth: 12.0 }).unwrap();
        assert_eq!(fa.coefficients, fb.coefficients);
        assert!((fa.diagnostics.aicc - a).abs() < 1e-9);
    }

    #[test]
    fn singular_fit_marks_bandwidth_invalid() {
        let coords = grid(5, 4);
        let n = coords.nrows();
        let x = Array2::from_shape_fn((n, 3), |(i, j)| match j {
            0 => 1.0,
            1 => coords[[i, 0]],
            _ => coords[[i, 1]],
        });
        let y = Array1::from_shape_fn(n, |i| i as f64);
        let ctx = context(&y, &x, &coords, Family::Gaussian);
        let pool = WorkerPool::simulated(2);
        let coordinator = Coordinator::new(ctx, &pool);
        // Two neighbours cannot support three coefficients.
        let response = coordinator.score(ScoreRequest { bandwidth: 2.0 });
        assert!(matches!(response, ScoreResponse::Invalid(_)));
        assert!(response.aicc().is_nan());
        assert!(coordinator.fit(FitRequest { bandwidth: 2.0 }).is_err());
    }

    #[test]
    fn gaussian_fit_reports_residual_diagnostics() {
        let coords = grid(5, 5);
        let n = coords.nrows();
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { coords[[i, 1]] });
        let y = Array1::from_shape_fn(n, |i| 2.0 - coords[[i, 1]] + 0.05 * ((i * 3) % 4) as f64);
        let ctx = context(&y, &x, &coords, Family::Gaussian);
        let pool = WorkerPool::serial();
        let result = Coordinator::new(ctx, &pool)
            .fit(FitRequest { bandwidth: 10.0 })
            .unwrap();
        let fitted_plus_residual = &result.fitted + &result.diagnostic;
        for i in 0..n {
            assert!((fitted_plus_residual[i] - y[i]).abs() < 1e-10);
        }
        let r2 = result.diagnostics.r_squared.unwrap();
        assert!(r2 > 0.95 && r2 <= 1.0);
        assert!(result.diagnostics.enp > 2.0);
        assert!(result.standard_errors.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
}
