//! # Target Estimation
//!
//! This module drives the fit of every target in a run. Both strategies share a
//! single [`LocalRegressionEngine`], which bundles the worker pool with the
//! kernel, local-fit and search settings of the run:
//!
//! 1.  Single bandwidth: a golden-section search picks the bandwidth whose
//!     coordinator pass has the lowest AICc, and a finalized pass at that
//!     bandwidth produces coefficients, standard errors and diagnostics.
//!     Negative binomial targets update their dispersion from that fit and
//!     are refitted once at the same bandwidth.
//!
//! 2.  Multiscale: the single-bandwidth optimum seeds a backfitting run in
//!     which every feature searches its own bandwidth. Poisson and negative
//!     binomial targets are backfitted on the working response of the seed
//!     fit. A chunked replay of the backfit then recovers effective parameter
//!     counts and standard errors.
//!
//! Targets are independent: a failure is recorded for that target and the
//! batch moves on.

use std::borrow::Cow;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collinearity::{drop_collinear, zero_columns};
use crate::config::{ConfigError, ModelConfig};
use crate::coordinator::{
    Coordinator, CoordinatorError, FitContext, FitFailure, FitRequest, FitResult, WorkerPool,
};
use crate::dataset::{DatasetError, SpatialDataset};
use crate::diagnostics::{
    TargetDiagnostics, compute_aicc_glm, compute_aicc_linear, output_diagnostics, r_squared,
};
use crate::families::{Family, WorkingLikelihood};
use crate::kernel::KernelSpec;
use crate::linalg::utils::KahanSum;
use crate::local::LocalFitOptions;
use crate::multiscale::{
    BackfitError, BackfitOptions, WorkingProblem, multiscale_backfitting,
    multiscale_compute_metrics,
};
use crate::optimizer::{SearchOptions, SearchStop, find_optimal_bw};
use crate::subsample::{SubsampleMap, stratified_subsample};
use crate::types::{BandwidthMode, CoefficientTable, FamilyKind};

/// Floor on the backfitting round cap.
const MIN_BACKFIT_ROUNDS: usize = 200;

#[derive(Error, Debug)]
pub enum BandwidthSelectionError {
    #[error(transparent)]
    Range(#[from] ConfigError),

    #[error("No bandwidth in [{lower}, {upper}] produced a valid fit for every sample.")]
    NoValidBandwidth { lower: f64, upper: f64 },
}

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid dataset: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Worker pool could not be started: {0}")]
    WorkerPool(#[from] CoordinatorError),

    #[error("Bandwidth selection failed: {0}")]
    Bandwidth(#[from] BandwidthSelectionError),

    #[error("Finalized fit at bandwidth {bandwidth} failed: {source}")]
    FinalFit {
        bandwidth: f64,
        #[source]
        source: FitFailure,
    },

    #[error("Multiscale backfitting aborted: {0}")]
    Backfit(#[from] BackfitError),
}

/// Shared local-regression capability: worker pool plus the per-run kernel,
/// local-fit and search settings.
pub struct LocalRegressionEngine<'a> {
    config: &'a ModelConfig,
    pool: &'a WorkerPool,
}

impl<'a> LocalRegressionEngine<'a> {
    pub fn new(config: &'a ModelConfig, pool: &'a WorkerPool) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &ModelConfig {
        self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        self.pool
    }

    pub fn kernel_spec(&self) -> KernelSpec {
        KernelSpec {
            kind: self.config.kernel,
            mode: self.config.bandwidth_mode(),
            exclude_self: self.config.exclude_self,
            threshold: self.config.weight_threshold,
        }
    }

    pub fn local_options(&self) -> LocalFitOptions {
        LocalFitOptions {
            tol: self.config.tolerance,
            max_iter: self.config.max_iter,
        }
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            mode: self.config.bandwidth_mode(),
            tolerance: self.config.tolerance,
            max_iter: self.config.max_iter,
            patience: self.config.search_patience,
        }
    }

    pub fn backfit_options(&self) -> BackfitOptions {
        BackfitOptions {
            tolerance: self.config.tolerance,
            max_rounds: self.config.max_iter.max(MIN_BACKFIT_ROUNDS),
            patience: self.config.patience,
            rollback_window: self.config.rollback_window,
        }
    }

    pub fn context<'b>(
        &self,
        y: ArrayView1<'b, f64>,
        x: ArrayView2<'b, f64>,
        coords: ArrayView2<'b, f64>,
        prior_weights: Option<ArrayView1<'b, f64>>,
        init_betas: Option<ArrayView1<'b, f64>>,
        family: Family,
    ) -> FitContext<'b> {
        FitContext {
            y,
            x,
            coords,
            prior_weights,
            init_betas,
            family,
            kernel: self.kernel_spec(),
            local: self.local_options(),
        }
    }

    /// The configured bandwidth, or the golden-section optimum over the
    /// resolved search range. Fixed-mode optima are rounded to two decimals.
    pub fn select_bandwidth(&self, ctx: FitContext<'_>) -> Result<f64, BandwidthSelectionError> {
        if let Some(bw) = self.config.bw {
            return Ok(bw);
        }
        let range = self
            .config
            .resolve_search_range(ctx.coords, ctx.n_features())?;
        let coordinator = Coordinator::new(ctx, self.pool);
        let outcome = find_optimal_bw(range.lower, range.upper, self.search_options(), |bw| {
            coordinator.score_value(bw)
        });
        let bw = outcome
            .bandwidth
            .ok_or(BandwidthSelectionError::NoValidBandwidth {
                lower: range.lower,
                upper: range.upper,
            })?;
        if outcome.stop == SearchStop::IterationCap {
            log::warn!("bandwidth search hit its iteration cap; using best bandwidth {bw}");
        }
        log::debug!(
            "bandwidth search over [{}, {}] stopped ({:?}) after {} round(s) at {bw} with AICc {}",
            range.lower,
            range.upper,
            outcome.stop,
            outcome.iterations,
            outcome.score
        );
        Ok(match self.config.bandwidth_mode() {
            BandwidthMode::Fixed => {
                let rounded = (bw * 100.0).round() / 100.0;
                if rounded > 0.0 { rounded } else { bw }
            }
            BandwidthMode::Adaptive => bw,
        })
    }

    pub fn fit_at(&self, ctx: FitContext<'_>, bandwidth: f64) -> Result<FitResult, EstimationError> {
        Coordinator::new(ctx, self.pool)
            .fit(FitRequest { bandwidth })
            .map_err(|source| EstimationError::FinalFit { bandwidth, source })
    }
}

/// Inputs of one target's fit.
pub struct TargetProblem<'a> {
    pub target: &'a str,
    pub y: ArrayView1<'a, f64>,
    pub x: ArrayView2<'a, f64>,
    pub coords: ArrayView2<'a, f64>,
    pub init_betas: Option<ArrayView1<'a, f64>>,
    pub feature_names: &'a [String],
    pub family: FamilyKind,
}

/// Bandwidth(s) behind a fitted target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetBandwidth {
    Single {
        bandwidth: f64,
    },
    Multiscale {
        initial: f64,
        per_feature: Vec<f64>,
        /// Per-feature bandwidths of every backfitting round.
        history: Vec<Vec<f64>>,
    },
}

/// Everything kept about one fitted target, one row per sample.
#[derive(Debug, Clone)]
pub struct TargetFit {
    pub target: String,
    pub family: Family,
    pub bandwidth: TargetBandwidth,
    pub coefficients: CoefficientTable,
    /// `None` when the metrics pass was skipped.
    pub standard_errors: Option<Array2<f64>>,
    /// Residual for Gaussian fits, fitted mean otherwise.
    pub diagnostic: Array1<f64>,
    pub fitted: Array1<f64>,
    pub influence: Option<Array1<f64>>,
    pub diagnostics: Option<TargetDiagnostics>,
}

impl TargetFit {
    pub fn is_multiscale(&self) -> bool {
        matches!(self.bandwidth, TargetBandwidth::Multiscale { .. })
    }
}

pub trait FitStrategy {
    fn name(&self) -> &'static str;

    fn fit_target(
        &self,
        engine: &LocalRegressionEngine<'_>,
        problem: &TargetProblem<'_>,
    ) -> Result<TargetFit, EstimationError>;
}

pub struct SingleBandwidthStrategy;

impl FitStrategy for SingleBandwidthStrategy {
    fn name(&self) -> &'static str {
        "single bandwidth"
    }

    fn fit_target(
        &self,
        engine: &LocalRegressionEngine<'_>,
        problem: &TargetProblem<'_>,
    ) -> Result<TargetFit, EstimationError> {
        let family = Family::from_kind(problem.family, problem.y);
        let mut ctx = engine.context(
            problem.y,
            problem.x,
            problem.coords,
            None,
            problem.init_betas,
            family,
        );
        let bandwidth = engine.select_bandwidth(ctx)?;
        log::info!("target '{}': bandwidth {bandwidth}", problem.target);
        let mut result = engine.fit_at(ctx, bandwidth)?;

        let dof = problem.y.len() as f64 - result.diagnostics.enp;
        let updated = ctx.family.with_updated_dispersion(problem.y, result.fitted.view(), dof);
        if updated != ctx.family {
            ctx.family = updated;
            result = engine.fit_at(ctx, bandwidth)?;
        }

        output_diagnostics(problem.target, &result.diagnostics);
        Ok(TargetFit {
            target: problem.target.to_string(),
            family: ctx.family,
            bandwidth: TargetBandwidth::Single { bandwidth },
            coefficients: result.coefficients,
            standard_errors: Some(result.standard_errors),
            diagnostic: result.diagnostic,
            fitted: result.fitted,
            influence: Some(result.influence),
            diagnostics: Some(result.diagnostics),
        })
    }
}

pub struct MultiscaleBackfittingStrategy {
    /// Skip the chunked metrics pass and report coefficients only.
    pub params_only: bool,
    /// Hat-matrix column blocks per worker in the metrics pass.
    pub chunks: usize,
}

/// IRLS working response and weights at the fitted means of a seed fit.
fn working_response(
    family: &Family,
    y: ArrayView1<'_, f64>,
    fitted: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let n = y.len();
    let eta = fitted.mapv(|mu| family.link_value(mu));
    let ones = Array1::<f64>::ones(n);
    let mut mu = Array1::<f64>::zeros(n);
    let mut weights = Array1::<f64>::zeros(n);
    let mut z = Array1::<f64>::zeros(n);
    family.irls_update(y, &eta, ones.view(), &mut mu, &mut weights, &mut z);
    (z, weights)
}

impl FitStrategy for MultiscaleBackfittingStrategy {
    fn name(&self) -> &'static str {
        "multiscale backfitting"
    }

    fn fit_target(
        &self,
        engine: &LocalRegressionEngine<'_>,
        problem: &TargetProblem<'_>,
    ) -> Result<TargetFit, EstimationError> {
        let n = problem.y.len();
        let p = problem.x.ncols();
        let mut family = Family::from_kind(problem.family, problem.y);
        let seed_ctx = engine.context(
            problem.y,
            problem.x,
            problem.coords,
            None,
            problem.init_betas,
            family,
        );
        log::info!(
            "target '{}': finding a uniform initial bandwidth for all features",
            problem.target
        );
        let initial_bandwidth = engine.select_bandwidth(seed_ctx)?;

        let (response, prior) = if family.is_gaussian() {
            (problem.y.to_owned(), None)
        } else {
            let mut seed = engine.fit_at(seed_ctx, initial_bandwidth)?;
            let dof = n as f64 - seed.diagnostics.enp;
            let updated = family.with_updated_dispersion(problem.y, seed.fitted.view(), dof);
            if updated != family {
                family = updated;
                seed = engine.fit_at(FitContext { family, ..seed_ctx }, initial_bandwidth)?;
            }
            let (z, weights) = working_response(&family, problem.y, &seed.fitted);
            (z, Some(weights))
        };
        let working = WorkingProblem {
            response: response.view(),
            x: problem.x.reborrow(),
            coords: problem.coords.reborrow(),
            prior_weights: prior.as_ref().map(|w| w.view()),
        };

        let backfit = multiscale_backfitting(
            engine,
            working,
            problem.feature_names,
            initial_bandwidth,
            &engine.backfit_options(),
        )?;
        log::info!(
            "target '{}': per-feature bandwidths {:?} after {} round(s) ({:?})",
            problem.target,
            backfit.bandwidths,
            backfit.history.len(),
            backfit.stop
        );

        let eta = backfit.linear_predictor();
        let fitted = eta.mapv(|e| family.inverse_link(e));
        let diagnostic = if family.is_gaussian() {
            &problem.y - &fitted
        } else {
            fitted.clone()
        };

        let rss: f64 = diagnostic
            .iter()
            .map(|r| r * r)
            .collect::<KahanSum>()
            .sum();
        let y_bar = problem.y.mean().unwrap_or(0.0);
        let tss: f64 = problem
            .y
            .iter()
            .map(|v| (v - y_bar) * (v - y_bar))
            .collect::<KahanSum>()
            .sum();
        let deviance = (!family.is_gaussian()).then(|| family.deviance(problem.y, fitted.view()));

        let mut fit = TargetFit {
            target: problem.target.to_string(),
            family,
            bandwidth: TargetBandwidth::Multiscale {
                initial: backfit.initial_bandwidth,
                per_feature: backfit.bandwidths.clone(),
                history: backfit.history.clone(),
            },
            coefficients: backfit.coefficients.clone(),
            standard_errors: None,
            diagnostic,
            fitted,
            influence: None,
            diagnostics: None,
        };

        if self.params_only {
            log::warn!(
                "target '{}': metrics pass skipped, only coefficients are reported",
                problem.target
            );
            if family.is_gaussian() {
                log::info!("R-squared for {} model: {}", problem.target, r_squared(rss, tss));
            } else if let Some(deviance) = deviance {
                log::info!("Deviance for {} model: {deviance}", problem.target);
            }
            return Ok(fit);
        }

        let metrics = multiscale_compute_metrics(engine, working, &backfit, self.chunks)?;
        let enp = metrics.enp;
        let (sigma_squared, diagnostics) = if family.is_gaussian() {
            let sigma_squared = rss / (n as f64 - enp);
            (
                sigma_squared,
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
            let log_likelihood = family.log_likelihood(problem.y, fit.fitted.view());
            (
                1.0,
                TargetDiagnostics {
                    aicc: compute_aicc_glm(log_likelihood, enp, n, p),
                    enp,
                    r_squared: None,
                    deviance,
                    sigma_squared: None,
                    n_fitted: n,
                },
            )
        };
        // Dispersion on the backfitted means, for the reported model state.
        fit.family = family.with_updated_dispersion(problem.y, fit.fitted.view(), n as f64 - enp);
        fit.standard_errors = Some(metrics.leverage.mapv(|l| (l.max(0.0) * sigma_squared).sqrt()));
        fit.influence = Some(metrics.influence);
        output_diagnostics(problem.target, &diagnostics);
        fit.diagnostics = Some(diagnostics);
        Ok(fit)
    }
}

/// Result of one target in a batch.
#[derive(Debug)]
pub enum TargetOutcome {
    Fitted(TargetFit),
    Failed {
        target: String,
        error: EstimationError,
    },
}

impl TargetOutcome {
    pub fn target(&self) -> &str {
        match self {
            TargetOutcome::Fitted(fit) => &fit.target,
            TargetOutcome::Failed { target, .. } => target,
        }
    }
}

/// Outcome of a batch, in target order.
#[derive(Debug)]
pub struct FitReport {
    pub sample_ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub dropped_features: Vec<String>,
    pub outcomes: Vec<TargetOutcome>,
}

impl FitReport {
    pub fn fitted(&self) -> impl Iterator<Item = &TargetFit> {
        self.outcomes.iter().filter_map(|o| match o {
            TargetOutcome::Fitted(fit) => Some(fit),
            TargetOutcome::Failed { .. } => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &EstimationError)> {
        self.outcomes.iter().filter_map(|o| match o {
            TargetOutcome::Failed { target, error } => Some((target.as_str(), error)),
            TargetOutcome::Fitted(_) => None,
        })
    }
}

/// Apply covariate selection, the intercept and the multicollinearity
/// filter. Returns the design and the names of dropped features.
pub fn prepare_design(
    dataset: &SpatialDataset,
    config: &ModelConfig,
) -> Result<(SpatialDataset, Vec<String>), EstimationError> {
    let mut design = dataset.clone();
    if let Some(covariates) = &config.covariates {
        design = design.select_covariates(covariates)?;
    }
    if config.fit_intercept {
        design = design.with_intercept();
    }
    for name in zero_columns(design.predictors.view(), &design.feature_names) {
        log::warn!("feature '{name}' is zero in every sample");
    }
    let dropped = match config.multicollinear_threshold {
        Some(threshold) => {
            drop_collinear(design.predictors.view(), &design.feature_names, threshold)
        }
        None => Vec::new(),
    };
    if !dropped.is_empty() {
        design = design.drop_features(&dropped)?;
    }
    Ok((design, dropped))
}

/// Expand a fit on a subsample to every sample: coefficients and standard
/// errors are copied from each sample's stand-in, diagnostics are recomputed
/// from the sample's own data, and unfitted samples get NaN influence.
fn propagate(fit: TargetFit, map: &SubsampleMap, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> TargetFit {
    let coefficients = CoefficientTable(map.propagate_rows(&fit.coefficients));
    let eta = coefficients.linear_predictor(x);
    let fitted = eta.mapv(|e| fit.family.inverse_link(e));
    let diagnostic = if fit.family.is_gaussian() {
        &y - &fitted
    } else {
        fitted.clone()
    };
    TargetFit {
        standard_errors: fit.standard_errors.as_ref().map(|se| map.propagate_rows(se)),
        influence: fit
            .influence
            .as_ref()
            .map(|h| map.propagate_fitted_only(h, f64::NAN)),
        coefficients,
        diagnostic,
        fitted,
        ..fit
    }
}

fn fit_one(
    engine: &LocalRegressionEngine<'_>,
    strategy: &dyn FitStrategy,
    design: &SpatialDataset,
    target: &str,
) -> Result<TargetFit, EstimationError> {
    let config = engine.config();
    design.check_response(target, config.family)?;
    if let Some(init) = design.init_betas.get(target) {
        if init.len() != design.n_features() {
            return Err(DatasetError::InitBetasLength {
                target: target.to_string(),
                got: init.len(),
                expected: design.n_features(),
            }
            .into());
        }
    }

    let y_full = design.response(target)?;
    let map = if config.subsample {
        stratified_subsample(design.coords.view(), y_full, config.seed)
    } else {
        SubsampleMap::identity(design.n_samples())
    };
    let fitted_set: Cow<'_, SpatialDataset> = if map.is_identity() {
        Cow::Borrowed(design)
    } else {
        Cow::Owned(design.subset(&map.sampled))
    };

    let problem = TargetProblem {
        target,
        y: fitted_set.response(target)?,
        x: fitted_set.predictors.view(),
        coords: fitted_set.coords.view(),
        init_betas: fitted_set.init_betas.get(target).map(|b| b.view()),
        feature_names: &fitted_set.feature_names,
        family: config.family,
    };
    log::info!(
        "fitting target '{target}' on {} sample(s) with {} strategy",
        problem.y.len(),
        strategy.name()
    );
    let fit = strategy.fit_target(engine, &problem)?;
    Ok(if map.is_identity() {
        fit
    } else {
        propagate(fit, &map, design.predictors.view(), y_full)
    })
}

/// Fit every configured target. Per-target failures are recorded in the
/// report; only configuration, design and pool errors abort the batch.
pub fn fit_targets(dataset: &SpatialDataset, config: &ModelConfig) -> Result<FitReport, EstimationError> {
    config.validate()?;
    let (design, dropped_features) = prepare_design(dataset, config)?;
    let pool = WorkerPool::new(config.workers)?;
    let engine = LocalRegressionEngine::new(config, &pool);
    let strategy: Box<dyn FitStrategy> = if config.multiscale {
        Box::new(MultiscaleBackfittingStrategy {
            params_only: config.multiscale_params_only,
            chunks: config.chunks,
        })
    } else {
        Box::new(SingleBandwidthStrategy)
    };
    log::info!(
        "fitting {} target(s) over {} sample(s) and {} feature(s) with {} worker(s) ({:?})",
        config.targets.len(),
        design.n_samples(),
        design.n_features(),
        pool.workers(),
        pool.backend()
    );

    let outcomes = config
        .targets
        .iter()
        .map(|target| match fit_one(&engine, strategy.as_ref(), &design, target) {
            Ok(fit) => TargetOutcome::Fitted(fit),
            Err(error) => {
                log::error!("target '{target}' failed: {error}");
                TargetOutcome::Failed {
                    target: target.clone(),
                    error,
                }
            }
        })
        .collect();

    Ok(FitReport {
        sample_ids: design.sample_ids.clone(),
        feature_names: design.feature_names.clone(),
        dropped_features,
        outcomes,
    })
}
