//! Local estimator: one weighted regression per focal sample.
//!
//! Gaussian fits solve the weighted normal equations once. Poisson and
//! negative binomial fits run IRLS, folding the spatial weights into every
//! working-weight update. Either way the fit also exposes
//! `P = (X^T W X)^{-1} X^T diag(spatial)`, whose column for the focal sample
//! gives that sample's hat value.

use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

use crate::families::{Family, WorkingLikelihood};
use crate::kernel::{KernelError, SpatialWeights};
use crate::linalg::faer_ndarray::{FaerCholesky, FaerCholeskyFactor, FaerLinalgError, weighted_gram};
use crate::types::Coefficients;

/// Pivot ratio below which `X^T W X` is treated as singular.
const SINGULAR_PIVOT_RATIO: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocalFitError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("weighted design is singular (pivot ratio {ratio:.3e}) with {support} weighted samples")]
    SingularDesign { ratio: f64, support: usize },
    #[error("local fit produced non-finite coefficients")]
    NonFinite,
    #[error("initial coefficients have length {got}, expected {expected}")]
    InitBetasLength { got: usize, expected: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct LocalFitOptions {
    /// IRLS stops once no coefficient moves by more than this.
    pub tol: f64,
    pub max_iter: usize,
}

impl Default for LocalFitOptions {
    fn default() -> Self {
        Self {
            tol: 1e-3,
            max_iter: 500,
        }
    }
}

/// Solution of one local regression, restricted to the kernel support.
#[derive(Debug, Clone)]
pub struct LocalFit {
    pub betas: Coefficients,
    /// Sample indices carrying positive spatial weight, ascending.
    pub support: Vec<usize>,
    /// `P x m` map from the support responses to the coefficients.
    pub pinv: Array2<f64>,
    /// Mean response over the support.
    pub fitted: Array1<f64>,
    /// Final IRLS (Fisher) weight per support sample; ones for Gaussian fits.
    pub irls_weights: Array1<f64>,
    /// `diag((X^T W X)^{-1})` at the final weights.
    pub inverse_hessian_diag: Array1<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Per-sample summary kept by the coordinator.
#[derive(Debug, Clone)]
pub struct LocalFitRecord {
    /// Residual for Gaussian fits, fitted mean otherwise.
    pub diagnostic: f64,
    /// Fitted mean at the focal sample.
    pub fitted: f64,
    /// Diagonal hat-matrix entry of the focal sample.
    pub hat: f64,
    pub betas: Coefficients,
    /// Row sums of squares of `P`, one per feature.
    pub leverage: Array1<f64>,
    pub inverse_hessian_diag: Array1<f64>,
}

fn gather_rows(x: ArrayView2<'_, f64>, rows: &[usize]) -> Array2<f64> {
    x.select(Axis(0), rows)
}

fn gather(v: ArrayView1<'_, f64>, rows: &[usize]) -> Array1<f64> {
    rows.iter().map(|&i| v[i]).collect()
}

fn factorize(gram: &Array2<f64>, support: usize) -> Result<FaerCholeskyFactor, LocalFitError> {
    let factor = gram.cholesky(Side::Lower).map_err(|err| match err {
        FaerLinalgError::NonFinite => LocalFitError::NonFinite,
        FaerLinalgError::Cholesky(_) => LocalFitError::SingularDesign {
            ratio: 0.0,
            support,
        },
    })?;
    let ratio = factor.pivot_ratio();
    if !(ratio > SINGULAR_PIVOT_RATIO) {
        return Err(LocalFitError::SingularDesign { ratio, support });
    }
    Ok(factor)
}

/// Weighted least squares on the support: returns `(betas, P, factor)`.
fn solve_wls(
    xs: &Array2<f64>,
    zs: &Array1<f64>,
    spatial: &Array1<f64>,
    total_weights: &Array1<f64>,
) -> Result<(Array1<f64>, Array2<f64>, FaerCholeskyFactor), LocalFitError> {
    let gram = weighted_gram(xs, total_weights.view());
    let factor = factorize(&gram, xs.nrows())?;
    let mut xtw = xs.t().to_owned();
    for (mut col, &w) in xtw.columns_mut().into_iter().zip(total_weights.iter()) {
        col *= w;
    }
    let betas = factor.solve_vec(&xtw.dot(zs));
    if betas.iter().any(|b| !b.is_finite()) {
        return Err(LocalFitError::NonFinite);
    }
    let mut xt_spatial = xs.t().to_owned();
    for (mut col, &w) in xt_spatial.columns_mut().into_iter().zip(spatial.iter()) {
        col *= w;
    }
    let pinv = factor.solve_mat(&xt_spatial);
    Ok((betas, pinv, factor))
}

/// Fit the local model defined by one sample's spatial weights.
///
/// `y`, `x` and `prior_weights` cover the full sample set; only the rows in
/// the weight support enter the fit. `prior_weights` scale the spatial
/// weights (used for the working problem of multiscale GLM fits).
pub fn fit_local(
    y: ArrayView1<'_, f64>,
    x: ArrayView2<'_, f64>,
    weights: &SpatialWeights,
    family: &Family,
    init_betas: Option<ArrayView1<'_, f64>>,
    prior_weights: Option<ArrayView1<'_, f64>>,
    options: &LocalFitOptions,
) -> Result<LocalFit, LocalFitError> {
    let n_features = x.ncols();
    if let Some(init) = init_betas {
        if init.len() != n_features {
            return Err(LocalFitError::InitBetasLength {
                got: init.len(),
                expected: n_features,
            });
        }
    }

    let support = weights.indices.clone();
    let xs = gather_rows(x, &support);
    let ys = gather(y, &support);
    let mut spatial = Array1::from(weights.values.clone());
    if let Some(prior) = prior_weights {
        spatial *= &gather(prior, &support);
    }

    if family.is_gaussian() {
        let (betas, pinv, factor) = solve_wls(&xs, &ys, &spatial, &spatial)?;
        let fitted = xs.dot(&betas);
        return Ok(LocalFit {
            betas: Coefficients(betas),
            support,
            pinv,
            fitted,
            irls_weights: Array1::ones(ys.len()),
            inverse_hessian_diag: factor.inverse_diag(),
            iterations: 1,
            converged: true,
        });
    }

    let m = ys.len();
    let ones = Array1::<f64>::ones(m);
    let mut mu = Array1::<f64>::zeros(m);
    let mut fisher = Array1::<f64>::zeros(m);
    let mut z = Array1::<f64>::zeros(m);

    let mut betas = init_betas.map(|b| b.to_owned());
    let mut eta = match &betas {
        Some(b) => xs.dot(b),
        None => family
            .initial_mean(ys.view())
            .mapv(|v| family.link_value(v)),
    };

    let mut iterations = 0;
    let mut converged = false;
    while iterations < options.max_iter {
        iterations += 1;
        family.irls_update(ys.view(), &eta, ones.view(), &mut mu, &mut fisher, &mut z);
        let total = &spatial * &fisher;
        let (next, _, _) = solve_wls(&xs, &z, &spatial, &total)?;
        let change = betas
            .as_ref()
            .map(|b| {
                b.iter()
                    .zip(next.iter())
                    .fold(0.0_f64, |acc, (a, c)| acc.max((a - c).abs()))
            })
            .unwrap_or(f64::INFINITY);
        eta = xs.dot(&next);
        betas = Some(next);
        if change < options.tol {
            converged = true;
            break;
        }
    }

    let betas = match betas {
        Some(b) => b,
        None => return Err(LocalFitError::NonFinite),
    };
    // Weights and hat map at the converged coefficients.
    family.irls_update(ys.view(), &eta, ones.view(), &mut mu, &mut fisher, &mut z);
    let total = &spatial * &fisher;
    let gram = weighted_gram(&xs, total.view());
    let factor = factorize(&gram, m)?;
    let mut xt_spatial = xs.t().to_owned();
    for (mut col, &w) in xt_spatial.columns_mut().into_iter().zip(spatial.iter()) {
        col *= w;
    }
    let pinv = factor.solve_mat(&xt_spatial);

    Ok(LocalFit {
        betas: Coefficients(betas),
        support,
        pinv,
        fitted: mu,
        irls_weights: fisher,
        inverse_hessian_diag: factor.inverse_diag(),
        iterations,
        converged,
    })
}

impl LocalFit {
    /// Hat value of `focal`: `x_i . P[:, i]`, scaled by the final IRLS weight.
    /// Zero when the focal sample carries no weight of its own.
    pub fn hat_value(&self, focal: usize, x_focal: ArrayView1<'_, f64>) -> f64 {
        match self.support.binary_search(&focal) {
            Ok(pos) => x_focal.dot(&self.pinv.column(pos)) * self.irls_weights[pos],
            Err(_) => 0.0,
        }
    }

    pub fn leverage(&self) -> Array1<f64> {
        self.pinv.map_axis(Axis(1), |row| row.dot(&row))
    }

    pub fn record(
        &self,
        focal: usize,
        y_focal: f64,
        x_focal: ArrayView1<'_, f64>,
        family: &Family,
    ) -> LocalFitRecord {
        let eta = x_focal.dot(&*self.betas);
        let fitted = family.inverse_link(eta);
        let diagnostic = if family.is_gaussian() {
            y_focal - fitted
        } else {
            fitted
        };
        LocalFitRecord {
            diagnostic,
            fitted,
            hat: self.hat_value(focal, x_focal),
            betas: self.betas.clone(),
            leverage: self.leverage(),
            inverse_hessian_diag: self.inverse_hessian_diag.clone(),
        }
    }
}
