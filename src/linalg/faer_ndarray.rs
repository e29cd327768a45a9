use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatMut, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("matrix contains non-finite entries")]
    NonFinite,
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Tiny local systems stay on ndarray; GEMM setup dominates there.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let (s0, s1) = (strides[0], strides[1]);
    // SAFETY: shape and strides come straight from the live, uniquely borrowed array.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

/// Borrowed faer view over an ndarray matrix. Layouts with non-positive
/// strides are copied into a compact owned buffer first.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.as_standard_layout().into_owned();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: cols as isize,
                col_stride: 1,
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let ptr = match &self.owned {
            Some(owned) => owned.as_ptr(),
            None => self.ptr,
        };
        // SAFETY: the pointer is either borrowed from an array that outlives `'a`
        // or owned by `self`; shape and strides describe that same buffer.
        unsafe {
            MatRef::from_raw_parts(ptr, self.rows, self.cols, self.row_stride, self.col_stride)
        }
    }
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// `A^T A`, dispatched to faer GEMM for moderate sizes.
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    use faer::Accum;
    use faer::linalg::matmul::matmul;

    let (n, p) = a.dim();
    if !should_use_faer_matmul(p, p, n) {
        return a.t().dot(a);
    }
    let mut result = Mat::<f64>::zeros(p, p);
    let a_view = FaerArrayView::new(a);
    let a_ref = a_view.as_ref();
    let par = if n < 128 || p < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    };
    matmul(result.as_mut(), Accum::Replace, a_ref.transpose(), a_ref, 1.0, par);
    mat_to_array(result.as_ref())
}

/// `X^T diag(w) X` for non-negative weights.
pub fn weighted_gram<S: Data<Elem = f64>>(
    x: &ArrayBase<S, Ix2>,
    weights: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let mut scaled = x.to_owned();
    for (mut row, &w) in scaled.rows_mut().into_iter().zip(weights.iter()) {
        row *= w.max(0.0).sqrt();
    }
    fast_ata(&scaled)
}

/// Cholesky factor of a symmetric positive definite matrix.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.clone().insert_axis(ndarray::Axis(1));
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs.index_axis_move(ndarray::Axis(1), 0)
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.as_standard_layout().into_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    /// Diagonal of `L`.
    pub fn diag(&self) -> Array1<f64> {
        let l = self.factor.L();
        Array1::from_shape_fn(l.nrows(), |i| l[(i, i)])
    }

    /// Ratio of the smallest to the largest pivot of `L L^T`. Values near zero
    /// flag a numerically singular system even when the factorization succeeds.
    pub fn pivot_ratio(&self) -> f64 {
        let diag = self.diag();
        let (min, max) = diag
            .iter()
            .map(|d| d * d)
            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
        if max > 0.0 { min / max } else { 0.0 }
    }

    /// Diagonal of the inverse of the factored matrix.
    pub fn inverse_diag(&self) -> Array1<f64> {
        let p = self.factor.L().nrows();
        let inverse = self.solve_mat(&Array2::eye(p));
        inverse.diag().to_owned()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        if self.iter().any(|v| !v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn cholesky_solves_spd_system() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let factor = a.cholesky(Side::Lower).unwrap();
        let x = factor.solve_vec(&array![1.0, 2.0]);
        let back = a.dot(&x);
        assert_abs_diff_eq!(back[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[1], 2.0, epsilon = 1e-12);
        let inv_diag = factor.inverse_diag();
        assert_abs_diff_eq!(inv_diag[0], 3.0 / 11.0, epsilon = 1e-12);
        assert_abs_diff_eq!(inv_diag[1], 4.0 / 11.0, epsilon = 1e-12);
    }

    #[test]
    fn weighted_gram_matches_dense_product() {
        let x = array![[1.0, 2.0], [1.0, -1.0], [1.0, 0.5]];
        let w = array![0.5, 2.0, 1.0];
        let gram = weighted_gram(&x, w.view());
        let dense = x.t().dot(&ndarray::Array2::from_diag(&w)).dot(&x);
        for (a, b) in gram.iter().zip(dense.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn pivot_ratio_flags_near_singular_matrix() {
        let a = array![[1.0, 1.0], [1.0, 1.0 + 1e-13]];
        match a.cholesky(Side::Lower) {
            Ok(factor) => assert!(factor.pivot_ratio() < 1e-10),
            Err(_) => {}
        }
        let b = array![[2.0, 0.0], [0.0, 1.0]];
        assert_abs_diff_eq!(
            b.cholesky(Side::Lower).unwrap().pivot_ratio(),
            0.5,
            epsilon = 1e-12
        );
    }
}
