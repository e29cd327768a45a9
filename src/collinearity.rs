//! Variance-inflation screening of the predictor matrix.

use ndarray::{Array1, ArrayView2, Axis};

use crate::dataset::INTERCEPT_NAME;

/// Squared residual norm, relative to the column's own, below which a
/// column adds nothing to the span of the columns before it.
const DEPENDENT_RATIO: f64 = 1e-10;

/// Orthonormal basis for the span of an intercept and `columns` of `x`,
/// built by Gram-Schmidt with one reorthogonalization pass. Columns that
/// are linear combinations of earlier ones are skipped.
fn orthonormal_span(x: ArrayView2<'_, f64>, columns: &[usize]) -> Vec<Array1<f64>> {
    let n = x.nrows();
    let mut basis: Vec<Array1<f64>> = Vec::with_capacity(columns.len() + 1);
    if n > 0 {
        basis.push(Array1::from_elem(n, 1.0 / (n as f64).sqrt()));
    }
    for &j in columns {
        let original = x.column(j).to_owned();
        let norm2 = original.dot(&original);
        if !(norm2 > 0.0) {
            continue;
        }
        let mut v = original;
        for _ in 0..2 {
            for q in &basis {
                let c = q.dot(&v);
                v.scaled_add(-c, q);
            }
        }
        let residual = v.dot(&v);
        if residual > DEPENDENT_RATIO * norm2 {
            v /= residual.sqrt();
            basis.push(v);
        }
    }
    basis
}

/// `1 / (1 - R^2)` of column `target` regressed on an intercept and the
/// `others`. Infinite for constant or perfectly explained columns. Linear
/// dependence among the `others` does not inflate the target.
pub fn variance_inflation(x: ArrayView2<'_, f64>, target: usize, others: &[usize]) -> f64 {
    let y = x.column(target);
    let mean = y.mean().unwrap_or(0.0);
    let tss: f64 = y.iter().map(|v| (v - mean) * (v - mean)).sum();
    if !(tss > 0.0) {
        return f64::INFINITY;
    }

    let mut residual = y.to_owned();
    for q in orthonormal_span(x, others) {
        let c = q.dot(&residual);
        residual.scaled_add(-c, &q);
    }
    let rss = residual.dot(&residual);
    let r2 = 1.0 - rss / tss;
    if r2 >= 1.0 { f64::INFINITY } else { 1.0 / (1.0 - r2) }
}

/// Repeatedly drop the feature with the largest VIF until every remaining
/// VIF is below `threshold`. The intercept column is never tested. Returns
/// the names of the dropped features, in drop order.
pub fn drop_collinear(
    x: ArrayView2<'_, f64>,
    feature_names: &[String],
    threshold: f64,
) -> Vec<String> {
    let mut candidates: Vec<usize> = (0..x.ncols())
        .filter(|&j| feature_names[j] != INTERCEPT_NAME)
        .collect();
    let mut dropped = Vec::new();

    while candidates.len() > 1 {
        let (worst_pos, worst_vif) = candidates
            .iter()
            .enumerate()
            .map(|(pos, &j)| {
                let others: Vec<usize> = candidates.iter().copied().filter(|&k| k != j).collect();
                (pos, variance_inflation(x, j, &others))
            })
            .fold((0, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if worst_vif < threshold {
            break;
        }
        let j = candidates.remove(worst_pos);
        log::info!(
            "dropping feature '{}' with variance inflation factor {worst_vif:.3}",
            feature_names[j]
        );
        dropped.push(feature_names[j].clone());
    }
    dropped
}

/// Names of predictors that are zero in every sample.
pub fn zero_columns(x: ArrayView2<'_, f64>, feature_names: &[String]) -> Vec<String> {
    x.map_axis(Axis(0), |col| col.iter().all(|v| *v == 0.0))
        .iter()
        .zip(feature_names)
        .filter(|(zero, _)| **zero)
        .map(|(_, name)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn near_duplicate_feature_is_dropped() {
        let mut rng = StdRng::seed_from_u64(42);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n = 200;
        let mut x = Array2::<f64>::ones((n, 4));
        for i in 0..n {
            let a = normal.sample(&mut rng);
            x[[i, 1]] = a;
            x[[i, 2]] = normal.sample(&mut rng);
            x[[i, 3]] = a + 0.01 * normal.sample(&mut rng);
        }
        let feature_names = names(&["intercept", "a", "b", "a_copy"]);
        let dropped = drop_collinear(x.view(), &feature_names, 10.0);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0] == "a" || dropped[0] == "a_copy");
    }

    #[test]
    fn independent_features_are_kept() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let x = Array2::from_shape_fn((150, 3), |_| normal.sample(&mut rng));
        let dropped = drop_collinear(x.view(), &names(&["a", "b", "c"]), 5.0);
        assert!(dropped.is_empty());
        let vif = variance_inflation(x.view(), 0, &[1, 2]);
        assert!(vif >= 1.0 && vif < 1.2, "vif {vif}");
    }

    #[test]
    fn dependent_companions_do_not_inflate_an_independent_feature() {
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n = 120;
        let mut x = Array2::<f64>::zeros((n, 3));
        for i in 0..n {
            let a = normal.sample(&mut rng);
            x[[i, 0]] = a;
            x[[i, 1]] = normal.sample(&mut rng);
            x[[i, 2]] = 2.0 * a;
        }
        let vif_b = variance_inflation(x.view(), 1, &[0, 2]);
        assert!(vif_b.is_finite() && vif_b < 1.5, "vif {vif_b}");
        assert!(variance_inflation(x.view(), 0, &[1, 2]) > 1e6);

        let dropped = drop_collinear(x.view(), &names(&["a", "b", "a2"]), 10.0);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0] == "a" || dropped[0] == "a2", "dropped {dropped:?}");
    }

    #[test]
    fn constant_column_has_infinite_inflation() {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| if j == 0 { 3.0 } else { i as f64 });
        assert_eq!(variance_inflation(x.view(), 0, &[1]), f64::INFINITY);
        assert_eq!(zero_columns(Array2::<f64>::zeros((3, 1)).view(), &names(&["z"])), vec!["z"]);
    }
}
