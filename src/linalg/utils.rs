/// Compensated accumulator for long reductions over per-sample terms.
#[derive(Default, Clone, Copy, Debug)]
pub struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    /// Fold another partial sum into this one.
    pub fn merge(&mut self, other: KahanSum) {
        self.add(other.sum);
        self.add(-other.c);
    }

    pub fn sum(self) -> f64 {
        self.sum
    }
}

impl FromIterator<f64> for KahanSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = KahanSum::default();
        for v in iter {
            acc.add(v);
        }
        acc
    }
}

/// Euclidean distance between two planar points.
#[inline]
pub fn planar_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kahan_sum_keeps_small_terms() {
        let mut acc = KahanSum::default();
        acc.add(1e16);
        for _ in 0..1000 {
            acc.add(1.0);
        }
        acc.add(-1e16);
        assert_eq!(acc.sum(), 1000.0);
    }

    #[test]
    fn merged_partials_match_single_pass() {
        let values: Vec<f64> = (0..200).map(|i| 0.1 * i as f64).collect();
        let whole: KahanSum = values.iter().copied().collect();
        let mut left: KahanSum = values[..77].iter().copied().collect();
        let right: KahanSum = values[77..].iter().copied().collect();
        left.merge(right);
        assert!((whole.sum() - left.sum()).abs() < 1e-10);
    }
}
