//! Golden-section bandwidth search.

use std::collections::BTreeMap;

use crate::types::BandwidthMode;

/// Interior split ratio of the golden section, `1 - 1/phi`.
pub const GOLDEN_DELTA: f64 = 0.38197;

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub mode: BandwidthMode,
    /// Stop once the two interior scores differ by less than this.
    pub tolerance: f64,
    pub max_iter: usize,
    /// Rounds without a better score and without a fresh evaluation before
    /// the search gives up.
    pub patience: usize,
}

/// Why the search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStop {
    Converged,
    Plateau,
    IterationCap,
    /// A score evaluated to NaN; the last known-good bandwidth is returned.
    NanScore,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Best bandwidth seen, or `None` when no finite score was ever found.
    pub bandwidth: Option<f64>,
    pub score: f64,
    pub iterations: usize,
    pub stop: SearchStop,
    /// Every bandwidth evaluated, with its score, in ascending bandwidth order.
    pub evaluated: Vec<(f64, f64)>,
}

/// Cache key that treats bandwidths as exact bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BandwidthKey(i64);

impl BandwidthKey {
    fn new(bw: f64) -> Self {
        // Order-preserving map from f64 to i64 for non-NaN values.
        let bits = bw.to_bits() as i64;
        Self(if bits < 0 { bits ^ i64::MAX } else { bits })
    }
}

pub struct GoldenSectionSearch<F> {
    score: F,
    options: SearchOptions,
    cache: BTreeMap<BandwidthKey, (f64, f64)>,
}

impl<F> GoldenSectionSearch<F>
where
    F: FnMut(f64) -> f64,
{
    pub fn new(options: SearchOptions, score: F) -> Self {
        Self {
            score,
            options,
            cache: BTreeMap::new(),
        }
    }

    fn evaluate(&mut self, bw: f64) -> (f64, bool) {
        let key = BandwidthKey::new(bw);
        if let Some(&(_, s)) = self.cache.get(&key) {
            return (s, false);
        }
        let s = (self.score)(bw);
        log::debug!("bandwidth {bw}: score {s}");
        self.cache.insert(key, (bw, s));
        (s, true)
    }

    /// Minimize the score over `[lower, upper]`.
    pub fn run(mut self, lower: f64, upper: f64) -> SearchOutcome {
        let opts = self.options;
        let (mut lo, mut hi) = (lower, upper);
        let mut lb = lo + GOLDEN_DELTA * (hi - lo).abs();
        let mut ub = hi - GOLDEN_DELTA * (hi - lo).abs();

        let mut best: Option<(f64, f64)> = None;
        let mut stale_rounds = 0usize;
        let mut iterations = 0usize;
        let mut stop = SearchStop::IterationCap;

        while iterations < opts.max_iter {
            iterations += 1;
            lb = opts.mode.normalize(lb);
            ub = opts.mode.normalize(ub);

            let (lb_score, lb_fresh) = self.evaluate(lb);
            if lb_score.is_nan() {
                stop = SearchStop::NanScore;
                break;
            }
            let (ub_score, ub_fresh) = self.evaluate(ub);
            if ub_score.is_nan() {
                stop = SearchStop::NanScore;
                break;
            }

            // Ties keep the smaller bandwidth.
            let (candidate_bw, candidate_score) = if lb_score <= ub_score {
                let pick = (lb, lb_score);
                hi = ub;
                ub = lb;
                lb = lo + GOLDEN_DELTA * (hi - lo).abs();
                pick
            } else {
                let pick = (ub, ub_score);
                lo = lb;
                lb = ub;
                ub = hi - GOLDEN_DELTA * (hi - lo).abs();
                pick
            };

            let improved = best.is_none_or(|(_, s)| candidate_score < s);
            if improved {
                best = Some((candidate_bw, candidate_score));
                stale_rounds = 0;
            } else if lb_fresh || ub_fresh {
                stale_rounds = 0;
            } else {
                stale_rounds += 1;
            }

            if (lb_score - ub_score).abs() < opts.tolerance {
                stop = SearchStop::Converged;
                break;
            }
            if stale_rounds >= opts.patience {
                stop = SearchStop::Plateau;
                break;
            }
        }

        if stop == SearchStop::NanScore {
            match best {
                Some((bw, _)) => log::warn!(
                    "bandwidth search hit a NaN score; keeping last good bandwidth {bw}"
                ),
                None => log::warn!("bandwidth search hit a NaN score before any valid bandwidth"),
            }
        }

        let evaluated = self.cache.into_values().collect();
        SearchOutcome {
            bandwidth: best.map(|(bw, _)| bw),
            score: best.map_or(f64::NAN, |(_, s)| s),
            iterations,
            stop,
            evaluated,
        }
    }
}

/// Golden-section search over `[lower, upper]` for the bandwidth minimizing
/// `score`.
pub fn find_optimal_bw<F>(lower: f64, upper: f64, options: SearchOptions, score: F) -> SearchOutcome
where
    F: FnMut(f64) -> f64,
{
    GoldenSectionSearch::new(options, score).run(lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(mode: BandwidthMode, tolerance: f64) -> SearchOptions {
        SearchOptions {
            mode,
            tolerance,
            max_iter: 500,
            patience: 3,
        }
    }

    #[test]
    fn finds_known_minimum_in_fixed_mode() {
        let out = find_optimal_bw(1.0, 100.0, options(BandwidthMode::Fixed, 1e-3), |x| {
            (x - 37.0).abs()
        });
        let bw = out.bandwidth.unwrap();
        assert!((bw - 37.0).abs() < 1e-3, "got {bw}");
        assert!(out.iterations < 500);

        let quad = find_optimal_bw(1.0, 100.0, options(BandwidthMode::Fixed, 1e-3), |x| {
            (x - 37.0) * (x - 37.0)
        });
        assert!((quad.bandwidth.unwrap() - 37.0).abs() < 0.05);
    }

    #[test]
    fn adaptive_mode_lands_on_whole_neighbour_count() {
        let out = find_optimal_bw(1.0, 100.0, options(BandwidthMode::Adaptive, 1e-3), |x| {
            (x - 37.0) * (x - 37.0)
        });
        assert_eq!(out.bandwidth, Some(37.0));
        assert!(out.evaluated.iter().all(|(bw, _)| bw.fract() == 0.0));
    }

    #[test]
    fn cached_bandwidths_are_not_rescored() {
        let mut calls = Vec::new();
        let out = find_optimal_bw(1.0, 100.0, options(BandwidthMode::Adaptive, 1e-3), |x| {
            calls.push(x);
            (x - 20.0).abs()
        });
        let mut unique = calls.clone();
        unique.sort_by(f64::total_cmp);
        unique.dedup();
        assert_eq!(unique.len(), calls.len());
        assert_eq!(out.evaluated.len(), calls.len());
    }

    #[test]
    fn nan_score_returns_last_good_bandwidth() {
        // Scores turn NaN below 30, so the search falls off a cliff when
        // moving left.
        let out = find_optimal_bw(1.0, 100.0, options(BandwidthMode::Fixed, 1e-6), |x| {
            if x < 30.0 { f64::NAN } else { (x - 10.0).abs() }
        });
        assert_eq!(out.stop, SearchStop::NanScore);
        let bw = out.bandwidth.unwrap();
        assert!(bw >= 30.0);
        assert!(out.score.is_finite());
    }

    #[test]
    fn nan_on_first_round_reports_no_bandwidth() {
        let out = find_optimal_bw(1.0, 100.0, options(BandwidthMode::Fixed, 1e-3), |_| f64::NAN);
        assert_eq!(out.stop, SearchStop::NanScore);
        assert!(out.bandwidth.is_none());
        assert!(out.score.is_nan());
    }

    #[test]
    fn flat_score_stops_immediately() {
        let out = find_optimal_bw(5.0, 50.0, options(BandwidthMode::Adaptive, 1e-3), |_| 1.0);
        assert_eq!(out.stop, SearchStop::Converged);
        assert_eq!(out.iterations, 1);
        // Ties keep the lower interior point.
        assert_eq!(out.bandwidth, Some((5.0 + GOLDEN_DELTA * 45.0).round()));
    }
}
