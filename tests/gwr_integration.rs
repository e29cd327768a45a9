use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Gamma, Normal, Poisson};
use swr::config::ModelConfig;
use swr::dataset::SpatialDataset;
use swr::estimate::{FitReport, TargetBandwidth, TargetOutcome, fit_targets};
use swr::families::Family;
use swr::types::FamilyKind;

fn grid(nx: usize, ny: usize) -> Array2<f64> {
    Array2::from_shape_fn((nx * ny, 2), |(i, j)| {
        if j == 0 { (i % nx) as f64 } else { (i / nx) as f64 }
    })
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("s{i}")).collect()
}

fn normal_matrix(rng: &mut StdRng, n: usize, p: usize) -> Array2<f64> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((n, p), |_| normal.sample(rng))
}

fn dataset(
    coords: &Array2<f64>,
    responses: Array2<f64>,
    targets: &[&str],
    predictors: Array2<f64>,
    features: &[&str],
) -> SpatialDataset {
    SpatialDataset::new(
        ids(coords.nrows()),
        coords.clone(),
        responses,
        targets.iter().map(|s| s.to_string()).collect(),
        predictors,
        features.iter().map(|s| s.to_string()).collect(),
    )
    .unwrap()
}

fn only_fit(report: &FitReport) -> &swr::estimate::TargetFit {
    let fits: Vec<_> = report.fitted().collect();
    assert_eq!(fits.len(), 1, "failures: {:?}", report.failures().collect::<Vec<_>>());
    fits[0]
}

/// Smooth surface plus two informative columns whose effects drift across
/// the grid, and one column of pure noise.
fn drifting_signal(seed: u64) -> (Array2<f64>, Array2<f64>, Array1<f64>) {
    let coords = grid(10, 20);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(seed);
    let x = normal_matrix(&mut rng, n, 3);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let y = Array1::from_shape_fn(n, |i| {
        let (u, v) = (coords[[i, 0]], coords[[i, 1]]);
        let b1 = 1.0 + u / 5.0;
        let b2 = (v / 4.0).sin() * 2.0;
        2.0 + b1 * x[[i, 0]] + b2 * x[[i, 1]] + noise.sample(&mut rng)
    });
    (coords, x, y)
}

#[test]
fn informative_columns_beat_noise_on_a_grid() {
    let (coords, x, y) = drifting_signal(7);
    let responses = y.clone().insert_axis(ndarray::Axis(1));
    let config = ModelConfig {
        targets: vec!["y".to_string()],
        bw_fixed: true,
        bw: Some(5.0),
        workers: 2,
        ..ModelConfig::default()
    };

    let informative = dataset(
        &coords,
        responses.clone(),
        &["y"],
        x.clone(),
        &["x1", "x2", "noise"],
    );
    let noise_only = dataset(
        &coords,
        responses,
        &["y"],
        x.column(2).to_owned().insert_axis(ndarray::Axis(1)),
        &["noise"],
    );

    let full = fit_targets(&informative, &config).unwrap();
    let baseline = fit_targets(&noise_only, &config).unwrap();
    let r2_full = only_fit(&full).diagnostics.as_ref().unwrap().r_squared.unwrap();
    let r2_noise = only_fit(&baseline).diagnostics.as_ref().unwrap().r_squared.unwrap();
    assert!(
        r2_full - r2_noise >= 0.3,
        "informative R² {r2_full} vs noise-only R² {r2_noise}"
    );
    let fit = only_fit(&full);
    assert_eq!(fit.bandwidth, TargetBandwidth::Single { bandwidth: 5.0 });
    assert_eq!(full.feature_names, vec!["intercept", "x1", "x2", "noise"]);
    assert_eq!(fit.coefficients.ncols(), 4);
    assert!(fit.influence.as_ref().unwrap().iter().all(|h| h.is_finite()));
}

#[test]
fn multiscale_gives_the_constant_effect_the_wider_bandwidth() {
    let coords = grid(12, 12);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(21);
    let x = normal_matrix(&mut rng, n, 1);
    let noise = Normal::new(0.0, 0.05).unwrap();
    // Intercept is constant; the slope changes sign every few grid cells.
    let y = Array1::from_shape_fn(n, |i| {
        let (u, v) = (coords[[i, 0]], coords[[i, 1]]);
        let slope = 3.0 * (u / 2.0).sin() * (v / 2.0).cos();
        1.5 + slope * x[[i, 0]] + noise.sample(&mut rng)
    });
    let ds = dataset(
        &coords,
        y.insert_axis(ndarray::Axis(1)),
        &["y"],
        x,
        &["slope"],
    );
    let config = ModelConfig {
        targets: vec!["y".to_string()],
        multiscale: true,
        chunks: 2,
        workers: 2,
        tolerance: 1e-5,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    let fit = only_fit(&report);
    let TargetBandwidth::Multiscale {
        per_feature,
        history,
        ..
    } = &fit.bandwidth
    else {
        panic!("expected a multiscale bandwidth, got {:?}", fit.bandwidth);
    };
    assert_eq!(per_feature.len(), 2);
    assert!(!history.is_empty());
    assert!(
        per_feature[0] > per_feature[1],
        "intercept bandwidth {} should exceed slope bandwidth {}",
        per_feature[0],
        per_feature[1]
    );
    let diagnostics = fit.diagnostics.as_ref().unwrap();
    assert!(diagnostics.enp > 1.0 && diagnostics.enp < n as f64);
    let se = fit.standard_errors.as_ref().unwrap();
    assert!(se.iter().all(|v| v.is_finite() && *v >= 0.0));
}

#[test]
fn params_only_multiscale_skips_metrics() {
    let (coords, x, y) = drifting_signal(3);
    let ds = dataset(
        &coords,
        y.insert_axis(ndarray::Axis(1)),
        &["y"],
        x.slice(ndarray::s![.., 0..2]).to_owned(),
        &["x1", "x2"],
    );
    let config = ModelConfig {
        targets: vec!["y".to_string()],
        multiscale: true,
        multiscale_params_only: true,
        workers: 1,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    let fit = only_fit(&report);
    assert!(fit.standard_errors.is_none());
    assert!(fit.influence.is_none());
    assert!(fit.diagnostics.is_none());
    assert!(fit.coefficients.iter().all(|b| b.is_finite()));
}

#[test]
fn subsampled_fit_covers_every_sample() {
    let coords = grid(20, 20);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(5);
    let x = normal_matrix(&mut rng, n, 1);
    let y = Array1::from_shape_fn(n, |i| {
        if i % 3 == 0 {
            0.0
        } else {
            2.0 + 0.5 * x[[i, 0]] + coords[[i, 0]] / 10.0
        }
    });
    let ds = dataset(&coords, y.insert_axis(ndarray::Axis(1)), &["y"], x, &["x1"]);
    let config = ModelConfig {
        targets: vec!["y".to_string()],
        subsample: true,
        workers: 2,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    let fit = only_fit(&report);
    assert_eq!(fit.coefficients.nrows(), n);
    assert_eq!(fit.diagnostic.len(), n);
    assert!(fit.coefficients.iter().all(|b| b.is_finite()));
    let influence = fit.influence.as_ref().unwrap();
    let unfitted = influence.iter().filter(|h| h.is_nan()).count();
    assert!(unfitted > 0 && unfitted < n);
    assert_eq!(fit.diagnostics.as_ref().unwrap().n_fitted, n - unfitted);
}

#[test]
fn batch_continues_past_a_failed_target() {
    let coords = grid(10, 10);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(11);
    let x = normal_matrix(&mut rng, n, 1);
    let counts = Poisson::new(4.0).unwrap();
    let responses = Array2::from_shape_fn((n, 2), |(i, t)| {
        if t == 1 && i == 17 { -1.0 } else { counts.sample(&mut rng) }
    });
    let ds = dataset(&coords, responses, &["good", "bad"], x, &["x1"]);
    let config = ModelConfig {
        family: FamilyKind::Poisson,
        targets: vec!["good".to_string(), "bad".to_string()],
        workers: 2,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert!(matches!(&report.outcomes[0], TargetOutcome::Fitted(fit) if fit.target == "good"));
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "bad");
}

#[test]
fn poisson_fit_recovers_the_log_linear_slope() {
    let coords = grid(10, 20);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(99);
    let x = normal_matrix(&mut rng, n, 1).mapv(|v| v * 0.5);
    let y = Array1::from_shape_fn(n, |i| {
        let mu = (3.0 + 0.5 * x[[i, 0]]).exp();
        Poisson::new(mu).unwrap().sample(&mut rng)
    });
    let ds = dataset(&coords, y.insert_axis(ndarray::Axis(1)), &["y"], x, &["x1"]);
    let config = ModelConfig {
        family: FamilyKind::Poisson,
        targets: vec!["y".to_string()],
        workers: 2,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    let fit = only_fit(&report);
    assert_eq!(fit.family, Family::Poisson);
    let slope = fit.coefficients.column(1).mean().unwrap();
    let intercept = fit.coefficients.column(0).mean().unwrap();
    assert!((slope - 0.5).abs() < 0.2, "mean slope {slope}");
    assert!((intercept - 3.0).abs() < 0.2, "mean intercept {intercept}");
    let diagnostics = fit.diagnostics.as_ref().unwrap();
    assert!(diagnostics.deviance.unwrap().is_finite());
    assert!(diagnostics.aicc.is_finite());
    // Poisson tables report fitted means, which are positive.
    assert!(fit.diagnostic.iter().all(|mu| *mu > 0.0));
}

#[test]
fn multiscale_separates_short_and_long_range_effects() {
    let coords = grid(16, 16);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(17);
    let x = normal_matrix(&mut rng, n, 2);
    let noise = Normal::new(0.0, 0.3).unwrap();
    // The first effect varies over about 3 grid cells, the second over 30.
    let y = Array1::from_shape_fn(n, |i| {
        let (u, v) = (coords[[i, 0]], coords[[i, 1]]);
        let short = 3.0 * (u / 3.0).sin() * (v / 3.0).cos();
        let long = 1.0 + (u + v) / 30.0;
        short * x[[i, 0]] + long * x[[i, 1]] + noise.sample(&mut rng)
    });
    let ds = dataset(
        &coords,
        y.insert_axis(ndarray::Axis(1)),
        &["y"],
        x,
        &["short", "long"],
    );
    let config = ModelConfig {
        targets: vec!["y".to_string()],
        fit_intercept: false,
        multiscale: true,
        multiscale_params_only: true,
        tolerance: 1e-5,
        workers: 2,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    let fit = only_fit(&report);
    assert_eq!(report.feature_names, vec!["short", "long"]);
    let TargetBandwidth::Multiscale { per_feature, .. } = &fit.bandwidth else {
        panic!("expected a multiscale bandwidth, got {:?}", fit.bandwidth);
    };
    assert!(
        per_feature[1] >= 3.0 * per_feature[0],
        "short-range bandwidth {} vs long-range bandwidth {}",
        per_feature[0],
        per_feature[1]
    );
}

#[test]
fn negative_binomial_fit_estimates_dispersion() {
    let coords = grid(10, 20);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(31);
    let x = normal_matrix(&mut rng, n, 1).mapv(|v| v * 0.5);
    let theta = 5.0;
    // Gamma-Poisson mixture: negative binomial counts with dispersion theta.
    let y = Array1::from_shape_fn(n, |i| {
        let mu = (2.0 + 0.4 * x[[i, 0]]).exp();
        let rate: f64 = Gamma::new(theta, mu / theta).unwrap().sample(&mut rng);
        Poisson::new(rate.max(1e-6)).unwrap().sample(&mut rng)
    });
    let ds = dataset(&coords, y.insert_axis(ndarray::Axis(1)), &["y"], x, &["x1"]);
    let config = ModelConfig {
        family: FamilyKind::NegativeBinomial,
        targets: vec!["y".to_string()],
        workers: 2,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    let fit = only_fit(&report);
    let Family::NegativeBinomial { theta: fitted_theta } = fit.family else {
        panic!("expected a negative binomial family, got {:?}", fit.family);
    };
    assert!(fitted_theta.is_finite() && fitted_theta > 0.0, "theta {fitted_theta}");
    let slope = fit.coefficients.column(1).mean().unwrap();
    assert!((slope - 0.4).abs() < 0.25, "mean slope {slope}");
    let diagnostics = fit.diagnostics.as_ref().unwrap();
    assert!(diagnostics.deviance.unwrap().is_finite());
    assert!(diagnostics.aicc.is_finite());
    assert!(fit.diagnostic.iter().all(|mu| *mu > 0.0));
}

#[test]
fn poisson_multiscale_fit_reports_metrics() {
    let coords = grid(10, 10);
    let n = coords.nrows();
    let mut rng = StdRng::seed_from_u64(43);
    let x = normal_matrix(&mut rng, n, 1).mapv(|v| v * 0.5);
    let y = Array1::from_shape_fn(n, |i| {
        let mu = (1.5 + 0.3 * x[[i, 0]]).exp();
        Poisson::new(mu).unwrap().sample(&mut rng)
    });
    let ds = dataset(&coords, y.insert_axis(ndarray::Axis(1)), &["y"], x, &["x1"]);
    let config = ModelConfig {
        family: FamilyKind::Poisson,
        targets: vec!["y".to_string()],
        multiscale: true,
        chunks: 2,
        workers: 2,
        ..ModelConfig::default()
    };
    let report = fit_targets(&ds, &config).unwrap();
    let fit = only_fit(&report);
    assert!(fit.is_multiscale());
    assert_eq!(fit.family, Family::Poisson);
    let diagnostics = fit.diagnostics.as_ref().unwrap();
    assert!(diagnostics.deviance.unwrap().is_finite());
    assert!(diagnostics.aicc.is_finite());
    assert!(diagnostics.enp > 1.0 && diagnostics.enp < n as f64);
    assert!(fit.fitted.iter().all(|mu| *mu > 0.0));
    let se = fit.standard_errors.as_ref().unwrap();
    assert!(se.iter().all(|v| v.is_finite() && *v >= 0.0));
}
