use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use std::path::PathBuf;
use swr::config::ModelConfig;
use swr::dataset::load_csv;
use swr::estimate::{FitReport, TargetBandwidth, fit_targets};
use swr::output::{OutputLayout, write_predictions, write_results};
use swr::predict::predict_from_model;
use swr::types::{FamilyKind, KernelKind};

#[derive(Parser, Debug)]
#[command(name = "swr")]
#[command(about = "Spatially weighted regression CLI", long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (build ", env!("SWR_BUILD_TIMESTAMP"), ")"))]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Fit(FitArgs),
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
struct FitArgs {
    data: PathBuf,
    #[arg(long = "config")]
    config: Option<PathBuf>,
    #[arg(long = "targets", value_delimiter = ',')]
    targets: Vec<String>,
    #[arg(long = "covariates", value_delimiter = ',')]
    covariates: Option<Vec<String>>,
    #[arg(long = "family", value_enum)]
    family: Option<FamilyArg>,
    #[arg(long = "kernel", value_enum)]
    kernel: Option<KernelArg>,
    #[arg(long = "bw-fixed", default_value_t = false)]
    bw_fixed: bool,
    #[arg(long = "bw")]
    bw: Option<f64>,
    #[arg(long = "minbw")]
    minbw: Option<f64>,
    #[arg(long = "maxbw")]
    maxbw: Option<f64>,
    #[arg(long = "exclude-self", default_value_t = false)]
    exclude_self: bool,
    #[arg(long = "no-intercept", default_value_t = false)]
    no_intercept: bool,
    #[arg(long = "subsample", default_value_t = false)]
    subsample: bool,
    #[arg(long = "multiscale", default_value_t = false)]
    multiscale: bool,
    #[arg(long = "multiscale-params-only", default_value_t = false)]
    multiscale_params_only: bool,
    #[arg(long = "chunks")]
    chunks: Option<usize>,
    #[arg(long = "workers")]
    workers: Option<usize>,
    #[arg(long = "tolerance")]
    tolerance: Option<f64>,
    #[arg(long = "max-iter")]
    max_iter: Option<usize>,
    #[arg(long = "patience")]
    patience: Option<usize>,
    #[arg(long = "multicollinear-threshold")]
    multicollinear_threshold: Option<f64>,
    #[arg(long = "out")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct PredictArgs {
    data: PathBuf,
    #[arg(long = "model")]
    model: PathBuf,
    #[arg(long = "out")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum FamilyArg {
    Gaussian,
    Poisson,
    Nb,
}

impl From<FamilyArg> for FamilyKind {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::Gaussian => FamilyKind::Gaussian,
            FamilyArg::Poisson => FamilyKind::Poisson,
            FamilyArg::Nb => FamilyKind::NegativeBinomial,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum KernelArg {
    Bisquare,
    Exponential,
    Gaussian,
    Quadratic,
    Triangular,
    Uniform,
}

impl From<KernelArg> for KernelKind {
    fn from(arg: KernelArg) -> Self {
        match arg {
            KernelArg::Bisquare => KernelKind::Bisquare,
            KernelArg::Exponential => KernelKind::Exponential,
            KernelArg::Gaussian => KernelKind::Gaussian,
            KernelArg::Quadratic => KernelKind::Quadratic,
            KernelArg::Triangular => KernelKind::Triangular,
            KernelArg::Uniform => KernelKind::Uniform,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Fit(args) => run_fit(args),
        Command::Predict(args) => run_predict(args),
    }
}

/// Command-line flags override the values of `--config`.
fn build_config(args: &FitArgs) -> Result<ModelConfig, String> {
    let mut config = match &args.config {
        Some(path) => ModelConfig::from_json_path(path).map_err(|e| e.to_string())?,
        None => ModelConfig::default(),
    };
    if !args.targets.is_empty() {
        config.targets = args.targets.clone();
    }
    if let Some(covariates) = &args.covariates {
        config.covariates = Some(covariates.clone());
    }
    if let Some(family) = args.family {
        config.family = family.into();
    }
    if let Some(kernel) = args.kernel {
        config.kernel = kernel.into();
    }
    config.bw_fixed |= args.bw_fixed;
    config.bw = args.bw.or(config.bw);
    config.minbw = args.minbw.or(config.minbw);
    config.maxbw = args.maxbw.or(config.maxbw);
    config.exclude_self |= args.exclude_self;
    if args.no_intercept {
        config.fit_intercept = false;
    }
    config.subsample |= args.subsample;
    config.multiscale |= args.multiscale || args.multiscale_params_only;
    config.multiscale_params_only |= args.multiscale_params_only;
    config.chunks = args.chunks.unwrap_or(config.chunks);
    config.workers = args.workers.unwrap_or(config.workers);
    config.tolerance = args.tolerance.unwrap_or(config.tolerance);
    config.max_iter = args.max_iter.unwrap_or(config.max_iter);
    config.patience = args.patience.unwrap_or(config.patience);
    config.multicollinear_threshold = args
        .multicollinear_threshold
        .or(config.multicollinear_threshold);
    Ok(config)
}

fn run_fit(args: FitArgs) -> Result<(), String> {
    let mut config = build_config(&args)?;
    let dataset = load_csv(&args.data, &config.targets).map_err(|e| e.to_string())?;
    if config.targets.is_empty() {
        config.targets = dataset.target_names.clone();
    }
    let report = fit_targets(&dataset, &config).map_err(|e| e.to_string())?;

    let layout = OutputLayout::from_output_path(&args.out);
    let state = write_results(&report, &config, &layout).map_err(|e| e.to_string())?;
    println!("{}", summary_table(&report));
    println!("model state: {}", layout.model_path().display());
    if !state.failed.is_empty() {
        return Err(format!(
            "{} of {} target(s) failed",
            state.failed.len(),
            config.targets.len()
        ));
    }
    Ok(())
}

fn bandwidth_text(bandwidth: &TargetBandwidth) -> String {
    match bandwidth {
        TargetBandwidth::Single { bandwidth } => format!("{bandwidth}"),
        TargetBandwidth::Multiscale { per_feature, .. } => per_feature
            .iter()
            .map(|bw| bw.to_string())
            .collect::<Vec<_>>()
            .join(" / "),
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".to_string())
}

fn summary_table(report: &FitReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["target", "bandwidth", "AICc", "ENP", "R²", "deviance"]);
    for fit in report.fitted() {
        let diagnostics = fit.diagnostics.as_ref();
        table.add_row(Row::from(vec![
            Cell::new(&fit.target),
            Cell::new(bandwidth_text(&fit.bandwidth)),
            Cell::new(optional(diagnostics.map(|d| d.aicc))),
            Cell::new(optional(diagnostics.map(|d| d.enp))),
            Cell::new(optional(diagnostics.and_then(|d| d.r_squared))),
            Cell::new(optional(diagnostics.and_then(|d| d.deviance))),
        ]));
    }
    for (target, error) in report.failures() {
        table.add_row(Row::from(vec![
            Cell::new(target),
            Cell::new(format!("failed: {error}")),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
        ]));
    }
    table
}

fn run_predict(args: PredictArgs) -> Result<(), String> {
    let predictions = predict_from_model(&args.model, &args.data).map_err(|e| e.to_string())?;
    write_predictions(
        &args.out,
        &predictions.sample_ids,
        &predictions.targets,
        &predictions.values,
    )
    .map_err(|e| e.to_string())?;
    println!(
        "wrote {} prediction(s) for {} target(s) to {}",
        predictions.sample_ids.len(),
        predictions.targets.len(),
        args.out.display()
    );
    Ok(())
}
