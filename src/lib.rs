pub mod collinearity;
pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod diagnostics;
pub mod estimate;
pub mod families;
pub mod kernel;
pub mod local;
pub mod multiscale;
pub mod optimizer;
pub mod output;
pub mod predict;
pub mod subsample;
pub mod types;

pub mod linalg {
    pub mod faer_ndarray;
    pub mod utils;
}

pub use config::{ConfigError, ModelConfig, SearchRange};
pub use coordinator::{Coordinator, FitContext, FitRequest, FitResult, WorkerPool};
pub use dataset::{DatasetError, SpatialDataset, load_csv};
pub use diagnostics::TargetDiagnostics;
pub use estimate::{
    EstimationError, FitReport, FitStrategy, LocalRegressionEngine, MultiscaleBackfittingStrategy,
    SingleBandwidthStrategy, TargetBandwidth, TargetFit, TargetOutcome, fit_targets,
};
pub use families::Family;
pub use kernel::{KernelSpec, SpatialWeights, compute_weights};
pub use local::{LocalFit, LocalFitError, fit_local};
pub use optimizer::find_optimal_bw;
pub use output::{ModelState, OutputError, OutputLayout, write_results};
pub use predict::{PredictError, predict, predict_from_model};
pub use types::{BandwidthMode, CoefficientTable, Coefficients, FamilyKind, KernelKind};
