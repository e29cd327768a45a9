//! Re-apply saved local coefficients to a design matrix.

use std::path::Path;

use ndarray::{Array1, Array2, ArrayView2};
use thiserror::Error;

use crate::dataset::{DatasetError, INTERCEPT_NAME, NumericTable, read_numeric_csv};
use crate::families::Family;
use crate::output::{ModelState, OutputError};
use crate::types::CoefficientTable;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("coefficient table has {coefficients} rows but the input has {inputs}")]
    RowMismatch { coefficients: usize, inputs: usize },
    #[error("design has {design} columns but the coefficients cover {coefficients}")]
    FeatureMismatch { design: usize, coefficients: usize },
    #[error("'{path}' has no column '{column}'")]
    MissingColumn { path: String, column: String },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Output(#[from] OutputError),
}

/// `g^-1(sum_j x_ij beta_ij)` for every sample.
pub fn predict(
    x: ArrayView2<'_, f64>,
    coefficients: &CoefficientTable,
    family: &Family,
) -> Result<Array1<f64>, PredictError> {
    if x.nrows() != coefficients.nrows() {
        return Err(PredictError::RowMismatch {
            coefficients: coefficients.nrows(),
            inputs: x.nrows(),
        });
    }
    if x.ncols() != coefficients.ncols() {
        return Err(PredictError::FeatureMismatch {
            design: x.ncols(),
            coefficients: coefficients.ncols(),
        });
    }
    let eta = coefficients.linear_predictor(x);
    Ok(family.predict(eta.view()))
}

fn column(table: &NumericTable, path: &Path, name: &str) -> Result<usize, PredictError> {
    table
        .column_index(name)
        .ok_or_else(|| PredictError::MissingColumn {
            path: path.display().to_string(),
            column: name.to_string(),
        })
}

/// Predictor columns of `table` in `feature_names` order; the intercept is a
/// column of ones.
pub fn design_matrix(
    table: &NumericTable,
    path: &Path,
    feature_names: &[String],
) -> Result<Array2<f64>, PredictError> {
    let mut x = Array2::<f64>::ones((table.ids.len(), feature_names.len()));
    for (j, name) in feature_names.iter().enumerate() {
        if name == INTERCEPT_NAME {
            continue;
        }
        let c = column(table, path, name)?;
        x.column_mut(j).assign(&table.values.column(c));
    }
    Ok(x)
}

/// Read the `b_*` columns of a result table written by `fit`.
pub fn load_coefficients(
    path: &Path,
    feature_names: &[String],
) -> Result<(Vec<String>, CoefficientTable), PredictError> {
    let table = read_numeric_csv(path)?;
    let cols = feature_names
        .iter()
        .map(|f| column(&table, path, &format!("b_{f}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((table.ids.clone(), CoefficientTable(table.select(&cols))))
}

/// Predictions of every fitted target of a saved model.
#[derive(Debug, Clone)]
pub struct PredictionSet {
    pub sample_ids: Vec<String>,
    pub targets: Vec<String>,
    /// Samples by targets.
    pub values: Array2<f64>,
}

/// Load the model state at `model_path` and predict every fitted target for
/// the samples in `data_path`, which must list the same samples in the same
/// order as the data the model was fitted on.
pub fn predict_from_model(model_path: &Path, data_path: &Path) -> Result<PredictionSet, PredictError> {
    let state = ModelState::load(model_path)?;
    let table_dir = model_path.parent().unwrap_or_else(|| Path::new("."));
    let data = read_numeric_csv(data_path)?;
    let x = design_matrix(&data, data_path, &state.feature_names)?;

    let mut values = Array2::<f64>::zeros((x.nrows(), state.targets.len()));
    for (t, target) in state.targets.iter().enumerate() {
        let table_path = table_dir.join(&target.table);
        let (ids, coefficients) = load_coefficients(&table_path, &state.feature_names)?;
        if ids != data.ids {
            log::warn!(
                "sample identifiers in {} differ from {}; matching rows by position",
                table_path.display(),
                data_path.display()
            );
        }
        let prediction = predict(x.view(), &coefficients, &target.family)?;
        values.column_mut(t).assign(&prediction);
    }
    Ok(PredictionSet {
        sample_ids: data.ids,
        targets: state.targets.iter().map(|t| t.target.clone()).collect(),
        values,
    })
}
