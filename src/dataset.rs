//! Spatial dataset contract and CSV loading.
//!
//! The CSV layout is `sample id, x, y, <targets...>, <predictors...>`: the
//! first three columns are fixed, named response columns are pulled out as
//! targets and every remaining column becomes a predictor.

use csv::ReaderBuilder;
use ndarray::{Array1, Array2, ArrayView1, Axis, concatenate};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::types::FamilyKind;

pub const INTERCEPT_NAME: &str = "intercept";

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("{what}: expected {expected} rows, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{what} has {got} columns but {names} names")]
    NameCountMismatch {
        what: &'static str,
        got: usize,
        names: usize,
    },
    #[error("coordinates must have exactly two columns, got {0}")]
    MalformedCoordinates(usize),
    #[error("non-finite value in {what} at row {row}, column {col}")]
    NonFinite {
        what: &'static str,
        row: usize,
        col: usize,
    },
    #[error("target '{target}' has a negative value {value} at row {row}, which the {family} family cannot model")]
    InvalidResponse {
        target: String,
        family: FamilyKind,
        row: usize,
        value: f64,
    },
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    #[error("no predictors remain after covariate selection")]
    NoPredictors,
    #[error("initial coefficients for target '{target}' have length {got}, expected {expected}")]
    InitBetasLength {
        target: String,
        got: usize,
        expected: usize,
    },
    #[error("failed to read csv '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("csv '{path}': {message}")]
    Malformed { path: String, message: String },
}

/// Samples of one run: identifiers, planar coordinates, response columns and
/// named predictor columns. Rows are aligned across all members.
#[derive(Debug, Clone)]
pub struct SpatialDataset {
    pub sample_ids: Vec<String>,
    pub coords: Array2<f64>,
    pub responses: Array2<f64>,
    pub target_names: Vec<String>,
    pub predictors: Array2<f64>,
    pub feature_names: Vec<String>,
    pub init_betas: HashMap<String, Array1<f64>>,
}

fn check_finite(what: &'static str, values: &Array2<f64>) -> Result<(), DatasetError> {
    for ((row, col), v) in values.indexed_iter() {
        if !v.is_finite() {
            return Err(DatasetError::NonFinite { what, row, col });
        }
    }
    Ok(())
}

impl SpatialDataset {
    pub fn new(
        sample_ids: Vec<String>,
        coords: Array2<f64>,
        responses: Array2<f64>,
        target_names: Vec<String>,
        predictors: Array2<f64>,
        feature_names: Vec<String>,
    ) -> Result<Self, DatasetError> {
        let n = sample_ids.len();
        if coords.ncols() != 2 {
            return Err(DatasetError::MalformedCoordinates(coords.ncols()));
        }
        for (what, got) in [
            ("coordinates", coords.nrows()),
            ("responses", responses.nrows()),
            ("predictors", predictors.nrows()),
        ] {
            if got != n {
                return Err(DatasetError::ShapeMismatch {
                    what,
                    expected: n,
                    got,
                });
            }
        }
        if responses.ncols() != target_names.len() {
            return Err(DatasetError::NameCountMismatch {
                what: "responses",
                got: responses.ncols(),
                names: target_names.len(),
            });
        }
        if predictors.ncols() != feature_names.len() {
            return Err(DatasetError::NameCountMismatch {
                what: "predictors",
                got: predictors.ncols(),
                names: feature_names.len(),
            });
        }
        check_finite("coordinates", &coords)?;
        check_finite("responses", &responses)?;
        check_finite("predictors", &predictors)?;
        Ok(Self {
            sample_ids,
            coords,
            responses,
            target_names,
            predictors,
            feature_names,
            init_betas: HashMap::new(),
        })
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn has_intercept(&self) -> bool {
        self.feature_names.first().map(String::as_str) == Some(INTERCEPT_NAME)
    }

    /// Prepend a constant intercept column at position 0.
    pub fn with_intercept(mut self) -> Self {
        if self.has_intercept() {
            return self;
        }
        let ones = Array2::<f64>::ones((self.n_samples(), 1));
        self.predictors = concatenate![Axis(1), ones, self.predictors];
        self.feature_names.insert(0, INTERCEPT_NAME.to_string());
        self
    }

    /// Keep only the named predictor columns, in the order given. Names that
    /// are not present are skipped with a warning.
    pub fn select_covariates(mut self, names: &[String]) -> Result<Self, DatasetError> {
        let mut keep = Vec::with_capacity(names.len());
        for name in names {
            match self.feature_names.iter().position(|f| f == name) {
                Some(idx) => keep.push(idx),
                None => log::warn!("covariate '{name}' not found in dataset; skipping"),
            }
        }
        if keep.is_empty() {
            return Err(DatasetError::NoPredictors);
        }
        self.predictors = self.predictors.select(Axis(1), &keep);
        self.feature_names = keep.iter().map(|&i| self.feature_names[i].clone()).collect();
        Ok(self)
    }

    /// Remove the named predictor columns.
    pub fn drop_features(mut self, names: &[String]) -> Result<Self, DatasetError> {
        let keep: Vec<usize> = (0..self.n_features())
            .filter(|&j| !names.contains(&self.feature_names[j]))
            .collect();
        if keep.is_empty() {
            return Err(DatasetError::NoPredictors);
        }
        self.predictors = self.predictors.select(Axis(1), &keep);
        self.feature_names = keep.iter().map(|&i| self.feature_names[i].clone()).collect();
        Ok(self)
    }

    pub fn with_init_betas(
        mut self,
        target: &str,
        betas: Array1<f64>,
    ) -> Result<Self, DatasetError> {
        self.target_index(target)?;
        if betas.len() != self.n_features() {
            return Err(DatasetError::InitBetasLength {
                target: target.to_string(),
                got: betas.len(),
                expected: self.n_features(),
            });
        }
        self.init_betas.insert(target.to_string(), betas);
        Ok(self)
    }

    pub fn target_index(&self, target: &str) -> Result<usize, DatasetError> {
        self.target_names
            .iter()
            .position(|t| t == target)
            .ok_or_else(|| DatasetError::UnknownTarget(target.to_string()))
    }

    pub fn response(&self, target: &str) -> Result<ArrayView1<'_, f64>, DatasetError> {
        let idx = self.target_index(target)?;
        Ok(self.responses.column(idx))
    }

    /// Count families need non-negative responses.
    pub fn check_response(&self, target: &str, family: FamilyKind) -> Result<(), DatasetError> {
        if family.is_gaussian() {
            return Ok(());
        }
        let y = self.response(target)?;
        if let Some((row, &value)) = y.iter().enumerate().find(|(_, v)| **v < 0.0) {
            return Err(DatasetError::InvalidResponse {
                target: target.to_string(),
                family,
                row,
                value,
            });
        }
        Ok(())
    }

    /// Derived sample set restricted to `rows`, in that order.
    pub fn subset(&self, rows: &[usize]) -> SpatialDataset {
        SpatialDataset {
            sample_ids: rows.iter().map(|&i| self.sample_ids[i].clone()).collect(),
            coords: self.coords.select(Axis(0), rows),
            responses: self.responses.select(Axis(0), rows),
            target_names: self.target_names.clone(),
            predictors: self.predictors.select(Axis(0), rows),
            feature_names: self.feature_names.clone(),
            init_betas: self.init_betas.clone(),
        }
    }
}

/// Numeric CSV table: a leading identifier column followed by named numeric
/// columns.
#[derive(Debug, Clone)]
pub struct NumericTable {
    pub ids: Vec<String>,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl NumericTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn select(&self, cols: &[usize]) -> Array2<f64> {
        self.values.select(Axis(1), cols)
    }
}

/// Read a CSV whose first column is an identifier and every other column is
/// numeric. `NaN` and `inf` cells parse as such.
pub fn read_numeric_csv(path: &Path) -> Result<NumericTable, DatasetError> {
    let display = path.display().to_string();
    let malformed = |message: String| DatasetError::Malformed {
        path: display.clone(),
        message,
    };
    let csv_error = |source: csv::Error| DatasetError::Csv {
        path: display.clone(),
        source,
    };
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;
    let headers: Vec<String> = rdr
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(|s| s.trim().to_string())
        .collect();
    if headers.len() < 2 {
        return Err(malformed(format!(
            "expected an id column and at least one value column, got {} column(s)",
            headers.len()
        )));
    }

    let width = headers.len() - 1;
    let mut ids = Vec::new();
    let mut flat = Vec::new();
    for (row, rec) in rdr.records().enumerate() {
        let rec = rec.map_err(csv_error)?;
        if rec.len() != headers.len() {
            return Err(malformed(format!(
                "row {} has {} fields, expected {}",
                row + 1,
                rec.len(),
                headers.len()
            )));
        }
        ids.push(rec.get(0).unwrap_or_default().trim().to_string());
        for col in 1..headers.len() {
            let raw = rec.get(col).unwrap_or_default().trim();
            let v: f64 = raw.parse().map_err(|_| {
                malformed(format!(
                    "non-numeric value '{raw}' at row {}, column '{}'",
                    row + 1,
                    headers[col]
                ))
            })?;
            flat.push(v);
        }
    }
    if ids.is_empty() {
        return Err(malformed("csv has no rows".to_string()));
    }
    let values = Array2::from_shape_vec((ids.len(), width), flat)
        .map_err(|err| malformed(err.to_string()))?;
    Ok(NumericTable {
        ids,
        columns: headers[1..].to_vec(),
        values,
    })
}

/// Load `sample id, x, y, ...` rows from a CSV file. Columns named in
/// `targets` become responses; when `targets` is empty the first column after
/// the coordinates is the single target. Every other column is a predictor.
pub fn load_csv(path: &Path, targets: &[String]) -> Result<SpatialDataset, DatasetError> {
    let table = read_numeric_csv(path)?;
    if table.columns.len() < 3 {
        return Err(DatasetError::Malformed {
            path: path.display().to_string(),
            message: format!(
                "expected at least 4 columns (id, x, y, target), got {}",
                table.columns.len() + 1
            ),
        });
    }

    let target_cols: Vec<usize> = if targets.is_empty() {
        vec![2]
    } else {
        targets
            .iter()
            .map(|t| {
                table.columns[2..]
                    .iter()
                    .position(|c| c == t)
                    .map(|p| p + 2)
                    .ok_or_else(|| DatasetError::UnknownTarget(t.clone()))
            })
            .collect::<Result<_, _>>()?
    };
    let feature_cols: Vec<usize> = (2..table.columns.len())
        .filter(|c| !target_cols.contains(c))
        .collect();

    let coords = table.select(&[0, 1]);
    let responses = table.select(&target_cols);
    let predictors = table.select(&feature_cols);
    let target_names = target_cols.iter().map(|&c| table.columns[c].clone()).collect();
    let feature_names = feature_cols.iter().map(|&c| table.columns[c].clone()).collect();

    log::info!(
        "loaded {} samples with {} target(s) and {} predictor(s) from {}",
        table.ids.len(),
        target_cols.len(),
        feature_cols.len(),
        path.display()
    );
    SpatialDataset::new(table.ids, coords, responses, target_names, predictors, feature_names)
}
