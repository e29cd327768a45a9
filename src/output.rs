//! Result tables, prediction tables and the saved model state.
//!
//! Only the coordinating thread writes here, after every pass has finished.

use std::fs;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelConfig;
use crate::diagnostics::TargetDiagnostics;
use crate::estimate::{FitReport, TargetBandwidth, TargetFit};
use crate::families::Family;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write csv '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("model state '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn csv_error(path: &Path) -> impl Fn(csv::Error) -> OutputError + '_ {
    move |source| OutputError::Csv {
        path: path.display().to_string(),
        source,
    }
}

/// Where the files of one run go: `<dir>/<stem>_<target>.csv` and
/// `<dir>/<stem>_model.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub dir: PathBuf,
    pub stem: String,
}

impl OutputLayout {
    /// Layout for a base output path such as `results/run.csv`.
    pub fn from_output_path(path: &Path) -> Self {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "swr".to_string());
        Self { dir, stem }
    }

    pub fn table_name(&self, target: &str, multiscale: bool) -> String {
        if multiscale {
            format!("{}_{target}_multiscale.csv", self.stem)
        } else {
            format!("{}_{target}.csv", self.stem)
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(format!("{}_model.json", self.stem))
    }

    /// Files a run over `targets` writes, plus the tables a previous model
    /// state at this layout lists.
    fn previous_results(&self, targets: &[String]) -> Vec<PathBuf> {
        let model_path = self.model_path();
        let mut paths = Vec::new();
        if model_path.is_file() {
            match ModelState::load(&model_path) {
                Ok(state) => paths.extend(state.targets.iter().map(|t| self.dir.join(&t.table))),
                Err(err) => log::warn!("ignoring unreadable previous model state: {err}"),
            }
        }
        for target in targets {
            paths.push(self.dir.join(self.table_name(target, false)));
            paths.push(self.dir.join(self.table_name(target, true)));
        }
        paths.push(model_path);
        paths.sort();
        paths.dedup();
        paths
    }

    /// Remove the result files a previous run with the same stem left behind
    /// for `targets`. Other files in the directory are never touched.
    /// Returns how many were removed.
    pub fn clear_previous(&self, targets: &[String]) -> Result<usize, OutputError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
            return Ok(0);
        }
        let mut removed = 0;
        for path in self.previous_results(targets) {
            if path.is_file() {
                fs::remove_file(&path).map_err(io_error(&path))?;
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("removed {removed} result file(s) of a previous run from {}", self.dir.display());
        }
        Ok(removed)
    }
}

/// Write one target's table: `sample, <diagnostic>, influence, b_*, se_*`.
/// Influence and standard-error columns are left out when the fit has none.
pub fn write_target_table(
    path: &Path,
    sample_ids: &[String],
    feature_names: &[String],
    fit: &TargetFit,
) -> Result<(), OutputError> {
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error(path))?;

    let mut header = vec![
        "sample".to_string(),
        fit.family.kind().diagnostic_label().to_string(),
    ];
    if fit.influence.is_some() {
        header.push("influence".to_string());
    }
    header.extend(feature_names.iter().map(|f| format!("b_{f}")));
    if fit.standard_errors.is_some() {
        header.extend(feature_names.iter().map(|f| format!("se_{f}")));
    }
    wtr.write_record(&header).map_err(csv_error(path))?;

    for (i, id) in sample_ids.iter().enumerate() {
        let mut record = Vec::with_capacity(header.len());
        record.push(id.clone());
        record.push(fit.diagnostic[i].to_string());
        if let Some(influence) = &fit.influence {
            record.push(influence[i].to_string());
        }
        record.extend(fit.coefficients.row(i).iter().map(|b| b.to_string()));
        if let Some(se) = &fit.standard_errors {
            record.extend(se.row(i).iter().map(|v| v.to_string()));
        }
        wtr.write_record(&record).map_err(csv_error(path))?;
    }
    wtr.flush().map_err(io_error(path))?;
    Ok(())
}

/// `sample, <target>...` prediction table.
pub fn write_predictions(
    path: &Path,
    sample_ids: &[String],
    targets: &[String],
    values: &Array2<f64>,
) -> Result<(), OutputError> {
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error(path))?;
    let mut header = vec!["sample".to_string()];
    header.extend(targets.iter().cloned());
    wtr.write_record(&header).map_err(csv_error(path))?;
    for (i, id) in sample_ids.iter().enumerate() {
        let mut record = vec![id.clone()];
        record.extend(values.row(i).iter().map(|v| v.to_string()));
        wtr.write_record(&record).map_err(csv_error(path))?;
    }
    wtr.flush().map_err(io_error(path))?;
    log::info!("wrote predictions for {} target(s) to {}", targets.len(), path.display());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub target: String,
    pub family: Family,
    pub bandwidth: TargetBandwidth,
    pub diagnostics: Option<TargetDiagnostics>,
    /// Result table file name, relative to the model file.
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub target: String,
    pub error: String,
}

/// Everything `predict` needs to re-apply a fitted model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    pub version: String,
    pub config: ModelConfig,
    pub feature_names: Vec<String>,
    pub dropped_features: Vec<String>,
    pub targets: Vec<TargetState>,
    pub failed: Vec<FailedTarget>,
}

impl ModelState {
    pub fn from_report(report: &FitReport, config: &ModelConfig, layout: &OutputLayout) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: config.clone(),
            feature_names: report.feature_names.clone(),
            dropped_features: report.dropped_features.clone(),
            targets: report
                .fitted()
                .map(|fit| TargetState {
                    target: fit.target.clone(),
                    family: fit.family,
                    bandwidth: fit.bandwidth.clone(),
                    diagnostics: fit.diagnostics.clone(),
                    table: layout.table_name(&fit.target, fit.is_multiscale()),
                })
                .collect(),
            failed: report
                .failures()
                .map(|(target, error)| FailedTarget {
                    target: target.to_string(),
                    error: error.to_string(),
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), OutputError> {
        let text = serde_json::to_string_pretty(self).map_err(|source| OutputError::Json {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(path, text).map_err(io_error(path))
    }

    pub fn load(path: &Path) -> Result<Self, OutputError> {
        let text = fs::read_to_string(path).map_err(io_error(path))?;
        serde_json::from_str(&text).map_err(|source| OutputError::Json {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Clear the previous run, write every fitted target's table and the model
/// state. Returns the saved state.
pub fn write_results(
    report: &FitReport,
    config: &ModelConfig,
    layout: &OutputLayout,
) -> Result<ModelState, OutputError> {
    let targets: Vec<String> = report.outcomes.iter().map(|o| o.target().to_string()).collect();
    layout.clear_previous(&targets)?;
    let state = ModelState::from_report(report, config, layout);
    for (fit, target_state) in report.fitted().zip(&state.targets) {
        let path = layout.dir.join(&target_state.table);
        write_target_table(&path, &report.sample_ids, &report.feature_names, fit)?;
        log::info!("wrote results for target '{}' to {}", fit.target, path.display());
    }
    state.save(&layout.model_path())?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoefficientTable;
    use ndarray::{Array1, array};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("swr-output-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fit(influence: bool) -> TargetFit {
        TargetFit {
            target: "geneA".to_string(),
            family: Family::Gaussian,
            bandwidth: TargetBandwidth::Single { bandwidth: 8.0 },
            coefficients: CoefficientTable(array![[1.0, 0.5], [2.0, -0.5]]),
            standard_errors: influence.then(|| array![[0.1, 0.2], [0.3, 0.4]]),
            diagnostic: array![0.25, -0.25],
            fitted: Array1::zeros(2),
            influence: influence.then(|| array![0.4, f64::NAN]),
            diagnostics: None,
        }
    }

    #[test]
    fn layout_derives_names_from_output_path() {
        let layout = OutputLayout::from_output_path(Path::new("out/run.csv"));
        assert_eq!(layout.dir, PathBuf::from("out"));
        assert_eq!(layout.table_name("g1", false), "run_g1.csv");
        assert_eq!(layout.table_name("g1", true), "run_g1_multiscale.csv");
        assert_eq!(layout.model_path(), PathBuf::from("out/run_model.json"));
        let bare = OutputLayout::from_output_path(Path::new("run.csv"));
        assert_eq!(bare.dir, PathBuf::from("."));
    }

    #[test]
    fn table_columns_follow_fixed_order() {
        let dir = temp_dir("table");
        let path = dir.join("t.csv");
        let names = vec!["intercept".to_string(), "ct".to_string()];
        write_target_table(&path, &["a".into(), "b".into()], &names, &fit(true)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "sample,residual,influence,b_intercept,b_ct,se_intercept,se_ct"
        );
        assert_eq!(lines.next().unwrap(), "a,0.25,0.4,1,0.5,0.1,0.2");
        assert!(lines.next().unwrap().starts_with("b,-0.25,NaN,2"));

        write_target_table(&path, &["a".into(), "b".into()], &names, &fit(false)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next().unwrap(), "sample,residual,b_intercept,b_ct");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn clearing_only_touches_files_this_layout_writes() {
        let dir = temp_dir("clear");
        for name in [
            "run_g1.csv",
            "run_g1_multiscale.csv",
            "run_model.json",
            "run_input.csv",
            "other.csv",
            "run.txt",
            "notes_run_g1.csv",
        ] {
            fs::write(dir.join(name), "x").unwrap();
        }
        let layout = OutputLayout {
            dir: dir.clone(),
            stem: "run".to_string(),
        };
        assert_eq!(layout.clear_previous(&["g1".to_string()]).unwrap(), 3);
        assert!(dir.join("run_input.csv").exists());
        assert!(dir.join("other.csv").exists());
        assert!(dir.join("run.txt").exists());
        assert!(dir.join("notes_run_g1.csv").exists());
        assert!(!dir.join("run_g1.csv").exists());
        assert!(!dir.join("run_model.json").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn clearing_removes_tables_listed_by_the_previous_model() {
        let dir = temp_dir("clear-model");
        let layout = OutputLayout {
            dir: dir.clone(),
            stem: "run".to_string(),
        };
        let state = ModelState {
            version: "0".to_string(),
            config: ModelConfig::default(),
            feature_names: vec!["intercept".to_string()],
            dropped_features: Vec::new(),
            targets: vec![TargetState {
                target: "old".to_string(),
                family: Family::Gaussian,
                bandwidth: TargetBandwidth::Single { bandwidth: 3.0 },
                diagnostics: None,
                table: "run_old.csv".to_string(),
            }],
            failed: Vec::new(),
        };
        state.save(&layout.model_path()).unwrap();
        fs::write(dir.join("run_old.csv"), "x").unwrap();
        fs::write(dir.join("run_old_notes.csv"), "x").unwrap();

        assert_eq!(layout.clear_previous(&["new".to_string()]).unwrap(), 2);
        assert!(!dir.join("run_old.csv").exists());
        assert!(dir.join("run_old_notes.csv").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
