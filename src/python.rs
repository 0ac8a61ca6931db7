use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::{CsvReadOptions, DataFrame, SerReader};
use pyo3::prelude::*;
use pyo3::types::PyModule;
use pyo3_polars::PyDataFrame;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::codes::{self, CodeMap, CodeOptions};
use crate::error::MixError;
use crate::model_data::{build_from_dataframes, ModelDataConfig};
use crate::optimize::{optimize, AllocationProblem, ConstraintKind, MarginalReturnSolver};
use crate::schema;
use crate::transform;

/// Stateful builder: holds the settings and the code mapping carried
/// between runs.
#[pyclass(name = "ModelBuilder")]
pub struct PyModelBuilder {
    config: ModelDataConfig,
    mapping: CodeMap,
}

#[pymethods]
impl PyModelBuilder {
    #[new]
    #[pyo3(signature = (config_toml=None))]
    fn new(config_toml: Option<&str>) -> PyResult<Self> {
        let config = match config_toml {
            Some(raw) => ModelDataConfig::from_toml_str(raw)?,
            None => ModelDataConfig::default(),
        };
        Ok(Self {
            config,
            mapping: CodeMap::new(),
        })
    }

    /// Load a CSV with every column as a string.
    fn load_csv(&self, path: &str) -> PyResult<PyDataFrame> {
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .try_into_reader_with_file_path(Some(path.into()))
            .and_then(|reader| reader.finish())
            .map_err(MixError::from)?;
        Ok(PyDataFrame(df))
    }

    /// Build the modeling matrix from `(name, frame)` sources.
    ///
    /// Returns `(matrix, lineage)`; the code mapping is kept for the next run.
    fn build(
        &mut self,
        sources: Vec<(String, PyDataFrame)>,
    ) -> PyResult<(PyDataFrame, PyDataFrame)> {
        let frames: Vec<(String, DataFrame)> =
            sources.into_iter().map(|(name, df)| (name, df.0)).collect();
        let data = build_from_dataframes(&frames, &self.config, &self.mapping)?;
        self.mapping = data.mapping;
        Ok((
            PyDataFrame(data.matrix.to_dataframe()?),
            PyDataFrame(data.lineage.to_dataframe()?),
        ))
    }

    #[getter]
    fn mapping(&self) -> BTreeMap<String, String> {
        self.mapping.clone()
    }

    #[setter]
    fn set_mapping(&mut self, mapping: BTreeMap<String, String>) {
        self.mapping = mapping;
    }
}

#[pyfunction]
fn apply_apl(values: Vec<f64>, adstock: f64, power: f64, lag: i32) -> Vec<f64> {
    transform::apply_decay_power_lag(&values, adstock, power, lag)
}

#[pyfunction]
#[pyo3(signature = (descriptions, existing=None, code_length=3, case_sensitive=false, seed=None))]
fn synthesize_codes(
    descriptions: BTreeSet<String>,
    existing: Option<BTreeMap<String, String>>,
    code_length: usize,
    case_sensitive: bool,
    seed: Option<u64>,
) -> BTreeMap<String, String> {
    let options = CodeOptions {
        code_length,
        case_sensitive,
    };
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    codes::synthesize_codes(&descriptions, &existing.unwrap_or_default(), &options, &mut rng)
}

#[pyfunction]
#[pyo3(signature = (
    coefficients,
    exponents,
    constraint_value,
    constraint="spend",
    lower_bounds=None,
    upper_bounds=None,
    revenue_lower=None,
    revenue_upper=None
))]
#[allow(clippy::too_many_arguments)]
fn optimize_spend(
    coefficients: Vec<f64>,
    exponents: Vec<f64>,
    constraint_value: f64,
    constraint: &str,
    lower_bounds: Option<Vec<f64>>,
    upper_bounds: Option<Vec<f64>>,
    revenue_lower: Option<Vec<f64>>,
    revenue_upper: Option<Vec<f64>>,
) -> PyResult<(Vec<f64>, f64, bool)> {
    let kind: ConstraintKind = constraint.parse()?;
    let n = coefficients.len();
    let mut problem = AllocationProblem::new(coefficients, exponents, constraint_value, kind)
        .with_spend_bounds(
            lower_bounds.unwrap_or_else(|| vec![0.0; n]),
            upper_bounds.unwrap_or_else(|| vec![f64::INFINITY; n]),
        );
    if revenue_lower.is_some() || revenue_upper.is_some() {
        problem = problem.with_revenue_bounds(
            &revenue_lower.unwrap_or_default(),
            &revenue_upper.unwrap_or_default(),
        );
    }
    let solved = optimize(&problem, &MarginalReturnSolver::default())?;
    Ok((solved.allocation, solved.achieved_value, solved.converged))
}

/// Export reserved names as Python submodules.
fn add_schema_exports(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let lineage = PyModule::new(m.py(), "lineage")?;
    lineage.add("FILE", schema::lineage::FILE)?;
    lineage.add("VARIABLE", schema::lineage::VARIABLE)?;
    m.add_submodule(&lineage)?;

    let wide = PyModule::new(m.py(), "wide")?;
    wide.add("FILE", schema::wide::FILE)?;
    wide.add("SUMMARY_TYPE", schema::wide::SUMMARY_TYPE)?;
    wide.add("VARIABLE", schema::wide::VARIABLE)?;
    m.add_submodule(&wide)?;

    let transform = PyModule::new(m.py(), "transform")?;
    transform.add("LEVELS", schema::transform::LEVELS.to_vec())?;
    transform.add("INTERCEPT", schema::transform::INTERCEPT)?;
    transform.add("RESIDUAL", schema::transform::RESIDUAL)?;
    transform.add("ADJUSTMENT_FACTOR", schema::transform::ADJUSTMENT_FACTOR)?;
    m.add_submodule(&transform)?;

    let assessment = PyModule::new(m.py(), "assessment")?;
    assessment.add("DEPENDENT", schema::assessment::DEPENDENT)?;
    assessment.add("PREDICTED", schema::assessment::PREDICTED)?;
    assessment.add("ERROR", schema::assessment::ERROR)?;
    assessment.add("ERROR_PCT", schema::assessment::ERROR_PCT)?;
    m.add_submodule(&assessment)?;

    Ok(())
}

#[pymodule]
fn mixkit(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyModelBuilder>()?;
    m.add_function(wrap_pyfunction!(apply_apl, m)?)?;
    m.add_function(wrap_pyfunction!(synthesize_codes, m)?)?;
    m.add_function(wrap_pyfunction!(optimize_spend, m)?)?;
    add_schema_exports(m)?;
    Ok(())
}
