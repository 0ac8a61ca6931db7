#[cfg(feature = "python")]
use pyo3::exceptions::{PyRuntimeError, PyValueError};
#[cfg(feature = "python")]
use pyo3::PyErr;
use thiserror::Error;

use crate::aggregation::Axis;

#[derive(Error, Debug)]
pub enum MixError {
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Validation: {0}")]
    Validation(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),

    #[error(
        "Shape mismatch: coefficients are nested {coefficients} panel level(s) deep \
         but the matrix has {matrix} panel level(s)"
    )]
    ShapeMismatch { coefficients: usize, matrix: usize },

    #[error("{axis} '{name}' belongs to both group '{first}' and group '{second}'")]
    OverlappingGroup {
        axis: Axis,
        name: String,
        first: String,
        second: String,
    },

    #[error("No summary function registered for duplicated metrics: {0:?}")]
    MissingSummary(Vec<String>),
}

#[cfg(feature = "python")]
impl From<MixError> for PyErr {
    fn from(err: MixError) -> PyErr {
        match err {
            MixError::Polars(_) => PyRuntimeError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}
