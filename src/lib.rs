//! Marketing-mix model data preparation, decomposition and aggregation.
//!
//! Long metric tables become a coded wide matrix ([`model_data`]), variables
//! are transformed and multiplied through fitted coefficients
//! ([`decompose`], [`network`]), and the resulting contributions are rolled
//! up or split across panel and variable groups ([`aggregation`]).

pub mod aggregation;
pub mod calendar;
pub mod codes;
pub mod decompose;
pub mod error;
pub mod frame;
pub mod model_data;
pub mod network;
pub mod optimize;
pub mod reshape;
pub mod schema;
pub mod transform;

#[cfg(feature = "python")]
mod python;

pub use aggregation::{aggregate, segregate, Axis, GroupMap, Grouping};
pub use codes::{synthesize_codes, CodeMap, CodeOptions};
pub use decompose::{assess_error, collapse_date, decompose, Coefficients, DateWindow};
pub use error::MixError;
pub use frame::{Frame, Join, Label, RowKey, Series};
pub use model_data::{build_model_data, Lineage, ModelData, ModelDataConfig};
pub use network::{decompose_network, NodeColumn, NodeMap};
pub use optimize::{
    optimize, Allocation, AllocationProblem, AllocationSolver, ConstraintKind, MarginalReturnSolver,
};
pub use reshape::{long_to_wide, LongTable, Summary, SummaryPlan, WideColumn, WideMatrix};
pub use transform::{
    apply_decay_power_lag, apply_transforms, create_base, BaseSpec, PanelScope, TransformKey,
};
