/// Reserved column and index-level names used across mixkit.
/// Single source of truth - also exported to Python under the `python` feature.

// ── Long-format / lineage columns ──────────────────────────────────────────
pub mod lineage {
    pub const FILE: &str = "_File_";
    pub const VARIABLE: &str = "_Variable_";
}

// ── Wide modeling-matrix column levels ─────────────────────────────────────
pub mod wide {
    pub const FILE: &str = "_File_";
    pub const SUMMARY_TYPE: &str = "_summary_type_";
    pub const VARIABLE: &str = "_Variable_";
}

// ── Summary function names ─────────────────────────────────────────────────
pub mod summary {
    pub const SUM: &str = "sum";
    pub const MEAN: &str = "mean";
    pub const MAX: &str = "max";
    pub const MIN: &str = "min";
    pub const MEDIAN: &str = "median";
}

// ── Transform-key levels and reserved regressors ───────────────────────────
pub mod transform {
    pub const VARIABLE: &str = "Variable";
    pub const ADSTOCK: &str = "Adstock";
    pub const POWER: &str = "Power";
    pub const LAG: &str = "Lag";

    pub const LEVELS: [&str; 4] = [VARIABLE, ADSTOCK, POWER, LAG];

    pub const INTERCEPT: &str = "Intercept";
    pub const RESIDUAL: &str = "Residual";
    pub const ADJUSTMENT_FACTOR: &str = "_Adjustment_Factor_";
}

// ── Node network column level ──────────────────────────────────────────────
pub mod network {
    pub const NODE: &str = "Node";
}

// ── Error assessment columns ───────────────────────────────────────────────
pub mod assessment {
    pub const DEPENDENT: &str = "Dependent";
    pub const PREDICTED: &str = "Predicted";
    pub const ERROR: &str = "Error";
    pub const ERROR_PCT: &str = "Error %";
}

// ── Period index level ─────────────────────────────────────────────────────
pub mod timeseries {
    pub const PANEL: &str = "Panel";
    pub const PERIOD: &str = "Period";
}
