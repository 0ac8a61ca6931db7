//! Long (row-per-fact) tables and the long-to-wide pivot.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use polars::prelude::*;

use crate::codes::fold;
use crate::error::MixError;
use crate::frame::{Frame, Label, RowKey};
use crate::schema::{summary, wide};

// ── Summary kinds ───────────────────────────────────────────────────────────

/// Reduction applied to the values that land in one wide cell.
#[derive(Debug, Clone)]
pub enum Summary {
    Sum,
    Mean,
    Max,
    Min,
    Median,
    Custom { name: String, func: fn(&[f64]) -> f64 },
}

impl Summary {
    pub fn name(&self) -> &str {
        match self {
            Summary::Sum => summary::SUM,
            Summary::Mean => summary::MEAN,
            Summary::Max => summary::MAX,
            Summary::Min => summary::MIN,
            Summary::Median => summary::MEDIAN,
            Summary::Custom { name, .. } => name,
        }
    }

    /// Built-in summary by name.
    pub fn from_name(name: &str) -> Result<Self, MixError> {
        match name.to_ascii_lowercase().as_str() {
            summary::SUM => Ok(Summary::Sum),
            summary::MEAN => Ok(Summary::Mean),
            summary::MAX => Ok(Summary::Max),
            summary::MIN => Ok(Summary::Min),
            summary::MEDIAN => Ok(Summary::Median),
            _ => Err(MixError::InvalidData(format!(
                "unknown summary function '{name}'"
            ))),
        }
    }

    /// Reduce the present values; `None` when there are none.
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        Some(match self {
            Summary::Sum => values.iter().sum(),
            Summary::Mean => values.iter().sum::<f64>() / n,
            Summary::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Summary::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Summary::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            Summary::Custom { func, .. } => func(values),
        })
    }
}

/// Ordered summary buckets, each claiming a list of metric names.
#[derive(Debug, Clone, Default)]
pub struct SummaryPlan {
    buckets: Vec<(Summary, Vec<String>)>,
}

impl SummaryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan from `(summary name, metrics)` pairs, in order.
    pub fn from_names(entries: &[(String, Vec<String>)]) -> Result<Self, MixError> {
        let mut plan = Self::new();
        for (name, metrics) in entries {
            plan = plan.with(Summary::from_name(name)?, metrics.iter().cloned());
        }
        Ok(plan)
    }

    pub fn with<I, S>(mut self, kind: Summary, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let metrics: Vec<String> = metrics.into_iter().map(Into::into).collect();
        match self.buckets.iter_mut().find(|(s, _)| s.name() == kind.name()) {
            Some((_, claimed)) => claimed.extend(metrics),
            None => self.buckets.push((kind, metrics)),
        }
        self
    }

    pub fn buckets(&self) -> &[(Summary, Vec<String>)] {
        &self.buckets
    }

    /// Bucket explicitly claiming `metric`, if any.
    pub fn claimed(&self, metric: &str, case_sensitive: bool) -> Option<&Summary> {
        let wanted = normalize(metric, case_sensitive);
        self.buckets
            .iter()
            .find(|(_, metrics)| metrics.iter().any(|m| normalize(m, case_sensitive) == wanted))
            .map(|(kind, _)| kind)
    }
}

fn normalize(name: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        name.to_string()
    } else {
        fold(name)
    }
}

// ── Long tables ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LongRecord {
    pub panel: RowKey,
    pub descriptions: Vec<String>,
    pub value: Option<f64>,
}

impl LongRecord {
    /// Description at `pos`; a record with too few fields is invalid data.
    pub fn description(&self, pos: usize) -> Result<&String, MixError> {
        self.descriptions.get(pos).ok_or_else(|| {
            MixError::InvalidData(format!(
                "record {:?} has {} description field(s), needs more than {pos}",
                self.panel,
                self.descriptions.len()
            ))
        })
    }
}

/// Row-per-fact table: panel key fields, description fields, one value.
#[derive(Debug, Clone, Default)]
pub struct LongTable {
    pub panel_names: Vec<String>,
    pub description_names: Vec<String>,
    pub records: Vec<LongRecord>,
}

fn string_values(df: &DataFrame, name: &str) -> Result<Vec<String>, MixError> {
    let column = df
        .column(name)
        .map_err(|_| MixError::MissingColumn(name.to_string()))?;
    let series = column.as_materialized_series().cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

impl LongTable {
    pub fn new(panel_names: Vec<String>, description_names: Vec<String>) -> Self {
        Self {
            panel_names,
            description_names,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, panel: RowKey, descriptions: Vec<String>, value: Option<f64>) {
        self.records.push(LongRecord {
            panel,
            descriptions,
            value,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolve a possibly negative description position.
    pub fn description_position(&self, index: isize) -> Result<usize, MixError> {
        let n = self.description_names.len() as isize;
        let pos = if index < 0 { n + index } else { index };
        if pos < 0 || pos >= n {
            return Err(MixError::Validation(format!(
                "description index {index} out of range for {n} field(s)"
            )));
        }
        Ok(pos as usize)
    }

    /// Adapt a polars frame. Key and description columns are read as
    /// strings; the value column is cast to Float64 (unparseable → missing).
    pub fn from_dataframe(
        df: &DataFrame,
        panel_keys: &[String],
        description_fields: &[String],
        value_field: &str,
    ) -> Result<Self, MixError> {
        let panels = panel_keys
            .iter()
            .map(|k| string_values(df, k))
            .collect::<Result<Vec<_>, _>>()?;
        let descriptions = description_fields
            .iter()
            .map(|k| string_values(df, k))
            .collect::<Result<Vec<_>, _>>()?;
        let values: Vec<Option<f64>> = df
            .column(value_field)
            .map_err(|_| MixError::MissingColumn(value_field.to_string()))?
            .as_materialized_series()
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .collect();

        let mut table = Self::new(panel_keys.to_vec(), description_fields.to_vec());
        for (row, value) in values.into_iter().enumerate() {
            table.push(
                panels.iter().map(|c| c[row].clone()).collect(),
                descriptions.iter().map(|c| c[row].clone()).collect(),
                value,
            );
        }
        Ok(table)
    }

    pub fn read_csv<P: AsRef<Path>>(
        path: P,
        panel_keys: &[String],
        description_fields: &[String],
        value_field: &str,
    ) -> Result<Self, MixError> {
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .try_into_reader_with_file_path(Some(path.as_ref().to_path_buf()))?
            .finish()?;
        Self::from_dataframe(&df, panel_keys, description_fields, value_field)
    }
}

/// Merge records that agree on every key field.
///
/// The duplicated record's metric (description at `metric_index`) must be
/// claimed by a summary in `plan`; otherwise the whole call fails with
/// every such metric listed.
pub fn collapse_duplicates(
    table: &LongTable,
    metric_index: isize,
    plan: &SummaryPlan,
    case_sensitive: bool,
) -> Result<LongTable, MixError> {
    let metric_pos = table.description_position(metric_index)?;
    let mut order: Vec<(RowKey, Vec<String>)> = Vec::new();
    let mut groups: HashMap<(RowKey, Vec<String>), Vec<Option<f64>>> = HashMap::new();
    for record in &table.records {
        record.description(metric_pos)?;
        let key = (record.panel.clone(), record.descriptions.clone());
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(record.value);
    }

    let mut unclaimed = BTreeSet::new();
    let mut out = LongTable::new(table.panel_names.clone(), table.description_names.clone());
    for key in order {
        let values = &groups[&key];
        let value = if values.len() == 1 {
            values[0]
        } else {
            let metric = &key.1[metric_pos];
            match plan.claimed(metric, case_sensitive) {
                Some(kind) => {
                    let present: Vec<f64> = values.iter().flatten().copied().collect();
                    kind.reduce(&present)
                }
                None => {
                    unclaimed.insert(metric.clone());
                    None
                }
            }
        };
        out.push(key.0, key.1, value);
    }
    if !unclaimed.is_empty() {
        return Err(MixError::MissingSummary(unclaimed.into_iter().collect()));
    }
    Ok(out)
}

// ── Wide matrix ─────────────────────────────────────────────────────────────

/// Column key of the wide modeling matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WideColumn {
    /// Set only when per-source columns are kept apart.
    pub source: Option<String>,
    pub summary: String,
    pub variable: String,
}

impl WideColumn {
    pub fn new(summary: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            source: None,
            summary: summary.into(),
            variable: variable.into(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Label for WideColumn {
    fn parts(&self) -> Vec<String> {
        let mut parts = Vec::with_capacity(3);
        if let Some(source) = &self.source {
            parts.push(source.clone());
        }
        parts.push(self.summary.clone());
        parts.push(self.variable.clone());
        parts
    }

    fn level_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(3);
        if self.source.is_some() {
            names.push(wide::FILE.to_string());
        }
        names.push(wide::SUMMARY_TYPE.to_string());
        names.push(wide::VARIABLE.to_string());
        names
    }
}

pub type WideMatrix = Frame<WideColumn>;

impl Frame<WideColumn> {
    /// Re-key columns by variable code alone, the form transforms read.
    /// Fails if two columns share a variable (several summaries or sources).
    pub fn by_variable(&self) -> Result<Frame<String>, MixError> {
        self.map_columns(|c| c.variable.clone())
    }
}

/// A long record after description codes have been substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub panel: RowKey,
    pub metric: String,
    pub variable: String,
    pub value: Option<f64>,
}

/// Pivot mapped records into a wide matrix.
///
/// Each record lands in the first bucket claiming its metric, or in `sum`
/// when none does. Cells without a present value stay missing. Rows are
/// sorted; columns follow bucket order with variables sorted inside each.
pub fn long_to_wide(
    records: &[MappedRecord],
    index_names: &[String],
    plan: &SummaryPlan,
    case_sensitive: bool,
) -> Result<WideMatrix, MixError> {
    let mut buckets: Vec<Summary> = plan.buckets().iter().map(|(s, _)| s.clone()).collect();
    let mut sum_bucket = buckets.iter().position(|s| matches!(s, Summary::Sum));

    let mut cells: BTreeMap<(usize, String), BTreeMap<RowKey, Vec<f64>>> = BTreeMap::new();
    let mut panels: BTreeSet<RowKey> = BTreeSet::new();
    for record in records {
        if record.panel.len() != index_names.len() {
            return Err(MixError::InvalidData(format!(
                "record key {:?} does not match index levels {:?}",
                record.panel, index_names
            )));
        }
        let wanted = normalize(&record.metric, case_sensitive);
        let bucket = plan
            .buckets()
            .iter()
            .position(|(_, metrics)| {
                metrics
                    .iter()
                    .any(|m| normalize(m, case_sensitive) == wanted)
            });
        let bucket = match (bucket, sum_bucket) {
            (Some(b), _) => b,
            (None, Some(b)) => b,
            (None, None) => {
                buckets.push(Summary::Sum);
                sum_bucket = Some(buckets.len() - 1);
                buckets.len() - 1
            }
        };
        panels.insert(record.panel.clone());
        let values = cells
            .entry((bucket, record.variable.clone()))
            .or_default()
            .entry(record.panel.clone())
            .or_default();
        if let Some(v) = record.value {
            values.push(v);
        }
    }

    let mut matrix = WideMatrix::new(index_names.iter().cloned());
    for panel in panels {
        matrix.ensure_row(panel);
    }
    for ((bucket, variable), by_panel) in cells {
        let column = matrix.ensure_column(WideColumn::new(buckets[bucket].name(), variable));
        for (panel, values) in by_panel {
            if let Some(row) = matrix.row_position(&panel) {
                matrix.set_at(row, column, buckets[bucket].reduce(&values));
            }
        }
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(panel: &[&str], metric: &str, variable: &str, value: Option<f64>) -> MappedRecord {
        MappedRecord {
            panel: panel.iter().map(|s| s.to_string()).collect(),
            metric: metric.to_string(),
            variable: variable.to_string(),
            value,
        }
    }

    fn key(parts: &[&str]) -> RowKey {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn geometric(values: &[f64]) -> f64 {
        values.iter().product::<f64>().powf(1.0 / values.len() as f64)
    }

    #[test]
    fn test_summary_reductions() {
        assert_eq!(Summary::Median.reduce(&[3.0, 1.0, 2.0, 10.0]), Some(2.5));
        assert_eq!(Summary::Max.reduce(&[3.0, 1.0]), Some(3.0));
        assert_eq!(Summary::Mean.reduce(&[]), None);
        let custom = Summary::Custom {
            name: "geo".to_string(),
            func: geometric,
        };
        assert!((custom.reduce(&[2.0, 8.0]).unwrap() - 4.0).abs() < 1e-12);
        assert!(Summary::from_name("mode").is_err());
    }

    #[test]
    fn test_unclaimed_metrics_sum_and_gaps_stay_missing() {
        let plan = SummaryPlan::new().with(Summary::Mean, ["Price"]);
        let records = vec![
            rec(&["p1", "2020-01-06"], "SPEND", "TV", Some(10.0)),
            rec(&["p1", "2020-01-06"], "Spend", "TV", Some(5.0)),
            rec(&["p1", "2020-01-06"], "price", "TV", Some(2.0)),
            rec(&["p1", "2020-01-06"], "PRICE", "TV", Some(4.0)),
            rec(&["p2", "2020-01-06"], "Spend", "Radio", Some(0.0)),
        ];
        let names = vec!["Panel".to_string(), "Period".to_string()];
        let wide = long_to_wide(&records, &names, &plan, false).unwrap();

        assert_eq!(
            wide.columns(),
            &[
                WideColumn::new("mean", "TV"),
                WideColumn::new("sum", "Radio"),
                WideColumn::new("sum", "TV"),
            ]
        );
        let p1 = key(&["p1", "2020-01-06"]);
        let p2 = key(&["p2", "2020-01-06"]);
        assert_eq!(wide.get(&p1, &WideColumn::new("mean", "TV")), Some(3.0));
        assert_eq!(wide.get(&p1, &WideColumn::new("sum", "TV")), Some(15.0));
        assert_eq!(wide.get(&p2, &WideColumn::new("sum", "Radio")), Some(0.0));
        assert_eq!(wide.get(&p2, &WideColumn::new("sum", "TV")), None);
    }

    #[test]
    fn test_case_sensitive_metric_matching() {
        let plan = SummaryPlan::new().with(Summary::Mean, ["Price"]);
        let records = vec![rec(&["p1"], "price", "TV", Some(2.0))];
        let wide = long_to_wide(&records, &["Panel".to_string()], &plan, true).unwrap();
        assert_eq!(wide.columns(), &[WideColumn::new("sum", "TV")]);
    }

    #[test]
    fn test_collapse_duplicates_requires_summary() {
        let mut table =
            LongTable::new(vec!["Panel".into()], vec!["Channel".into(), "Metric".into()]);
        table.push(key(&["p1"]), vec!["TV".into(), "Spend".into()], Some(1.0));
        table.push(key(&["p1"]), vec!["TV".into(), "Spend".into()], Some(2.0));
        table.push(key(&["p1"]), vec!["TV".into(), "GRP".into()], Some(7.0));

        let err = collapse_duplicates(&table, -1, &SummaryPlan::new(), false).unwrap_err();
        assert!(matches!(err, MixError::MissingSummary(ref m) if m == &vec!["Spend".to_string()]));

        let plan = SummaryPlan::new().with(Summary::Max, ["spend"]);
        let merged = collapse_duplicates(&table, -1, &plan, false).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.records[0].value, Some(2.0));
        assert_eq!(merged.records[1].value, Some(7.0));
    }

    #[test]
    fn test_collapse_duplicates_rejects_short_records() {
        let mut table =
            LongTable::new(vec!["Panel".into()], vec!["Channel".into(), "Metric".into()]);
        table.push(key(&["p1"]), vec!["TV".into()], Some(1.0));
        let err = collapse_duplicates(&table, -1, &SummaryPlan::new(), false).unwrap_err();
        assert!(matches!(err, MixError::InvalidData(_)));
    }

    #[test]
    fn test_from_dataframe_casts_values() {
        let df = df! {
            "Geo" => ["A", "B"],
            "Metric" => ["Spend", "Spend"],
            "Value" => ["1.5", "n/a"],
        }
        .unwrap();
        let table =
            LongTable::from_dataframe(&df, &["Geo".into()], &["Metric".into()], "Value").unwrap();
        assert_eq!(table.records[0].value, Some(1.5));
        assert_eq!(table.records[1].value, None);

        let missing =
            LongTable::from_dataframe(&df, &["Region".into()], &["Metric".into()], "Value");
        assert!(matches!(missing, Err(MixError::MissingColumn(_))));
    }
}
