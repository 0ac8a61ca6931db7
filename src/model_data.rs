//! Builds the wide modeling matrix from one or more long source tables.
use std::collections::{BTreeMap, BTreeSet, HashSet};

use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codes::{synthesize_codes, CodeMap, CodeOptions};
use crate::error::MixError;
use crate::reshape::{long_to_wide, LongTable, MappedRecord, SummaryPlan, WideMatrix};
use crate::schema::lineage;

/// Builder settings; every field has a default so a partial TOML works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDataConfig {
    pub panel_keys: Vec<String>,
    pub description_fields: Vec<String>,
    pub value_field: String,
    /// Position of the metric among the description fields; negative
    /// counts from the end.
    pub metric_index: isize,
    /// Summary function name → metrics it claims.
    pub summaries: BTreeMap<String, Vec<String>>,
    pub delimiter: String,
    pub code_length: usize,
    pub case_sensitive: bool,
    pub iterative: bool,
    pub seed: Option<u64>,
}

impl Default for ModelDataConfig {
    fn default() -> Self {
        Self {
            panel_keys: Vec::new(),
            description_fields: Vec::new(),
            value_field: "Value".to_string(),
            metric_index: -1,
            summaries: BTreeMap::new(),
            delimiter: "_".to_string(),
            code_length: 3,
            case_sensitive: false,
            iterative: false,
            seed: None,
        }
    }
}

impl ModelDataConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, MixError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn summary_plan(&self) -> Result<SummaryPlan, MixError> {
        let entries: Vec<(String, Vec<String>)> = self
            .summaries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        SummaryPlan::from_names(&entries)
    }

    pub fn code_options(&self) -> CodeOptions {
        CodeOptions {
            code_length: self.code_length,
            case_sensitive: self.case_sensitive,
        }
    }

    /// Seeded when `seed` is set, otherwise from OS entropy.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LineageEntry {
    pub source: String,
    pub variable: String,
    pub descriptions: Vec<String>,
}

/// Which source and description values produced each variable code.
#[derive(Debug, Clone, Default)]
pub struct Lineage {
    description_names: Vec<String>,
    entries: Vec<LineageEntry>,
    seen: HashSet<LineageEntry>,
}

impl Lineage {
    pub fn new(description_names: Vec<String>) -> Self {
        Self {
            description_names,
            ..Self::default()
        }
    }

    /// Record an entry unless an identical one exists.
    pub fn push(&mut self, entry: LineageEntry) {
        if self.seen.insert(entry.clone()) {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[LineageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_dataframe(&self) -> Result<DataFrame, MixError> {
        let sources: Vec<&str> = self.entries.iter().map(|e| e.source.as_str()).collect();
        let variables: Vec<&str> = self.entries.iter().map(|e| e.variable.as_str()).collect();
        let mut columns = vec![
            Column::new(lineage::FILE.into(), &sources),
            Column::new(lineage::VARIABLE.into(), &variables),
        ];
        for (i, name) in self.description_names.iter().enumerate() {
            let values: Vec<&str> = self
                .entries
                .iter()
                .map(|e| e.descriptions.get(i).map(String::as_str).unwrap_or(""))
                .collect();
            columns.push(Column::new(name.as_str().into(), &values));
        }
        Ok(DataFrame::new(columns)?)
    }
}

#[derive(Debug, Clone)]
pub struct ModelData {
    pub matrix: WideMatrix,
    /// The seed mapping extended with every code assigned here.
    pub mapping: CodeMap,
    pub lineage: Lineage,
}

fn distinct_descriptions<'a, I: IntoIterator<Item = &'a LongTable>>(tables: I) -> BTreeSet<String> {
    tables
        .into_iter()
        .flat_map(|t| t.records.iter())
        .flat_map(|r| r.descriptions.iter().cloned())
        .collect()
}

fn map_records(
    source: &str,
    table: &LongTable,
    metric_pos: usize,
    mapping: &CodeMap,
    delimiter: &str,
    lineage: &mut Lineage,
) -> Result<Vec<MappedRecord>, MixError> {
    table
        .records
        .iter()
        .map(|record| {
            let codes = record
                .descriptions
                .iter()
                .map(|d| {
                    mapping
                        .get(d)
                        .map(String::as_str)
                        .ok_or_else(|| {
                            MixError::InvalidData(format!("no code for description '{d}'"))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let variable = codes.join(delimiter);
            lineage.push(LineageEntry {
                source: source.to_string(),
                variable: variable.clone(),
                descriptions: record.descriptions.clone(),
            });
            Ok(MappedRecord {
                panel: record.panel.clone(),
                metric: record.description(metric_pos)?.clone(),
                variable,
                value: record.value,
            })
        })
        .collect()
}

/// Code every description and pivot the sources into one wide matrix.
///
/// Combined mode codes the union of all descriptions at once and pivots
/// every record together. Iterative mode codes and pivots each source in
/// turn, reusing codes from earlier sources, and places the per-source
/// matrices side by side with their columns tagged by source name.
pub fn build_model_data<R: Rng + ?Sized>(
    sources: &[(String, LongTable)],
    config: &ModelDataConfig,
    plan: &SummaryPlan,
    seed_mapping: &CodeMap,
    rng: &mut R,
) -> Result<ModelData, MixError> {
    let Some((_, first)) = sources.first() else {
        return Err(MixError::Validation("no source tables supplied".to_string()));
    };
    for (name, table) in sources {
        if table.panel_names != first.panel_names
            || table.description_names != first.description_names
        {
            return Err(MixError::Validation(format!(
                "source '{name}' does not share the key and description fields of the first source"
            )));
        }
    }
    let metric_pos = first.description_position(config.metric_index)?;
    let options = config.code_options();
    let mut mapping = seed_mapping.clone();
    let mut lineage = Lineage::new(first.description_names.clone());

    let matrix = if config.iterative {
        let mut matrix = WideMatrix::new(first.panel_names.iter().cloned());
        for (name, table) in sources {
            debug!(source = %name, records = table.len(), "mapping source");
            let assigned =
                synthesize_codes(&distinct_descriptions([table]), &mapping, &options, rng);
            mapping.extend(assigned);
            let records =
                map_records(name, table, metric_pos, &mapping, &config.delimiter, &mut lineage)?;
            let wide = long_to_wide(&records, &table.panel_names, plan, config.case_sensitive)?;
            let tagged = wide.map_columns(|c| c.clone().with_source(name.clone()))?;
            matrix.concat_columns(&tagged)?;
        }
        matrix
    } else {
        let descriptions = distinct_descriptions(sources.iter().map(|(_, t)| t));
        debug!(
            sources = sources.len(),
            descriptions = descriptions.len(),
            "mapping combined sources"
        );
        let assigned = synthesize_codes(&descriptions, &mapping, &options, rng);
        mapping.extend(assigned);
        let mut records = Vec::new();
        for (name, table) in sources {
            records.extend(map_records(
                name,
                table,
                metric_pos,
                &mapping,
                &config.delimiter,
                &mut lineage,
            )?);
        }
        long_to_wide(&records, &first.panel_names, plan, config.case_sensitive)?
    };

    Ok(ModelData {
        matrix,
        mapping,
        lineage,
    })
}

/// [`build_model_data`] over polars frames, with field names, summaries
/// and randomness taken from `config`.
pub fn build_from_dataframes(
    frames: &[(String, DataFrame)],
    config: &ModelDataConfig,
    seed_mapping: &CodeMap,
) -> Result<ModelData, MixError> {
    let sources = frames
        .iter()
        .map(|(name, df)| {
            LongTable::from_dataframe(
                df,
                &config.panel_keys,
                &config.description_fields,
                &config.value_field,
            )
            .map(|t| (name.clone(), t))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let plan = config.summary_plan()?;
    let mut rng = config.rng();
    build_model_data(&sources, config, &plan, seed_mapping, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RowKey;
    use crate::reshape::WideColumn;

    fn key(parts: &[&str]) -> RowKey {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn table(rows: &[(&str, &str, &str, f64)]) -> LongTable {
        let mut t = LongTable::new(
            vec!["Geo".into(), "Period".into()],
            vec!["Channel".into(), "Metric".into()],
        );
        for (geo, channel, metric, value) in rows {
            t.push(
                key(&[*geo, "2020-01-06"]),
                vec![channel.to_string(), metric.to_string()],
                Some(*value),
            );
        }
        t
    }

    fn seeded() -> CodeMap {
        [("TV", "TV0"), ("Radio", "RAD"), ("Spend", "SPD"), ("Price", "PRC")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_from_toml() {
        let config = ModelDataConfig::from_toml_str(
            r#"
            panel_keys = ["Geo", "Period"]
            description_fields = ["Channel", "Metric"]
            value_field = "Amount"
            iterative = true
            seed = 11

            [summaries]
            mean = ["Price"]
            "#,
        )
        .unwrap();
        assert_eq!(config.code_length, 3);
        assert_eq!(config.delimiter, "_");
        assert!(config.iterative);
        assert!(config.summary_plan().unwrap().claimed("price", false).is_some());
        assert!(ModelDataConfig::from_toml_str("code_length = 'x'").is_err());
    }

    #[test]
    fn test_combined_sources_share_columns() {
        let a = table(&[("N", "TV", "Spend", 10.0), ("N", "TV", "Price", 2.0)]);
        let b = table(&[("N", "TV", "Spend", 5.0), ("S", "Radio", "Spend", 1.0)]);
        let plan = SummaryPlan::new().with(crate::reshape::Summary::Mean, ["Price"]);
        let config = ModelDataConfig::default();
        let mut rng = StdRng::seed_from_u64(3);
        let data = build_model_data(
            &[("a.csv".to_string(), a), ("b.csv".to_string(), b)],
            &config,
            &plan,
            &seeded(),
            &mut rng,
        )
        .unwrap();

        let n = key(&["N", "2020-01-06"]);
        assert_eq!(data.matrix.get(&n, &WideColumn::new("sum", "TV0_SPD")), Some(15.0));
        assert_eq!(data.matrix.get(&n, &WideColumn::new("mean", "TV0_PRC")), Some(2.0));
        assert_eq!(data.lineage.len(), 4);
        assert_eq!(data.mapping, seeded());
    }

    #[test]
    fn test_iterative_sources_stay_separate() {
        let a = table(&[("N", "TV", "Spend", 10.0)]);
        let b = table(&[("N", "TV", "Spend", 5.0), ("N", "Print", "Spend", 3.0)]);
        let config = ModelDataConfig {
            iterative: true,
            ..ModelDataConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let data = build_model_data(
            &[("a".to_string(), a), ("b".to_string(), b)],
            &config,
            &SummaryPlan::new(),
            &seeded(),
            &mut rng,
        )
        .unwrap();

        let n = key(&["N", "2020-01-06"]);
        let tv_a = WideColumn::new("sum", "TV0_SPD").with_source("a");
        let tv_b = WideColumn::new("sum", "TV0_SPD").with_source("b");
        assert_eq!(data.matrix.get(&n, &tv_a), Some(10.0));
        assert_eq!(data.matrix.get(&n, &tv_b), Some(5.0));
        assert!(data.mapping.contains_key("Print"));
        assert_eq!(data.matrix.n_columns(), 3);
    }

    #[test]
    fn test_seed_codes_are_stable_across_runs() {
        let a = table(&[("N", "Search", "Clicks", 10.0), ("N", "Social", "Clicks", 4.0)]);
        let config = ModelDataConfig::default();
        let first = build_model_data(
            &[("a".to_string(), a.clone())],
            &config,
            &SummaryPlan::new(),
            &CodeMap::new(),
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
        let second = build_model_data(
            &[("a".to_string(), a)],
            &config,
            &SummaryPlan::new(),
            &first.mapping,
            &mut StdRng::seed_from_u64(2),
        )
        .unwrap();
        assert_eq!(first.mapping, second.mapping);
        assert_eq!(first.matrix.columns(), second.matrix.columns());
    }

    #[test]
    fn test_short_record_is_invalid_data() {
        let mut a = table(&[("N", "TV", "Spend", 10.0)]);
        a.push(key(&["S", "2020-01-06"]), vec!["Radio".to_string()], Some(1.0));
        let result = build_model_data(
            &[("a".to_string(), a)],
            &ModelDataConfig::default(),
            &SummaryPlan::new(),
            &seeded(),
            &mut StdRng::seed_from_u64(5),
        );
        assert!(matches!(result, Err(MixError::InvalidData(_))));
    }

    #[test]
    fn test_lineage_frame_and_empty_sources() {
        let a = table(&[("N", "TV", "Spend", 10.0), ("S", "TV", "Spend", 1.0)]);
        let data = build_model_data(
            &[("a".to_string(), a)],
            &ModelDataConfig::default(),
            &SummaryPlan::new(),
            &seeded(),
            &mut StdRng::seed_from_u64(5),
        )
        .unwrap();
        let df = data.lineage.to_dataframe().unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(df.width(), 4);

        let empty = build_model_data(
            &[],
            &ModelDataConfig::default(),
            &SummaryPlan::new(),
            &CodeMap::new(),
            &mut StdRng::seed_from_u64(5),
        );
        assert!(matches!(empty, Err(MixError::Validation(_))));
    }
}
