//! Adstock / power / lag regressors and dummy "base" series.
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use tracing::warn;

use crate::calendar::{date_periods, date_range, format_period, Frequency};
use crate::error::MixError;
use crate::frame::{Frame, Label, RowKey, Series};
use crate::schema::{timeseries, transform};

// ── Transform key ───────────────────────────────────────────────────────────

/// `(variable, adstock, power, lag)`: one fully parameterised regressor.
#[derive(Debug, Clone)]
pub struct TransformKey {
    pub variable: String,
    pub adstock: f64,
    pub power: f64,
    pub lag: i32,
}

impl TransformKey {
    pub fn new(variable: impl Into<String>, adstock: f64, power: f64, lag: i32) -> Self {
        Self {
            variable: variable.into(),
            adstock,
            power,
            lag,
        }
    }

    /// Untransformed use of a variable, `(variable, 0, 1, 0)`.
    pub fn raw(variable: impl Into<String>) -> Self {
        Self::new(variable, 0.0, 1.0, 0)
    }

    pub fn intercept() -> Self {
        Self::raw(transform::INTERCEPT)
    }

    pub fn residual() -> Self {
        Self::raw(transform::RESIDUAL)
    }

    pub fn adjustment_factor() -> Self {
        Self::raw(transform::ADJUSTMENT_FACTOR)
    }

    pub fn is_identity(&self) -> bool {
        self.adstock == 0.0 && self.power == 1.0 && self.lag == 0
    }

    fn ordering_key(&self) -> (&str, u64, u64, i32) {
        (&self.variable, self.adstock.to_bits(), self.power.to_bits(), self.lag)
    }
}

impl PartialEq for TransformKey {
    fn eq(&self, other: &Self) -> bool {
        self.ordering_key() == other.ordering_key()
    }
}

impl Eq for TransformKey {}

impl Hash for TransformKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ordering_key().hash(state);
    }
}

impl PartialOrd for TransformKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransformKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.variable
            .cmp(&other.variable)
            .then(self.adstock.total_cmp(&other.adstock))
            .then(self.power.total_cmp(&other.power))
            .then(self.lag.cmp(&other.lag))
    }
}

impl fmt::Display for TransformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.variable, self.adstock, self.power, self.lag)
    }
}

impl Label for TransformKey {
    fn parts(&self) -> Vec<String> {
        vec![
            self.variable.clone(),
            self.adstock.to_string(),
            self.power.to_string(),
            self.lag.to_string(),
        ]
    }

    fn level_names(&self) -> Vec<String> {
        transform::LEVELS.iter().map(|s| s.to_string()).collect()
    }

    fn display_name(&self) -> String {
        self.to_string()
    }
}

// ── APL filter ──────────────────────────────────────────────────────────────

/// Decay, then power, then lag.
///
/// `y[t] = x[t] + adstock * y[t-1]`, each `y` raised to `power` (NaN
/// becomes 0), then shifted by `lag` with 0 fill. Negative lags shift
/// backward. The output has the input's length.
pub fn apply_decay_power_lag(values: &[f64], adstock: f64, power: f64, lag: i32) -> Vec<f64> {
    let mut carry = 0.0;
    let powered: Vec<f64> = values
        .iter()
        .map(|&x| {
            carry = x + adstock * carry;
            let y = carry.powf(power);
            if y.is_nan() {
                0.0
            } else {
                y
            }
        })
        .collect();

    let n = powered.len();
    let shift = lag.unsigned_abs() as usize;
    (0..n)
        .map(|t| {
            let src = if lag >= 0 {
                t.checked_sub(shift)
            } else {
                Some(t + shift).filter(|&s| s < n)
            };
            src.map_or(0.0, |s| powered[s])
        })
        .collect()
}

impl Series {
    /// Transformed copy; labels stay in place and missing values count as 0.
    pub fn apply_decay_power_lag(&self, adstock: f64, power: f64, lag: i32) -> Series {
        let input: Vec<f64> = self.values.iter().map(|v| v.unwrap_or(0.0)).collect();
        Series {
            name: self.name.clone(),
            index_names: self.index_names.clone(),
            index: self.index.clone(),
            values: apply_decay_power_lag(&input, adstock, power, lag)
                .into_iter()
                .map(Some)
                .collect(),
        }
    }
}

// ── Panel-aware transforms ──────────────────────────────────────────────────

/// Which rows a group of transform keys is computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelScope {
    /// The whole column as one series.
    Global,
    /// Each panel separately, using only that panel's history.
    PerPanel,
    /// One named panel; other panels get no value for these keys.
    Panel(RowKey),
}

/// Transform matrix columns into a `Frame<TransformKey>`.
///
/// Rows keep the matrix order; rows no scope touches are dropped. Missing
/// inputs are fed to the filter as 0. An `Intercept` variable the matrix
/// lacks is the constant 1.
pub fn apply_transforms(
    matrix: &Frame<String>,
    scopes: &[(PanelScope, Vec<TransformKey>)],
) -> Result<Frame<TransformKey>, MixError> {
    let all_rows: Vec<usize> = (0..matrix.n_rows()).collect();
    let panel_groups = matrix.panel_groups();

    let mut touched = vec![false; matrix.n_rows()];
    let mut results: Vec<(TransformKey, Vec<usize>, Vec<f64>)> = Vec::new();
    for (scope, keys) in scopes {
        let groups: Vec<&[usize]> = match scope {
            PanelScope::Global => vec![all_rows.as_slice()],
            PanelScope::PerPanel => panel_groups.iter().map(|(_, rows)| rows.as_slice()).collect(),
            PanelScope::Panel(panel) => {
                let found = panel_groups.iter().find(|(p, _)| p == panel);
                if found.is_none() {
                    warn!(?panel, "named panel has no rows in the matrix");
                }
                found.map(|(_, rows)| rows.as_slice()).into_iter().collect()
            }
        };
        for key in keys {
            let input = match matrix.column(&key.variable) {
                Some(cells) => Some(cells),
                None if key.variable == transform::INTERCEPT => None,
                None => return Err(MixError::ColumnNotFound(key.variable.clone())),
            };
            for rows in &groups {
                let values: Vec<f64> = rows
                    .iter()
                    .map(|&r| input.map_or(1.0, |cells| cells[r].unwrap_or(0.0)))
                    .collect();
                let transformed = apply_decay_power_lag(&values, key.adstock, key.power, key.lag);
                for &r in rows.iter() {
                    touched[r] = true;
                }
                results.push((key.clone(), rows.to_vec(), transformed));
            }
        }
    }

    let mut out: Frame<TransformKey> = matrix.empty_like();
    let mut positions = vec![None; matrix.n_rows()];
    for (r, row) in matrix.rows().iter().enumerate() {
        if touched[r] {
            positions[r] = Some(out.ensure_row(row.clone()));
        }
    }
    for (key, rows, values) in results {
        let column = out.ensure_column(key);
        for (r, value) in rows.into_iter().zip(values) {
            if let Some(target) = positions[r] {
                out.set_at(target, column, Some(value));
            }
        }
    }
    Ok(out)
}

// ── Base / dummy series ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DateSpec {
    /// Inclusive range.
    Range { start: NaiveDate, end: NaiveDate },
    Start { start: NaiveDate, periods: usize },
    /// Explicit dates; sorted and deduplicated.
    Dates(Vec<NaiveDate>),
}

#[derive(Debug, Clone)]
pub struct BaseSpec {
    pub variable: String,
    pub dates: DateSpec,
    pub frequency: Frequency,
    /// Cumulative count 1, 2, 3, ... instead of constant 1.
    pub increasing: bool,
    pub negative: bool,
    /// Panels to broadcast over; empty means no panel level.
    pub panels: Vec<String>,
}

impl BaseSpec {
    pub fn new(variable: impl Into<String>, dates: DateSpec) -> Self {
        Self {
            variable: variable.into(),
            dates,
            frequency: Frequency::default(),
            increasing: false,
            negative: false,
            panels: Vec::new(),
        }
    }

    pub fn frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn increasing(mut self, increasing: bool) -> Self {
        self.increasing = increasing;
        self
    }

    pub fn negative(mut self, negative: bool) -> Self {
        self.negative = negative;
        self
    }

    pub fn panels<I, S>(mut self, panels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.panels = panels.into_iter().map(Into::into).collect();
        self
    }

    fn index_names(&self) -> Vec<String> {
        if self.panels.is_empty() {
            vec![timeseries::PERIOD.to_string()]
        } else {
            vec![timeseries::PANEL.to_string(), timeseries::PERIOD.to_string()]
        }
    }
}

/// Build a dummy regressor over the requested dates, per panel if any.
pub fn create_base(spec: &BaseSpec) -> Result<Series, MixError> {
    let dates = match &spec.dates {
        DateSpec::Range { start, end } => date_range(*start, *end, spec.frequency),
        DateSpec::Start { start, periods } => date_periods(*start, *periods, spec.frequency),
        DateSpec::Dates(dates) => {
            let mut dates = dates.clone();
            dates.sort();
            dates.dedup();
            dates
        }
    };
    if dates.is_empty() {
        return Err(MixError::Validation(format!(
            "base '{}' covers no periods",
            spec.variable
        )));
    }

    let sign = if spec.negative { -1.0 } else { 1.0 };
    let values: Vec<f64> = (1..=dates.len())
        .map(|i| sign * if spec.increasing { i as f64 } else { 1.0 })
        .collect();

    let mut series = Series::new(spec.variable.clone(), spec.index_names());
    let panels: Vec<Option<&String>> = if spec.panels.is_empty() {
        vec![None]
    } else {
        spec.panels.iter().map(Some).collect()
    };
    for panel in panels {
        for (date, value) in dates.iter().zip(&values) {
            let mut key: RowKey = panel.into_iter().cloned().collect();
            key.push(format_period(*date));
            series.push(key, Some(*value));
        }
    }
    Ok(series)
}

/// Several base specs in one frame; specs sharing a variable are summed.
/// Rows are sorted.
pub fn create_base_frame(specs: &[BaseSpec]) -> Result<Frame<String>, MixError> {
    let Some(first) = specs.first() else {
        return Ok(Frame::new([timeseries::PERIOD]));
    };
    let index_names = first.index_names();
    let mut frame: Frame<String> = Frame::new(index_names.clone());
    for spec in specs {
        if spec.index_names() != index_names {
            return Err(MixError::Validation(format!(
                "base '{}' mixes panelled and unpanelled specs",
                spec.variable
            )));
        }
        let series = create_base(spec)?;
        for (key, value) in series.index.into_iter().zip(series.values) {
            if let Some(v) = value {
                frame.accumulate(key, spec.variable.clone(), v);
            }
        }
    }
    let mut rows = frame.rows().to_vec();
    rows.sort();
    Ok(frame.reindex_rows(&rows))
}

// ── Spread of sparse observations ───────────────────────────────────────────

/// Spread each observed value evenly over the adjacent run of missing
/// values: the run before it when `prior`, the run after it otherwise.
/// Gaps no observation reaches stay missing.
pub fn spread_observed(values: &[Option<f64>], prior: bool) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let observed: Vec<usize> = (0..values.len()).filter(|&i| values[i].is_some()).collect();
    let mut run_start = 0;
    for (n, &i) in observed.iter().enumerate() {
        let Some(v) = values[i] else { continue };
        let span = if prior {
            let span = run_start..i + 1;
            run_start = i + 1;
            span
        } else {
            let end = observed.get(n + 1).copied().unwrap_or(values.len());
            i..end
        };
        let share = v / span.len() as f64;
        for slot in &mut out[span] {
            *slot = Some(share);
        }
    }
    out
}

/// [`spread_observed`] down every column, within each panel.
pub fn spread_observed_frame<C: Label>(frame: &Frame<C>, prior: bool) -> Frame<C> {
    let mut out = frame.clone();
    for (_, rows) in frame.panel_groups() {
        for c in 0..frame.n_columns() {
            let column = frame.column_at(c);
            let values: Vec<Option<f64>> = rows.iter().map(|&r| column[r]).collect();
            for (&r, value) in rows.iter().zip(spread_observed(&values, prior)) {
                out.set_at(r, c, value);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::parse_period;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{actual:?} != {expected:?}");
        }
    }

    fn key(parts: &[&str]) -> RowKey {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn d(s: &str) -> NaiveDate {
        parse_period(s).unwrap()
    }

    const SPEND: [f64; 6] = [100.0, 50.0, 10.0, 0.0, 0.0, 0.0];

    #[test]
    fn test_decay_only() {
        let out = apply_decay_power_lag(&SPEND, 0.5, 1.0, 0);
        assert_close(&out, &[100.0, 100.0, 60.0, 30.0, 15.0, 7.5]);
    }

    #[test]
    fn test_identity_parameters() {
        let x = [3.5, -1.0, 0.0, 1e6];
        assert_eq!(apply_decay_power_lag(&x, 0.0, 1.0, 0), x.to_vec());
    }

    #[test]
    fn test_power_and_lag() {
        let powered = apply_decay_power_lag(&SPEND[..4], 0.0, 0.9, 0);
        assert_close(&powered, &[63.0957, 33.8122, 7.9433, 0.0]);

        let lagged = apply_decay_power_lag(&SPEND, 0.0, 1.0, 4);
        assert_close(&lagged, &[0.0, 0.0, 0.0, 0.0, 100.0, 50.0]);

        let all = apply_decay_power_lag(&SPEND, 0.5, 0.4, 2);
        assert_close(&all, &[0.0, 0.0, 6.30957, 6.30957, 5.14352, 3.89806]);
    }

    #[test]
    fn test_negative_base_and_lead() {
        let out = apply_decay_power_lag(&[-4.0, 9.0], 0.0, 0.5, 0);
        assert_close(&out, &[0.0, 3.0]);
        let lead = apply_decay_power_lag(&[1.0, 2.0, 3.0], 0.0, 1.0, -1);
        assert_close(&lead, &[2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_series_labels_stay_fixed() {
        let mut series = Series::new("A", vec!["Period".into()]);
        series.push(key(&["t1"]), Some(100.0));
        series.push(key(&["t2"]), None);
        let out = series.apply_decay_power_lag(0.0, 1.0, 1);
        assert_eq!(out.index, series.index);
        assert_eq!(out.values, vec![Some(0.0), Some(100.0)]);
    }

    fn panel_matrix() -> Frame<String> {
        let mut m: Frame<String> = Frame::new(["Panel", "Period"]);
        let data = [
            ("METRO", [10.0, 20.0, 30.0]),
            ("REGIONAL", [1.0, 2.0, 3.0]),
            ("VILLAGE", [5.0, 5.0, 5.0]),
        ];
        for (panel, values) in data {
            for (t, v) in values.iter().enumerate() {
                m.set(key(&[panel, &t.to_string()]), "A".into(), Some(*v));
            }
        }
        m
    }

    #[test]
    fn test_named_panels_leave_others_absent() {
        let m = panel_matrix();
        let scopes = vec![
            (PanelScope::Panel(key(&["METRO"])), vec![TransformKey::new("A", 0.0, 1.0, 1)]),
            (
                PanelScope::Panel(key(&["REGIONAL"])),
                vec![TransformKey::new("A", 0.0, 1.0, 1), TransformKey::new("A", 0.0, 1.0, 2)],
            ),
        ];
        let out = apply_transforms(&m, &scopes).unwrap();

        assert_eq!(out.n_rows(), 6);
        assert!(out.row_position(&key(&["VILLAGE", "0"])).is_none());
        let lag1 = TransformKey::new("A", 0.0, 1.0, 1);
        let lag2 = TransformKey::new("A", 0.0, 1.0, 2);
        assert_eq!(out.get(&key(&["METRO", "1"]), &lag1), Some(10.0));
        assert_eq!(out.get(&key(&["REGIONAL", "0"]), &lag1), Some(0.0));
        assert_eq!(out.get(&key(&["REGIONAL", "2"]), &lag2), Some(1.0));
        assert_eq!(out.get(&key(&["METRO", "2"]), &lag2), None);
    }

    #[test]
    fn test_per_panel_history_does_not_leak() {
        let m = panel_matrix();
        let adstock = TransformKey::new("A", 0.5, 1.0, 0);
        let scoped =
            apply_transforms(&m, &[(PanelScope::PerPanel, vec![adstock.clone()])]).unwrap();
        assert_eq!(scoped.get(&key(&["REGIONAL", "0"]), &adstock), Some(1.0));

        let global = apply_transforms(&m, &[(PanelScope::Global, vec![adstock.clone()])]).unwrap();
        assert_eq!(global.get(&key(&["REGIONAL", "0"]), &adstock), Some(1.0 + 0.5 * 42.5));
    }

    #[test]
    fn test_intercept_defaults_and_unknown_variable() {
        let m = panel_matrix();
        let intercept = vec![TransformKey::intercept()];
        let out = apply_transforms(&m, &[(PanelScope::PerPanel, intercept)]).unwrap();
        assert!(out.column(&TransformKey::intercept()).unwrap().iter().all(|v| *v == Some(1.0)));

        let err = apply_transforms(&m, &[(PanelScope::Global, vec![TransformKey::raw("B")])]);
        assert!(matches!(err, Err(MixError::ColumnNotFound(_))));
    }

    #[test]
    fn test_base_two_point_dates() {
        let spec = BaseSpec::new("var1", DateSpec::Dates(vec![d("2020-04-07"), d("2020-03-10")]));
        let series = create_base(&spec).unwrap();
        assert_eq!(series.index, vec![key(&["2020-03-10"]), key(&["2020-04-07"])]);
        assert_eq!(series.values, vec![Some(1.0), Some(1.0)]);
    }

    #[test]
    fn test_base_increasing_negative_panels() {
        let spec = BaseSpec::new(
            "trend",
            DateSpec::Start {
                start: d("2020-03-10"),
                periods: 3,
            },
        )
        .increasing(true)
        .negative(true)
        .panels(["p1", "p2"]);
        let series = create_base(&spec).unwrap();
        assert_eq!(series.len(), 6);
        assert_eq!(series.get(&key(&["p2", "2020-03-24"])), Some(-3.0));
    }

    #[test]
    fn test_base_frame_sums_per_variable() {
        let specs = vec![
            BaseSpec::new("var2", DateSpec::Dates(vec![d("2020-03-10"), d("2020-04-07")]))
                .panels(["panel1"]),
            BaseSpec::new(
                "var2",
                DateSpec::Range {
                    start: d("2020-03-10"),
                    end: d("2020-04-07"),
                },
            )
            .frequency("7D".parse().unwrap())
            .panels(["panel1"]),
            BaseSpec::new(
                "var3",
                DateSpec::Range {
                    start: d("2020-03-10"),
                    end: d("2020-04-06"),
                },
            )
            .panels(["panel2"]),
        ];
        let frame = create_base_frame(&specs).unwrap();
        let var2: Vec<Option<f64>> = frame
            .column(&"var2".to_string())
            .unwrap()
            .iter()
            .take(5)
            .copied()
            .collect();
        assert_eq!(var2, vec![Some(2.0), Some(1.0), Some(1.0), Some(1.0), Some(2.0)]);
        let var3 = frame.column(&"var3".to_string()).unwrap();
        assert_eq!(var3.iter().filter(|v| **v == Some(1.0)).count(), 4);
        assert_eq!(frame.n_rows(), 9);
    }

    #[test]
    fn test_spread_observed_prior() {
        let n = None;
        let spend = [Some(34.0), n, n, Some(30.0), Some(13.0), n, Some(20.0), n, Some(40.0)];
        let spread: Vec<f64> =
            spread_observed(&spend, true).into_iter().map(|v| v.unwrap()).collect();
        assert_close(&spread, &[34.0, 10.0, 10.0, 10.0, 13.0, 10.0, 10.0, 20.0, 20.0]);

        let volume = [n, n, Some(6.0), n, n, n, Some(7.0), n, n];
        let spread = spread_observed(&volume, true);
        assert_eq!(&spread[..3], &[Some(2.0); 3]);
        assert_eq!(&spread[3..7], &[Some(1.75); 4]);
        assert_eq!(&spread[7..], &[None, None]);
    }

    #[test]
    fn test_spread_observed_following() {
        let n = None;
        let spend = [Some(34.0), n, n, Some(30.0), Some(13.0), n, Some(20.0), n, Some(40.0)];
        let spread: Vec<f64> =
            spread_observed(&spend, false).into_iter().map(|v| v.unwrap()).collect();
        let third = 34.0 / 3.0;
        assert_close(&spread, &[third, third, third, 30.0, 6.5, 6.5, 10.0, 10.0, 40.0]);

        let volume = [n, n, Some(6.0), n, n, n, Some(7.0), n, n];
        let spread = spread_observed(&volume, false);
        assert_eq!(&spread[..2], &[None, None]);
        assert_eq!(&spread[2..6], &[Some(1.5); 4]);
        assert!((spread[8].unwrap() - 7.0 / 3.0).abs() < 1e-12);
    }
}
