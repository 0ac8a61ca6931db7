//! Coefficient-weighted decomposition of a response.
use std::collections::HashMap;

use chrono::NaiveDate;

use crate::calendar::parse_period;
use crate::error::MixError;
use crate::frame::{div, mul, sub, sum_present, Frame, Label, RowKey, Series};
use crate::schema::{assessment, transform};
use crate::transform::{apply_transforms, PanelScope, TransformKey};

#[derive(Debug, Clone, PartialEq)]
pub struct CoefEntry {
    /// Empty for a global coefficient.
    pub panel: RowKey,
    pub key: TransformKey,
    pub value: f64,
}

/// Fitted coefficients, optionally nested under panel keys.
#[derive(Debug, Clone, Default)]
pub struct Coefficients {
    entries: Vec<CoefEntry>,
}

impl Coefficients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, panel: RowKey, key: TransformKey, value: f64) {
        self.entries.push(CoefEntry { panel, key, value });
    }

    pub fn global(mut self, key: TransformKey, value: f64) -> Self {
        self.push(Vec::new(), key, value);
        self
    }

    pub fn nested(mut self, panel: RowKey, key: TransformKey, value: f64) -> Self {
        self.push(panel, key, value);
        self
    }

    pub fn entries(&self) -> &[CoefEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of panel levels every entry is nested under.
    pub fn panel_depth(&self) -> Result<usize, MixError> {
        let mut depths = self.entries.iter().map(|e| e.panel.len());
        let first = depths.next().unwrap_or(0);
        if depths.any(|d| d != first) {
            return Err(MixError::Validation(
                "coefficients mix different panel nesting depths".to_string(),
            ));
        }
        Ok(first)
    }

    /// Distinct transform keys in first-seen order.
    pub fn keys(&self) -> Vec<TransformKey> {
        let mut keys: Vec<TransformKey> = Vec::new();
        for entry in &self.entries {
            if !keys.contains(&entry.key) {
                keys.push(entry.key.clone());
            }
        }
        keys
    }

    /// Entries restricted to `keep`.
    pub fn filter<F: Fn(&CoefEntry) -> bool>(&self, keep: F) -> Coefficients {
        Coefficients {
            entries: self.entries.iter().filter(|e| keep(e)).cloned().collect(),
        }
    }

    fn scopes(&self, matrix_panel_depth: usize) -> Vec<(PanelScope, Vec<TransformKey>)> {
        if self.entries.iter().all(|e| e.panel.is_empty()) {
            let scope = if matrix_panel_depth > 0 {
                PanelScope::PerPanel
            } else {
                PanelScope::Global
            };
            return vec![(scope, self.keys())];
        }
        let mut scopes: Vec<(PanelScope, Vec<TransformKey>)> = Vec::new();
        for entry in &self.entries {
            let scope = PanelScope::Panel(entry.panel.clone());
            match scopes.iter_mut().find(|(s, _)| *s == scope) {
                Some((_, keys)) if keys.contains(&entry.key) => {}
                Some((_, keys)) => keys.push(entry.key.clone()),
                None => scopes.push((scope, vec![entry.key.clone()])),
            }
        }
        scopes
    }
}

/// Contribution of each coefficient's transformed regressor per row.
///
/// Coefficients must be global or nested exactly as deep as the matrix's
/// panel levels (every level but the period). With a `dependent`, a
/// `Residual` column makes each row sum to the dependent value.
pub fn decompose(
    matrix: &Frame<String>,
    coefficients: &Coefficients,
    dependent: Option<&Series>,
) -> Result<Frame<TransformKey>, MixError> {
    let coef_depth = coefficients.panel_depth()?;
    let matrix_depth = matrix.depth().saturating_sub(1);
    if coef_depth != 0 && coef_depth != matrix_depth {
        return Err(MixError::ShapeMismatch {
            coefficients: coef_depth,
            matrix: matrix_depth,
        });
    }

    let mut out = apply_transforms(matrix, &coefficients.scopes(matrix_depth))?;

    let lookup: HashMap<(&[String], &TransformKey), f64> = coefficients
        .entries()
        .iter()
        .map(|e| ((e.panel.as_slice(), &e.key), e.value))
        .collect();
    let columns = out.columns().to_vec();
    for (c, key) in columns.iter().enumerate() {
        for r in 0..out.n_rows() {
            let panel: &[String] = if coef_depth == 0 { &[] } else { out.panel_of(r) };
            let coef = lookup.get(&(panel, key)).copied();
            let value = mul(out.get_at(r, c), coef);
            out.set_at(r, c, value);
        }
    }

    if let Some(dependent) = dependent {
        let observed = dependent.reindex(out.rows());
        let residuals: Vec<Option<f64>> = (0..out.n_rows())
            .map(|r| sub(observed[r], Some(out.row_sum(r).unwrap_or(0.0))))
            .collect();
        let column = out.ensure_column(TransformKey::residual());
        for (r, value) in residuals.into_iter().enumerate() {
            out.set_at(r, column, value);
        }
    }
    Ok(out)
}

/// Dependent, prediction and error per row of a decomposition carrying a
/// `Residual` column.
pub fn assess_error(decomposition: &Frame<TransformKey>) -> Result<Frame<String>, MixError> {
    let residual_key = TransformKey::residual();
    let residual_col = decomposition
        .column_position(&residual_key)
        .ok_or_else(|| MixError::MissingColumn(transform::RESIDUAL.to_string()))?;

    let mut out: Frame<String> = decomposition.empty_like();
    for (r, row) in decomposition.rows().iter().enumerate() {
        let predicted = sum_present(
            decomposition
                .row_values(r)
                .enumerate()
                .filter(|(c, _)| *c != residual_col)
                .map(|(_, v)| v),
        )
        .or(Some(0.0));
        let error = decomposition.get_at(r, residual_col);
        let dependent = error.and_then(|e| predicted.map(|p| p + e));
        out.set(row.clone(), assessment::DEPENDENT.to_string(), dependent);
        out.set(row.clone(), assessment::PREDICTED.to_string(), predicted);
        out.set(row.clone(), assessment::ERROR.to_string(), error);
        out.set(row.clone(), assessment::ERROR_PCT.to_string(), div(error, dependent));
    }
    Ok(out)
}

/// Named inclusive date window.
#[derive(Debug, Clone, PartialEq)]
pub struct DateWindow {
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(name: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            name: name.into(),
            start,
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Sum every panel × column over each window. The period level of the
/// result holds the window name; windows with no present value are missing.
pub fn collapse_date<C: Label>(
    frame: &Frame<C>,
    windows: &[DateWindow],
) -> Result<Frame<C>, MixError> {
    let dates = frame
        .rows()
        .iter()
        .map(|row| match row.last() {
            Some(period) => parse_period(period),
            None => Err(MixError::InvalidData("row key has no period level".to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: Frame<C> = frame.empty_like();
    for column in frame.columns() {
        out.ensure_column(column.clone());
    }
    for (panel, rows) in frame.panel_groups() {
        for window in windows {
            let inside: Vec<usize> = rows
                .iter()
                .copied()
                .filter(|&r| window.contains(dates[r]))
                .collect();
            let mut key = panel.clone();
            key.push(window.name.clone());
            let target = out.ensure_row(key);
            for c in 0..frame.n_columns() {
                let column = frame.column_at(c);
                out.set_at(target, c, sum_present(inside.iter().map(|&r| column[r])));
            }
        }
    }
    Ok(out)
}
