//! Labeled two-axis container for modeling data.
//!
//! A `Frame` maps an ordered row key (panel levels, usually ending in a
//! period label) and a column label to an optional value. `None` means
//! "no value" and is kept distinct from an observed zero. Rows and columns
//! keep insertion order and are unique, so a (row, column) pair never
//! appears twice.
//!
//! Arithmetic never aligns implicitly: callers pick a row set with
//! [`align`] and [`Frame::reindex_rows`] first, then combine cells with the
//! missing-aware helpers below.
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use polars::prelude::{Column, DataFrame};

use crate::error::MixError;

/// Ordered tuple of index values identifying one row.
pub type RowKey = Vec<String>;

/// A column label that can be flattened into named index levels.
pub trait Label: Clone + Eq + Hash + Debug {
    /// Level values, outermost first.
    fn parts(&self) -> Vec<String>;

    /// Level names matching `parts`.
    fn level_names(&self) -> Vec<String>;

    fn display_name(&self) -> String {
        self.parts().join(":")
    }
}

impl Label for String {
    fn parts(&self) -> Vec<String> {
        vec![self.clone()]
    }

    fn level_names(&self) -> Vec<String> {
        vec![crate::schema::transform::VARIABLE.to_string()]
    }

    fn display_name(&self) -> String {
        self.clone()
    }
}

/// Row-join policy used by [`align`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// Keys present on both sides, in left order.
    Inner,
    /// Every left key, in left order.
    Left,
    /// Left keys followed by right-only keys.
    Outer,
}

/// Compute the row set for combining two keyed sides.
pub fn align(left: &[RowKey], right: &[RowKey], join: Join) -> Vec<RowKey> {
    match join {
        Join::Left => left.to_vec(),
        Join::Inner => {
            let right: HashSet<&RowKey> = right.iter().collect();
            left.iter().filter(|k| right.contains(k)).cloned().collect()
        }
        Join::Outer => {
            let mut seen: HashSet<&RowKey> = left.iter().collect();
            let mut out = left.to_vec();
            for key in right {
                if seen.insert(key) {
                    out.push(key.clone());
                }
            }
            out
        }
    }
}

// ── Missing-value arithmetic ────────────────────────────────────────────────

/// Sum of present values; `None` when nothing is present.
pub fn sum_present<I: IntoIterator<Item = Option<f64>>>(values: I) -> Option<f64> {
    values.into_iter().flatten().fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// Mean of present values; `None` when nothing is present.
pub fn mean_present<I: IntoIterator<Item = Option<f64>>>(values: I) -> Option<f64> {
    let (total, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(t, n), v| (t + v, n + 1));
    (count > 0).then(|| total / count as f64)
}

pub fn add(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? + b?)
}

pub fn sub(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? - b?)
}

pub fn mul(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? * b?)
}

/// Division; a missing or zero denominator yields `None`.
pub fn div(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    let b = b?;
    if b == 0.0 {
        return None;
    }
    Some(a? / b)
}

// ── Frame ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Frame<C: Label> {
    index_names: Vec<String>,
    rows: Vec<RowKey>,
    row_pos: HashMap<RowKey, usize>,
    columns: Vec<C>,
    col_pos: HashMap<C, usize>,
    /// Column-major cells, `data[column][row]`.
    data: Vec<Vec<Option<f64>>>,
}

impl<C: Label> Frame<C> {
    pub fn new<S: Into<String>>(index_names: impl IntoIterator<Item = S>) -> Self {
        Self {
            index_names: index_names.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
            row_pos: HashMap::new(),
            columns: Vec::new(),
            col_pos: HashMap::new(),
            data: Vec::new(),
        }
    }

    /// Empty frame sharing this frame's index names.
    pub fn empty_like<D: Label>(&self) -> Frame<D> {
        Frame::new(self.index_names.iter().cloned())
    }

    pub fn index_names(&self) -> &[String] {
        &self.index_names
    }

    /// Number of row-index levels.
    pub fn depth(&self) -> usize {
        self.index_names.len()
    }

    pub fn rows(&self) -> &[RowKey] {
        &self.rows
    }

    pub fn columns(&self) -> &[C] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    pub fn row_position(&self, row: &[String]) -> Option<usize> {
        self.row_pos.get(row).copied()
    }

    pub fn column_position(&self, column: &C) -> Option<usize> {
        self.col_pos.get(column).copied()
    }

    pub fn contains_column(&self, column: &C) -> bool {
        self.col_pos.contains_key(column)
    }

    /// Position of `row`, appending it (all cells missing) if new.
    pub fn ensure_row(&mut self, row: RowKey) -> usize {
        if let Some(&pos) = self.row_pos.get(&row) {
            return pos;
        }
        let pos = self.rows.len();
        self.row_pos.insert(row.clone(), pos);
        self.rows.push(row);
        for cells in &mut self.data {
            cells.push(None);
        }
        pos
    }

    /// Position of `column`, appending it (all cells missing) if new.
    pub fn ensure_column(&mut self, column: C) -> usize {
        if let Some(&pos) = self.col_pos.get(&column) {
            return pos;
        }
        let pos = self.columns.len();
        self.col_pos.insert(column.clone(), pos);
        self.columns.push(column);
        self.data.push(vec![None; self.rows.len()]);
        pos
    }

    pub fn get(&self, row: &[String], column: &C) -> Option<f64> {
        let r = self.row_position(row)?;
        let c = self.column_position(column)?;
        self.data[c][r]
    }

    pub fn get_at(&self, row: usize, column: usize) -> Option<f64> {
        self.data.get(column).and_then(|cells| cells.get(row)).copied().flatten()
    }

    pub fn set(&mut self, row: RowKey, column: C, value: Option<f64>) {
        let r = self.ensure_row(row);
        let c = self.ensure_column(column);
        self.data[c][r] = value;
    }

    pub fn set_at(&mut self, row: usize, column: usize, value: Option<f64>) {
        self.data[column][row] = value;
    }

    /// Add `value` to the cell, treating a missing cell as the first term.
    pub fn accumulate(&mut self, row: RowKey, column: C, value: f64) {
        let r = self.ensure_row(row);
        let c = self.ensure_column(column);
        let cell = &mut self.data[c][r];
        *cell = Some(cell.unwrap_or(0.0) + value);
    }

    pub fn column(&self, column: &C) -> Option<&[Option<f64>]> {
        self.column_position(column).map(|c| self.data[c].as_slice())
    }

    pub fn column_at(&self, column: usize) -> &[Option<f64>] {
        &self.data[column]
    }

    pub fn row_values(&self, row: usize) -> impl Iterator<Item = Option<f64>> + '_ {
        self.data.iter().map(move |cells| cells[row])
    }

    /// Sum of the present cells of a row.
    pub fn row_sum(&self, row: usize) -> Option<f64> {
        sum_present(self.row_values(row))
    }

    /// Panel levels of a row: every level except the last (period) one.
    pub fn panel_of(&self, row: usize) -> &[String] {
        let key = &self.rows[row];
        &key[..key.len().saturating_sub(1)]
    }

    /// Row positions grouped by panel, groups in first-seen order.
    pub fn panel_groups(&self) -> Vec<(Vec<String>, Vec<usize>)> {
        let mut order: Vec<(Vec<String>, Vec<usize>)> = Vec::new();
        let mut lookup: HashMap<&[String], usize> = HashMap::new();
        for r in 0..self.rows.len() {
            let panel = self.panel_of(r);
            match lookup.get(panel) {
                Some(&g) => order[g].1.push(r),
                None => {
                    lookup.insert(panel, order.len());
                    order.push((panel.to_vec(), vec![r]));
                }
            }
        }
        order
    }

    /// Keep the rows matching `keep`, preserving order and columns.
    pub fn filter_rows<F: Fn(&[String]) -> bool>(&self, keep: F) -> Frame<C> {
        let selected: Vec<RowKey> = self
            .rows
            .iter()
            .filter(|r| keep(r.as_slice()))
            .cloned()
            .collect();
        self.reindex_rows(&selected)
    }

    /// Frame over exactly `rows`; rows unknown to `self` are all-missing.
    pub fn reindex_rows(&self, rows: &[RowKey]) -> Frame<C> {
        let mut out: Frame<C> = self.empty_like();
        for column in &self.columns {
            out.ensure_column(column.clone());
        }
        for row in rows {
            let r = out.ensure_row(row.clone());
            if let Some(src) = self.row_position(row) {
                for c in 0..self.columns.len() {
                    out.data[c][r] = self.data[c][src];
                }
            }
        }
        out
    }

    /// Relabel columns; two columns landing on one label is an error.
    pub fn map_columns<D: Label, F: Fn(&C) -> D>(&self, relabel: F) -> Result<Frame<D>, MixError> {
        let mut out: Frame<D> = self.empty_like();
        for row in &self.rows {
            out.ensure_row(row.clone());
        }
        for (c, column) in self.columns.iter().enumerate() {
            let label = relabel(column);
            if out.contains_column(&label) {
                return Err(MixError::DuplicateColumn(label.display_name()));
            }
            let pos = out.ensure_column(label);
            out.data[pos] = self.data[c].clone();
        }
        Ok(out)
    }

    /// Append `other`'s columns, taking the outer union of rows.
    pub fn concat_columns(&mut self, other: &Frame<C>) -> Result<(), MixError> {
        if other.depth() != self.depth() && !self.rows.is_empty() {
            return Err(MixError::Validation(format!(
                "cannot concatenate frames with {} and {} index levels",
                self.depth(),
                other.depth()
            )));
        }
        if self.rows.is_empty() && self.columns.is_empty() {
            self.index_names = other.index_names.clone();
        }
        for column in &other.columns {
            if self.contains_column(column) {
                return Err(MixError::DuplicateColumn(column.display_name()));
            }
        }
        for row in align(&self.rows, &other.rows, Join::Outer) {
            self.ensure_row(row);
        }
        for (c, column) in other.columns.iter().enumerate() {
            let pos = self.ensure_column(column.clone());
            for (r, row) in other.rows.iter().enumerate() {
                let target = self.row_pos[row];
                self.data[pos][target] = other.data[c][r];
            }
        }
        Ok(())
    }

    /// Append `other`'s rows, taking the union of columns.
    pub fn concat_rows(&mut self, other: &Frame<C>) -> Result<(), MixError> {
        if self.rows.is_empty() && self.columns.is_empty() {
            self.index_names = other.index_names.clone();
        }
        for (r, row) in other.rows.iter().enumerate() {
            if self.row_pos.contains_key(row) {
                return Err(MixError::Validation(format!(
                    "row {:?} present in both frames",
                    row
                )));
            }
            let target = self.ensure_row(row.clone());
            for (c, column) in other.columns.iter().enumerate() {
                let pos = self.ensure_column(column.clone());
                self.data[pos][target] = other.data[c][r];
            }
        }
        Ok(())
    }

    /// Export as a polars DataFrame: one Utf8 column per index level,
    /// then one Float64 column per label (named by `display_name`).
    pub fn to_dataframe(&self) -> Result<DataFrame, MixError> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.depth() + self.columns.len());
        for (level, name) in self.index_names.iter().enumerate() {
            let values: Vec<String> = self
                .rows
                .iter()
                .map(|r| r.get(level).cloned().unwrap_or_default())
                .collect();
            columns.push(Column::new(name.as_str().into(), &values));
        }
        for (c, label) in self.columns.iter().enumerate() {
            columns.push(Column::new(label.display_name().into(), &self.data[c]));
        }
        Ok(DataFrame::new(columns)?)
    }
}

/// A single labeled column of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub index_names: Vec<String>,
    pub index: Vec<RowKey>,
    pub values: Vec<Option<f64>>,
}

impl Series {
    pub fn new(name: impl Into<String>, index_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            index_names,
            index: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, key: RowKey, value: Option<f64>) {
        self.index.push(key);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &[String]) -> Option<f64> {
        self.index
            .iter()
            .position(|k| k.as_slice() == key)
            .and_then(|i| self.values[i])
    }

    /// Copy one column out of a frame.
    pub fn from_column<C: Label>(frame: &Frame<C>, column: &C) -> Result<Self, MixError> {
        let values = frame
            .column(column)
            .ok_or_else(|| MixError::ColumnNotFound(column.display_name()))?;
        Ok(Self {
            name: column.display_name(),
            index_names: frame.index_names().to_vec(),
            index: frame.rows().to_vec(),
            values: values.to_vec(),
        })
    }

    /// Values aligned to `rows`; keys absent from the series are missing.
    pub fn reindex(&self, rows: &[RowKey]) -> Vec<Option<f64>> {
        let lookup: HashMap<&RowKey, usize> =
            self.index.iter().enumerate().rev().map(|(i, k)| (k, i)).collect();
        rows.iter()
            .map(|r| lookup.get(r).and_then(|&i| self.values[i]))
            .collect()
    }

    pub fn into_frame(self) -> Frame<String> {
        let mut frame = Frame::new(self.index_names);
        let column = frame.ensure_column(self.name);
        for (key, value) in self.index.into_iter().zip(self.values) {
            let row = frame.ensure_row(key);
            frame.set_at(row, column, value);
        }
        frame
    }
}
