//! Roll modeling data up across panel and variable groups, and split it
//! back down in proportion to a disaggregated reference.
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::MixError;
use crate::frame::{mul, sum_present, Frame, Label, RowKey};
use crate::reshape::WideColumn;

/// Group name → member names.
pub type GroupMap = BTreeMap<String, Vec<String>>;

/// Axis a grouping applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Panel,
    Variable,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Panel => write!(f, "panel"),
            Axis::Variable => write!(f, "variable"),
        }
    }
}

/// Panel and variable groupings, plus the row level holding panel names.
#[derive(Debug, Clone, Default)]
pub struct Grouping {
    pub panels: GroupMap,
    pub variables: GroupMap,
    pub panel_level: usize,
}

impl Grouping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn panel_group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.panels
            .insert(name.into(), members.into_iter().map(Into::into).collect());
        self
    }

    pub fn variable_group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables
            .insert(name.into(), members.into_iter().map(Into::into).collect());
        self
    }

    pub fn panel_level(mut self, level: usize) -> Self {
        self.panel_level = level;
        self
    }

    fn panels_only(&self) -> Grouping {
        Grouping {
            panels: self.panels.clone(),
            variables: GroupMap::new(),
            panel_level: self.panel_level,
        }
    }
}

/// Column labels that carry a renamable variable name.
pub trait VariableLabel: Label {
    fn variable(&self) -> &str;
    fn with_variable(&self, variable: &str) -> Self;
}

impl VariableLabel for String {
    fn variable(&self) -> &str {
        self
    }

    fn with_variable(&self, variable: &str) -> Self {
        variable.to_string()
    }
}

impl VariableLabel for WideColumn {
    fn variable(&self) -> &str {
        &self.variable
    }

    fn with_variable(&self, variable: &str) -> Self {
        WideColumn {
            variable: variable.to_string(),
            ..self.clone()
        }
    }
}

/// Member → group, rejecting members claimed by two groups.
pub fn invert_groups(groups: &GroupMap, axis: Axis) -> Result<HashMap<String, String>, MixError> {
    let mut inverted: HashMap<String, String> = HashMap::new();
    for (group, members) in groups {
        for member in members {
            if let Some(first) = inverted.get(member) {
                if first != group {
                    return Err(MixError::OverlappingGroup {
                        axis,
                        name: member.clone(),
                        first: first.clone(),
                        second: group.clone(),
                    });
                }
                continue;
            }
            inverted.insert(member.clone(), group.clone());
        }
    }
    Ok(inverted)
}

fn rename_row(row: &[String], level: usize, panels: &HashMap<String, String>) -> RowKey {
    let mut renamed = row.to_vec();
    if let Some(group) = row.get(level).and_then(|p| panels.get(p)) {
        renamed[level] = group.clone();
    }
    renamed
}

fn rename_column<C: VariableLabel>(column: &C, variables: &HashMap<String, String>) -> C {
    match variables.get(column.variable()) {
        Some(group) => column.with_variable(group),
        None => column.clone(),
    }
}

/// Roll members up into their groups.
///
/// Cells landing on the same group row and column are summed, or averaged
/// when `is_mean` accepts the resulting variable name. Missing cells are
/// skipped; a group cell with no present member stays missing.
pub fn aggregate<C, F>(
    matrix: &Frame<C>,
    grouping: &Grouping,
    is_mean: F,
) -> Result<Frame<C>, MixError>
where
    C: VariableLabel,
    F: Fn(&str) -> bool,
{
    let panels = invert_groups(&grouping.panels, Axis::Panel)?;
    let variables = invert_groups(&grouping.variables, Axis::Variable)?;

    let mut out: Frame<C> = matrix.empty_like();
    let row_targets: Vec<usize> = matrix
        .rows()
        .iter()
        .map(|row| out.ensure_row(rename_row(row, grouping.panel_level, &panels)))
        .collect();
    let col_targets: Vec<usize> = matrix
        .columns()
        .iter()
        .map(|column| out.ensure_column(rename_column(column, &variables)))
        .collect();

    let mut cells: HashMap<(usize, usize), (f64, usize)> = HashMap::new();
    for (c, &tc) in col_targets.iter().enumerate() {
        let column = matrix.column_at(c);
        for (r, &tr) in row_targets.iter().enumerate() {
            if let Some(v) = column[r] {
                let cell = cells.entry((tr, tc)).or_insert((0.0, 0));
                cell.0 += v;
                cell.1 += 1;
            }
        }
    }
    let means: Vec<bool> = out.columns().iter().map(|c| is_mean(c.variable())).collect();
    for ((r, c), (total, count)) in cells {
        let value = if means[c] { total / count as f64 } else { total };
        out.set_at(r, c, Some(value));
    }
    Ok(out)
}

/// Spread `total` over `parts` in proportion to each part's weight.
/// All-missing or zero-sum weights give missing parts.
fn split(total: Option<f64>, weights: &[Option<f64>]) -> Vec<Option<f64>> {
    let denominator = sum_present(weights.iter().copied());
    weights
        .iter()
        .map(|w| {
            let share = match denominator {
                Some(d) if d != 0.0 => w.map(|w| w / d),
                _ => None,
            };
            mul(total, share)
        })
        .collect()
}

/// Scale present `values` so they sum to `target`, spreading the shortfall
/// in proportion to the values themselves.
fn reconcile(values: &mut [&mut Option<f64>], target: f64) {
    let split_total: f64 = values.iter().filter_map(|v| **v).sum();
    if split_total == 0.0 {
        return;
    }
    let shortfall = target - split_total;
    for value in values.iter_mut() {
        if let Some(v) = value.as_mut() {
            *v += *v / split_total * shortfall;
        }
    }
}

/// Undo [`aggregate`] using `reference` for the split ratios.
///
/// Variable groups are split first, with shares taken from the reference
/// rolled up to the group panel level. Group panels are then split into
/// their member panels by each member's share of the group, per column.
/// `match_sum` rescales each split so it totals the aggregated value.
pub fn segregate<C: VariableLabel>(
    aggregated: &Frame<C>,
    reference: &Frame<C>,
    grouping: &Grouping,
    match_sum: bool,
) -> Result<Frame<C>, MixError> {
    let panels = invert_groups(&grouping.panels, Axis::Panel)?;
    invert_groups(&grouping.variables, Axis::Variable)?;

    let by_variable = segregate_variables(aggregated, reference, grouping, match_sum)?;
    Ok(segregate_panels(&by_variable, reference, grouping.panel_level, &panels, match_sum))
}

fn segregate_variables<C: VariableLabel>(
    aggregated: &Frame<C>,
    reference: &Frame<C>,
    grouping: &Grouping,
    match_sum: bool,
) -> Result<Frame<C>, MixError> {
    let shares = aggregate(reference, &grouping.panels_only(), |_| false)?;
    let mut out: Frame<C> = aggregated.empty_like();
    for row in aggregated.rows() {
        out.ensure_row(row.clone());
    }

    for (c, column) in aggregated.columns().iter().enumerate() {
        let source = aggregated.column_at(c);
        let Some(members) = grouping.variables.get(column.variable()) else {
            let target = out.ensure_column(column.clone());
            for (r, value) in source.iter().enumerate() {
                out.set_at(r, target, *value);
            }
            continue;
        };

        let member_columns: Vec<C> = members.iter().map(|m| column.with_variable(m)).collect();
        let targets: Vec<usize> = member_columns
            .iter()
            .map(|m| out.ensure_column(m.clone()))
            .collect();
        let mut split_cells: Vec<Vec<Option<f64>>> = Vec::with_capacity(out.n_rows());
        for (r, row) in aggregated.rows().iter().enumerate() {
            let weights: Vec<Option<f64>> =
                member_columns.iter().map(|m| shares.get(row, m)).collect();
            split_cells.push(split(source[r], &weights));
        }
        if match_sum {
            let target: f64 = source.iter().flatten().sum();
            let mut cells: Vec<&mut Option<f64>> = split_cells.iter_mut().flatten().collect();
            reconcile(&mut cells, target);
        }
        for (r, values) in split_cells.into_iter().enumerate() {
            for (&t, value) in targets.iter().zip(values) {
                out.set_at(r, t, value);
            }
        }
    }
    Ok(out)
}

fn segregate_panels<C: VariableLabel>(
    frame: &Frame<C>,
    reference: &Frame<C>,
    level: usize,
    panels: &HashMap<String, String>,
    match_sum: bool,
) -> Frame<C> {
    // Group row → member rows of the reference, in reference order. A
    // member may share its group's name.
    let mut members: HashMap<RowKey, Vec<usize>> = HashMap::new();
    for (r, row) in reference.rows().iter().enumerate() {
        if row.get(level).is_some_and(|p| panels.contains_key(p)) {
            members
                .entry(rename_row(row, level, panels))
                .or_default()
                .push(r);
        }
    }

    let mut out: Frame<C> = frame.empty_like();
    for column in frame.columns() {
        out.ensure_column(column.clone());
    }
    let ref_columns: Vec<Option<usize>> = frame
        .columns()
        .iter()
        .map(|c| reference.column_position(c))
        .collect();

    // Output cells per (group name, column) for reconciliation.
    let mut groups: BTreeMap<(String, usize), (f64, Vec<(usize, usize)>)> = BTreeMap::new();
    for (r, row) in frame.rows().iter().enumerate() {
        let Some(member_rows) = members.get(row) else {
            let target = out.ensure_row(row.clone());
            for c in 0..frame.n_columns() {
                out.set_at(target, c, frame.get_at(r, c));
            }
            continue;
        };
        let targets: Vec<usize> = member_rows
            .iter()
            .map(|&m| out.ensure_row(reference.rows()[m].clone()))
            .collect();
        let group = row.get(level).cloned().unwrap_or_default();
        for c in 0..frame.n_columns() {
            let weights: Vec<Option<f64>> = member_rows
                .iter()
                .map(|&m| ref_columns[c].and_then(|rc| reference.get_at(m, rc)))
                .collect();
            let total = frame.get_at(r, c);
            let entry = groups.entry((group.clone(), c)).or_insert((0.0, Vec::new()));
            entry.0 += total.unwrap_or(0.0);
            for (&t, value) in targets.iter().zip(split(total, &weights)) {
                out.set_at(t, c, value);
                entry.1.push((t, c));
            }
        }
    }

    if match_sum {
        for (target, cells) in groups.into_values() {
            let mut values: Vec<Option<f64>> =
                cells.iter().map(|&(r, c)| out.get_at(r, c)).collect();
            {
                let mut refs: Vec<&mut Option<f64>> = values.iter_mut().collect();
                reconcile(&mut refs, target);
            }
            for (&(r, c), value) in cells.iter().zip(values) {
                out.set_at(r, c, value);
            }
        }
    }
    out
}

// ── Variable-name parsing ───────────────────────────────────────────────────

/// Pick (or, with `anti`, drop) delimiter-separated parts of a name.
///
/// When every position is negative the name is split from the right at
/// most `max |position|` times. Positions past the end read as empty. The
/// joined result has trailing delimiters removed.
pub fn parse_variable(name: &str, positions: &[i32], delimiter: &str, anti: bool) -> String {
    let all_negative = !positions.is_empty() && positions.iter().all(|&p| p < 0);
    let parts: Vec<&str> = if all_negative {
        let splits = positions.iter().map(|p| p.unsigned_abs() as usize).max().unwrap_or(0);
        let mut parts: Vec<&str> = name.rsplitn(splits + 1, delimiter).collect();
        parts.reverse();
        parts
    } else {
        name.split(delimiter).collect()
    };
    let resolve = |p: i32| -> Option<usize> {
        let idx = if p < 0 { parts.len() as i64 + p as i64 } else { p as i64 };
        (idx >= 0).then_some(idx as usize)
    };

    let picked: Vec<&str> = if anti {
        let dropped: Vec<usize> = positions.iter().filter_map(|&p| resolve(p)).collect();
        parts
            .iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, s)| *s)
            .collect()
    } else {
        positions
            .iter()
            .map(|&p| resolve(p).and_then(|i| parts.get(i).copied()).unwrap_or(""))
            .collect()
    };
    picked.join(delimiter).trim_end_matches(delimiter).to_string()
}

/// Predicate accepting variable names whose parsed code is in `codes`.
pub fn code_predicate(
    codes: Vec<String>,
    positions: Vec<i32>,
    delimiter: String,
) -> impl Fn(&str) -> bool {
    move |name| {
        let code = parse_variable(name, &positions, &delimiter, false);
        codes.iter().any(|c| *c == code)
    }
}
