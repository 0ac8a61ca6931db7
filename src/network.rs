use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::decompose::{decompose, Coefficients};
use crate::error::MixError;
use crate::frame::{mul, sum_present, Frame, Label, RowKey, Series};
use crate::schema::{network, transform};
use crate::transform::TransformKey;

/// A transform key feeding a target node, optionally for one panel only.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAssignment {
    /// Empty applies to every panel.
    pub panel: RowKey,
    pub key: TransformKey,
    pub node: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeMap {
    assignments: Vec<NodeAssignment>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, key: TransformKey, node: impl Into<String>) -> Self {
        self.assignments.push(NodeAssignment {
            panel: Vec::new(),
            key,
            node: node.into(),
        });
        self
    }

    pub fn assign_in(mut self, panel: RowKey, key: TransformKey, node: impl Into<String>) -> Self {
        self.assignments.push(NodeAssignment {
            panel,
            key,
            node: node.into(),
        });
        self
    }

    /// Node for `key` in `panel`; a panel-specific assignment wins.
    pub fn node_of(&self, panel: &[String], key: &TransformKey) -> Option<&str> {
        let exact = self
            .assignments
            .iter()
            .find(|a| a.panel.as_slice() == panel && &a.key == key);
        exact
            .or_else(|| self.assignments.iter().find(|a| a.panel.is_empty() && &a.key == key))
            .map(|a| a.node.as_str())
    }
}

/// Column key of a network decomposition: target node, then transform key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeColumn {
    pub node: String,
    pub key: TransformKey,
}

impl Label for NodeColumn {
    fn parts(&self) -> Vec<String> {
        let mut parts = vec![self.node.clone()];
        parts.extend(self.key.parts());
        parts
    }

    fn level_names(&self) -> Vec<String> {
        let mut names = vec![network::NODE.to_string()];
        names.extend(self.key.level_names());
        names
    }

    fn display_name(&self) -> String {
        format!("{}:{}", self.node, self.key)
    }
}

/// Dependency graph between target nodes.
///
/// An edge `V -> T` exists when a key feeding `T` transforms variable `V`
/// and `V` is itself a target node.
struct NodeGraph {
    graph: DiGraph<String, usize>,
    node_map: HashMap<String, NodeIndex>,
}

impl NodeGraph {
    fn build(targets: &[(String, Vec<TransformKey>)]) -> Self {
        let mut graph = DiGraph::new();
        let mut node_map: HashMap<String, NodeIndex> = HashMap::new();
        for (node, _) in targets {
            node_map
                .entry(node.clone())
                .or_insert_with(|| graph.add_node(node.clone()));
        }
        for (node, keys) in targets {
            for key in keys {
                if let Some(&src) = node_map.get(&key.variable) {
                    let dst = node_map[node];
                    match graph.find_edge(src, dst) {
                        Some(edge) => graph[edge] += 1,
                        None => {
                            graph.add_edge(src, dst, 1);
                        }
                    }
                }
            }
        }
        Self { graph, node_map }
    }

    /// Nodes with every feeding node first.
    fn order(&self) -> Result<Vec<String>, MixError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            MixError::Validation(format!(
                "node network has a cycle through '{}'",
                self.graph[cycle.node_id()]
            ))
        })?;
        Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
    }

    fn contains(&self, node: &str) -> bool {
        self.node_map.contains_key(node)
    }
}

/// Decompose every target node by its own coefficients.
///
/// Each node's dependent is the matrix column of the same name. A node
/// consumed by N > 1 distinct keys gets an `_Adjustment_Factor_` column of
/// `-(N-1)/N × (Intercept + Residual)`, so that its base is counted once
/// across all N consumers. With panel-nested coefficients each panel runs
/// separately and the results are stacked.
pub fn decompose_network(
    matrix: &Frame<String>,
    coefficients: &Coefficients,
    nodes: &NodeMap,
) -> Result<Frame<NodeColumn>, MixError> {
    let depth = coefficients.panel_depth()?;
    if depth == 0 {
        return decompose_panel(matrix, coefficients, nodes, &[]);
    }

    let mut out: Frame<NodeColumn> = matrix.empty_like();
    for (panel, _) in matrix.panel_groups() {
        let panel_coefs = coefficients.filter(|e| e.panel == panel);
        if panel_coefs.is_empty() {
            continue;
        }
        let sub_matrix = matrix.filter_rows(|row| row.starts_with(&panel));
        let part = decompose_panel(&sub_matrix, &panel_coefs, nodes, &panel)?;
        out.concat_rows(&part)?;
    }
    Ok(out)
}

fn decompose_panel(
    matrix: &Frame<String>,
    coefficients: &Coefficients,
    nodes: &NodeMap,
    panel: &[String],
) -> Result<Frame<NodeColumn>, MixError> {
    let mut targets: Vec<(String, Vec<TransformKey>)> = Vec::new();
    for key in coefficients.keys() {
        let node = nodes.node_of(panel, &key).ok_or_else(|| {
            MixError::Validation(format!("no node assigned to {key} in panel {panel:?}"))
        })?;
        match targets.iter_mut().find(|(n, _)| n == node) {
            Some((_, keys)) => keys.push(key),
            None => targets.push((node.to_string(), vec![key])),
        }
    }

    let graph = NodeGraph::build(&targets);
    let mut consumers: HashMap<&str, usize> = HashMap::new();
    for (_, keys) in &targets {
        for key in keys {
            if graph.contains(&key.variable) {
                *consumers.entry(key.variable.as_str()).or_default() += 1;
            }
        }
    }

    let mut out: Frame<NodeColumn> = matrix.empty_like();
    for node in graph.order()? {
        let keys = targets
            .iter()
            .find(|(n, _)| *n == node)
            .map(|(_, keys)| keys.clone())
            .unwrap_or_default();
        let node_coefs = coefficients.filter(|e| keys.contains(&e.key));
        let dependent = Series::from_column(matrix, &node)?;
        debug!(node = %node, keys = keys.len(), "decomposing node");
        let mut part = decompose(matrix, &node_coefs, Some(&dependent))?;

        let n = consumers.get(node.as_str()).copied().unwrap_or(0);
        if n > 1 {
            let intercept = part.column_position(&TransformKey::intercept());
            let residual = part.column_position(&TransformKey::residual());
            let factor = -((n - 1) as f64) / n as f64;
            let adjustments: Vec<Option<f64>> = (0..part.n_rows())
                .map(|r| {
                    let base = sum_present(
                        [intercept, residual].into_iter().flatten().map(|c| part.get_at(r, c)),
                    );
                    mul(base, Some(factor))
                })
                .collect();
            let column = part.ensure_column(TransformKey::adjustment_factor());
            for (r, value) in adjustments.into_iter().enumerate() {
                part.set_at(r, column, value);
            }
            debug!(node = %node, consumers = n, "split node base across consumers");
        }

        let labelled = part.map_columns(|key| NodeColumn {
            node: node.clone(),
            key: key.clone(),
        })?;
        out.concat_columns(&labelled)?;
    }
    Ok(out)
}

/// Sum of a node's columns per row.
pub fn node_total(frame: &Frame<NodeColumn>, node: &str) -> Vec<Option<f64>> {
    let columns: Vec<usize> = (0..frame.n_columns())
        .filter(|&c| frame.columns()[c].node == node)
        .collect();
    (0..frame.n_rows())
        .map(|r| sum_present(columns.iter().map(|&c| frame.get_at(r, c))))
        .collect()
}

/// Intercept + Residual of a node per row, before any adjustment.
pub fn node_base(frame: &Frame<NodeColumn>, node: &str) -> Vec<Option<f64>> {
    let base_vars = [transform::INTERCEPT, transform::RESIDUAL];
    let columns: Vec<usize> = (0..frame.n_columns())
        .filter(|&c| {
            let col = &frame.columns()[c];
            col.node == node
                && col.key.is_identity()
                && base_vars.contains(&col.key.variable.as_str())
        })
        .collect();
    (0..frame.n_rows())
        .map(|r| sum_present(columns.iter().map(|&c| frame.get_at(r, c))))
        .collect()
}
