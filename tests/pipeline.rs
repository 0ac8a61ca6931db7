//! End-to-end run: long tables → coded matrix → decomposition → groups → budget.

use mixkit::{
    aggregate, build_model_data, decompose, optimize, segregate, AllocationProblem, CodeMap,
    Coefficients, ConstraintKind, Grouping, LongTable, MarginalReturnSolver, ModelDataConfig,
    Series, SummaryPlan, TransformKey,
};

fn key(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

fn sales_table() -> LongTable {
    let mut table = LongTable::new(key(&["Region", "Period"]), key(&["Channel", "Metric"]));
    let rows = [
        ("North", "2024-01-01", 10.0, 5.0, 100.0),
        ("North", "2024-01-08", 12.0, 4.0, 110.0),
        ("South", "2024-01-01", 6.0, 9.0, 90.0),
        ("South", "2024-01-08", 8.0, 7.0, 95.0),
    ];
    for (region, period, tv, search, sales) in rows {
        table.push(key(&[region, period]), key(&["TV", "Spend"]), Some(tv));
        table.push(key(&[region, period]), key(&["Search", "Spend"]), Some(search));
        table.push(key(&[region, period]), key(&["Sales", "Revenue"]), Some(sales));
    }
    table
}

fn variable(mapping: &CodeMap, channel: &str, metric: &str) -> String {
    format!("{}_{}", mapping[channel], mapping[metric])
}

#[test]
fn test_matrix_decomposes_to_dependent() {
    let config = ModelDataConfig {
        seed: Some(11),
        ..ModelDataConfig::default()
    };
    let sources = vec![("sales.csv".to_string(), sales_table())];
    let mut rng = config.rng();
    let data = build_model_data(&sources, &config, &SummaryPlan::new(), &CodeMap::new(), &mut rng)
        .unwrap();

    assert_eq!(data.matrix.n_rows(), 4);
    assert_eq!(data.matrix.n_columns(), 3);
    assert_eq!(data.lineage.len(), 3);

    let matrix = data.matrix.by_variable().unwrap();
    let tv = variable(&data.mapping, "TV", "Spend");
    let search = variable(&data.mapping, "Search", "Spend");
    let sales = variable(&data.mapping, "Sales", "Revenue");

    let coefficients = Coefficients::new()
        .global(TransformKey::raw(tv.as_str()), 2.0)
        .global(TransformKey::raw(search.as_str()), 3.0)
        .global(TransformKey::intercept(), 50.0);
    let dependent = Series::from_column(&matrix, &sales).unwrap();
    let decomposition = decompose(&matrix, &coefficients, Some(&dependent)).unwrap();

    let north = key(&["North", "2024-01-01"]);
    assert_eq!(decomposition.get(&north, &TransformKey::raw(tv.as_str())), Some(20.0));
    assert_eq!(decomposition.get(&north, &TransformKey::intercept()), Some(50.0));
    assert_eq!(decomposition.get(&north, &TransformKey::residual()), Some(15.0));
    for (r, row) in decomposition.rows().iter().enumerate() {
        let total = decomposition.row_sum(r).unwrap();
        assert!(approx(total, dependent.get(row).unwrap()));
    }
}

#[test]
fn test_grouped_matrix_splits_back() {
    let config = ModelDataConfig {
        seed: Some(3),
        ..ModelDataConfig::default()
    };
    let sources = vec![("sales.csv".to_string(), sales_table())];
    let mut rng = config.rng();
    let data = build_model_data(&sources, &config, &SummaryPlan::new(), &CodeMap::new(), &mut rng)
        .unwrap();
    let matrix = data.matrix.by_variable().unwrap();
    let tv = variable(&data.mapping, "TV", "Spend");
    let search = variable(&data.mapping, "Search", "Spend");

    let grouping = Grouping::new()
        .panel_group("All", ["North", "South"])
        .variable_group("Media", [tv.clone(), search.clone()]);
    let grouped = aggregate(&matrix, &grouping, |_| false).unwrap();

    let all = key(&["All", "2024-01-01"]);
    assert_eq!(grouped.n_rows(), 2);
    assert_eq!(grouped.get(&all, &"Media".to_string()), Some(30.0));

    let restored = segregate(&grouped, &matrix, &grouping, true).unwrap();
    for row in matrix.rows() {
        for column in [&tv, &search] {
            let expected = matrix.get(row, column).unwrap();
            let actual = restored.get(row, column).unwrap();
            assert!(approx(actual, expected), "{row:?} {column}: {actual} != {expected}");
        }
    }
}

#[test]
fn test_budget_splits_evenly_across_matching_channels() {
    let coefficients = Coefficients::new()
        .global(TransformKey::new("tv", 0.0, 0.5, 0), 2.0)
        .global(TransformKey::new("search", 0.0, 0.5, 0), 2.0);
    let problem = AllocationProblem::from_coefficients(
        &coefficients,
        &[],
        &key(&["tv", "search"]),
        100.0,
        ConstraintKind::Spend,
    )
    .unwrap();

    let solved = optimize(&problem, &MarginalReturnSolver::default()).unwrap();
    assert!(solved.converged);
    assert!((solved.allocation[0] - 50.0).abs() < 1e-3);
    assert!((solved.allocation[1] - 50.0).abs() < 1e-3);
}
