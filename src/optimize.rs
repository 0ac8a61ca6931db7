//! Spend allocation across channels with response `c * s^p`.
//!
//! The solver sits behind [`AllocationSolver`]; callers shape an
//! [`AllocationProblem`] and read back an [`Allocation`]. The bundled
//! [`MarginalReturnSolver`] handles concave responses (`0 < p <= 1`).
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decompose::Coefficients;
use crate::error::MixError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    /// Total spend is fixed; maximise revenue.
    Spend,
    /// Total revenue is fixed; minimise spend.
    Revenue,
}

impl FromStr for ConstraintKind {
    type Err = MixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spend" | "budget" => Ok(ConstraintKind::Spend),
            "revenue" => Ok(ConstraintKind::Revenue),
            _ => Err(MixError::InvalidData(format!("unknown constraint '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationProblem {
    pub coefficients: Vec<f64>,
    pub exponents: Vec<f64>,
    pub constraint_value: f64,
    pub constraint: ConstraintKind,
    pub lower_bounds: Vec<f64>,
    pub upper_bounds: Vec<f64>,
}

impl AllocationProblem {
    /// Unbounded problem: spend in `[0, inf)` per channel.
    pub fn new(
        coefficients: Vec<f64>,
        exponents: Vec<f64>,
        constraint_value: f64,
        constraint: ConstraintKind,
    ) -> Self {
        let n = coefficients.len();
        Self {
            coefficients,
            exponents,
            constraint_value,
            constraint,
            lower_bounds: vec![0.0; n],
            upper_bounds: vec![f64::INFINITY; n],
        }
    }

    /// Channels from coefficients in `panel`, one per listed variable. The
    /// coefficient is the response scale and the key's power its exponent.
    pub fn from_coefficients(
        coefficients: &Coefficients,
        panel: &[String],
        variables: &[String],
        constraint_value: f64,
        constraint: ConstraintKind,
    ) -> Result<Self, MixError> {
        let mut scales = Vec::with_capacity(variables.len());
        let mut exponents = Vec::with_capacity(variables.len());
        for variable in variables {
            let entry = coefficients
                .entries()
                .iter()
                .find(|e| e.panel.as_slice() == panel && &e.key.variable == variable)
                .ok_or_else(|| {
                    MixError::Validation(format!("no coefficient for '{variable}' in {panel:?}"))
                })?;
            scales.push(entry.value);
            exponents.push(entry.key.power);
        }
        Ok(Self::new(scales, exponents, constraint_value, constraint))
    }

    pub fn with_spend_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.lower_bounds = lower;
        self.upper_bounds = upper;
        self
    }

    /// Tighten spend bounds so each channel's revenue stays in range.
    pub fn with_revenue_bounds(mut self, lower: &[f64], upper: &[f64]) -> Self {
        for i in 0..self.len() {
            let (c, p) = (self.coefficients[i], self.exponents[i]);
            if c <= 0.0 || p <= 0.0 {
                continue;
            }
            if let Some(&r) = lower.get(i) {
                self.lower_bounds[i] = self.lower_bounds[i].max((r / c).powf(1.0 / p));
            }
            if let Some(&r) = upper.get(i) {
                self.upper_bounds[i] = self.upper_bounds[i].min((r / c).powf(1.0 / p));
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    pub fn validate(&self) -> Result<(), MixError> {
        let n = self.len();
        if self.exponents.len() != n
            || self.lower_bounds.len() != n
            || self.upper_bounds.len() != n
        {
            return Err(MixError::Validation(format!(
                "allocation inputs disagree in length: \
                 {} coefficients, {} exponents, {} lower, {} upper",
                n,
                self.exponents.len(),
                self.lower_bounds.len(),
                self.upper_bounds.len()
            )));
        }
        if !(self.constraint_value.is_finite() && self.constraint_value >= 0.0) {
            return Err(MixError::Validation(format!(
                "constraint value {} must be finite and non-negative",
                self.constraint_value
            )));
        }
        for i in 0..n {
            if self.lower_bounds[i] < 0.0 || self.lower_bounds[i] > self.upper_bounds[i] {
                return Err(MixError::Validation(format!(
                    "channel {i}: bounds [{}, {}] are not a valid spend range",
                    self.lower_bounds[i], self.upper_bounds[i]
                )));
            }
        }
        Ok(())
    }

    /// Total revenue of an allocation.
    pub fn revenue(&self, spend: &[f64]) -> f64 {
        spend
            .iter()
            .zip(self.coefficients.iter().zip(&self.exponents))
            .map(|(s, (c, p))| c * s.powf(*p))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub allocation: Vec<f64>,
    /// Revenue under a spend constraint, spend under a revenue constraint.
    pub achieved_value: f64,
    pub converged: bool,
}

pub trait AllocationSolver {
    fn solve(&self, problem: &AllocationProblem) -> Result<Allocation, MixError>;
}

/// Validate, solve, and report a solver that did not converge.
pub fn optimize(
    problem: &AllocationProblem,
    solver: &dyn AllocationSolver,
) -> Result<Allocation, MixError> {
    problem.validate()?;
    let allocation = solver.solve(problem)?;
    if !allocation.converged {
        warn!(
            constraint = ?problem.constraint,
            target = problem.constraint_value,
            achieved = allocation.achieved_value,
            "allocation did not meet its constraint"
        );
    }
    Ok(allocation)
}

/// Equalises marginal return `c p s^(p-1)` across channels by bisecting
/// the Lagrange multiplier on a log scale. Channels with `p >= 1` take an
/// all-or-nothing spend at their marginal return.
#[derive(Debug, Clone)]
pub struct MarginalReturnSolver {
    pub iterations: usize,
    pub tolerance: f64,
}

impl Default for MarginalReturnSolver {
    fn default() -> Self {
        Self {
            iterations: 300,
            tolerance: 1e-6,
        }
    }
}

impl MarginalReturnSolver {
    fn spend_at(problem: &AllocationProblem, upper: &[f64], lambda: f64) -> Vec<f64> {
        (0..problem.len())
            .map(|i| {
                let (c, p) = (problem.coefficients[i], problem.exponents[i]);
                let (lo, hi) = (problem.lower_bounds[i], upper[i]);
                if c <= 0.0 || p <= 0.0 {
                    return lo;
                }
                if p >= 1.0 {
                    return if c * p > lambda { hi } else { lo };
                }
                (lambda / (c * p)).powf(1.0 / (p - 1.0)).clamp(lo, hi)
            })
            .collect()
    }

    fn measure(problem: &AllocationProblem, spend: &[f64]) -> f64 {
        match problem.constraint {
            ConstraintKind::Spend => spend.iter().sum(),
            ConstraintKind::Revenue => problem.revenue(spend),
        }
    }
}

impl AllocationSolver for MarginalReturnSolver {
    fn solve(&self, problem: &AllocationProblem) -> Result<Allocation, MixError> {
        let target = problem.constraint_value;
        // Unbounded channels can never usefully exceed the whole target.
        let upper: Vec<f64> = (0..problem.len())
            .map(|i| {
                let hi = problem.upper_bounds[i];
                if hi.is_finite() {
                    return hi;
                }
                let (c, p) = (problem.coefficients[i], problem.exponents[i]);
                let cap = match problem.constraint {
                    ConstraintKind::Spend => target,
                    ConstraintKind::Revenue if c > 0.0 && p > 0.0 => (target / c).powf(1.0 / p),
                    ConstraintKind::Revenue => target,
                };
                cap.max(problem.lower_bounds[i])
            })
            .collect();

        // Measure is non-increasing in lambda.
        let (mut lo, mut hi) = (-700.0_f64, 700.0_f64);
        for _ in 0..self.iterations {
            let mid = 0.5 * (lo + hi);
            let spend = Self::spend_at(problem, &upper, mid.exp());
            if Self::measure(problem, &spend) > target {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1e-12 {
                break;
            }
        }
        let spend = Self::spend_at(problem, &upper, hi.exp());

        let measured = Self::measure(problem, &spend);
        let converged = (measured - target).abs() <= self.tolerance * target.abs().max(1.0);
        debug!(measured, target, converged, "marginal-return solve finished");
        let achieved_value = match problem.constraint {
            ConstraintKind::Spend => problem.revenue(&spend),
            ConstraintKind::Revenue => spend.iter().sum(),
        };
        Ok(Allocation {
            allocation: spend,
            achieved_value,
            converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RowKey;
    use crate::transform::TransformKey;

    const COEF: [f64; 7] = [47.0, 75.0, 13.0, 63.0, 96.0, 25.0, 17.0];
    const POWER: [f64; 7] = [0.9, 0.32, 0.97, 0.53, 0.02, 0.86, 0.67];
    const LOWER: [f64; 7] = [644.8, 265.6, 138.4, 528.8, 228.8, 202.4, 782.4];
    const UPPER: [f64; 7] = [967.2, 398.4, 207.6, 793.2, 343.2, 303.6, 1173.6];

    fn problem(value: f64, constraint: ConstraintKind) -> AllocationProblem {
        AllocationProblem::new(COEF.to_vec(), POWER.to_vec(), value, constraint)
            .with_spend_bounds(LOWER.to_vec(), UPPER.to_vec())
    }

    fn solve(problem: &AllocationProblem) -> Allocation {
        optimize(problem, &MarginalReturnSolver::default()).unwrap()
    }

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < tol, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn test_budget_constraint() {
        let solved = solve(&problem(3489.0, ConstraintKind::Spend));
        assert!(solved.converged);
        assert_close(
            &solved.allocation,
            &[967.2, 265.6, 207.6, 733.8, 228.8, 303.6, 782.4],
            1e-3,
        );
        assert!((solved.allocation.iter().sum::<f64>() - 3489.0).abs() < 1e-3);
    }

    #[test]
    fn test_revenue_constraint() {
        let solved = solve(&problem(28511.75, ConstraintKind::Revenue));
        assert!(solved.converged);
        assert_close(
            &solved.allocation,
            &[869.72435, 265.6, 138.4, 528.8, 228.8, 202.4, 782.4],
            1e-3,
        );
        let spend: f64 = solved.allocation.iter().sum();
        assert!((solved.achieved_value - spend).abs() < 1e-9);
    }

    #[test]
    fn test_infeasible_budget_is_reported() {
        let solved = solve(&problem(100.0, ConstraintKind::Spend));
        assert!(!solved.converged);
        assert_close(&solved.allocation, &LOWER, 1e-9);
    }

    #[test]
    fn test_validation() {
        let mut bad = problem(3489.0, ConstraintKind::Spend);
        bad.exponents.pop();
        assert!(matches!(bad.validate(), Err(MixError::Validation(_))));

        let crossed =
            problem(3489.0, ConstraintKind::Spend).with_spend_bounds(vec![5.0; 7], vec![1.0; 7]);
        assert!(crossed.validate().is_err());
        assert!("budget".parse::<ConstraintKind>().unwrap() == ConstraintKind::Spend);
    }

    #[test]
    fn test_revenue_bounds_tighten_spend() {
        let p = AllocationProblem::new(vec![10.0], vec![0.5], 100.0, ConstraintKind::Spend)
            .with_revenue_bounds(&[20.0], &[50.0]);
        assert!((p.lower_bounds[0] - 4.0).abs() < 1e-12);
        assert!((p.upper_bounds[0] - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_unbounded_channels_split_budget() {
        let p =
            AllocationProblem::new(vec![1.0, 1.0], vec![0.5, 0.5], 100.0, ConstraintKind::Spend);
        let solved = solve(&p);
        assert_close(&solved.allocation, &[50.0, 50.0], 1e-6);
    }

    #[test]
    fn test_from_coefficients() {
        let coefs = Coefficients::new()
            .global(TransformKey::new("TV", 0.3, 0.6, 0), 12.0)
            .global(TransformKey::intercept(), 5.0);
        let channels = ["TV".to_string()];
        let p = AllocationProblem::from_coefficients(
            &coefs,
            &[],
            &channels,
            10.0,
            ConstraintKind::Spend,
        )
        .unwrap();
        assert_eq!(p.coefficients, vec![12.0]);
        assert_eq!(p.exponents, vec![0.6]);
        let missing: RowKey = vec!["north".to_string()];
        let nested = AllocationProblem::from_coefficients(
            &coefs,
            &missing,
            &channels,
            10.0,
            ConstraintKind::Spend,
        );
        assert!(nested.is_err());
    }
}
