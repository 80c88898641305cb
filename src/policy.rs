//! Weight-selection policies evaluated at each rebalance point.
//!
//! A policy turns one [`WindowEstimate`] into an [`Allocation`]. The
//! optimizing policies never fail on infeasibility; they report it through
//! the allocation status and let the engine decide what to do.

use crate::error::{BacktestError, Result};
use crate::optimizer::{
    Bounds, Constraint, FeasibilityReport, NegativeSharpe, Objective, Optimizer,
    QuadraticBackend, QuadraticProgram, Solution, SolveStatus,
};
use crate::stats::WindowEstimate;
use crate::types::equal_weights;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Tolerance used when validating user-supplied weight vectors.
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Default volatility floor for the Sharpe objective.
pub const DEFAULT_VOLATILITY_FLOOR: f64 = 1e-12;

/// Weights chosen by a policy, with the solver's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub weights: Vec<f64>,
    pub status: SolveStatus,
    pub feasibility: FeasibilityReport,
}

impl Allocation {
    /// An allocation that needs no solve.
    pub fn exact(weights: Vec<f64>) -> Self {
        let feasibility =
            FeasibilityReport::evaluate(&weights, &Bounds::unit(weights.len()), &[Constraint::Budget]);
        Self {
            weights,
            status: SolveStatus::Optimal,
            feasibility,
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.status != SolveStatus::Infeasible
    }
}

impl From<Solution> for Allocation {
    fn from(solution: Solution) -> Self {
        Self {
            weights: solution.weights,
            status: solution.status,
            feasibility: solution.feasibility,
        }
    }
}

/// A rule that picks portfolio weights from one window's statistics.
pub trait WeightPolicy: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Choose weights for the next holding period.
    fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation>;
}

fn variance_program(estimate: &WindowEstimate, equalities: Vec<(Vec<f64>, f64)>) -> QuadraticProgram {
    let n = estimate.n_assets();
    QuadraticProgram {
        quadratic: estimate
            .covariance
            .iter()
            .map(|row| row.iter().map(|v| 2.0 * v).collect())
            .collect(),
        linear: vec![0.0; n],
        equalities,
        bounds: Bounds::unit(n),
    }
}

/// Global minimum variance: `min wᵀΣw` s.t. `sum(w) == 1`, `0 <= w <= 1`.
#[derive(Debug, Clone, Default)]
pub struct MinVariance {
    optimizer: Optimizer,
}

impl MinVariance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }
}

impl WeightPolicy for MinVariance {
    fn name(&self) -> &str {
        "Minimum Variance"
    }

    fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
        let n = estimate.n_assets();
        let qp = variance_program(estimate, vec![(vec![1.0; n], 1.0)]);
        Ok(self.optimizer.solve_quadratic(&qp)?.into())
    }
}

/// Minimum variance at a required expected return.
///
/// `min wᵀΣw` s.t. `sum(w) == 1`, `w · μ == target`, `0 <= w <= 1`. The
/// target is per period, in the same units as the return matrix.
///
/// The return row is divided by `max |μ|` before solving, so the optimizer's
/// feasibility tolerance bounds the miss relative to the size of the expected
/// returns rather than in absolute return units.
#[derive(Debug, Clone)]
pub struct TargetReturn {
    target: f64,
    optimizer: Optimizer,
}

impl TargetReturn {
    pub fn new(target: f64) -> Self {
        Self {
            target,
            optimizer: Optimizer::default(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn target(&self) -> f64 {
        self.target
    }
}

impl WeightPolicy for TargetReturn {
    fn name(&self) -> &str {
        "Target Return"
    }

    fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
        if !self.target.is_finite() {
            return Err(BacktestError::StrategyError(format!(
                "Target return must be finite, got {}",
                self.target
            )));
        }

        let n = estimate.n_assets();
        let scale = estimate
            .expected_returns
            .iter()
            .fold(0.0_f64, |m, mu| m.max(mu.abs()));
        let scale = if scale > 0.0 { scale } else { 1.0 };
        let qp = variance_program(
            estimate,
            vec![
                (vec![1.0; n], 1.0),
                (
                    estimate.expected_returns.iter().map(|mu| mu / scale).collect(),
                    self.target / scale,
                ),
            ],
        );
        let solution = self.optimizer.solve_quadratic(&qp)?;
        if solution.status == SolveStatus::Infeasible {
            debug!(
                "Target return {:.6} unreachable (violation {:.3e})",
                self.target, solution.feasibility.constraint_violation
            );
        }
        Ok(solution.into())
    }
}

/// Maximum Sharpe ratio: `min -(w·μ - r_f) / sqrt(wᵀΣw)` s.t. budget and bounds.
///
/// The risk-free rate is per period. Volatility is floored so zero-variance
/// windows stay finite.
#[derive(Debug, Clone)]
pub struct MaxSharpe {
    risk_free_rate: f64,
    volatility_floor: f64,
    optimizer: Optimizer,
}

impl Default for MaxSharpe {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl MaxSharpe {
    pub fn new(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            volatility_floor: DEFAULT_VOLATILITY_FLOOR,
            optimizer: Optimizer::default(),
        }
    }

    pub fn with_volatility_floor(mut self, floor: f64) -> Self {
        self.volatility_floor = floor;
        self
    }

    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    /// Scaled program `min yᵀΣy` s.t. `(μ - r_f)ᵀy == 1`, `y >= 0`, then
    /// `w = y / sum(y)`.
    fn solve_scaled(&self, estimate: &WindowEstimate, excess: &[f64]) -> Result<Option<Allocation>> {
        let n = estimate.n_assets();
        let mut qp = variance_program(estimate, vec![(excess.to_vec(), 1.0)]);
        qp.bounds = Bounds::non_negative(n);

        let solution = self.optimizer.solve_quadratic(&qp)?;
        if solution.status == SolveStatus::Infeasible {
            return Ok(None);
        }

        let total: f64 = solution.weights.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return Ok(None);
        }

        let unit = Bounds::unit(n);
        let scaled: Vec<f64> = solution.weights.iter().map(|y| y / total).collect();
        let weights = unit.project(&scaled, true);
        let feasibility = FeasibilityReport::evaluate(&weights, &unit, &[Constraint::Budget]);

        Ok(Some(Allocation {
            weights,
            status: solution.status,
            feasibility,
        }))
    }
}

impl WeightPolicy for MaxSharpe {
    fn name(&self) -> &str {
        "Maximum Sharpe"
    }

    fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
        let excess: Vec<f64> = estimate
            .expected_returns
            .iter()
            .map(|mu| mu - self.risk_free_rate)
            .collect();

        let conic = self.optimizer.config().quadratic_backend == QuadraticBackend::Conic;
        if conic && excess.iter().any(|&e| e > 0.0) {
            if let Some(allocation) = self.solve_scaled(estimate, &excess)? {
                return Ok(allocation);
            }
            debug!("Scaled Sharpe program failed; using the direct objective");
        }

        let objective = NegativeSharpe {
            expected_returns: estimate.expected_returns.clone(),
            covariance: estimate.covariance.clone(),
            risk_free_rate: self.risk_free_rate,
            volatility_floor: self.volatility_floor,
        };
        let n = estimate.n_assets();
        Ok(self
            .optimizer
            .minimize(&objective, &Bounds::unit(n), &[Constraint::Budget])?
            .into())
    }
}

/// Objective over weights and the current window's statistics.
///
/// Closures `Fn(&[f64], &WindowEstimate) -> f64` implement this trait, so
/// external state such as an alpha vector can be captured by value.
pub trait EstimateObjective: Send + Sync {
    fn evaluate(&self, weights: &[f64], estimate: &WindowEstimate) -> f64;
}

impl<F> EstimateObjective for F
where
    F: Fn(&[f64], &WindowEstimate) -> f64 + Send + Sync,
{
    fn evaluate(&self, weights: &[f64], estimate: &WindowEstimate) -> f64 {
        self(weights, estimate)
    }
}

struct BoundObjective<'a> {
    objective: &'a dyn EstimateObjective,
    estimate: &'a WindowEstimate,
}

impl Objective for BoundObjective<'_> {
    fn value(&self, weights: &[f64]) -> f64 {
        self.objective.evaluate(weights, self.estimate)
    }
}

/// Overrides for [`CustomObjective`].
///
/// `None` fields fall back to the budget constraint and `[0, 1]` bounds.
#[derive(Debug, Clone, Default)]
pub struct CustomSettings {
    pub constraints: Option<Vec<Constraint>>,
    pub bounds: Option<Bounds>,
}

impl CustomSettings {
    pub fn with_constraints(mut self, constraints: Vec<Constraint>) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Concrete bounds and constraints for `n` assets.
    pub fn resolve(&self, n: usize) -> Result<(Bounds, Vec<Constraint>)> {
        let bounds = match &self.bounds {
            Some(b) if b.len() != n => {
                return Err(BacktestError::StrategyError(format!(
                    "Custom bounds cover {} assets, window has {}",
                    b.len(),
                    n
                )));
            }
            Some(b) => b.clone(),
            None => Bounds::unit(n),
        };
        let constraints = self
            .constraints
            .clone()
            .unwrap_or_else(|| vec![Constraint::Budget]);
        Ok((bounds, constraints))
    }
}

/// Minimizes a caller-supplied objective.
///
/// No global optimum is promised for non-convex objectives.
#[derive(Clone)]
pub struct CustomObjective {
    name: String,
    objective: Arc<dyn EstimateObjective>,
    settings: CustomSettings,
    optimizer: Optimizer,
}

impl std::fmt::Debug for CustomObjective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomObjective")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish()
    }
}

impl CustomObjective {
    pub fn new<F>(name: impl Into<String>, objective: F) -> Self
    where
        F: EstimateObjective + 'static,
    {
        Self {
            name: name.into(),
            objective: Arc::new(objective),
            settings: CustomSettings::default(),
            optimizer: Optimizer::default(),
        }
    }

    pub fn with_settings(mut self, settings: CustomSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }
}

impl WeightPolicy for CustomObjective {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
        let (bounds, constraints) = self.settings.resolve(estimate.n_assets())?;
        let objective = BoundObjective {
            objective: self.objective.as_ref(),
            estimate,
        };
        Ok(self.optimizer.minimize(&objective, &bounds, &constraints)?.into())
    }
}

/// `1/n` in every asset.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualWeight;

impl WeightPolicy for EqualWeight {
    fn name(&self) -> &str {
        "Equal Weight"
    }

    fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
        Ok(Allocation::exact(equal_weights(estimate.n_assets())))
    }
}

/// A constant weight vector.
#[derive(Debug, Clone)]
pub struct FixedWeights {
    weights: Vec<f64>,
}

impl FixedWeights {
    /// Fails unless every weight lies in `[0, 1]` and the weights sum to 1.
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(BacktestError::StrategyError(
                "Fixed weights cannot be empty".to_string(),
            ));
        }
        let report =
            FeasibilityReport::evaluate(&weights, &Bounds::unit(weights.len()), &[Constraint::Budget]);
        if !report.is_valid_allocation(WEIGHT_TOLERANCE) {
            return Err(BacktestError::StrategyError(format!(
                "Fixed weights must lie in [0, 1] and sum to 1 (sum residual {:.3e}, bound violation {:.3e})",
                report.budget_residual, report.bound_violation
            )));
        }
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl WeightPolicy for FixedWeights {
    fn name(&self) -> &str {
        "Fixed Weights"
    }

    fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
        if estimate.n_assets() != self.weights.len() {
            return Err(BacktestError::StrategyError(format!(
                "Fixed weights cover {} assets, window has {}",
                self.weights.len(),
                estimate.n_assets()
            )));
        }
        Ok(Allocation::exact(self.weights.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerConfig;

    fn estimate() -> WindowEstimate {
        WindowEstimate::new(
            vec![0.0004, 0.0008, 0.0012],
            vec![
                vec![0.00010, 0.00002, 0.00001],
                vec![0.00002, 0.00025, 0.00003],
                vec![0.00001, 0.00003, 0.00060],
            ],
        )
        .unwrap()
    }

    fn assert_valid(allocation: &Allocation) {
        let sum: f64 = allocation.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum = {}", sum);
        assert!(allocation
            .weights
            .iter()
            .all(|&w| (-1e-6..=1.0 + 1e-6).contains(&w)));
    }

    fn gradient() -> Optimizer {
        Optimizer::new(OptimizerConfig {
            quadratic_backend: QuadraticBackend::Gradient,
            ..Default::default()
        })
    }

    #[test]
    fn test_min_variance_beats_equal_weight() {
        let est = estimate();
        for policy in [MinVariance::new(), MinVariance::new().with_optimizer(gradient())] {
            let a = policy.compute(&est).unwrap();
            assert_eq!(a.status, SolveStatus::Optimal);
            assert_valid(&a);
            assert!(
                est.portfolio_variance(&a.weights)
                    <= est.portfolio_variance(&equal_weights(3)) + 1e-12
            );
        }
    }

    #[test]
    fn test_target_return_is_met() {
        let est = estimate();
        let a = TargetReturn::new(0.0009).compute(&est).unwrap();
        assert_eq!(a.status, SolveStatus::Optimal);
        assert_valid(&a);
        assert!((est.portfolio_return(&a.weights) - 0.0009).abs() < 1e-7);
    }

    #[test]
    fn test_target_near_boundary_is_not_optimal_unless_met() {
        let est = estimate();
        let target = 0.00119999;
        for policy in [
            TargetReturn::new(target),
            TargetReturn::new(target).with_optimizer(gradient()),
        ] {
            let a = policy.compute(&est).unwrap();
            let miss = (est.portfolio_return(&a.weights) - target).abs();
            if a.status == SolveStatus::Optimal {
                assert!(miss <= 1e-6 * 0.0012 + 1e-15, "miss {:.3e}", miss);
            }
        }
    }

    #[test]
    fn test_unreachable_target_is_infeasible() {
        let est = estimate();
        for policy in [
            TargetReturn::new(0.01),
            TargetReturn::new(0.01).with_optimizer(gradient()),
        ] {
            let a = policy.compute(&est).unwrap();
            assert_eq!(a.status, SolveStatus::Infeasible);
            assert!(!a.is_feasible());
        }
    }

    #[test]
    fn test_max_sharpe_backends_agree() {
        let est = estimate();
        let conic = MaxSharpe::new(0.0).compute(&est).unwrap();
        let direct = MaxSharpe::new(0.0).with_optimizer(gradient()).compute(&est).unwrap();
        assert_valid(&conic);
        assert_valid(&direct);

        let s_conic = est.sharpe_ratio(&conic.weights, 0.0).unwrap();
        let s_direct = est.sharpe_ratio(&direct.weights, 0.0).unwrap();
        assert!((s_conic - s_direct).abs() < 1e-4, "{} vs {}", s_conic, s_direct);

        let s_equal = est.sharpe_ratio(&equal_weights(3), 0.0).unwrap();
        assert!(s_conic >= s_equal - 1e-9);
    }

    #[test]
    fn test_max_sharpe_with_no_positive_excess_return() {
        let est = estimate();
        let a = MaxSharpe::new(0.01).compute(&est).unwrap();
        assert_valid(&a);
        assert!(a.weights.iter().all(|w| w.is_finite()));
    }

    #[test]
    fn test_policies_survive_zero_variance_window() {
        let est = WindowEstimate::new(vec![0.001, 0.002], vec![vec![0.0; 2]; 2]).unwrap();
        let policies: Vec<Box<dyn WeightPolicy>> = vec![
            Box::new(MinVariance::new()),
            Box::new(MaxSharpe::new(0.0)),
            Box::new(MaxSharpe::new(0.0).with_optimizer(gradient())),
            Box::new(EqualWeight),
        ];
        for policy in policies {
            let a = policy.compute(&est).unwrap();
            assert!(a.weights.iter().all(|w| w.is_finite()), "{}", policy.name());
            assert_valid(&a);
        }
    }

    #[test]
    fn test_custom_objective_uses_captured_alpha() {
        let alpha = vec![0.0, 1.0, 0.0];
        let policy = CustomObjective::new("alpha tilt", move |w: &[f64], est: &WindowEstimate| {
            est.portfolio_variance(w) * 100.0
                - w.iter().zip(alpha.iter()).map(|(a, b)| a * b).sum::<f64>()
        });
        let a = policy.compute(&estimate()).unwrap();
        assert_valid(&a);
        assert!(a.weights[1] > 0.5, "{:?}", a.weights);
        assert_eq!(policy.name(), "alpha tilt");
    }

    #[test]
    fn test_custom_settings_override_bounds() {
        let policy = CustomObjective::new("cap", |w: &[f64], _: &WindowEstimate| -w[2])
            .with_settings(
                CustomSettings::default()
                    .with_bounds(Bounds::new(vec![0.0; 3], vec![1.0, 1.0, 0.3]).unwrap()),
            );
        let a = policy.compute(&estimate()).unwrap();
        assert!(a.weights[2] <= 0.3 + 1e-9);
        assert_valid(&a);

        let wrong = CustomObjective::new("bad", |_: &[f64], _: &WindowEstimate| 0.0)
            .with_settings(CustomSettings::default().with_bounds(Bounds::unit(2)));
        assert!(wrong.compute(&estimate()).is_err());
    }

    #[test]
    fn test_fixed_weights_validation() {
        assert!(FixedWeights::new(vec![0.5, 0.6]).is_err());
        assert!(FixedWeights::new(vec![1.5, -0.5]).is_err());
        assert!(FixedWeights::new(vec![]).is_err());

        let fixed = FixedWeights::new(vec![0.2, 0.3, 0.5]).unwrap();
        assert_eq!(fixed.compute(&estimate()).unwrap().weights, vec![0.2, 0.3, 0.5]);

        let two = FixedWeights::new(vec![0.5, 0.5]).unwrap();
        assert!(two.compute(&estimate()).is_err());
    }
}
