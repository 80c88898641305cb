//! Constrained minimization over portfolio weight vectors.
//!
//! Two backends share one result type:
//!
//! - A general solver for arbitrary objectives: projected gradient descent
//!   (Barzilai-Borwein step, Armijo backtracking) inside an augmented
//!   Lagrangian loop. Bounds and the budget constraint are enforced exactly
//!   by Euclidean projection; every other constraint goes through the
//!   Lagrangian.
//! - A conic interior-point backend (`clarabel`) for quadratic programs.
//!
//! Neither backend fails on non-convergence or infeasibility. Both return the
//! candidate they ended on, tagged with a [`SolveStatus`] and a
//! [`FeasibilityReport`], and leave the decision to the caller.

use crate::error::{BacktestError, Result};
use crate::stats::{dot, mat_vec_mul};
use crate::types::equal_weights;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Function minimized by the optimizer.
///
/// Closures `Fn(&[f64]) -> f64` implement this trait directly; structured
/// objectives may also supply an analytic gradient. Without one, central
/// finite differences are used.
pub trait Objective: Send + Sync {
    fn value(&self, weights: &[f64]) -> f64;

    fn gradient(&self, _weights: &[f64]) -> Option<Vec<f64>> {
        None
    }
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn value(&self, weights: &[f64]) -> f64 {
        self(weights)
    }
}

/// `wᵀ Σ w`.
#[derive(Debug, Clone)]
pub struct PortfolioVariance {
    pub covariance: Vec<Vec<f64>>,
}

impl Objective for PortfolioVariance {
    fn value(&self, weights: &[f64]) -> f64 {
        dot(weights, &mat_vec_mul(&self.covariance, weights))
    }

    fn gradient(&self, weights: &[f64]) -> Option<Vec<f64>> {
        Some(
            mat_vec_mul(&self.covariance, weights)
                .into_iter()
                .map(|v| 2.0 * v)
                .collect(),
        )
    }
}

/// `-(w·μ - r_f) / max(sqrt(wᵀΣw), floor)`.
///
/// The volatility floor keeps the ratio finite on zero-variance windows.
#[derive(Debug, Clone)]
pub struct NegativeSharpe {
    pub expected_returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    pub risk_free_rate: f64,
    pub volatility_floor: f64,
}

impl NegativeSharpe {
    fn volatility(&self, sigma_w: &[f64], weights: &[f64]) -> (f64, bool) {
        let raw = dot(weights, sigma_w).max(0.0).sqrt();
        if raw < self.volatility_floor {
            (self.volatility_floor, true)
        } else {
            (raw, false)
        }
    }
}

impl Objective for NegativeSharpe {
    fn value(&self, weights: &[f64]) -> f64 {
        let sigma_w = mat_vec_mul(&self.covariance, weights);
        let (vol, _) = self.volatility(&sigma_w, weights);
        -(dot(weights, &self.expected_returns) - self.risk_free_rate) / vol
    }

    fn gradient(&self, weights: &[f64]) -> Option<Vec<f64>> {
        let sigma_w = mat_vec_mul(&self.covariance, weights);
        let (vol, floored) = self.volatility(&sigma_w, weights);
        let excess = dot(weights, &self.expected_returns) - self.risk_free_rate;

        // d(-S)/dw_i = -mu_i / vol + excess * (Σw)_i / vol³
        Some(
            self.expected_returns
                .iter()
                .zip(sigma_w.iter())
                .map(|(&mu, &sw)| {
                    if floored {
                        -mu / vol
                    } else {
                        -mu / vol + excess * sw / (vol * vol * vol)
                    }
                })
                .collect(),
        )
    }
}

/// Shared closure type for general constraints.
pub type ConstraintFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// A constraint on the weight vector.
///
/// Inequalities follow the `g(w) >= 0` convention.
#[derive(Clone)]
pub enum Constraint {
    /// `sum(w) == 1`, enforced exactly by projection.
    Budget,
    /// `a · w == rhs`.
    LinearEq { coefficients: Vec<f64>, rhs: f64 },
    /// `a · w >= rhs`.
    LinearIneq { coefficients: Vec<f64>, rhs: f64 },
    /// `h(w) == 0`.
    Equality(ConstraintFn),
    /// `g(w) >= 0`.
    Inequality(ConstraintFn),
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Budget => write!(f, "Budget"),
            Constraint::LinearEq { coefficients, rhs } => f
                .debug_struct("LinearEq")
                .field("coefficients", coefficients)
                .field("rhs", rhs)
                .finish(),
            Constraint::LinearIneq { coefficients, rhs } => f
                .debug_struct("LinearIneq")
                .field("coefficients", coefficients)
                .field("rhs", rhs)
                .finish(),
            Constraint::Equality(_) => write!(f, "Equality(<fn>)"),
            Constraint::Inequality(_) => write!(f, "Inequality(<fn>)"),
        }
    }
}

impl Constraint {
    pub fn budget() -> Self {
        Constraint::Budget
    }

    pub fn linear_eq(coefficients: Vec<f64>, rhs: f64) -> Self {
        Constraint::LinearEq { coefficients, rhs }
    }

    pub fn linear_ineq(coefficients: Vec<f64>, rhs: f64) -> Self {
        Constraint::LinearIneq { coefficients, rhs }
    }

    pub fn equality<F>(f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Constraint::Equality(Arc::new(f))
    }

    pub fn inequality<F>(f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Constraint::Inequality(Arc::new(f))
    }

    pub fn is_equality(&self) -> bool {
        matches!(
            self,
            Constraint::Budget | Constraint::LinearEq { .. } | Constraint::Equality(_)
        )
    }

    /// `h(w)` for equalities, `g(w)` for inequalities.
    pub fn residual(&self, weights: &[f64]) -> f64 {
        match self {
            Constraint::Budget => weights.iter().sum::<f64>() - 1.0,
            Constraint::LinearEq { coefficients, rhs }
            | Constraint::LinearIneq { coefficients, rhs } => dot(coefficients, weights) - rhs,
            Constraint::Equality(f) | Constraint::Inequality(f) => f(weights),
        }
    }

    /// Non-negative amount by which `weights` violates the constraint.
    pub fn violation(&self, weights: &[f64]) -> f64 {
        let r = self.residual(weights);
        let v = if self.is_equality() { r.abs() } else { (-r).max(0.0) };
        if v.is_nan() {
            f64::INFINITY
        } else {
            v
        }
    }

    fn gradient(&self, weights: &[f64]) -> Vec<f64> {
        match self {
            Constraint::Budget => vec![1.0; weights.len()],
            Constraint::LinearEq { coefficients, .. }
            | Constraint::LinearIneq { coefficients, .. } => coefficients.clone(),
            Constraint::Equality(f) | Constraint::Inequality(f) => {
                numerical_gradient(|w| f(w), weights)
            }
        }
    }
}

/// Per-asset box bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Bounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(BacktestError::InvalidInput(
                "Lower and upper bounds must have the same length".to_string(),
            ));
        }
        for (i, (lo, hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if !lo.is_finite() || !hi.is_finite() {
                return Err(BacktestError::InvalidInput(format!(
                    "Bounds for asset {} must be finite",
                    i
                )));
            }
            if lo > hi {
                return Err(BacktestError::InvalidInput(format!(
                    "Lower bound {} exceeds upper bound {} for asset {}",
                    lo, hi, i
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    /// `[0, 1]` for every asset: long-only, no leverage.
    pub fn unit(n: usize) -> Self {
        Self {
            lower: vec![0.0; n],
            upper: vec![1.0; n],
        }
    }

    /// `[0, ∞)` for every asset.
    ///
    /// Only meaningful for problems without the budget constraint, such as the
    /// scaled form of the maximum-Sharpe program.
    pub fn non_negative(n: usize) -> Self {
        Self {
            lower: vec![0.0; n],
            upper: vec![f64::INFINITY; n],
        }
    }

    /// The same `[lo, hi]` for every asset.
    pub fn uniform(n: usize, lower: f64, upper: f64) -> Result<Self> {
        Self::new(vec![lower; n], vec![upper; n])
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// Largest distance of any component outside its bounds.
    pub fn violation(&self, weights: &[f64]) -> f64 {
        weights
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .map(|(&w, (&lo, &hi))| {
                if w.is_nan() {
                    f64::INFINITY
                } else {
                    (lo - w).max(w - hi).max(0.0)
                }
            })
            .fold(0.0, f64::max)
    }

    /// Euclidean projection onto the box, intersected with `sum(w) == 1` when
    /// `budget` is set.
    ///
    /// When the box cannot reach a unit sum the nearest box corner is
    /// returned.
    pub fn project(&self, x: &[f64], budget: bool) -> Vec<f64> {
        let clamp = |tau: f64| -> Vec<f64> {
            x.iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .map(|(&xi, (&lo, &hi))| (xi - tau).clamp(lo, hi))
                .collect()
        };

        if !budget {
            return clamp(0.0);
        }

        let sum_lo: f64 = self.lower.iter().sum();
        let sum_hi: f64 = self.upper.iter().sum();
        if sum_lo >= 1.0 {
            return self.lower.clone();
        }
        if sum_hi <= 1.0 {
            return self.upper.clone();
        }

        // sum(clamp(x - tau)) is non-increasing in tau.
        let mut tau_lo = x
            .iter()
            .zip(self.upper.iter())
            .map(|(xi, hi)| xi - hi)
            .fold(f64::INFINITY, f64::min);
        let mut tau_hi = x
            .iter()
            .zip(self.lower.iter())
            .map(|(xi, lo)| xi - lo)
            .fold(f64::NEG_INFINITY, f64::max);

        for _ in 0..200 {
            let mid = 0.5 * (tau_lo + tau_hi);
            if mid <= tau_lo || mid >= tau_hi {
                break;
            }
            let s: f64 = clamp(mid).iter().sum();
            if s > 1.0 {
                tau_lo = mid;
            } else {
                tau_hi = mid;
            }
        }

        let mut w = clamp(0.5 * (tau_lo + tau_hi));

        // Spread the remaining round-off over components strictly inside the box.
        let residual = 1.0 - w.iter().sum::<f64>();
        let free: Vec<usize> = (0..w.len())
            .filter(|&i| w[i] > self.lower[i] && w[i] < self.upper[i])
            .collect();
        if residual != 0.0 && !free.is_empty() {
            let share = residual / free.len() as f64;
            for i in free {
                w[i] = (w[i] + share).clamp(self.lower[i], self.upper[i]);
            }
        }

        w
    }
}

/// Outcome classification of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Converged to a point satisfying every constraint.
    Optimal,
    /// Feasible candidate, but the iteration or time budget ran out first.
    NotConverged,
    /// The returned candidate violates bounds or constraints.
    Infeasible,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Optimal => write!(f, "optimal"),
            SolveStatus::NotConverged => write!(f, "not-converged"),
            SolveStatus::Infeasible => write!(f, "infeasible"),
        }
    }
}

/// Post-hoc constraint residuals of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityReport {
    /// `|sum(w) - 1|`, reported whether or not the budget was requested.
    pub budget_residual: f64,
    /// Largest distance outside the bounds.
    pub bound_violation: f64,
    /// Largest violation among the requested constraints.
    pub constraint_violation: f64,
}

impl FeasibilityReport {
    pub fn evaluate(weights: &[f64], bounds: &Bounds, constraints: &[Constraint]) -> Self {
        let budget_residual = (weights.iter().sum::<f64>() - 1.0).abs();
        Self {
            budget_residual: if budget_residual.is_nan() {
                f64::INFINITY
            } else {
                budget_residual
            },
            bound_violation: bounds.violation(weights),
            constraint_violation: constraints
                .iter()
                .map(|c| c.violation(weights))
                .fold(0.0, f64::max),
        }
    }

    /// True when bounds and requested constraints hold within `tolerance`.
    pub fn is_feasible(&self, tolerance: f64) -> bool {
        self.bound_violation <= tolerance && self.constraint_violation <= tolerance
    }

    /// True when `w` is a valid long-only fully invested weight vector.
    pub fn is_valid_allocation(&self, tolerance: f64) -> bool {
        self.is_feasible(tolerance) && self.budget_residual <= tolerance
    }
}

/// Result of one optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub weights: Vec<f64>,
    pub objective: f64,
    pub iterations: usize,
    pub status: SolveStatus,
    pub feasibility: FeasibilityReport,
}

/// Backend used for quadratic programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuadraticBackend {
    /// Interior-point conic solver.
    #[default]
    Conic,
    /// The general projected-gradient solver.
    Gradient,
}

/// Solver limits and tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Projected-gradient iterations per augmented-Lagrangian round.
    pub max_iterations: usize,
    /// Augmented-Lagrangian rounds.
    pub max_outer_iterations: usize,
    /// Interior-point iterations for the conic backend.
    pub conic_max_iterations: u32,
    /// Step-size convergence tolerance on the weights.
    pub tolerance: f64,
    /// Largest accepted constraint or bound violation.
    pub feasibility_tolerance: f64,
    /// Initial penalty for the augmented Lagrangian.
    pub initial_penalty: f64,
    /// Wall-clock limit per solve, in seconds.
    pub time_limit_secs: Option<f64>,
    /// Backend for quadratic programs.
    pub quadratic_backend: QuadraticBackend,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2_000,
            max_outer_iterations: 25,
            conic_max_iterations: 200,
            tolerance: 1e-10,
            feasibility_tolerance: 1e-6,
            initial_penalty: 10.0,
            time_limit_secs: None,
            quadratic_backend: QuadraticBackend::Conic,
        }
    }
}

/// Quadratic program `min ½ xᵀPx + qᵀx` s.t. linear equalities and bounds.
#[derive(Debug, Clone)]
pub struct QuadraticProgram {
    /// Symmetric PSD matrix `P`.
    pub quadratic: Vec<Vec<f64>>,
    /// Linear term `q`.
    pub linear: Vec<f64>,
    /// Rows `(a, b)` with `a · x == b`.
    pub equalities: Vec<(Vec<f64>, f64)>,
    pub bounds: Bounds,
}

impl QuadraticProgram {
    /// Constraint list equivalent to the equality rows.
    pub fn constraints(&self) -> Vec<Constraint> {
        self.equalities
            .iter()
            .map(|(a, b)| Constraint::linear_eq(a.clone(), *b))
            .collect()
    }

    fn objective(&self, x: &[f64]) -> f64 {
        0.5 * dot(x, &mat_vec_mul(&self.quadratic, x)) + dot(&self.linear, x)
    }
}

struct QuadraticObjective<'a>(&'a QuadraticProgram);

impl Objective for QuadraticObjective<'_> {
    fn value(&self, weights: &[f64]) -> f64 {
        self.0.objective(weights)
    }

    fn gradient(&self, weights: &[f64]) -> Option<Vec<f64>> {
        Some(
            mat_vec_mul(&self.0.quadratic, weights)
                .into_iter()
                .zip(self.0.linear.iter())
                .map(|(px, q)| px + q)
                .collect(),
        )
    }
}

/// Constrained minimizer.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimize `objective` from the equal-weight starting point.
    pub fn minimize(
        &self,
        objective: &dyn Objective,
        bounds: &Bounds,
        constraints: &[Constraint],
    ) -> Result<Solution> {
        self.minimize_from(objective, bounds, constraints, &equal_weights(bounds.len()))
    }

    /// Minimize `objective` from `initial`.
    pub fn minimize_from(
        &self,
        objective: &dyn Objective,
        bounds: &Bounds,
        constraints: &[Constraint],
        initial: &[f64],
    ) -> Result<Solution> {
        let n = bounds.len();
        if n == 0 {
            return Err(BacktestError::InvalidInput(
                "Need at least one asset".to_string(),
            ));
        }
        if initial.len() != n || initial.iter().any(|v| !v.is_finite()) {
            return Err(BacktestError::InvalidInput(format!(
                "Initial guess must have {} finite entries",
                n
            )));
        }
        for c in constraints {
            if let Constraint::LinearEq { coefficients, .. }
            | Constraint::LinearIneq { coefficients, .. } = c
            {
                if coefficients.len() != n {
                    return Err(BacktestError::InvalidInput(format!(
                        "Linear constraint has {} coefficients for {} assets",
                        coefficients.len(),
                        n
                    )));
                }
            }
        }

        let budget = constraints.iter().any(|c| matches!(c, Constraint::Budget));
        let general: Vec<&Constraint> = constraints
            .iter()
            .filter(|c| !matches!(c, Constraint::Budget))
            .collect();

        let deadline = self
            .config
            .time_limit_secs
            .map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));

        let mut w = bounds.project(initial, budget);
        let mut multipliers = vec![0.0; general.len()];
        let mut penalty = self.config.initial_penalty;
        let mut prev_violation = f64::INFINITY;
        let mut iterations = 0;
        let mut converged = false;

        for outer in 0..self.config.max_outer_iterations.max(1) {
            let lagrangian = AugmentedLagrangian {
                objective,
                constraints: &general,
                multipliers: &multipliers,
                penalty,
            };

            let inner = projected_gradient(
                &lagrangian,
                w,
                |x| bounds.project(x, budget),
                self.config.max_iterations,
                self.config.tolerance,
                deadline,
            );
            w = inner.point;
            iterations += inner.iterations;

            let violation = general
                .iter()
                .map(|c| c.violation(&w))
                .fold(0.0, f64::max);

            if general.is_empty() {
                converged = inner.converged;
                break;
            }
            if inner.converged && violation <= self.config.feasibility_tolerance {
                converged = true;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("Optimizer hit its time limit after {} rounds", outer + 1);
                break;
            }

            for (lambda, c) in multipliers.iter_mut().zip(general.iter()) {
                let r = c.residual(&w);
                if c.is_equality() {
                    *lambda += penalty * r;
                } else {
                    *lambda = (*lambda - penalty * r).max(0.0);
                }
            }
            if violation > 0.25 * prev_violation {
                penalty = (penalty * 10.0).min(1e12);
            }
            prev_violation = violation;
        }

        let solution = self.finish(objective.value(&w), w, iterations, converged, bounds, constraints);
        debug!(
            "Gradient solve finished: status={}, iterations={}, objective={:.6e}",
            solution.status, solution.iterations, solution.objective
        );
        Ok(solution)
    }

    /// Solve a quadratic program with the configured quadratic backend.
    pub fn solve_quadratic(&self, qp: &QuadraticProgram) -> Result<Solution> {
        let n = qp.bounds.len();
        if n == 0 {
            return Err(BacktestError::InvalidInput(
                "Need at least one asset".to_string(),
            ));
        }
        if qp.quadratic.len() != n
            || qp.quadratic.iter().any(|row| row.len() != n)
            || qp.linear.len() != n
            || qp.equalities.iter().any(|(a, _)| a.len() != n)
        {
            return Err(BacktestError::InvalidInput(
                "Quadratic program dimensions do not match the bounds".to_string(),
            ));
        }

        match self.config.quadratic_backend {
            QuadraticBackend::Conic => self.solve_conic(qp),
            QuadraticBackend::Gradient => {
                let mut constraints = qp.constraints();
                // A unit-sum row is cheaper as a projection.
                if let Some(pos) = qp
                    .equalities
                    .iter()
                    .position(|(a, b)| *b == 1.0 && a.iter().all(|&v| v == 1.0))
                {
                    constraints[pos] = Constraint::Budget;
                }
                self.minimize(&QuadraticObjective(qp), &qp.bounds, &constraints)
            }
        }
    }

    fn solve_conic(&self, qp: &QuadraticProgram) -> Result<Solution> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        let n = qp.bounds.len();
        let m_eq = qp.equalities.len();

        // P in CSC format, upper triangle only.
        let mut p_data = Vec::new();
        let mut p_indices = Vec::new();
        let mut p_indptr = vec![0];
        for j in 0..n {
            for i in 0..=j {
                let val = 0.5 * (qp.quadratic[i][j] + qp.quadratic[j][i]);
                if val != 0.0 {
                    p_data.push(val);
                    p_indices.push(i);
                }
            }
            p_indptr.push(p_data.len());
        }
        let p = CscMatrix::new(n, n, p_indptr, p_indices, p_data);

        // Rows: equalities, then -x <= -lo, then x <= hi for finite hi.
        let upper_rows: Vec<usize> = (0..n)
            .filter(|&j| qp.bounds.upper()[j].is_finite())
            .collect();
        let mut a_data = Vec::new();
        let mut a_indices = Vec::new();
        let mut a_indptr = vec![0];
        for j in 0..n {
            for (k, (row, _)) in qp.equalities.iter().enumerate() {
                if row[j] != 0.0 {
                    a_data.push(row[j]);
                    a_indices.push(k);
                }
            }
            a_data.push(-1.0);
            a_indices.push(m_eq + j);
            if let Some(pos) = upper_rows.iter().position(|&u| u == j) {
                a_data.push(1.0);
                a_indices.push(m_eq + n + pos);
            }
            a_indptr.push(a_data.len());
        }
        let m = m_eq + n + upper_rows.len();
        let a = CscMatrix::new(m, n, a_indptr, a_indices, a_data);

        let mut b: Vec<f64> = qp.equalities.iter().map(|(_, rhs)| *rhs).collect();
        b.extend(qp.bounds.lower().iter().map(|lo| -lo));
        b.extend(upper_rows.iter().map(|&j| qp.bounds.upper()[j]));

        let mut cones = Vec::with_capacity(2);
        if m_eq > 0 {
            cones.push(ZeroConeT(m_eq));
        }
        cones.push(NonnegativeConeT(n + upper_rows.len()));

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.config.conic_max_iterations)
            .time_limit(self.config.time_limit_secs.unwrap_or(f64::INFINITY))
            .verbose(false)
            .build()
            .map_err(|e| {
                BacktestError::OptimizationError(format!("Failed to build settings: {}", e))
            })?;

        let mut solver =
            DefaultSolver::new(&p, &qp.linear, &a, &b, &cones, settings).map_err(|e| {
                BacktestError::OptimizationError(format!("Failed to create solver: {:?}", e))
            })?;

        solver.solve();

        let status = solver.solution.status;
        let iterations = solver.solution.iterations as usize;
        let raw = solver.solution.x.clone();

        let converged = matches!(status, SolverStatus::Solved | SolverStatus::AlmostSolved);
        let infeasible = matches!(
            status,
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible
        );

        let budget = qp
            .equalities
            .iter()
            .any(|(a, b)| *b == 1.0 && a.iter().all(|&v| v == 1.0));

        // Interior-point iterates sit marginally inside or outside the box;
        // snap them into the feasible set the projection guarantees.
        let weights = if raw.len() == n && raw.iter().all(|v| v.is_finite()) {
            if converged || !infeasible {
                bounds_snap(&raw, &qp.bounds, budget)
            } else {
                qp.bounds.project(&raw, budget)
            }
        } else {
            qp.bounds.project(&equal_weights(n), budget)
        };

        debug!("Conic solve finished: status={:?}, iterations={}", status, iterations);

        let mut solution = self.finish(
            qp.objective(&weights),
            weights,
            iterations,
            converged,
            &qp.bounds,
            &qp.constraints(),
        );
        if infeasible {
            solution.status = SolveStatus::Infeasible;
        }
        Ok(solution)
    }

    fn finish(
        &self,
        objective: f64,
        weights: Vec<f64>,
        iterations: usize,
        converged: bool,
        bounds: &Bounds,
        constraints: &[Constraint],
    ) -> Solution {
        let feasibility = FeasibilityReport::evaluate(&weights, bounds, constraints);
        let status = if !feasibility.is_feasible(self.config.feasibility_tolerance) {
            SolveStatus::Infeasible
        } else if !converged {
            SolveStatus::NotConverged
        } else {
            SolveStatus::Optimal
        };

        Solution {
            weights,
            objective,
            iterations,
            status,
            feasibility,
        }
    }
}

/// Clamp tiny bound excursions and renormalize, leaving genuine
/// violations visible to the feasibility report.
fn bounds_snap(x: &[f64], bounds: &Bounds, budget: bool) -> Vec<f64> {
    const SNAP: f64 = 1e-7;
    let mut w: Vec<f64> = x
        .iter()
        .zip(bounds.lower().iter().zip(bounds.upper().iter()))
        .map(|(&xi, (&lo, &hi))| {
            if xi < lo && xi > lo - SNAP {
                lo
            } else if xi > hi && xi < hi + SNAP {
                hi
            } else {
                xi
            }
        })
        .collect();

    if budget {
        let total: f64 = w.iter().sum();
        if (total - 1.0).abs() < SNAP && total > 0.0 {
            w = bounds.project(&w, true);
        }
    }
    w
}

struct AugmentedLagrangian<'a> {
    objective: &'a dyn Objective,
    constraints: &'a [&'a Constraint],
    multipliers: &'a [f64],
    penalty: f64,
}

impl AugmentedLagrangian<'_> {
    fn value(&self, w: &[f64]) -> f64 {
        let mut total = self.objective.value(w);
        for (c, &lambda) in self.constraints.iter().zip(self.multipliers.iter()) {
            let r = c.residual(w);
            total += if c.is_equality() {
                lambda * r + 0.5 * self.penalty * r * r
            } else if r - lambda / self.penalty <= 0.0 {
                -lambda * r + 0.5 * self.penalty * r * r
            } else {
                -lambda * lambda / (2.0 * self.penalty)
            };
        }
        if total.is_nan() {
            f64::INFINITY
        } else {
            total
        }
    }

    fn gradient(&self, w: &[f64]) -> Vec<f64> {
        let mut grad = self
            .objective
            .gradient(w)
            .unwrap_or_else(|| numerical_gradient(|x| self.objective.value(x), w));

        for (c, &lambda) in self.constraints.iter().zip(self.multipliers.iter()) {
            let r = c.residual(w);
            let scale = if c.is_equality() {
                lambda + self.penalty * r
            } else if r - lambda / self.penalty <= 0.0 {
                -lambda + self.penalty * r
            } else {
                0.0
            };
            if scale != 0.0 {
                for (g, dc) in grad.iter_mut().zip(c.gradient(w)) {
                    *g += scale * dc;
                }
            }
        }
        grad
    }
}

struct InnerResult {
    point: Vec<f64>,
    iterations: usize,
    converged: bool,
}

fn projected_gradient(
    lagrangian: &AugmentedLagrangian<'_>,
    start: Vec<f64>,
    project: impl Fn(&[f64]) -> Vec<f64>,
    max_iterations: usize,
    tolerance: f64,
    deadline: Option<Instant>,
) -> InnerResult {
    const ARMIJO: f64 = 1e-4;
    const MIN_STEP: f64 = 1e-14;
    const MAX_STEP: f64 = 1e14;

    let mut x = start;
    let mut fx = lagrangian.value(&x);
    let mut grad = lagrangian.gradient(&x);

    if grad.iter().any(|g| !g.is_finite()) {
        return InnerResult {
            point: x,
            iterations: 0,
            converged: false,
        };
    }

    let gmax = grad.iter().fold(0.0_f64, |a, g| a.max(g.abs()));
    let mut step = if gmax > 0.0 {
        (1.0 / gmax).clamp(MIN_STEP, MAX_STEP)
    } else {
        1.0
    };

    for k in 0..max_iterations {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return InnerResult {
                point: x,
                iterations: k,
                converged: false,
            };
        }

        let mut t = step;
        let mut accepted = None;
        let mut first_trial = true;

        while t >= MIN_STEP {
            let trial: Vec<f64> = x.iter().zip(grad.iter()).map(|(xi, gi)| xi - t * gi).collect();
            let candidate = project(&trial);
            let d: Vec<f64> = candidate.iter().zip(x.iter()).map(|(c, xi)| c - xi).collect();
            let d_norm = d.iter().fold(0.0_f64, |a, v| a.max(v.abs()));

            if first_trial && d_norm <= tolerance {
                return InnerResult {
                    point: x,
                    iterations: k,
                    converged: true,
                };
            }
            first_trial = false;

            let f_new = lagrangian.value(&candidate);
            if f_new.is_finite() && f_new <= fx + ARMIJO * dot(&grad, &d) {
                accepted = Some((candidate, f_new));
                break;
            }
            t *= 0.5;
        }

        let Some((x_new, f_new)) = accepted else {
            // No descent left at machine precision.
            return InnerResult {
                point: x,
                iterations: k,
                converged: true,
            };
        };

        let g_new = lagrangian.gradient(&x_new);
        if g_new.iter().any(|g| !g.is_finite()) {
            return InnerResult {
                point: x_new,
                iterations: k + 1,
                converged: false,
            };
        }

        // Barzilai-Borwein step for the next iteration.
        let s: Vec<f64> = x_new.iter().zip(x.iter()).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(grad.iter()).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        step = if sy > 0.0 {
            (dot(&s, &s) / sy).clamp(MIN_STEP, MAX_STEP)
        } else {
            (t * 2.0).min(MAX_STEP)
        };

        x = x_new;
        fx = f_new;
        grad = g_new;
    }

    InnerResult {
        point: x,
        iterations: max_iterations,
        converged: false,
    }
}

/// Central finite-difference gradient.
pub fn numerical_gradient(f: impl Fn(&[f64]) -> f64, x: &[f64]) -> Vec<f64> {
    let mut point = x.to_vec();
    (0..x.len())
        .map(|i| {
            let h = 1e-7 * x[i].abs().max(1.0);
            let orig = point[i];
            point[i] = orig + h;
            let up = f(&point);
            point[i] = orig - h;
            let down = f(&point);
            point[i] = orig;
            (up - down) / (2.0 * h)
        })
        .collect()
}
