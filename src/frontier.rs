//! Efficient-frontier sweep.

use crate::error::{BacktestError, Result};
use crate::optimizer::{Optimizer, SolveStatus};
use crate::policy::{MinVariance, TargetReturn, WeightPolicy};
use crate::stats::{WindowEstimate, TRADING_DAYS};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One point on the frontier. Return and volatility are per period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub target_return: f64,
    pub expected_return: f64,
    pub volatility: f64,
    /// Per-period Sharpe ratio; zero for a riskless point.
    pub sharpe_ratio: f64,
    pub weights: Vec<f64>,
    pub status: SolveStatus,
}

impl FrontierPoint {
    /// `(return * 252, volatility * sqrt(252), sharpe * sqrt(252))`.
    pub fn annualized(&self) -> (f64, f64, f64) {
        (
            self.expected_return * TRADING_DAYS,
            self.volatility * TRADING_DAYS.sqrt(),
            self.sharpe_ratio * TRADING_DAYS.sqrt(),
        )
    }
}

/// Minimum-variance portfolios for `points` targets spaced evenly between the
/// global minimum-variance return and the highest asset return.
///
/// Targets the solver reports as infeasible are left out.
pub fn efficient_frontier(
    estimate: &WindowEstimate,
    points: usize,
    risk_free_rate: f64,
    optimizer: &Optimizer,
) -> Result<Vec<FrontierPoint>> {
    if points < 2 {
        return Err(BacktestError::InvalidInput(format!(
            "Frontier needs at least 2 points, got {}",
            points
        )));
    }

    let gmv = MinVariance::new()
        .with_optimizer(optimizer.clone())
        .compute(estimate)?;
    let low = estimate.portfolio_return(&gmv.weights);
    let high = estimate
        .expected_returns
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let high = high.max(low);

    let mut frontier = Vec::with_capacity(points);
    for k in 0..points {
        let target = low + (high - low) * k as f64 / (points - 1) as f64;
        let allocation = TargetReturn::new(target)
            .with_optimizer(optimizer.clone())
            .compute(estimate)?;

        if allocation.status == SolveStatus::Infeasible {
            debug!("Frontier target {:.6} infeasible, skipped", target);
            continue;
        }

        let volatility = estimate.portfolio_volatility(&allocation.weights);
        frontier.push(FrontierPoint {
            target_return: target,
            expected_return: estimate.portfolio_return(&allocation.weights),
            volatility,
            sharpe_ratio: estimate
                .sharpe_ratio(&allocation.weights, risk_free_rate)
                .unwrap_or(0.0),
            weights: allocation.weights,
            status: allocation.status,
        });
    }

    Ok(frontier)
}
