//! Window estimation and portfolio algebra.
//!
//! All matrices are dense `Vec<Vec<f64>>` in asset order. Estimates are built
//! fresh from one window of returns and carry no reference to the history
//! they came from.

use crate::error::{BacktestError, Result};
use serde::{Deserialize, Serialize};

/// Trading periods per year used for annualization.
pub const TRADING_DAYS: f64 = 252.0;

/// Expected returns and covariance estimated from one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEstimate {
    /// Per-asset arithmetic mean return.
    pub expected_returns: Vec<f64>,
    /// Sample covariance matrix (n - 1 denominator).
    pub covariance: Vec<Vec<f64>>,
}

impl WindowEstimate {
    /// Build an estimate from precomputed statistics.
    pub fn new(expected_returns: Vec<f64>, covariance: Vec<Vec<f64>>) -> Result<Self> {
        let n = expected_returns.len();
        if n == 0 {
            return Err(BacktestError::InvalidInput(
                "Need at least one asset".to_string(),
            ));
        }
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(BacktestError::InvalidInput(
                "Covariance matrix must be square and match number of assets".to_string(),
            ));
        }
        if expected_returns.iter().any(|v| !v.is_finite())
            || covariance.iter().flatten().any(|v| !v.is_finite())
        {
            return Err(BacktestError::InvalidInput(
                "Estimate contains non-finite values".to_string(),
            ));
        }

        Ok(Self {
            expected_returns,
            covariance,
        })
    }

    /// Estimate mean and sample covariance from `rows` (dates x assets).
    ///
    /// Constant columns produce zero variance rather than an error.
    pub fn from_window(rows: &[Vec<f64>]) -> Result<Self> {
        if rows.len() < 2 {
            return Err(BacktestError::InvalidInput(format!(
                "Need at least 2 observations to estimate covariance, got {}",
                rows.len()
            )));
        }

        let n = rows[0].len();
        if rows.iter().any(|r| r.len() != n) {
            return Err(BacktestError::InvalidInput(
                "Window rows have inconsistent widths".to_string(),
            ));
        }

        let t = rows.len() as f64;
        let mut means = vec![0.0; n];
        for row in rows {
            for (m, v) in means.iter_mut().zip(row.iter()) {
                *m += v;
            }
        }
        for m in means.iter_mut() {
            *m /= t;
        }

        let mut covariance = vec![vec![0.0; n]; n];
        for row in rows {
            for i in 0..n {
                let di = row[i] - means[i];
                for j in i..n {
                    covariance[i][j] += di * (row[j] - means[j]);
                }
            }
        }
        for i in 0..n {
            for j in i..n {
                let c = covariance[i][j] / (t - 1.0);
                covariance[i][j] = c;
                covariance[j][i] = c;
            }
        }

        Self::new(means, covariance)
    }

    pub fn n_assets(&self) -> usize {
        self.expected_returns.len()
    }

    /// `w · μ`.
    pub fn portfolio_return(&self, weights: &[f64]) -> f64 {
        dot(weights, &self.expected_returns)
    }

    /// `wᵀ Σ w`.
    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        quadratic_form(&self.covariance, weights)
    }

    /// `sqrt(wᵀ Σ w)`, with tiny negative round-off clamped to zero.
    pub fn portfolio_volatility(&self, weights: &[f64]) -> f64 {
        self.portfolio_variance(weights).max(0.0).sqrt()
    }

    /// Per-period Sharpe ratio of `weights` given a per-period risk-free rate.
    ///
    /// Returns `None` when volatility is zero.
    pub fn sharpe_ratio(&self, weights: &[f64], risk_free_rate: f64) -> Option<f64> {
        let vol = self.portfolio_volatility(weights);
        if vol > 0.0 {
            Some((self.portfolio_return(weights) - risk_free_rate) / vol)
        } else {
            None
        }
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn mat_vec_mul(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    mat.iter().map(|row| dot(row, v)).collect()
}

pub fn quadratic_form(mat: &[Vec<f64>], v: &[f64]) -> f64 {
    dot(v, &mat_vec_mul(mat, v))
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Sample standard deviation (n - 1 denominator); zero for fewer than two points.
pub fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}
