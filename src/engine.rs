//! Rolling-window backtest engine.
//!
//! The walk estimates statistics on a trailing window, asks a
//! [`WeightPolicy`] for weights, charges a fee for every position that
//! changed, then compounds capital over the next holding period with those
//! weights held fixed.

use crate::analytics::PerformanceSummary;
use crate::error::{BacktestError, Result};
use crate::optimizer::SolveStatus;
use crate::policy::WeightPolicy;
use crate::stats::{dot, WindowEstimate};
use crate::types::{CapitalSeries, ReturnMatrix, TimeSeries};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// How the per-rebalance fee total reduces capital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeeModel {
    /// `capital -= fee_total / capital`.
    #[default]
    CapitalScaled,
    /// `capital -= fee_total`.
    Flat,
    /// `capital *= 1 - fee_total`.
    Proportional,
}

impl FeeModel {
    /// Capital after charging `fee_total`.
    pub fn apply(self, capital: f64, fee_total: f64) -> f64 {
        match self {
            FeeModel::CapitalScaled => capital - fee_total / capital,
            FeeModel::Flat => capital - fee_total,
            FeeModel::Proportional => capital * (1.0 - fee_total),
        }
    }
}

/// What to do when a policy reports an infeasible allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InfeasibleAction {
    /// End the walk and keep the partial series.
    #[default]
    Stop,
    /// Keep the previous weights. Stops instead when there are none yet.
    HoldPrevious,
    /// Trade the infeasible candidate anyway.
    UseCandidate,
}

/// Configuration for the rolling engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Rows per estimation window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Rows held between rebalances.
    #[serde(default = "default_rebalance_freq")]
    pub rebalance_freq: usize,
    /// Fixed fee per changed position.
    #[serde(default)]
    pub transaction_fee: f64,
    /// Minimum absolute weight change counted as a trade.
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
    /// Starting capital.
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default)]
    pub fee_model: FeeModel,
    #[serde(default)]
    pub on_infeasible: InfeasibleAction,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            rebalance_freq: default_rebalance_freq(),
            transaction_fee: 0.0,
            change_threshold: default_change_threshold(),
            initial_capital: default_initial_capital(),
            fee_model: FeeModel::default(),
            on_infeasible: InfeasibleAction::default(),
        }
    }
}

fn default_window_size() -> usize {
    252
}

fn default_rebalance_freq() -> usize {
    21
}

fn default_change_threshold() -> f64 {
    1e-4
}

fn default_initial_capital() -> f64 {
    1.0
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size < 2 {
            return Err(BacktestError::ConfigError(format!(
                "window_size must be at least 2, got {}",
                self.window_size
            )));
        }
        if self.rebalance_freq == 0 {
            return Err(BacktestError::ConfigError(
                "rebalance_freq must be positive".to_string(),
            ));
        }
        if !self.transaction_fee.is_finite() || self.transaction_fee < 0.0 {
            return Err(BacktestError::ConfigError(format!(
                "transaction_fee must be finite and non-negative, got {}",
                self.transaction_fee
            )));
        }
        if !self.change_threshold.is_finite() || self.change_threshold < 0.0 {
            return Err(BacktestError::ConfigError(format!(
                "change_threshold must be finite and non-negative, got {}",
                self.change_threshold
            )));
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(BacktestError::ConfigError(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        Ok(())
    }
}

/// Why the walk ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// Every row was consumed (or there was nothing to consume).
    Completed,
    /// The policy reported an infeasible allocation under [`InfeasibleAction::Stop`].
    Infeasible { date: DateTime<Utc> },
    /// Window statistics could not be estimated (e.g. covariance overflow).
    EstimationFailed { date: DateTime<Utc>, message: String },
    /// The policy returned an error.
    PolicyError { date: DateTime<Utc>, message: String },
    /// The policy returned a weight vector of the wrong length.
    WrongWidth {
        date: DateTime<Utc>,
        expected: usize,
        got: usize,
    },
    /// The policy produced NaN or infinite weights.
    NonFiniteWeights { date: DateTime<Utc> },
    /// Capital became non-positive or non-finite.
    CapitalDepleted { date: DateTime<Utc> },
}

impl Termination {
    pub fn is_completed(&self) -> bool {
        matches!(self, Termination::Completed)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::Infeasible { date } => {
                write!(f, "infeasible allocation on {}", date.format("%Y-%m-%d"))
            }
            Termination::EstimationFailed { date, message } => {
                write!(f, "estimation failed on {}: {}", date.format("%Y-%m-%d"), message)
            }
            Termination::WrongWidth {
                date,
                expected,
                got,
            } => write!(
                f,
                "{} weights for {} assets on {}",
                got,
                expected,
                date.format("%Y-%m-%d")
            ),
            Termination::PolicyError { date, message } => {
                write!(f, "policy error on {}: {}", date.format("%Y-%m-%d"), message)
            }
            Termination::NonFiniteWeights { date } => {
                write!(f, "non-finite weights on {}", date.format("%Y-%m-%d"))
            }
            Termination::CapitalDepleted { date } => {
                write!(f, "capital depleted on {}", date.format("%Y-%m-%d"))
            }
        }
    }
}

/// One executed rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub date: DateTime<Utc>,
    pub weights: Vec<f64>,
    /// Assets whose weight moved by more than the change threshold.
    pub changed_positions: usize,
    /// `transaction_fee * changed_positions`.
    pub fee_total: f64,
    /// Capital removed by the fee model.
    pub capital_charged: f64,
    pub status: SolveStatus,
}

/// Output of one rolling backtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub assets: Vec<String>,
    pub config: BacktestConfig,
    /// Capital after every held row, dated from row `window_size` on.
    pub capital: CapitalSeries,
    pub rebalances: Vec<RebalanceRecord>,
    pub termination: Termination,
}

impl BacktestResult {
    pub fn final_capital(&self) -> f64 {
        self.capital.last().unwrap_or(self.config.initial_capital)
    }

    pub fn total_fees(&self) -> f64 {
        self.rebalances.iter().map(|r| r.capital_charged).sum()
    }

    /// Period-over-period returns of the capital series, including fees.
    pub fn returns(&self) -> TimeSeries {
        let mut out = TimeSeries::with_capacity(self.capital.len());
        let mut prev = self.config.initial_capital;
        for (date, value) in self.capital.iter() {
            out.push(date, value / prev - 1.0);
            prev = value;
        }
        out
    }

    pub fn summary(&self) -> PerformanceSummary {
        PerformanceSummary::from_capital(self.capital.values(), self.config.initial_capital)
    }
}

/// Rolling backtest engine.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: BacktestConfig,
}

impl Engine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Set the configuration.
    pub fn set_config(&mut self, config: BacktestConfig) {
        self.config = config;
    }

    /// Walk `returns` forward with `policy`.
    ///
    /// Degenerate situations end the walk early rather than failing; the
    /// partial series is returned together with the [`Termination`] reason.
    /// Only an invalid configuration is an error.
    pub fn run(&self, policy: &dyn WeightPolicy, returns: &ReturnMatrix) -> Result<BacktestResult> {
        self.config.validate()?;

        let cfg = &self.config;
        let rows = returns.len();
        let n = returns.n_assets();

        let mut result = BacktestResult {
            strategy_name: policy.name().to_string(),
            assets: returns.assets().to_vec(),
            config: cfg.clone(),
            capital: CapitalSeries::with_capacity(rows.saturating_sub(cfg.window_size)),
            rebalances: Vec::new(),
            termination: Termination::Completed,
        };

        if cfg.window_size >= rows {
            info!(
                "Not enough history for {}: window {} >= {} rows",
                policy.name(),
                cfg.window_size,
                rows
            );
            return Ok(result);
        }

        info!(
            "Running rolling backtest: {} on {} assets ({} rows, window {}, every {})",
            policy.name(),
            n,
            rows,
            cfg.window_size,
            cfg.rebalance_freq
        );

        let dates = returns.dates();
        let mut capital = cfg.initial_capital;
        let mut prev = vec![0.0; n];
        let mut i = cfg.window_size;

        'walk: while i < rows {
            let date = dates[i];
            let estimate = match WindowEstimate::from_window(returns.window(i - cfg.window_size..i)) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Estimation failed on {}: {}", date.format("%Y-%m-%d"), e);
                    result.termination = Termination::EstimationFailed {
                        date,
                        message: e.to_string(),
                    };
                    break;
                }
            };

            let allocation = match policy.compute(&estimate) {
                Ok(a) => a,
                Err(e) => {
                    warn!("{} failed on {}: {}", policy.name(), date.format("%Y-%m-%d"), e);
                    result.termination = Termination::PolicyError {
                        date,
                        message: e.to_string(),
                    };
                    break;
                }
            };

            let weights = match allocation.status {
                SolveStatus::Optimal => allocation.weights,
                SolveStatus::NotConverged => {
                    warn!(
                        "{} did not converge on {}; using best candidate",
                        policy.name(),
                        date.format("%Y-%m-%d")
                    );
                    allocation.weights
                }
                SolveStatus::Infeasible => match cfg.on_infeasible {
                    InfeasibleAction::Stop => {
                        warn!(
                            "{} infeasible on {}; stopping",
                            policy.name(),
                            date.format("%Y-%m-%d")
                        );
                        result.termination = Termination::Infeasible { date };
                        break;
                    }
                    InfeasibleAction::HoldPrevious if result.rebalances.is_empty() => {
                        warn!(
                            "{} infeasible on {} with no previous weights; stopping",
                            policy.name(),
                            date.format("%Y-%m-%d")
                        );
                        result.termination = Termination::Infeasible { date };
                        break;
                    }
                    InfeasibleAction::HoldPrevious => {
                        warn!(
                            "{} infeasible on {}; holding previous weights",
                            policy.name(),
                            date.format("%Y-%m-%d")
                        );
                        prev.clone()
                    }
                    InfeasibleAction::UseCandidate => {
                        warn!(
                            "{} infeasible on {}; trading candidate anyway",
                            policy.name(),
                            date.format("%Y-%m-%d")
                        );
                        allocation.weights
                    }
                },
            };

            if weights.len() != n {
                warn!(
                    "{} returned {} weights for {} assets on {}",
                    policy.name(),
                    weights.len(),
                    n,
                    date.format("%Y-%m-%d")
                );
                result.termination = Termination::WrongWidth {
                    date,
                    expected: n,
                    got: weights.len(),
                };
                break;
            }
            if weights.iter().any(|w| !w.is_finite()) {
                warn!("{} produced non-finite weights on {}", policy.name(), date.format("%Y-%m-%d"));
                result.termination = Termination::NonFiniteWeights { date };
                break;
            }

            let changed_positions = weights
                .iter()
                .zip(prev.iter())
                .filter(|(new, old)| (*new - *old).abs() > cfg.change_threshold)
                .count();
            let fee_total = cfg.transaction_fee * changed_positions as f64;
            let before = capital;
            if fee_total > 0.0 {
                capital = cfg.fee_model.apply(capital, fee_total);
            }

            debug!(
                "Rebalance on {}: {} changed, fee {:.6}, capital {:.6}",
                date.format("%Y-%m-%d"),
                changed_positions,
                fee_total,
                capital
            );

            result.rebalances.push(RebalanceRecord {
                date,
                weights: weights.clone(),
                changed_positions,
                fee_total,
                capital_charged: before - capital,
                status: allocation.status,
            });

            if !(capital.is_finite() && capital > 0.0) {
                warn!("Capital depleted by fees on {}", date.format("%Y-%m-%d"));
                result.termination = Termination::CapitalDepleted { date };
                break;
            }

            let end = (i + cfg.rebalance_freq).min(rows);
            for (t, row) in returns.window(i..end).iter().enumerate() {
                capital *= 1.0 + dot(row, &weights);
                let day = dates[i + t];
                if !capital.is_finite() {
                    result.termination = Termination::CapitalDepleted { date: day };
                    break 'walk;
                }
                result.capital.push(day, capital);
                if capital <= 0.0 {
                    warn!("Capital depleted on {}", day.format("%Y-%m-%d"));
                    result.termination = Termination::CapitalDepleted { date: day };
                    break 'walk;
                }
            }

            prev = weights;
            i += cfg.rebalance_freq;
        }

        info!(
            "Backtest complete: {} final capital {:.4} after {} rebalances ({})",
            policy.name(),
            result.final_capital(),
            result.rebalances.len(),
            result.termination
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{Bounds, Constraint, FeasibilityReport};
    use crate::policy::{Allocation, EqualWeight, FixedWeights, MinVariance, TargetReturn};
    use chrono::TimeZone;

    fn matrix(rows: Vec<Vec<f64>>) -> ReturnMatrix {
        let n = rows[0].len();
        let start = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
        let dates = (0..rows.len())
            .map(|i| start + chrono::Duration::days(i as i64))
            .collect();
        let assets = (0..n).map(|j| format!("A{}", j)).collect();
        ReturnMatrix::new(dates, assets, rows).unwrap()
    }

    fn noisy(rows: usize, n: usize) -> ReturnMatrix {
        matrix(
            (0..rows)
                .map(|t| {
                    (0..n)
                        .map(|j| 0.001 * (j as f64 + 1.0) * (((t * (j + 3)) % 7) as f64 - 3.0) / 3.0)
                        .collect()
                })
                .collect(),
        )
    }

    fn config(window: usize, freq: usize) -> BacktestConfig {
        BacktestConfig {
            window_size: window,
            rebalance_freq: freq,
            ..Default::default()
        }
    }

    struct Scripted {
        statuses: Vec<SolveStatus>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl WeightPolicy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
            let k = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let n = estimate.n_assets();
            let mut weights = vec![0.0; n];
            weights[k % n] = 1.0;
            Ok(Allocation {
                feasibility: FeasibilityReport::evaluate(&weights, &Bounds::unit(n), &[Constraint::Budget]),
                weights,
                status: self.statuses[k.min(self.statuses.len() - 1)],
            })
        }
    }

    #[test]
    fn test_invalid_config_is_error() {
        let m = noisy(10, 2);
        assert!(Engine::new(config(1, 1)).run(&EqualWeight, &m).is_err());
        assert!(Engine::new(config(5, 0)).run(&EqualWeight, &m).is_err());
        let cfg = BacktestConfig {
            initial_capital: 0.0,
            ..config(5, 1)
        };
        assert!(matches!(
            Engine::new(cfg).run(&EqualWeight, &m),
            Err(BacktestError::ConfigError(_))
        ));
    }

    #[test]
    fn test_window_longer_than_history_is_empty() {
        let m = noisy(10, 2);
        let result = Engine::new(config(10, 2)).run(&EqualWeight, &m).unwrap();
        assert!(result.capital.is_empty());
        assert!(result.rebalances.is_empty());
        assert!(result.termination.is_completed());
    }

    #[test]
    fn test_output_dates_start_at_window() {
        let m = noisy(30, 2);
        let result = Engine::new(config(10, 4)).run(&EqualWeight, &m).unwrap();
        assert_eq!(result.capital.len(), 20);
        assert_eq!(result.capital.dates()[0], m.dates()[10]);
        assert_eq!(result.capital.dates().last(), m.dates().last());
        // Rebalances at 10, 14, 18, 22, 26; the last holds only 4 rows.
        assert_eq!(result.rebalances.len(), 5);
    }

    #[test]
    fn test_trailing_partial_period_is_held() {
        let m = noisy(25, 2);
        let result = Engine::new(config(10, 10)).run(&EqualWeight, &m).unwrap();
        assert_eq!(result.capital.len(), 15);
        assert_eq!(result.rebalances.len(), 2);
    }

    #[test]
    fn test_fee_models() {
        assert_eq!(FeeModel::CapitalScaled.apply(2.0, 1.0), 1.5);
        assert_eq!(FeeModel::Flat.apply(2.0, 1.0), 1.0);
        assert_eq!(FeeModel::Proportional.apply(2.0, 0.25), 1.5);
    }

    #[test]
    fn test_fee_only_on_first_rebalance_for_constant_weights() {
        let m = noisy(40, 3);
        let cfg = BacktestConfig {
            transaction_fee: 0.001,
            ..config(10, 5)
        };
        let policy = FixedWeights::new(vec![0.5, 0.5, 0.0]).unwrap();
        let result = Engine::new(cfg).run(&policy, &m).unwrap();

        assert_eq!(result.rebalances[0].changed_positions, 2);
        assert!((result.rebalances[0].fee_total - 0.002).abs() < 1e-15);
        assert!((result.rebalances[0].capital_charged - 0.002).abs() < 1e-15);
        for record in &result.rebalances[1..] {
            assert_eq!(record.changed_positions, 0);
            assert_eq!(record.capital_charged, 0.0);
        }
    }

    #[test]
    fn test_stop_on_infeasible_truncates() {
        let m = noisy(40, 2);
        let policy = Scripted {
            statuses: vec![SolveStatus::Optimal, SolveStatus::Optimal, SolveStatus::Infeasible],
            calls: Default::default(),
        };
        let result = Engine::new(config(10, 5)).run(&policy, &m).unwrap();

        assert_eq!(result.rebalances.len(), 2);
        assert_eq!(result.capital.len(), 10);
        assert_eq!(
            result.termination,
            Termination::Infeasible { date: m.dates()[20] }
        );
    }

    #[test]
    fn test_hold_previous_keeps_weights() {
        let m = noisy(30, 2);
        let policy = Scripted {
            statuses: vec![SolveStatus::Optimal, SolveStatus::Infeasible],
            calls: Default::default(),
        };
        let cfg = BacktestConfig {
            on_infeasible: InfeasibleAction::HoldPrevious,
            ..config(10, 5)
        };
        let result = Engine::new(cfg).run(&policy, &m).unwrap();

        assert!(result.termination.is_completed());
        assert_eq!(result.capital.len(), 20);
        for record in &result.rebalances[1..] {
            assert_eq!(record.weights, result.rebalances[0].weights);
            assert_eq!(record.changed_positions, 0);
        }
    }

    #[test]
    fn test_hold_previous_without_history_stops() {
        let m = noisy(30, 2);
        let policy = Scripted {
            statuses: vec![SolveStatus::Infeasible, SolveStatus::Optimal],
            calls: Default::default(),
        };
        let cfg = BacktestConfig {
            on_infeasible: InfeasibleAction::HoldPrevious,
            ..config(10, 5)
        };
        let result = Engine::new(cfg).run(&policy, &m).unwrap();

        assert!(result.capital.is_empty());
        assert!(result.rebalances.is_empty());
        assert_eq!(
            result.termination,
            Termination::Infeasible { date: m.dates()[10] }
        );
    }

    struct WeightsOf(Vec<f64>);

    impl WeightPolicy for WeightsOf {
        fn name(&self) -> &str {
            "weights"
        }

        fn compute(&self, _estimate: &WindowEstimate) -> Result<Allocation> {
            Ok(Allocation::exact(self.0.clone()))
        }
    }

    #[test]
    fn test_wrong_width_and_non_finite_weights_are_distinct() {
        let m = noisy(30, 2);
        let engine = Engine::new(config(10, 5));

        let wide = engine.run(&WeightsOf(vec![0.5, 0.25, 0.25]), &m).unwrap();
        assert_eq!(
            wide.termination,
            Termination::WrongWidth {
                date: m.dates()[10],
                expected: 2,
                got: 3
            }
        );

        let nan = engine.run(&WeightsOf(vec![f64::NAN, 1.0]), &m).unwrap();
        assert_eq!(
            nan.termination,
            Termination::NonFiniteWeights { date: m.dates()[10] }
        );
        assert!(wide.capital.is_empty() && nan.capital.is_empty());
    }

    #[test]
    fn test_covariance_overflow_ends_walk_with_partial_series() {
        let mut rows: Vec<Vec<f64>> = (0..30)
            .map(|t| vec![0.001 * (t % 3) as f64, 0.0005 * (t % 2) as f64])
            .collect();
        rows[22] = vec![1e160, 1e160];
        let m = matrix(rows);

        let result = Engine::new(config(10, 5)).run(&EqualWeight, &m).unwrap();

        assert_eq!(result.capital.len(), 15);
        assert!(result.capital.values().iter().all(|c| c.is_finite()));
        assert!(matches!(
            result.termination,
            Termination::EstimationFailed { date, .. } if date == m.dates()[25]
        ));
    }

    #[test]
    fn test_not_converged_is_used() {
        let m = noisy(30, 2);
        let policy = Scripted {
            statuses: vec![SolveStatus::NotConverged],
            calls: Default::default(),
        };
        let result = Engine::new(config(10, 5)).run(&policy, &m).unwrap();
        assert!(result.termination.is_completed());
        assert!(result
            .rebalances
            .iter()
            .all(|r| r.status == SolveStatus::NotConverged));
    }

    #[test]
    fn test_unreachable_target_stops_by_default() {
        let m = noisy(40, 3);
        let result = Engine::new(config(10, 5))
            .run(&TargetReturn::new(0.5), &m)
            .unwrap();
        assert!(result.capital.is_empty());
        assert!(matches!(result.termination, Termination::Infeasible { .. }));
    }

    #[test]
    fn test_fees_can_deplete_capital() {
        let m = noisy(30, 2);
        let cfg = BacktestConfig {
            transaction_fee: 1.0,
            ..config(10, 5)
        };
        let result = Engine::new(cfg).run(&EqualWeight, &m).unwrap();
        assert!(result.capital.is_empty());
        assert!(matches!(result.termination, Termination::CapitalDepleted { .. }));
    }

    #[test]
    fn test_zero_variance_window_does_not_crash() {
        let m = matrix(vec![vec![0.001, 0.002]; 30]);
        let result = Engine::new(config(10, 5)).run(&MinVariance::new(), &m).unwrap();
        assert_eq!(result.capital.len(), 20);
        assert!(result.capital.values().iter().all(|c| c.is_finite() && *c > 0.0));
    }

    #[test]
    fn test_returns_and_summary_match_capital() {
        let m = noisy(40, 2);
        let result = Engine::new(config(10, 5)).run(&EqualWeight, &m).unwrap();
        let returns = result.returns();
        assert_eq!(returns.len(), result.capital.len());
        let rebuilt = returns.values().iter().fold(1.0, |c, r| c * (1.0 + r));
        assert!((rebuilt - result.final_capital()).abs() < 1e-12);
        assert_eq!(result.summary().total_return, result.final_capital() - 1.0);
    }
}
