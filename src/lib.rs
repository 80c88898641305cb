//! Folio - rolling-window portfolio optimization and rebalancing backtests.
//!
//! # Overview
//!
//! Folio estimates expected returns and covariance over a trailing window of
//! asset returns, asks a weight policy for an allocation, and walks the
//! capital of that allocation forward until the next rebalance:
//!
//! - **Constrained optimizer**: box bounds, a budget constraint, linear and
//!   arbitrary (in)equality constraints, with a conic backend for quadratic programs
//! - **Weight policies**: minimum variance, target return, maximum Sharpe,
//!   custom objectives, equal and fixed weights
//! - **Rolling engine**: fixed fee per changed position, configurable
//!   handling of infeasible windows
//! - **Comparison**: run several policies in parallel and align their
//!   capital series by date
//! - **Analytics**: total/annualized return, volatility, Sharpe, max drawdown
//!
//! # Quick Start
//!
//! ```no_run
//! use folio::{
//!     data::{load_prices_csv, DataConfig},
//!     engine::{BacktestConfig, Engine},
//!     policy::MinVariance,
//!     types::ReturnKind,
//! };
//!
//! let returns = load_prices_csv("data/prices.csv", &DataConfig::default(), ReturnKind::Log).unwrap();
//!
//! let config = BacktestConfig {
//!     window_size: 126,
//!     rebalance_freq: 21,
//!     ..Default::default()
//! };
//! let result = Engine::new(config).run(&MinVariance::new(), &returns).unwrap();
//!
//! println!("Final capital: {:.4}", result.final_capital());
//! println!("Sharpe: {:.2}", result.summary().sharpe_ratio);
//! ```
//!
//! # Custom Policies
//!
//! Implement [`WeightPolicy`] to plug your own allocation rule into the engine:
//!
//! ```
//! use folio::policy::{Allocation, WeightPolicy};
//! use folio::stats::WindowEstimate;
//! use folio::Result;
//!
//! struct AllInFirst;
//!
//! impl WeightPolicy for AllInFirst {
//!     fn name(&self) -> &str {
//!         "All In First"
//!     }
//!
//!     fn compute(&self, estimate: &WindowEstimate) -> Result<Allocation> {
//!         let mut weights = vec![0.0; estimate.n_assets()];
//!         weights[0] = 1.0;
//!         Ok(Allocation::exact(weights))
//!     }
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Return matrices and dated series
//! - [`stats`]: Window estimates (mean vector and sample covariance)
//! - [`optimizer`]: Bounded, constrained minimization
//! - [`policy`]: Weight policies
//! - [`engine`]: Rolling backtest engine
//! - [`compare`]: Multi-strategy comparison
//! - [`analytics`]: Performance summaries, static backtests, reporting
//! - [`frontier`]: Efficient-frontier sweep
//! - [`data`]: CSV loading
//! - [`config`]: TOML configuration file support

pub mod analytics;
pub mod compare;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod frontier;
pub mod optimizer;
pub mod policy;
pub mod stats;
pub mod types;

// Re-exports for convenience
pub use analytics::{PerformanceSummary, ResultFormatter, StaticBacktest};
pub use compare::{compare_strategies, Comparison, ComparisonTable, StrategySet};
pub use engine::{BacktestConfig, BacktestResult, Engine, FeeModel, InfeasibleAction, Termination};
pub use error::{BacktestError, Result};
pub use optimizer::{Bounds, Constraint, Optimizer, OptimizerConfig, SolveStatus};
pub use policy::{
    Allocation, CustomObjective, EqualWeight, FixedWeights, MaxSharpe, MinVariance, TargetReturn,
    WeightPolicy,
};
pub use stats::WindowEstimate;
pub use types::{CapitalSeries, ReturnKind, ReturnMatrix, TimeSeries};
