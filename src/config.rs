//! Configuration file support.
//!
//! A run is described by one TOML file: engine settings, solver limits, the
//! data source and the list of strategies to evaluate.

use crate::compare::StrategySet;
use crate::data::{load_prices_csv, load_returns_csv, DataConfig};
use crate::engine::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::optimizer::{Optimizer, OptimizerConfig, QuadraticBackend};
use crate::policy::{EqualWeight, FixedWeights, MaxSharpe, MinVariance, TargetReturn};
use crate::types::{ReturnKind, ReturnMatrix};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolioFileConfig {
    /// Rolling engine settings.
    #[serde(default)]
    pub backtest: BacktestConfig,
    /// Solver settings.
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    /// Data settings.
    #[serde(default)]
    pub data: DataSettings,
    /// Strategies to run, in order.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategySettings>,
}

impl Default for FolioFileConfig {
    fn default() -> Self {
        Self {
            backtest: BacktestConfig::default(),
            optimizer: OptimizerSettings::default(),
            data: DataSettings::default(),
            strategies: default_strategies(),
        }
    }
}

fn default_strategies() -> Vec<StrategySettings> {
    vec![
        StrategySettings::new("Minimum Variance", StrategyKind::MinVariance),
        StrategySettings::new("Maximum Sharpe", StrategyKind::MaxSharpe),
        StrategySettings::new("Equal Weight", StrategyKind::EqualWeight),
    ]
}

/// Solver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_outer_iterations")]
    pub max_outer_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_feasibility_tolerance")]
    pub feasibility_tolerance: f64,
    /// Wall-clock limit per solve in seconds.
    #[serde(default)]
    pub time_limit_secs: Option<f64>,
    /// "conic" or "gradient".
    #[serde(default)]
    pub backend: QuadraticBackend,
}

fn default_max_iterations() -> usize { 2_000 }
fn default_max_outer_iterations() -> usize { 25 }
fn default_tolerance() -> f64 { 1e-10 }
fn default_feasibility_tolerance() -> f64 { 1e-6 }

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_outer_iterations: default_max_outer_iterations(),
            tolerance: default_tolerance(),
            feasibility_tolerance: default_feasibility_tolerance(),
            time_limit_secs: None,
            backend: QuadraticBackend::default(),
        }
    }
}

impl OptimizerSettings {
    pub fn to_optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            max_iterations: self.max_iterations,
            max_outer_iterations: self.max_outer_iterations,
            tolerance: self.tolerance,
            feasibility_tolerance: self.feasibility_tolerance,
            time_limit_secs: self.time_limit_secs,
            quadratic_backend: self.backend,
            ..OptimizerConfig::default()
        }
    }
}

/// Whether the data file holds prices or returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    #[default]
    Prices,
    Returns,
}

/// Data settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataSettings {
    /// Path to the wide CSV file.
    pub path: Option<String>,
    #[serde(default)]
    pub kind: DataKind,
    /// Return definition when `kind = "prices"`.
    #[serde(default)]
    pub returns: ReturnKind,
    /// Date format in CSV.
    pub date_format: Option<String>,
    /// CSV delimiter; auto-detected when unset.
    pub delimiter: Option<char>,
}

impl DataSettings {
    pub fn to_data_config(&self) -> DataConfig {
        DataConfig {
            date_format: self.date_format.clone(),
            delimiter: self.delimiter.map(|c| c as u8),
        }
    }

    /// Load the configured file as a return matrix.
    pub fn load(&self) -> Result<ReturnMatrix> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| BacktestError::ConfigError("data.path is not set".to_string()))?;
        let config = self.to_data_config();
        match self.kind {
            DataKind::Prices => load_prices_csv(path, &config, self.returns),
            DataKind::Returns => load_returns_csv(path, &config),
        }
    }
}

/// Built-in strategy types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    MinVariance,
    MaxSharpe,
    TargetReturn,
    EqualWeight,
    Fixed,
}

/// One strategy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    /// Column name in comparison output.
    pub name: String,
    pub kind: StrategyKind,
    /// Per-period target return (target-return only).
    #[serde(default)]
    pub target_return: Option<f64>,
    /// Per-period risk-free rate (max-sharpe only).
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Constant weights (fixed only).
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
}

impl StrategySettings {
    pub fn new(name: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            target_return: None,
            risk_free_rate: 0.0,
            weights: None,
        }
    }

    /// Add this strategy to `set`.
    pub fn add_to(&self, set: &mut StrategySet, optimizer: &Optimizer) -> Result<()> {
        match self.kind {
            StrategyKind::MinVariance => {
                set.insert(&self.name, MinVariance::new().with_optimizer(optimizer.clone()));
            }
            StrategyKind::MaxSharpe => {
                set.insert(
                    &self.name,
                    MaxSharpe::new(self.risk_free_rate).with_optimizer(optimizer.clone()),
                );
            }
            StrategyKind::TargetReturn => {
                let target = self.target_return.ok_or_else(|| {
                    BacktestError::ConfigError(format!(
                        "Strategy '{}' needs target_return",
                        self.name
                    ))
                })?;
                set.insert(
                    &self.name,
                    TargetReturn::new(target).with_optimizer(optimizer.clone()),
                );
            }
            StrategyKind::EqualWeight => {
                set.insert(&self.name, EqualWeight);
            }
            StrategyKind::Fixed => {
                let weights = self.weights.clone().ok_or_else(|| {
                    BacktestError::ConfigError(format!("Strategy '{}' needs weights", self.name))
                })?;
                set.insert(&self.name, FixedWeights::new(weights)?);
            }
        }
        Ok(())
    }
}

impl FolioFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: FolioFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validated engine configuration.
    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        self.backtest.validate()?;
        Ok(self.backtest.clone())
    }

    pub fn optimizer(&self) -> Optimizer {
        Optimizer::new(self.optimizer.to_optimizer_config())
    }

    /// Instantiate every configured strategy.
    pub fn build_strategies(&self) -> Result<StrategySet> {
        if self.strategies.is_empty() {
            return Err(BacktestError::ConfigError(
                "No strategies configured".to_string(),
            ));
        }
        let optimizer = self.optimizer();
        let mut set = StrategySet::new();
        for strategy in &self.strategies {
            strategy.add_to(&mut set, &optimizer)?;
        }
        Ok(set)
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# folio run configuration

[backtest]
window_size = 252        # rows per estimation window
rebalance_freq = 21      # rows between rebalances
transaction_fee = 0.0    # fixed fee per changed position
change_threshold = 0.0001
initial_capital = 1.0
fee_model = "capital_scaled"   # capital_scaled | flat | proportional
on_infeasible = "stop"         # stop | hold_previous | use_candidate

[optimizer]
max_iterations = 2000
max_outer_iterations = 25
tolerance = 1e-10
feasibility_tolerance = 1e-6
# time_limit_secs = 5.0
backend = "conic"        # conic | gradient

[data]
path = "data/prices.csv"
kind = "prices"          # prices | returns
returns = "log"          # log | simple
# date_format = "%Y-%m-%d"
# delimiter = ","

[[strategies]]
name = "Minimum Variance"
kind = "min-variance"

[[strategies]]
name = "Maximum Sharpe"
kind = "max-sharpe"
risk_free_rate = 0.0

[[strategies]]
name = "Target Return"
kind = "target-return"
target_return = 0.0004

[[strategies]]
name = "Equal Weight"
kind = "equal-weight"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FeeModel, InfeasibleAction};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = FolioFileConfig::default();
        assert_eq!(config.backtest.window_size, 252);
        assert_eq!(config.backtest.rebalance_freq, 21);
        assert_eq!(config.strategies.len(), 3);
        assert_eq!(config.optimizer.backend, QuadraticBackend::Conic);
    }

    #[test]
    fn test_example_parses() {
        let config: FolioFileConfig = toml::from_str(&FolioFileConfig::example()).unwrap();
        assert_eq!(config.backtest.fee_model, FeeModel::CapitalScaled);
        assert_eq!(config.backtest.on_infeasible, InfeasibleAction::Stop);
        assert_eq!(config.data.kind, DataKind::Prices);
        assert_eq!(config.data.returns, ReturnKind::Log);
        assert_eq!(config.strategies[2].target_return, Some(0.0004));

        let set = config.build_strategies().unwrap();
        assert_eq!(
            set.names().collect::<Vec<_>>(),
            vec!["Minimum Variance", "Maximum Sharpe", "Target Return", "Equal Weight"]
        );
    }

    #[test]
    fn test_load_partial_config() {
        let toml_content = r#"
[backtest]
window_size = 60
fee_model = "flat"
on_infeasible = "hold_previous"

[optimizer]
backend = "gradient"

[[strategies]]
name = "fixed"
kind = "fixed"
weights = [0.6, 0.4]
"#;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", toml_content).unwrap();

        let config = FolioFileConfig::load(file.path()).unwrap();
        assert_eq!(config.backtest.window_size, 60);
        assert_eq!(config.backtest.rebalance_freq, 21);
        assert_eq!(config.backtest.fee_model, FeeModel::Flat);
        assert_eq!(config.backtest.on_infeasible, InfeasibleAction::HoldPrevious);
        assert_eq!(config.optimizer.backend, QuadraticBackend::Gradient);
        assert_eq!(config.optimizer.max_iterations, 2_000);
        assert_eq!(config.strategies.len(), 1);
        assert!(config.build_strategies().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let mut config = FolioFileConfig::default();
        config.backtest.window_size = 90;
        config.data.path = Some("prices.csv".to_string());
        config.optimizer.time_limit_secs = Some(2.5);

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        let loaded = FolioFileConfig::load(file.path()).unwrap();

        assert_eq!(loaded.backtest.window_size, 90);
        assert_eq!(loaded.data.path.as_deref(), Some("prices.csv"));
        assert_eq!(loaded.optimizer.time_limit_secs, Some(2.5));
        assert_eq!(loaded.strategies.len(), config.strategies.len());
    }

    #[test]
    fn test_missing_strategy_parameters() {
        let mut config = FolioFileConfig::default();
        config.strategies = vec![StrategySettings::new("t", StrategyKind::TargetReturn)];
        assert!(matches!(
            config.build_strategies(),
            Err(BacktestError::ConfigError(_))
        ));

        config.strategies = vec![];
        assert!(config.build_strategies().is_err());
    }

    #[test]
    fn test_invalid_backtest_settings() {
        let mut config = FolioFileConfig::default();
        config.backtest.rebalance_freq = 0;
        assert!(config.to_backtest_config().is_err());
    }

    #[test]
    fn test_data_path_required() {
        assert!(matches!(
            DataSettings::default().load(),
            Err(BacktestError::ConfigError(_))
        ));
    }
}
