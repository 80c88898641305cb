//! Command-line interface for the portfolio backtester.

use folio::analytics::{asset_sharpe_ratios, asset_volatility, ResultFormatter, StaticBacktest};
use folio::compare::compare_strategies;
use folio::config::{DataKind, DataSettings, FolioFileConfig, StrategyKind, StrategySettings};
use folio::engine::{BacktestConfig, Engine};
use folio::error::{BacktestError, Result};
use folio::frontier::efficient_frontier;
use folio::optimizer::Optimizer;
use folio::stats::WindowEstimate;
use folio::types::{equal_weights, ReturnKind, ReturnMatrix};
use folio::StrategySet;

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// folio - rolling-window portfolio optimization and backtesting.
#[derive(Parser)]
#[command(name = "folio")]
#[command(version)]
#[command(about = "Rolling-window portfolio optimization and rebalancing backtests")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Data source arguments shared by the subcommands.
#[derive(clap::Args, Debug, Clone)]
pub struct DataArgs {
    /// Path to a wide CSV file (date column + one column per asset)
    #[arg(short, long)]
    pub data: PathBuf,

    /// Whether the file holds prices or returns
    #[arg(short, long, value_enum, default_value = "prices")]
    pub kind: DataKind,

    /// Use simple instead of log returns when converting prices
    #[arg(long)]
    pub simple: bool,

    /// Date format in the CSV (e.g. "%Y-%m-%d")
    #[arg(long)]
    pub date_format: Option<String>,
}

impl DataArgs {
    fn load(&self) -> Result<ReturnMatrix> {
        DataSettings {
            path: Some(self.data.display().to_string()),
            kind: self.kind,
            returns: if self.simple {
                ReturnKind::Simple
            } else {
                ReturnKind::Log
            },
            date_format: self.date_format.clone(),
            delimiter: None,
        }
        .load()
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a rolling backtest with one built-in strategy
    Backtest {
        #[command(flatten)]
        data: DataArgs,

        /// Strategy to use
        #[arg(short = 'S', long, value_enum, default_value = "min-variance")]
        strategy: StrategyKind,

        /// Per-period target return (target-return strategy)
        #[arg(long)]
        target_return: Option<f64>,

        /// Per-period risk-free rate (max-sharpe strategy)
        #[arg(long, default_value = "0.0")]
        risk_free_rate: f64,

        /// Rows per estimation window
        #[arg(short, long, default_value = "252")]
        window: usize,

        /// Rows between rebalances
        #[arg(short, long, default_value = "21")]
        freq: usize,

        /// Fixed fee per changed position
        #[arg(long, default_value = "0.0")]
        fee: f64,

        /// Write the capital series to this CSV file
        #[arg(long)]
        capital_csv: Option<PathBuf>,
    },

    /// Compare every strategy listed in a configuration file
    Compare {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Write the date-aligned capital table to this CSV file
        #[arg(long)]
        table_csv: Option<PathBuf>,
    },

    /// Static buy-and-hold summary for fixed weights
    Summary {
        #[command(flatten)]
        data: DataArgs,

        /// Comma-separated weights in column order (default: equal weights)
        #[arg(long, value_delimiter = ',')]
        weights: Option<Vec<f64>>,

        /// Annual risk-free rate for per-asset Sharpe ratios
        #[arg(long, default_value = "0.0")]
        risk_free_rate: f64,
    },

    /// Efficient frontier over the most recent window
    Frontier {
        #[command(flatten)]
        data: DataArgs,

        /// Number of frontier points
        #[arg(short, long, default_value = "20")]
        points: usize,

        /// Rows used for estimation (default: all)
        #[arg(short, long)]
        window: Option<usize>,

        /// Per-period risk-free rate
        #[arg(long, default_value = "0.0")]
        risk_free_rate: f64,
    },

    /// Generate an example configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "folio.toml")]
        output: PathBuf,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(io::stderr)
            .finish();

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("Failed to set tracing subscriber");
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Backtest {
            data,
            strategy,
            target_return,
            risk_free_rate,
            window,
            freq,
            fee,
            capital_csv,
        } => {
            let config = BacktestConfig {
                window_size: *window,
                rebalance_freq: *freq,
                transaction_fee: *fee,
                ..Default::default()
            };
            let settings = StrategySettings {
                target_return: *target_return,
                risk_free_rate: *risk_free_rate,
                ..StrategySettings::new(strategy_label(*strategy), *strategy)
            };
            run_backtest(data, &settings, config, capital_csv.as_ref(), cli.output)
        }

        Commands::Compare { config, table_csv } => {
            run_compare(config, table_csv.as_ref(), cli.output)
        }

        Commands::Summary {
            data,
            weights,
            risk_free_rate,
        } => run_summary(data, weights.as_deref(), *risk_free_rate, cli.output),

        Commands::Frontier {
            data,
            points,
            window,
            risk_free_rate,
        } => run_frontier(data, *points, *window, *risk_free_rate, cli.output),

        Commands::Init { output } => init_config(output),
    }
}

fn strategy_label(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::MinVariance => "Minimum Variance",
        StrategyKind::MaxSharpe => "Maximum Sharpe",
        StrategyKind::TargetReturn => "Target Return",
        StrategyKind::EqualWeight => "Equal Weight",
        StrategyKind::Fixed => "Fixed Weights",
    }
}

fn run_backtest(
    data: &DataArgs,
    settings: &StrategySettings,
    config: BacktestConfig,
    capital_csv: Option<&PathBuf>,
    output: OutputFormat,
) -> Result<()> {
    let returns = data.load()?;

    if settings.kind == StrategyKind::Fixed {
        return Err(BacktestError::ConfigError(
            "Fixed weights are only available through a configuration file".to_string(),
        ));
    }
    let mut set = StrategySet::new();
    settings.add_to(&mut set, &Optimizer::default())?;
    let policy = set
        .get(&settings.name)
        .ok_or_else(|| BacktestError::UnknownStrategy(settings.name.clone()))?;

    let result = Engine::new(config).run(policy.as_ref(), &returns)?;

    if let Some(path) = capital_csv {
        result.capital.write_csv(fs::File::create(path)?, "capital")?;
        info!("Wrote capital series to {}", path.display());
    }

    match output {
        OutputFormat::Text => ResultFormatter::print_report(&result),
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&result)),
        OutputFormat::Csv => {
            println!("{}", ResultFormatter::csv_header());
            println!(
                "{}",
                ResultFormatter::to_csv_line(&result.strategy_name, &result.summary())
            );
        }
    }

    Ok(())
}

fn run_compare(config_path: &PathBuf, table_csv: Option<&PathBuf>, output: OutputFormat) -> Result<()> {
    let file_config = FolioFileConfig::load(config_path)?;
    let backtest_config = file_config.to_backtest_config()?;
    let strategies = file_config.build_strategies()?;
    let returns = file_config.data.load()?;

    let comparison = compare_strategies(&strategies, &returns, &backtest_config)?;

    if let Some(path) = table_csv {
        comparison.table.write_csv(fs::File::create(path)?)?;
        info!("Wrote comparison table to {}", path.display());
    }

    match output {
        OutputFormat::Text => {
            ResultFormatter::print_table(&comparison.summaries());
            for run in &comparison.runs {
                if let Some(result) = &run.result {
                    if !result.termination.is_completed() {
                        println!("  {}: {}", run.name, result.termination);
                    }
                }
                if let Some(error) = &run.error {
                    println!("  {}: failed: {}", run.name, error);
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&comparison)?),
        OutputFormat::Csv => comparison.table.write_csv(io::stdout())?,
    }

    Ok(())
}

fn run_summary(
    data: &DataArgs,
    weights: Option<&[f64]>,
    risk_free_rate: f64,
    output: OutputFormat,
) -> Result<()> {
    let returns = data.load()?;
    let weights = weights
        .map(|w| w.to_vec())
        .unwrap_or_else(|| equal_weights(returns.n_assets()));

    let backtest = StaticBacktest::run(&weights, &returns)?;
    let summary = backtest.summary();

    match output {
        OutputFormat::Text => {
            ResultFormatter::print_summary(&summary);
            ResultFormatter::print_asset_stats(
                &asset_volatility(&returns),
                &asset_sharpe_ratios(&returns, risk_free_rate),
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Csv => {
            println!("{}", ResultFormatter::csv_header());
            println!("{}", ResultFormatter::to_csv_line("static", &summary));
        }
    }

    Ok(())
}

fn run_frontier(
    data: &DataArgs,
    points: usize,
    window: Option<usize>,
    risk_free_rate: f64,
    output: OutputFormat,
) -> Result<()> {
    let returns = data.load()?;
    let rows = returns.len();
    let start = window.map(|w| rows.saturating_sub(w)).unwrap_or(0);
    let estimate = WindowEstimate::from_window(returns.window(start..rows))?;

    let frontier = efficient_frontier(&estimate, points, risk_free_rate, &Optimizer::default())?;

    match output {
        OutputFormat::Text => {
            let mut builder = tabled::builder::Builder::new();
            let mut header = vec![
                "Return".to_string(),
                "Volatility".to_string(),
                "Sharpe".to_string(),
            ];
            header.extend(returns.assets().iter().cloned());
            builder.push_record(header);
            for point in &frontier {
                let (ret, vol, sharpe) = point.annualized();
                let mut record = vec![
                    format!("{:.4}", ret),
                    format!("{:.4}", vol),
                    format!("{:.4}", sharpe),
                ];
                record.extend(point.weights.iter().map(|w| format!("{:.3}", w)));
                builder.push_record(record);
            }
            let table = builder
                .build()
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&frontier)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(io::stdout());
            let mut header = vec![
                "expected_return".to_string(),
                "volatility".to_string(),
                "sharpe_ratio".to_string(),
            ];
            header.extend(returns.assets().iter().cloned());
            wtr.write_record(&header)?;
            for point in &frontier {
                let mut record = vec![
                    point.expected_return.to_string(),
                    point.volatility.to_string(),
                    point.sharpe_ratio.to_string(),
                ];
                record.extend(point.weights.iter().map(|w| w.to_string()));
                wtr.write_record(&record)?;
            }
            wtr.flush()?;
        }
    }

    Ok(())
}

fn init_config(output: &PathBuf) -> Result<()> {
    let example = FolioFileConfig::example();
    fs::write(output, example)?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to point at your data, then run:");
    println!("  folio compare -c {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_backtest() {
        let cli = Cli::try_parse_from([
            "folio",
            "backtest",
            "-d",
            "prices.csv",
            "-S",
            "target-return",
            "--target-return",
            "0.0005",
            "-w",
            "126",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_summary_weights() {
        let cli = Cli::try_parse_from([
            "folio", "-o", "json", "summary", "-d", "r.csv", "-k", "returns", "--weights",
            "0.5,0.5",
        ])
        .unwrap();
        match cli.command {
            Commands::Summary { weights, data, .. } => {
                assert_eq!(weights, Some(vec![0.5, 0.5]));
                assert_eq!(data.kind, DataKind::Returns);
            }
            _ => panic!("expected summary"),
        }
        assert_eq!(cli.output, OutputFormat::Json);
    }

    #[test]
    fn test_init_command() {
        let cli = Cli::try_parse_from(["folio", "init"]);
        assert!(cli.is_ok());
    }
}
