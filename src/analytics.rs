//! Performance analytics and reporting.

use crate::engine::BacktestResult;
use crate::error::{BacktestError, Result};
use crate::stats::{mean, sample_std, TRADING_DAYS};
use crate::types::{ReturnMatrix, TimeSeries};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{builder::Builder, settings::Style};

/// One-row summary of a return series.
///
/// Annualization uses 252 periods per year. Max drawdown is reported as a
/// non-positive fraction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_return: f64,
    /// `mean(r) * 252`.
    pub annualized_return: f64,
    /// `std(r) * sqrt(252)`, sample standard deviation.
    pub volatility: f64,
    /// `mean(r) / std(r) * sqrt(252)`; zero when the series has no dispersion.
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub periods: usize,
}

impl PerformanceSummary {
    /// Summary of periodic returns, compounding from 1.
    pub fn from_returns(returns: &[f64]) -> Self {
        if returns.is_empty() {
            return Self::default();
        }
        let curve = cumulative(returns);
        let total_return = curve.last().copied().unwrap_or(1.0) - 1.0;
        Self::build(returns, &curve, total_return)
    }

    /// Summary of a capital curve that started at `initial`.
    ///
    /// Total return is read straight off the curve (`last / initial - 1`), so
    /// it matches the capital series without compounding round-off.
    pub fn from_capital(capital: &[f64], initial: f64) -> Self {
        if capital.is_empty() || initial == 0.0 {
            return Self::default();
        }
        let mut prev = initial;
        let returns: Vec<f64> = capital
            .iter()
            .map(|&c| {
                let r = c / prev - 1.0;
                prev = c;
                r
            })
            .collect();
        let curve: Vec<f64> = capital.iter().map(|c| c / initial).collect();
        let total_return = capital[capital.len() - 1] / initial - 1.0;
        Self::build(&returns, &curve, total_return)
    }

    fn build(returns: &[f64], curve: &[f64], total_return: f64) -> Self {
        let m = mean(returns);
        let std = sample_std(returns);
        let sharpe_ratio = if std > 0.0 {
            m / std * TRADING_DAYS.sqrt()
        } else {
            0.0
        };

        Self {
            total_return,
            annualized_return: m * TRADING_DAYS,
            volatility: std * TRADING_DAYS.sqrt(),
            sharpe_ratio,
            max_drawdown: drawdowns(curve).into_iter().fold(0.0, f64::min),
            periods: returns.len(),
        }
    }
}

/// `cumprod(1 + r)`.
pub fn cumulative(returns: &[f64]) -> Vec<f64> {
    let mut value = 1.0;
    returns
        .iter()
        .map(|r| {
            value *= 1.0 + r;
            value
        })
        .collect()
}

/// `curve / cummax(curve) - 1`.
pub fn drawdowns(curve: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    curve
        .iter()
        .map(|&v| {
            peak = peak.max(v);
            if peak > 0.0 {
                v / peak - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Dated drawdown of a value curve.
pub fn drawdown_series(curve: &TimeSeries) -> TimeSeries {
    let mut out = TimeSeries::with_capacity(curve.len());
    for (date, dd) in curve.dates().iter().zip(drawdowns(curve.values())) {
        out.push(*date, dd);
    }
    out
}

/// Buy-and-hold evaluation of fixed weights, without rebalancing or fees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticBacktest {
    pub portfolio_returns: TimeSeries,
    pub cumulative: TimeSeries,
    pub drawdown: TimeSeries,
    /// Annualized.
    pub volatility: f64,
    /// Annualized, zero risk-free rate.
    pub sharpe_ratio: f64,
}

impl StaticBacktest {
    pub fn run(weights: &[f64], returns: &ReturnMatrix) -> Result<Self> {
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(BacktestError::InvalidInput(
                "Weights contain non-finite values".to_string(),
            ));
        }

        let portfolio_returns = returns.portfolio_returns(weights)?;
        let curve = cumulative(portfolio_returns.values());
        let cumulative = TimeSeries::new(portfolio_returns.dates().to_vec(), curve)?;
        let drawdown = drawdown_series(&cumulative);
        let summary = PerformanceSummary::from_returns(portfolio_returns.values());

        Ok(Self {
            volatility: summary.volatility,
            sharpe_ratio: summary.sharpe_ratio,
            portfolio_returns,
            cumulative,
            drawdown,
        })
    }

    pub fn summary(&self) -> PerformanceSummary {
        PerformanceSummary::from_returns(self.portfolio_returns.values())
    }
}

/// Daily sample volatility per asset.
pub fn asset_volatility(returns: &ReturnMatrix) -> Vec<(String, f64)> {
    returns
        .assets()
        .iter()
        .filter_map(|a| returns.column(a).map(|col| (a.clone(), sample_std(&col))))
        .collect()
}

/// Annualized Sharpe ratio per asset.
///
/// `annual_risk_free_rate` is converted to a daily rate by dividing by 252.
/// Assets without dispersion get a ratio of zero.
pub fn asset_sharpe_ratios(returns: &ReturnMatrix, annual_risk_free_rate: f64) -> Vec<(String, f64)> {
    let rf_daily = annual_risk_free_rate / TRADING_DAYS;
    returns
        .assets()
        .iter()
        .filter_map(|a| {
            returns.column(a).map(|col| {
                let excess: Vec<f64> = col.iter().map(|r| r - rf_daily).collect();
                let std = sample_std(&excess);
                let sharpe = if std > 0.0 {
                    mean(&excess) / std * TRADING_DAYS.sqrt()
                } else {
                    0.0
                };
                (a.clone(), sharpe)
            })
        })
        .collect()
}

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Print one backtest: overview, summary and rebalance count.
    pub fn print_report(result: &BacktestResult) {
        let summary = result.summary();

        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " BACKTEST RESULTS ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Strategy:        {}", result.strategy_name);
        println!("  Assets:          {}", result.assets.join(", "));
        if let (Some(first), Some(last)) =
            (result.capital.dates().first(), result.capital.dates().last())
        {
            println!(
                "  Period:          {} to {}",
                first.format("%Y-%m-%d"),
                last.format("%Y-%m-%d")
            );
        }
        println!(
            "  Window / Freq:   {} / {}",
            result.config.window_size, result.config.rebalance_freq
        );
        println!("  Rebalances:      {}", result.rebalances.len());
        println!("  Fees Charged:    {:.6}", result.total_fees());
        println!("  Termination:     {}", Self::format_termination(result));
        println!();

        println!("{}", "Performance".bold().underline());
        println!("  Initial Capital: {:>12.4}", result.config.initial_capital);
        println!(
            "  Final Capital:   {:>12.4} {}",
            result.final_capital(),
            Self::format_pct_change(summary.total_return * 100.0)
        );
        println!();

        Self::print_summary(&summary);
        println!("{}", "═".repeat(60).blue());
    }

    /// Print the five-metric summary table.
    pub fn print_summary(summary: &PerformanceSummary) {
        let mut builder = Builder::new();
        builder.push_record(["Metric", "Value"]);
        builder.push_record(["Total Return".to_string(), format!("{:.4}", summary.total_return)]);
        builder.push_record([
            "Annualized Return".to_string(),
            format!("{:.4}", summary.annualized_return),
        ]);
        builder.push_record(["Volatility".to_string(), format!("{:.4}", summary.volatility)]);
        builder.push_record(["Sharpe Ratio".to_string(), format!("{:.4}", summary.sharpe_ratio)]);
        builder.push_record(["Max Drawdown".to_string(), format!("{:.4}", summary.max_drawdown)]);

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Print named summaries side by side.
    pub fn print_table(rows: &[(String, PerformanceSummary)]) {
        let mut builder = Builder::new();
        builder.push_record([
            "Strategy",
            "Total Return",
            "Annual Return",
            "Volatility",
            "Sharpe",
            "Max DD",
            "Periods",
        ]);

        for (name, s) in rows {
            builder.push_record([
                name.clone(),
                format!("{:.4}", s.total_return),
                format!("{:.4}", s.annualized_return),
                format!("{:.4}", s.volatility),
                format!("{:.4}", s.sharpe_ratio),
                format!("{:.4}", s.max_drawdown),
                s.periods.to_string(),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Print per-asset volatility and Sharpe ratio.
    pub fn print_asset_stats(volatility: &[(String, f64)], sharpe: &[(String, f64)]) {
        let mut builder = Builder::new();
        builder.push_record(["Asset", "Daily Vol", "Sharpe"]);
        for ((asset, vol), (_, s)) in volatility.iter().zip(sharpe.iter()) {
            builder.push_record([asset.clone(), format!("{:.6}", vol), format!("{:.4}", s)]);
        }
        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Export a result to JSON.
    pub fn to_json(result: &BacktestResult) -> String {
        serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string())
    }

    /// Export a named summary to a CSV line.
    pub fn to_csv_line(name: &str, s: &PerformanceSummary) -> String {
        format!(
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{}",
            name,
            s.total_return,
            s.annualized_return,
            s.volatility,
            s.sharpe_ratio,
            s.max_drawdown,
            s.periods
        )
    }

    /// Get CSV header.
    pub fn csv_header() -> &'static str {
        "strategy,total_return,annualized_return,volatility,sharpe_ratio,max_drawdown,periods"
    }

    fn format_termination(result: &BacktestResult) -> String {
        if result.termination.is_completed() {
            result.termination.to_string().green().to_string()
        } else {
            result.termination.to_string().yellow().to_string()
        }
    }

    /// Format percentage change with color.
    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("(+{:.2}%)", pct).green().to_string()
        } else {
            format!("({:.2}%)", pct).red().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn matrix() -> ReturnMatrix {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let dates = (0..4).map(|i| start + chrono::Duration::days(i)).collect();
        ReturnMatrix::new(
            dates,
            vec!["A".into(), "B".into()],
            vec![
                vec![0.10, 0.00],
                vec![-0.20, 0.02],
                vec![0.05, 0.00],
                vec![0.10, 0.02],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_summary_from_returns() {
        let r = [0.10, -0.20, 0.05];
        let s = PerformanceSummary::from_returns(&r);

        let expected_total = 1.1 * 0.8 * 1.05 - 1.0;
        assert!((s.total_return - expected_total).abs() < 1e-12);
        assert!((s.annualized_return - mean(&r) * 252.0).abs() < 1e-12);
        assert!((s.volatility - sample_std(&r) * 252.0_f64.sqrt()).abs() < 1e-12);
        // Peak 1.1, trough 0.88.
        assert!((s.max_drawdown - (0.88 / 1.1 - 1.0)).abs() < 1e-12);
        assert_eq!(s.periods, 3);
    }

    #[test]
    fn test_summary_of_empty_series() {
        assert_eq!(PerformanceSummary::from_returns(&[]), PerformanceSummary::default());
        assert_eq!(PerformanceSummary::from_capital(&[], 1.0).periods, 0);
    }

    #[test]
    fn test_constant_returns_have_zero_sharpe() {
        let s = PerformanceSummary::from_returns(&[0.0; 5]);
        assert_eq!(s.volatility, 0.0);
        assert_eq!(s.sharpe_ratio, 0.0);
        assert_eq!(s.max_drawdown, 0.0);
    }

    #[test]
    fn test_from_capital_total_return_is_exact() {
        let capital = [1.01, 0.995, 1.0301, 1.07];
        let s = PerformanceSummary::from_capital(&capital, 1.0);
        assert_eq!(s.total_return, 1.07 - 1.0);
        assert_eq!(s.periods, 4);
    }

    #[test]
    fn test_drawdowns_never_positive() {
        let dd = drawdowns(&[1.0, 1.2, 0.9, 1.3, 1.1]);
        assert!(dd.iter().all(|&d| d <= 0.0));
        assert_eq!(dd[1], 0.0);
        assert!((dd[2] - (0.9 / 1.2 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_static_backtest() {
        let m = matrix();
        let bt = StaticBacktest::run(&[1.0, 0.0], &m).unwrap();
        assert_eq!(bt.cumulative.len(), 4);
        assert!((bt.cumulative.values()[1] - 0.88).abs() < 1e-12);
        assert!(bt.drawdown.values().iter().all(|&d| d <= 0.0));
        assert!(StaticBacktest::run(&[1.0], &m).is_err());
        assert!(StaticBacktest::run(&[f64::NAN, 1.0], &m).is_err());
    }

    #[test]
    fn test_asset_stats() {
        let m = matrix();
        let vol = asset_volatility(&m);
        assert_eq!(vol[0].0, "A");
        assert!((vol[1].1 - sample_std(&[0.0, 0.02, 0.0, 0.02])).abs() < 1e-12);

        let sharpe = asset_sharpe_ratios(&m, 0.0);
        let b = [0.0, 0.02, 0.0, 0.02];
        let expected = mean(&b) / sample_std(&b) * 252.0_f64.sqrt();
        assert!((sharpe[1].1 - expected).abs() < 1e-9);

        // A positive risk-free rate lowers every ratio.
        let lower = asset_sharpe_ratios(&m, 0.05);
        assert!(lower.iter().zip(sharpe.iter()).all(|(l, s)| l.1 < s.1));
    }

    #[test]
    fn test_csv_line_matches_header() {
        let s = PerformanceSummary::from_returns(&[0.01, 0.02]);
        let line = ResultFormatter::to_csv_line("x", &s);
        assert_eq!(
            line.split(',').count(),
            ResultFormatter::csv_header().split(',').count()
        );
    }
}
