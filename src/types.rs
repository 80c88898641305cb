//! Core data types: return matrices, time series and weight helpers.

use crate::error::{BacktestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::ops::Range;

/// How to turn consecutive prices into returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    /// `ln(p_t / p_{t-1})`.
    #[default]
    Log,
    /// `p_t / p_{t-1} - 1`.
    Simple,
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnKind::Log => write!(f, "log"),
            ReturnKind::Simple => write!(f, "simple"),
        }
    }
}

/// Dates x assets matrix of periodic (daily) returns.
///
/// The asset set is fixed at construction. Rows are stored in date order and
/// every row carries exactly one value per asset, in the order of
/// [`ReturnMatrix::assets`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnMatrix {
    dates: Vec<DateTime<Utc>>,
    assets: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ReturnMatrix {
    /// Build a validated return matrix.
    ///
    /// Fails when there are no assets, asset names repeat, a row has the wrong
    /// width, dates are not strictly increasing or a value is not finite.
    pub fn new(
        dates: Vec<DateTime<Utc>>,
        assets: Vec<String>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self> {
        validate_frame(&dates, &assets, &rows)?;
        Ok(Self {
            dates,
            assets,
            rows,
        })
    }

    /// Derive returns from a dates x assets price matrix.
    ///
    /// The first date is consumed by the differencing, so the result has one
    /// row less than the input. Prices must be strictly positive.
    pub fn from_prices(
        dates: Vec<DateTime<Utc>>,
        assets: Vec<String>,
        prices: Vec<Vec<f64>>,
        kind: ReturnKind,
    ) -> Result<Self> {
        validate_frame(&dates, &assets, &prices)?;

        if let Some((i, _)) = prices
            .iter()
            .enumerate()
            .find(|(_, row)| row.iter().any(|&p| p <= 0.0))
        {
            return Err(BacktestError::DataError(format!(
                "Non-positive price on {}",
                dates[i].format("%Y-%m-%d")
            )));
        }

        let rows: Vec<Vec<f64>> = prices
            .windows(2)
            .map(|w| {
                w[0].iter()
                    .zip(w[1].iter())
                    .map(|(prev, curr)| match kind {
                        ReturnKind::Log => (curr / prev).ln(),
                        ReturnKind::Simple => curr / prev - 1.0,
                    })
                    .collect()
            })
            .collect();

        let dates = dates.into_iter().skip(1).collect();
        Self::new(dates, assets, rows)
    }

    /// Number of dates (rows).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of assets (columns).
    pub fn n_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn dates(&self) -> &[DateTime<Utc>] {
        &self.dates
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    /// Rows in `range`, clamped to the available data.
    pub fn window(&self, range: Range<usize>) -> &[Vec<f64>] {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        &self.rows[start..end]
    }

    /// Returns of a single asset over the whole history.
    pub fn column(&self, asset: &str) -> Option<Vec<f64>> {
        let j = self.assets.iter().position(|a| a == asset)?;
        Some(self.rows.iter().map(|row| row[j]).collect())
    }

    /// Sub-matrix restricted to rows in `range` (clamped).
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        Self {
            dates: self.dates[start..end].to_vec(),
            assets: self.assets.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// Portfolio return per date for a fixed weight vector.
    pub fn portfolio_returns(&self, weights: &[f64]) -> Result<TimeSeries> {
        if weights.len() != self.n_assets() {
            return Err(BacktestError::InvalidInput(format!(
                "Weight vector has {} entries for {} assets",
                weights.len(),
                self.n_assets()
            )));
        }

        let values = self
            .rows
            .iter()
            .map(|row| crate::stats::dot(row, weights))
            .collect();
        TimeSeries::new(self.dates.clone(), values)
    }
}

fn check_increasing(dates: &[DateTime<Utc>]) -> Result<()> {
    match dates.windows(2).position(|w| w[1] <= w[0]) {
        Some(pos) => Err(BacktestError::DataError(format!(
            "Dates must be strictly increasing (row {})",
            pos + 1
        ))),
        None => Ok(()),
    }
}

fn validate_frame(dates: &[DateTime<Utc>], assets: &[String], rows: &[Vec<f64>]) -> Result<()> {
    if assets.is_empty() {
        return Err(BacktestError::InvalidInput(
            "Need at least one asset".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for asset in assets {
        if !seen.insert(asset.as_str()) {
            return Err(BacktestError::InvalidInput(format!(
                "Duplicate asset column: {}",
                asset
            )));
        }
    }

    if dates.len() != rows.len() {
        return Err(BacktestError::InvalidInput(format!(
            "{} dates for {} rows",
            dates.len(),
            rows.len()
        )));
    }

    check_increasing(dates)?;

    for (i, row) in rows.iter().enumerate() {
        if row.len() != assets.len() {
            return Err(BacktestError::DataError(format!(
                "Row {} has {} values, expected {}",
                i,
                row.len(),
                assets.len()
            )));
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(BacktestError::DataError(format!(
                "Non-finite value in row {}",
                i
            )));
        }
    }

    Ok(())
}

/// Date-indexed series of values (capital, returns, drawdowns).
///
/// Dates are strictly increasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSeries")]
pub struct TimeSeries {
    dates: Vec<DateTime<Utc>>,
    values: Vec<f64>,
}

/// Compounded portfolio value over time.
pub type CapitalSeries = TimeSeries;

#[derive(Deserialize)]
struct RawSeries {
    dates: Vec<DateTime<Utc>>,
    values: Vec<f64>,
}

impl TryFrom<RawSeries> for TimeSeries {
    type Error = BacktestError;

    fn try_from(raw: RawSeries) -> Result<Self> {
        Self::new(raw.dates, raw.values)
    }
}

impl TimeSeries {
    /// Fails when the lengths differ or dates are not strictly increasing.
    pub fn new(dates: Vec<DateTime<Utc>>, values: Vec<f64>) -> Result<Self> {
        if dates.len() != values.len() {
            return Err(BacktestError::InvalidInput(format!(
                "{} dates for {} values",
                dates.len(),
                values.len()
            )));
        }
        check_increasing(&dates)?;
        Ok(Self { dates, values })
    }

    /// An empty series.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            dates: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Append a point; `date` must be later than the current last date.
    pub(crate) fn push(&mut self, date: DateTime<Utc>, value: f64) {
        debug_assert!(self.dates.last().map_or(true, |last| *last < date));
        self.dates.push(date);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn dates(&self) -> &[DateTime<Utc>] {
        &self.dates
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn first(&self) -> Option<f64> {
        self.values.first().copied()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Value at `date`, if present.
    pub fn get(&self, date: &DateTime<Utc>) -> Option<f64> {
        self.dates
            .binary_search(date)
            .ok()
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.dates.iter().copied().zip(self.values.iter().copied())
    }

    /// Write `date,<header>` rows as CSV.
    pub fn write_csv<W: Write>(&self, writer: W, header: &str) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(["date", header])?;
        for (date, value) in self.iter() {
            wtr.write_record([date.format("%Y-%m-%d").to_string(), value.to_string()])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Equal-weight vector (`1/n` per asset).
pub fn equal_weights(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}
