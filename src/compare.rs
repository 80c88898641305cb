//! Side-by-side comparison of several strategies on the same history.

use crate::analytics::PerformanceSummary;
use crate::engine::{BacktestConfig, BacktestResult, Engine};
use crate::error::Result;
use crate::policy::WeightPolicy;
use crate::types::{CapitalSeries, ReturnMatrix};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

/// Named policies in insertion order.
///
/// Inserting an existing name replaces that policy in place.
#[derive(Clone, Default)]
pub struct StrategySet {
    entries: Vec<(String, Arc<dyn WeightPolicy>)>,
}

impl std::fmt::Debug for StrategySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a policy. Returns the one it replaced, if any.
    pub fn insert<P>(&mut self, name: impl Into<String>, policy: P) -> Option<Arc<dyn WeightPolicy>>
    where
        P: WeightPolicy + 'static,
    {
        self.insert_shared(name, Arc::new(policy))
    }

    /// Add an already shared policy.
    pub fn insert_shared(
        &mut self,
        name: impl Into<String>,
        policy: Arc<dyn WeightPolicy>,
    ) -> Option<Arc<dyn WeightPolicy>> {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, policy)),
            None => {
                self.entries.push((name, policy));
                None
            }
        }
    }

    /// Builder-style [`StrategySet::insert`].
    pub fn with<P>(mut self, name: impl Into<String>, policy: P) -> Self
    where
        P: WeightPolicy + 'static,
    {
        self.insert(name, policy);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn WeightPolicy>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn WeightPolicy>)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Capital series of several strategies aligned on the union of their dates.
///
/// A cell is `None` where a strategy has no value for that date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonTable {
    dates: Vec<DateTime<Utc>>,
    names: Vec<String>,
    columns: Vec<Vec<Option<f64>>>,
}

impl ComparisonTable {
    /// Outer-join `series` by date.
    pub fn from_series(series: &[(String, &CapitalSeries)]) -> Self {
        let dates: Vec<DateTime<Utc>> = series
            .iter()
            .flat_map(|(_, s)| s.dates().iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let columns = series
            .iter()
            .map(|(_, s)| dates.iter().map(|d| s.get(d)).collect())
            .collect();

        Self {
            dates,
            names: series.iter().map(|(n, _)| n.clone()).collect(),
            columns,
        }
    }

    pub fn dates(&self) -> &[DateTime<Utc>] {
        &self.dates
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        let j = self.names.iter().position(|n| n == name)?;
        Some(&self.columns[j])
    }

    pub fn value(&self, name: &str, date: &DateTime<Utc>) -> Option<f64> {
        let i = self.dates.binary_search(date).ok()?;
        self.column(name)?[i]
    }

    /// Cells of row `index` in column order.
    pub fn row(&self, index: usize) -> Option<Vec<Option<f64>>> {
        if index >= self.dates.len() {
            return None;
        }
        Some(self.columns.iter().map(|c| c[index]).collect())
    }

    /// Write as CSV with one column per strategy; missing cells are empty.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header = vec!["date".to_string()];
        header.extend(self.names.iter().cloned());
        wtr.write_record(&header)?;

        for (i, date) in self.dates.iter().enumerate() {
            let mut record = vec![date.format("%Y-%m-%d").to_string()];
            record.extend(
                self.columns
                    .iter()
                    .map(|c| c[i].map(|v| v.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Per-strategy outcome of a comparison.
///
/// A policy that fails mid-walk still yields a `result`, ended by
/// [`Termination::PolicyError`](crate::engine::Termination::PolicyError).
/// `error` is only set when the engine itself refuses the run.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyRun {
    pub name: String,
    /// `None` when the engine refused the run; see `error`.
    pub result: Option<BacktestResult>,
    pub error: Option<String>,
}

/// Result of [`compare_strategies`].
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub table: ComparisonTable,
    pub runs: Vec<StrategyRun>,
}

impl Comparison {
    /// Summary of every successful run, in strategy order.
    pub fn summaries(&self) -> Vec<(String, PerformanceSummary)> {
        self.runs
            .iter()
            .filter_map(|run| run.result.as_ref().map(|r| (run.name.clone(), r.summary())))
            .collect()
    }

    pub fn result(&self, name: &str) -> Option<&BacktestResult> {
        self.runs
            .iter()
            .find(|run| run.name == name)
            .and_then(|run| run.result.as_ref())
    }
}

/// Run every strategy in `strategies` with the same configuration.
///
/// Runs are independent and execute in parallel. An invalid shared
/// configuration is an error before any run starts, so the per-run `Err`
/// branch only guards engine failures. A strategy whose walk ends early keeps
/// the dates it reached; the rest of its column is empty.
pub fn compare_strategies(
    strategies: &StrategySet,
    returns: &ReturnMatrix,
    config: &BacktestConfig,
) -> Result<Comparison> {
    config.validate()?;

    info!(
        "Comparing {} strategies on {} rows",
        strategies.len(),
        returns.len()
    );

    let runs: Vec<StrategyRun> = strategies
        .entries
        .par_iter()
        .map(|(name, policy)| {
            let engine = Engine::new(config.clone());
            match engine.run(policy.as_ref(), returns) {
                Ok(result) => StrategyRun {
                    name: name.clone(),
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    warn!("Strategy {} failed: {}", name, e);
                    StrategyRun {
                        name: name.clone(),
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        })
        .collect();

    let empty = CapitalSeries::empty();
    let series: Vec<(String, &CapitalSeries)> = runs
        .iter()
        .map(|run| {
            (
                run.name.clone(),
                run.result.as_ref().map(|r| &r.capital).unwrap_or(&empty),
            )
        })
        .collect();
    let table = ComparisonTable::from_series(&series);

    Ok(Comparison { table, runs })
}
