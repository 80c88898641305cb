//! Performance benchmarks for the optimizer and the rolling engine.
//!
//! Run with: cargo bench

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use folio::compare::{compare_strategies, StrategySet};
use folio::engine::{BacktestConfig, Engine};
use folio::optimizer::{OptimizerConfig, QuadraticBackend};
use folio::policy::{EqualWeight, MaxSharpe, MinVariance, WeightPolicy};
use folio::stats::WindowEstimate;
use folio::types::ReturnMatrix;
use folio::Optimizer;

/// Generate synthetic returns for benchmarking.
fn generate_returns(rows: usize, assets: usize) -> ReturnMatrix {
    let start = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
    let dates = (0..rows).map(|i| start + Duration::days(i as i64)).collect();
    let data = (0..rows)
        .map(|i| {
            (0..assets)
                .map(|j| {
                    let t = i as f64;
                    let k = j as f64 + 1.0;
                    0.0002 * k + 0.01 * (t * 0.3 * k).sin() + 0.004 * (t * 1.1 + k).cos()
                })
                .collect()
        })
        .collect();
    let names = (0..assets).map(|j| format!("ASSET{}", j)).collect();
    ReturnMatrix::new(dates, names, data).unwrap()
}

/// Benchmark single-window solves by asset count.
fn bench_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("policies");

    for assets in [5, 10, 25].iter() {
        let returns = generate_returns(252, *assets);
        let estimate = WindowEstimate::from_window(returns.rows()).unwrap();

        group.bench_with_input(
            BenchmarkId::new("min_variance_conic", assets),
            &estimate,
            |b, est| b.iter(|| MinVariance::new().compute(black_box(est))),
        );

        let gradient = Optimizer::new(OptimizerConfig {
            quadratic_backend: QuadraticBackend::Gradient,
            ..Default::default()
        });
        group.bench_with_input(
            BenchmarkId::new("min_variance_gradient", assets),
            &estimate,
            |b, est| {
                b.iter(|| {
                    MinVariance::new()
                        .with_optimizer(gradient.clone())
                        .compute(black_box(est))
                })
            },
        );

        group.bench_with_input(BenchmarkId::new("max_sharpe", assets), &estimate, |b, est| {
            b.iter(|| MaxSharpe::new(0.0).compute(black_box(est)))
        });
    }

    group.finish();
}

/// Benchmark full rolling runs.
fn bench_rolling(c: &mut Criterion) {
    let returns = generate_returns(1000, 8);
    let config = BacktestConfig {
        window_size: 252,
        rebalance_freq: 21,
        ..Default::default()
    };

    let mut group = c.benchmark_group("rolling");
    group.sample_size(20);

    group.bench_function("min_variance_1000x8", |b| {
        let engine = Engine::new(config.clone());
        b.iter(|| engine.run(&MinVariance::new(), black_box(&returns)))
    });

    group.bench_function("equal_weight_1000x8", |b| {
        let engine = Engine::new(config.clone());
        b.iter(|| engine.run(&EqualWeight, black_box(&returns)))
    });

    group.bench_function("compare_three", |b| {
        let set = StrategySet::new()
            .with("Minimum Variance", MinVariance::new())
            .with("Maximum Sharpe", MaxSharpe::new(0.0))
            .with("Equal Weight", EqualWeight);
        b.iter(|| compare_strategies(&set, black_box(&returns), &config))
    });

    group.finish();
}

criterion_group!(benches, bench_policies, bench_rolling);
criterion_main!(benches);
