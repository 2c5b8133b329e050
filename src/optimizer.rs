//! Grid search over entry/exit thresholds.
//!
//! Every combination is backtested on the same z-series, so the rolling
//! statistics are computed once per pair and the grid itself runs on rayon.

use crate::backtest::{self, BacktestMetrics, DEFAULT_ANNUALIZATION_FACTOR, DEFAULT_MIN_TRADES};
use crate::model::OptimizedParams;
use crate::stats::{self, RatioSample};
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEFAULT_Z_ENTRY_GRID: [f64; 6] = [1.5, 1.75, 2.0, 2.25, 2.5, 3.0];
pub const DEFAULT_Z_EXIT_GRID: [f64; 5] = [0.1, 0.25, 0.5, 0.75, 1.0];
pub const BASELINE_Z_ENTRY: f64 = 2.0;
pub const BASELINE_Z_EXIT: f64 = 0.5;
pub const DEFAULT_MIN_WIN_RATE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerGrid {
    pub z_entry: Vec<f64>,
    pub z_exit: Vec<f64>,
    pub min_trades: usize,
    pub min_win_rate: f64,
    pub annualization_factor: f64,
}

impl Default for OptimizerGrid {
    fn default() -> Self {
        Self {
            z_entry: DEFAULT_Z_ENTRY_GRID.to_vec(),
            z_exit: DEFAULT_Z_EXIT_GRID.to_vec(),
            min_trades: DEFAULT_MIN_TRADES,
            min_win_rate: DEFAULT_MIN_WIN_RATE,
            annualization_factor: DEFAULT_ANNUALIZATION_FACTOR,
        }
    }
}

impl OptimizerGrid {
    /// Valid combinations in enumeration order (entry-major).
    pub fn combinations(&self) -> Vec<(f64, f64)> {
        let mut combos = Vec::with_capacity(self.z_entry.len() * self.z_exit.len());
        for &entry in &self.z_entry {
            for &exit in &self.z_exit {
                if exit >= entry {
                    continue;
                }
                combos.push((entry, exit));
            }
        }
        combos
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridResult {
    pub z_entry: f64,
    pub z_exit: f64,
    pub metrics: BacktestMetrics,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub best: GridResult,
    /// Score at the default thresholds, when they produce a valid backtest.
    pub baseline_score: Option<f64>,
    pub improvement_pct: Option<f64>,
    /// Combinations that passed the minimum trade count.
    pub evaluated: usize,
}

pub fn composite_score(m: &BacktestMetrics) -> f64 {
    30.0 * m.win_rate + (m.avg_return * 100.0).min(30.0) + 6.67 * m.sharpe.min(3.0)
        + 3.33 * m.profit_factor.min(3.0)
        - 10.0 * m.max_drawdown
}

/// Backtests every combination against precomputed z-scores. Results keep
/// enumeration order; combinations without enough trades are dropped.
pub fn evaluate_grid(ratios: &[f64], zs: &[Option<f64>], grid: &OptimizerGrid) -> Vec<GridResult> {
    grid.combinations()
        .par_iter()
        .filter_map(|&(z_entry, z_exit)| {
            let metrics = backtest::simulate(ratios, zs, z_entry, z_exit)
                .metrics(grid.min_trades, grid.annualization_factor)?;
            let score = composite_score(&metrics);
            Some(GridResult {
                z_entry,
                z_exit,
                metrics,
                score,
            })
        })
        .collect()
}

/// Highest score among results meeting `min_win_rate`, falling back to the
/// whole set when none do. Ties keep the earlier result.
pub fn select_best(results: &[GridResult], min_win_rate: f64) -> Option<&GridResult> {
    fn first_max<'a>(iter: impl Iterator<Item = &'a GridResult>) -> Option<&'a GridResult> {
        iter.fold(None, |best: Option<&GridResult>, r| match best {
            Some(b) if r.score <= b.score => Some(b),
            _ => Some(r),
        })
    }

    first_max(results.iter().filter(|r| r.metrics.win_rate >= min_win_rate))
        .or_else(|| first_max(results.iter()))
}

pub fn optimize(
    samples: &[RatioSample],
    lookback_days: f64,
    grid: &OptimizerGrid,
) -> Option<OptimizationOutcome> {
    let ratios = stats::ratios(samples);
    let zs = stats::rolling_z(samples, lookback_days);
    let results = evaluate_grid(&ratios, &zs, grid);
    let best = select_best(&results, grid.min_win_rate)?.clone();

    let baseline_score = backtest::simulate(&ratios, &zs, BASELINE_Z_ENTRY, BASELINE_Z_EXIT)
        .metrics(grid.min_trades, grid.annualization_factor)
        .map(|m| composite_score(&m));
    let improvement_pct = baseline_score
        .filter(|b| *b != 0.0)
        .map(|b| (best.score - b) / b.abs() * 100.0);

    log::debug!(
        "[OPT] {} combinations valid, best entry={} exit={} score={:.2}",
        results.len(),
        best.z_entry,
        best.z_exit,
        best.score
    );

    Some(OptimizationOutcome {
        best,
        baseline_score,
        improvement_pct,
        evaluated: results.len(),
    })
}

pub fn to_params(
    pair_id: &str,
    outcome: &OptimizationOutcome,
    now: DateTime<Utc>,
    validity: Duration,
) -> OptimizedParams {
    OptimizedParams {
        pair_id: pair_id.to_string(),
        z_entry: outcome.best.z_entry,
        z_exit: outcome.best.z_exit,
        win_rate: outcome.best.metrics.win_rate,
        avg_return: outcome.best.metrics.avg_return,
        score: outcome.best.score,
        optimized_at: now,
        expires_at: now + validity,
    }
}
