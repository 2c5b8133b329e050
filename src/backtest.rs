//! Replays a ratio series through the entry/exit rules.

use crate::model::SpreadSignal;
use crate::stats::{self, RatioSample};
use serde::{Deserialize, Serialize};

/// Reported when there are winning trades but no losing ones.
pub const PROFIT_FACTOR_SENTINEL: f64 = 999.0;
pub const DEFAULT_MIN_TRADES: usize = 3;
/// Hourly samples per year.
pub const DEFAULT_ANNUALIZATION_FACTOR: f64 = 8760.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestParams {
    pub z_entry: f64,
    pub z_exit: f64,
    pub annualization_factor: f64,
    pub min_trades: usize,
}

impl BacktestParams {
    pub fn new(z_entry: f64, z_exit: f64) -> Self {
        Self {
            z_entry,
            z_exit,
            annualization_factor: DEFAULT_ANNUALIZATION_FACTOR,
            min_trades: DEFAULT_MIN_TRADES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTrade {
    pub side: SpreadSignal,
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_ratio: f64,
    pub exit_ratio: f64,
    pub entry_z: f64,
    pub exit_z: f64,
    pub ret: f64,
}

impl SimulatedTrade {
    pub fn holding(&self) -> usize {
        self.exit_index - self.entry_index
    }
}

#[derive(Debug, Clone, Copy)]
enum SimState {
    Flat,
    Entered {
        side: SpreadSignal,
        index: usize,
        ratio: f64,
        z: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub trade_count: usize,
    pub win_rate: f64,
    pub avg_return: f64,
    pub avg_holding: f64,
    pub sharpe: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub total_return: f64,
}

/// Trades and compounded equity of one pass over a series.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRun {
    pub trades: Vec<SimulatedTrade>,
    pub equity_curve: Vec<f64>,
}

pub fn realized_return(side: SpreadSignal, entry_ratio: f64, exit_ratio: f64) -> f64 {
    let short = (entry_ratio - exit_ratio) / entry_ratio;
    match side {
        SpreadSignal::Short => short,
        SpreadSignal::Long => -short,
    }
}

/// Runs the state machine over `ratios` with precomputed z-scores. A position
/// still open when the series ends is not counted.
pub fn simulate(ratios: &[f64], zs: &[Option<f64>], z_entry: f64, z_exit: f64) -> SimulationRun {
    let mut state = SimState::Flat;
    let mut trades = Vec::new();
    let mut equity = 1.0;
    let mut equity_curve = vec![equity];

    for (i, (&ratio, z)) in ratios.iter().zip(zs.iter()).enumerate() {
        let Some(z) = *z else {
            continue;
        };
        match state {
            SimState::Flat => {
                let side = if z > z_entry {
                    Some(SpreadSignal::Short)
                } else if z < -z_entry {
                    Some(SpreadSignal::Long)
                } else {
                    None
                };
                if let Some(side) = side {
                    state = SimState::Entered {
                        side,
                        index: i,
                        ratio,
                        z,
                    };
                }
            }
            SimState::Entered {
                side,
                index,
                ratio: entry_ratio,
                z: entry_z,
            } => {
                if z.abs() < z_exit {
                    let ret = realized_return(side, entry_ratio, ratio);
                    equity *= 1.0 + ret;
                    equity_curve.push(equity);
                    trades.push(SimulatedTrade {
                        side,
                        entry_index: index,
                        exit_index: i,
                        entry_ratio,
                        exit_ratio: ratio,
                        entry_z,
                        exit_z: z,
                        ret,
                    });
                    state = SimState::Flat;
                }
            }
        }
    }

    SimulationRun {
        trades,
        equity_curve,
    }
}

/// Computes rolling z over `samples` and simulates with `params`.
pub fn run(samples: &[RatioSample], lookback_days: f64, params: &BacktestParams) -> SimulationRun {
    let ratios = stats::ratios(samples);
    let zs = stats::rolling_z(samples, lookback_days);
    simulate(&ratios, &zs, params.z_entry, params.z_exit)
}

/// Metrics for `samples`, or `None` when the run has too few trades.
pub fn backtest(
    samples: &[RatioSample],
    lookback_days: f64,
    params: &BacktestParams,
) -> Option<BacktestMetrics> {
    run(samples, lookback_days, params).metrics(params.min_trades, params.annualization_factor)
}

pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0;
    for &eq in equity_curve {
        if eq > peak {
            peak = eq;
        }
        if peak > 0.0 {
            let dd = (peak - eq) / peak;
            if dd > worst {
                worst = dd;
            }
        }
    }
    worst
}

impl SimulationRun {
    pub fn metrics(&self, min_trades: usize, annualization_factor: f64) -> Option<BacktestMetrics> {
        let n = self.trades.len();
        if n == 0 || n < min_trades {
            return None;
        }
        let returns: Vec<f64> = self.trades.iter().map(|t| t.ret).collect();
        let wins = returns.iter().filter(|r| **r > 0.0).count();
        let avg_return = returns.iter().sum::<f64>() / n as f64;
        let avg_holding =
            self.trades.iter().map(|t| t.holding() as f64).sum::<f64>() / n as f64;
        let std_return = stats::mean_std(&returns).map(|(_, s)| s).unwrap_or(0.0);
        let sharpe = if std_return > 0.0 && avg_holding > 0.0 {
            (avg_return / std_return) * (annualization_factor / avg_holding).sqrt()
        } else {
            0.0
        };

        let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
        let gross_loss: f64 = -returns.iter().filter(|r| **r < 0.0).sum::<f64>();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            PROFIT_FACTOR_SENTINEL
        } else {
            0.0
        };

        let final_equity = self.equity_curve.last().copied().unwrap_or(1.0);
        Some(BacktestMetrics {
            trade_count: n,
            win_rate: wins as f64 / n as f64,
            avg_return,
            avg_holding,
            sharpe,
            profit_factor,
            max_drawdown: max_drawdown(&self.equity_curve),
            total_return: final_equity - 1.0,
        })
    }
}
