//! Pure statistics over aligned candle series.
//!
//! Anything that can be undefined (short history, zero variance) comes back as
//! `None`; callers treat that as "no signal".

use crate::model::Candle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum number of samples for any statistic.
pub const MIN_SAMPLES: usize = 20;
const MS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioSample {
    pub time: DateTime<Utc>,
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollingStat {
    pub mean: f64,
    pub std: f64,
    /// `None` when the window has zero variance.
    pub z: Option<f64>,
}

/// Index-aligned `closeA / closeB`, skipping samples where either close is not
/// a positive finite number.
pub fn ratio_series(series_a: &[Candle], series_b: &[Candle]) -> Option<Vec<RatioSample>> {
    let samples: Vec<RatioSample> = series_a
        .iter()
        .zip(series_b.iter())
        .filter_map(|(a, b)| {
            if !is_valid_close(a.close) || !is_valid_close(b.close) {
                return None;
            }
            Some(RatioSample {
                time: a.time,
                ratio: a.close / b.close,
            })
        })
        .collect();
    (samples.len() >= MIN_SAMPLES).then_some(samples)
}

fn is_valid_close(close: f64) -> bool {
    close.is_finite() && close > 0.0
}

pub fn ratios(samples: &[RatioSample]) -> Vec<f64> {
    samples.iter().map(|s| s.ratio).collect()
}

pub fn avg_sample_interval_ms(samples: &[RatioSample]) -> Option<f64> {
    let (first, last) = (samples.first()?, samples.last()?);
    if samples.len() < 2 {
        return None;
    }
    let span = last.time.signed_duration_since(first.time).num_milliseconds() as f64;
    let avg = span / (samples.len() - 1) as f64;
    (avg > 0.0).then_some(avg)
}

/// Trailing window length: `lookback_days` expressed in samples, never below
/// [`MIN_SAMPLES`].
pub fn window_size(samples: &[RatioSample], lookback_days: f64) -> usize {
    match avg_sample_interval_ms(samples) {
        Some(interval_ms) => {
            let raw = (lookback_days * MS_PER_DAY / interval_ms).round();
            if raw.is_finite() && raw > 0.0 {
                (raw as usize).max(MIN_SAMPLES)
            } else {
                MIN_SAMPLES
            }
        }
        None => MIN_SAMPLES,
    }
}

/// Mean and sample standard deviation (N-1 divisor).
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    Some((mean, var.sqrt()))
}

fn stat_of(window: &[f64]) -> Option<RollingStat> {
    if window.len() < MIN_SAMPLES {
        return None;
    }
    let (mean, std) = mean_std(window)?;
    let latest = *window.last()?;
    let z = (std > 0.0).then(|| (latest - mean) / std);
    Some(RollingStat { mean, std, z })
}

/// Statistic for every point over its trailing `window` (including itself).
/// Points with fewer than [`MIN_SAMPLES`] trailing values have none.
pub fn rolling_stats(values: &[f64], window: usize) -> Vec<Option<RollingStat>> {
    let window = window.max(MIN_SAMPLES);
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            stat_of(&values[start..=i])
        })
        .collect()
}

pub fn rolling_z(samples: &[RatioSample], lookback_days: f64) -> Vec<Option<f64>> {
    let window = window_size(samples, lookback_days);
    rolling_stats(&ratios(samples), window)
        .into_iter()
        .map(|stat| stat.and_then(|s| s.z))
        .collect()
}

/// Statistic of the most recent sample; uses the whole series when it is
/// shorter than the lookback window.
pub fn latest_stat(samples: &[RatioSample], lookback_days: f64) -> Option<RollingStat> {
    let window = window_size(samples, lookback_days).min(samples.len());
    let values = ratios(&samples[samples.len() - window..]);
    stat_of(&values)
}

fn log_returns(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

/// Pearson correlation of log-returns over the overlapping window, with
/// population variance. `None` when either side has no variance.
pub fn correlation(series_a: &[f64], series_b: &[f64]) -> Option<f64> {
    let n = series_a.len().min(series_b.len());
    let (a, b) = (&series_a[..n], &series_b[..n]);
    if a.iter().chain(b.iter()).any(|v| !is_valid_close(*v)) {
        return None;
    }
    let ra = log_returns(a);
    let rb = log_returns(b);
    if ra.len() < 2 {
        return None;
    }
    let len = ra.len() as f64;
    let mean_a = ra.iter().sum::<f64>() / len;
    let mean_b = rb.iter().sum::<f64>() / len;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in ra.iter().zip(rb.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    cov /= len;
    var_a /= len;
    var_b /= len;
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

/// 0..=5 rating of a pair's backtest. Returns, win rate and drawdown are
/// fractions (0.08 == 8%).
pub fn quality_stars(
    avg_return: f64,
    win_rate: f64,
    max_drawdown: f64,
    z_score: f64,
    trade_count: usize,
) -> u8 {
    let cap: f64 = if avg_return < 0.0 || max_drawdown > 0.50 {
        1.0
    } else if max_drawdown > 0.40 || win_rate < 0.50 || trade_count < 3 {
        2.0
    } else {
        5.0
    };

    let mut sum: f64 = 0.0;
    sum += if avg_return >= 0.08 {
        2.0
    } else if avg_return >= 0.05 {
        1.5
    } else if avg_return >= 0.02 {
        1.0
    } else if avg_return > 0.0 {
        0.5
    } else {
        0.0
    };
    sum += if win_rate >= 0.80 {
        1.5
    } else if win_rate >= 0.70 {
        1.0
    } else if win_rate >= 0.60 {
        0.5
    } else {
        0.0
    };
    sum += if max_drawdown <= 0.20 {
        1.0
    } else if max_drawdown <= 0.30 {
        0.5
    } else {
        0.0
    };
    let abs_z = z_score.abs();
    if (1.5..=2.5).contains(&abs_z) {
        sum += 0.5;
    }
    sum.round().min(cap).max(0.0) as u8
}

#[cfg(test)]
pub(crate) mod test_series {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Hourly candles with the given closes.
    pub fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle::new(t0() + Duration::hours(i as i64), *c))
            .collect()
    }

    /// Hourly ratio samples with the given ratios.
    pub fn samples(values: &[f64]) -> Vec<RatioSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, r)| RatioSample {
                time: t0() + Duration::hours(i as i64),
                ratio: *r,
            })
            .collect()
    }

    /// Alternating `mean ± amp` history.
    pub fn oscillating(len: usize, mean: f64, amp: f64) -> Vec<f64> {
        (0..len)
            .map(|i| if i % 2 == 0 { mean + amp } else { mean - amp })
            .collect()
    }
}
