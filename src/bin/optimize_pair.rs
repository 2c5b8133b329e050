//! Offline grid search for one pair.
//!
//! Usage: `optimize-pair <candles_a.jsonl> <candles_b.jsonl> [lookback_days]`
//!
//! Each input line is a candle such as `{"time":"2024-01-01T00:00:00Z","close":101.5}`.

use anyhow::{anyhow, bail, Context, Result};
use spreadbot::model::Candle;
use spreadbot::optimizer::{self, OptimizerGrid};
use spreadbot::stats;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const DEFAULT_LOOKBACK_DAYS: f64 = 7.0;

fn read_candles(path: &Path) -> Result<Vec<Candle>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut candles = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let candle: Candle = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid candle", path.display(), line_no + 1))?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.time);
    Ok(candles)
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        bail!("usage: optimize-pair <candles_a.jsonl> <candles_b.jsonl> [lookback_days]");
    }
    let lookback_days = match args.get(2) {
        Some(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("invalid lookback_days: {}", raw))?,
        None => DEFAULT_LOOKBACK_DAYS,
    };

    let series_a = read_candles(Path::new(&args[0]))?;
    let series_b = read_candles(Path::new(&args[1]))?;
    let samples = stats::ratio_series(&series_a, &series_b)
        .ok_or_else(|| anyhow!("not enough aligned samples"))?;

    let grid = OptimizerGrid::default();
    let outcome = optimizer::optimize(&samples, lookback_days, &grid)
        .ok_or_else(|| anyhow!("no parameter combination produced enough trades"))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
