//! Pair discovery over the active asset universe.

use crate::backtest::{self, BacktestParams};
use crate::config::{BotConfig, Settings};
use crate::error::EngineError;
use crate::model::{pair_id, Candle, OptimizedParams, SpreadSignal};
use crate::ports::gateway::MarketGateway;
use crate::stats;
use crate::store::BotStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub pair_id: String,
    pub coin_a: String,
    pub coin_b: String,
    pub signal: SpreadSignal,
    pub z_score: f64,
    pub ratio: f64,
    pub correlation: Option<f64>,
    pub quality_stars: u8,
    pub win_rate: f64,
    pub avg_return: f64,
    pub max_drawdown: f64,
    pub trade_count: usize,
    pub z_entry: f64,
    pub z_exit: f64,
    pub is_optimized: bool,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedAsset {
    pub asset: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub opportunities: Vec<Opportunity>,
    pub skipped_assets: Vec<SkippedAsset>,
    pub pairs_evaluated: usize,
}

/// Statistics of one pair before any filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct PairStats {
    pub coin_a: String,
    pub coin_b: String,
    pub z_score: f64,
    pub ratio: f64,
    pub correlation: Option<f64>,
    pub quality_stars: u8,
    pub win_rate: f64,
    pub avg_return: f64,
    pub max_drawdown: f64,
    pub trade_count: usize,
}

impl PairStats {
    pub fn pair_id(&self) -> String {
        pair_id(&self.coin_a, &self.coin_b)
    }
}

/// `None` when the pair lacks aligned history, a defined z-score or a valid
/// backtest.
pub fn evaluate_pair(
    coin_a: &str,
    coin_b: &str,
    candles_a: &[Candle],
    candles_b: &[Candle],
    lookback_days: f64,
    params: &BacktestParams,
) -> Option<PairStats> {
    let samples = stats::ratio_series(candles_a, candles_b)?;
    let latest = stats::latest_stat(&samples, lookback_days)?;
    let z_score = latest.z?;
    let metrics = backtest::backtest(&samples, lookback_days, params)?;

    let n = candles_a.len().min(candles_b.len());
    let closes_a: Vec<f64> = candles_a[..n].iter().map(|c| c.close).collect();
    let closes_b: Vec<f64> = candles_b[..n].iter().map(|c| c.close).collect();
    let correlation = stats::correlation(&closes_a, &closes_b);

    let ratio = samples.last()?.ratio;
    Some(PairStats {
        coin_a: coin_a.to_string(),
        coin_b: coin_b.to_string(),
        z_score,
        ratio,
        correlation,
        quality_stars: stats::quality_stars(
            metrics.avg_return,
            metrics.win_rate,
            metrics.max_drawdown,
            z_score,
            metrics.trade_count,
        ),
        win_rate: metrics.win_rate,
        avg_return: metrics.avg_return,
        max_drawdown: metrics.max_drawdown,
        trade_count: metrics.trade_count,
    })
}

pub fn opportunity_score(stars: u8, z_score: f64, win_rate: f64, is_optimized: bool) -> f64 {
    let bonus = if is_optimized { 10.0 } else { 0.0 };
    stars as f64 * 20.0 + z_score.abs() * 10.0 + win_rate * 15.0 + bonus
}

/// Filters by quality, applies per-pair thresholds and sorts by score,
/// best first. Equal scores keep their input order.
pub fn rank_opportunities(
    candidates: Vec<PairStats>,
    config: &BotConfig,
    overrides: &HashMap<String, OptimizedParams>,
) -> Vec<Opportunity> {
    let mut ranked: Vec<Opportunity> = candidates
        .into_iter()
        .filter(|c| c.quality_stars >= config.min_quality_stars && c.win_rate >= config.min_win_rate)
        .filter_map(|c| {
            let id = c.pair_id();
            let (z_entry, z_exit, is_optimized) = match overrides.get(&id) {
                Some(p) => (p.z_entry, p.z_exit, true),
                None => (config.z_entry_threshold, config.z_exit_threshold, false),
            };
            if c.z_score.abs() < z_entry {
                return None;
            }
            let signal = SpreadSignal::from_z(c.z_score)?;
            Some(Opportunity {
                score: opportunity_score(c.quality_stars, c.z_score, c.win_rate, is_optimized),
                pair_id: id,
                coin_a: c.coin_a,
                coin_b: c.coin_b,
                signal,
                z_score: c.z_score,
                ratio: c.ratio,
                correlation: c.correlation,
                quality_stars: c.quality_stars,
                win_rate: c.win_rate,
                avg_return: c.avg_return,
                max_drawdown: c.max_drawdown,
                trade_count: c.trade_count,
                z_entry,
                z_exit,
                is_optimized,
            })
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

/// Fetches candles for every asset concurrently. Returns the histories in
/// `assets` order plus the assets that failed, timed out or came back empty.
pub async fn fetch_histories(
    gateway: Arc<dyn MarketGateway>,
    assets: &[String],
    interval: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    timeout: Duration,
) -> (Vec<(String, Vec<Candle>)>, Vec<SkippedAsset>) {
    let mut set = JoinSet::new();
    for asset in assets {
        let gateway = gateway.clone();
        let asset = asset.clone();
        let interval = interval.to_string();
        set.spawn(async move {
            let result = tokio::time::timeout(
                timeout,
                gateway.get_candles(&asset, &interval, start, end),
            )
            .await;
            let outcome = match result {
                Ok(Ok(candles)) if candles.is_empty() => Err("no candles".to_string()),
                Ok(Ok(candles)) => Ok(candles),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", timeout)),
            };
            (asset, outcome)
        });
    }

    let mut fetched: HashMap<String, Vec<Candle>> = HashMap::new();
    let mut failed: HashMap<String, String> = HashMap::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((asset, Ok(candles))) => {
                fetched.insert(asset, candles);
            }
            Ok((asset, Err(reason))) => {
                failed.insert(asset, reason);
            }
            Err(e) => log::error!("[SCAN] fetch task failed: {:?}", e),
        }
    }

    let mut histories = Vec::new();
    let mut skipped = Vec::new();
    for asset in assets {
        if let Some(candles) = fetched.remove(asset) {
            histories.push((asset.clone(), candles));
        } else {
            let reason = failed
                .remove(asset)
                .unwrap_or_else(|| "fetch task aborted".to_string());
            log::warn!("[SCAN] skipping {}: {}", asset, reason);
            skipped.push(SkippedAsset {
                asset: asset.clone(),
                reason,
            });
        }
    }
    (histories, skipped)
}

/// Mid prices for `assets`. The gateway's batch call is tried first; assets
/// it did not price (or every asset, when it failed or timed out) are then
/// asked one by one, concurrently, each under its own `timeout`. Assets that
/// still have no price are absent from the result.
pub async fn fetch_mid_prices(
    gateway: Arc<dyn MarketGateway>,
    assets: &[String],
    timeout: Duration,
) -> HashMap<String, Decimal> {
    let mut prices = match tokio::time::timeout(timeout, gateway.get_mid_prices(assets)).await {
        Ok(Ok(prices)) => prices,
        Ok(Err(e)) => {
            log::warn!("[PRICE] batch price call failed: {}", e);
            HashMap::new()
        }
        Err(_) => {
            log::warn!("[PRICE] batch price call timed out after {:?}", timeout);
            HashMap::new()
        }
    };

    let mut set = JoinSet::new();
    for asset in assets.iter().filter(|a| !prices.contains_key(*a)) {
        let gateway = gateway.clone();
        let asset = asset.clone();
        set.spawn(async move {
            let result = tokio::time::timeout(timeout, gateway.get_mid_price(&asset)).await;
            (asset, result)
        });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((asset, Ok(Ok(price)))) => {
                prices.insert(asset, price);
            }
            Ok((asset, Ok(Err(e)))) => log::warn!("[PRICE] {} unavailable: {}", asset, e),
            Ok((asset, Err(_))) => {
                log::warn!("[PRICE] {} timed out after {:?}", asset, timeout)
            }
            Err(e) => log::error!("[PRICE] fetch task failed: {:?}", e),
        }
    }
    prices
}

/// Full scan at `now`: universe resolution, history fetch, pair statistics,
/// optimized-threshold overrides and ranking.
pub async fn scan(
    gateway: Arc<dyn MarketGateway>,
    store: &dyn BotStore,
    settings: &Settings,
    config: &BotConfig,
    now: DateTime<Utc>,
) -> Result<ScanReport, EngineError> {
    let assets = settings.resolve_universe(&config.active_universes);
    let start = now - settings.history_window();
    let (histories, skipped_assets) = fetch_histories(
        gateway,
        &assets,
        &settings.candle_interval,
        start,
        now,
        settings.call_timeout(),
    )
    .await;

    let params = BacktestParams {
        z_entry: config.z_entry_threshold,
        z_exit: config.z_exit_threshold,
        annualization_factor: settings.annualization_factor,
        min_trades: settings.min_backtest_trades,
    };

    let mut candidates = Vec::new();
    let mut pairs_evaluated = 0;
    for i in 0..histories.len() {
        for j in (i + 1)..histories.len() {
            pairs_evaluated += 1;
            let (coin_a, candles_a) = &histories[i];
            let (coin_b, candles_b) = &histories[j];
            match evaluate_pair(
                coin_a,
                coin_b,
                candles_a,
                candles_b,
                settings.lookback_days,
                &params,
            ) {
                Some(stats) => candidates.push(stats),
                None => log::debug!("[SCAN] {}/{} has no usable statistics", coin_a, coin_b),
            }
        }
    }

    let mut overrides = HashMap::new();
    for c in &candidates {
        let id = c.pair_id();
        if let Some(p) = store.get_optimized_params(&id, now).await? {
            overrides.insert(id, p);
        }
    }

    let opportunities = rank_opportunities(candidates, config, &overrides);
    log::info!(
        "[SCAN] {} assets, {} pairs, {} opportunities, {} skipped",
        assets.len(),
        pairs_evaluated,
        opportunities.len(),
        skipped_assets.len()
    );
    Ok(ScanReport {
        opportunities,
        skipped_assets,
        pairs_evaluated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::store::MemoryStore;
    use crate::testing::{
        scan_settings, spike_pair_closes, FakeGateway, Stall, SPIKE_PERIOD, SPIKE_SERIES_LEN,
    };
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn pair_stats(a: &str, b: &str, z: f64, stars: u8, win_rate: f64) -> PairStats {
        PairStats {
            coin_a: a.to_string(),
            coin_b: b.to_string(),
            z_score: z,
            ratio: 1.0,
            correlation: Some(0.8),
            quality_stars: stars,
            win_rate,
            avg_return: 0.02,
            max_drawdown: 0.05,
            trade_count: 6,
        }
    }

    fn optimized(pair: &str, z_entry: f64) -> OptimizedParams {
        OptimizedParams {
            pair_id: pair.to_string(),
            z_entry,
            z_exit: 0.25,
            win_rate: 0.8,
            avg_return: 0.03,
            score: 60.0,
            optimized_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::days(7),
        }
    }

    #[test]
    fn ranking_filters_and_orders() {
        let config = BotConfig::default();
        let candidates = vec![
            pair_stats("BTC", "ETH", 2.1, 3, 0.6),
            pair_stats("BTC", "SOL", -2.6, 4, 0.7),
            // below star floor
            pair_stats("ETH", "SOL", 3.0, 2, 0.9),
            // below win-rate floor
            pair_stats("ETH", "BNB", 3.0, 4, 0.4),
            // below entry
            pair_stats("SOL", "BNB", 1.2, 5, 0.9),
        ];
        let ranked = rank_opportunities(candidates, &config, &HashMap::new());
        let ids: Vec<&str> = ranked.iter().map(|o| o.pair_id.as_str()).collect();
        assert_eq!(ids, vec!["BTC/SOL", "BTC/ETH"]);
        assert_eq!(ranked[0].signal, SpreadSignal::Long);
        assert_eq!(ranked[1].signal, SpreadSignal::Short);
        assert_eq!(ranked[1].score, 3.0 * 20.0 + 2.1 * 10.0 + 0.6 * 15.0);
    }

    #[test]
    fn optimized_thresholds_override_entry_gate() {
        let config = BotConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("SOL/BNB".to_string(), optimized("SOL/BNB", 1.5));
        overrides.insert("BTC/ETH".to_string(), optimized("BTC/ETH", 3.0));
        let candidates = vec![
            pair_stats("SOL", "BNB", 1.6, 3, 0.6),
            pair_stats("BTC", "ETH", 2.5, 3, 0.6),
        ];
        let ranked = rank_opportunities(candidates, &config, &overrides);
        assert_eq!(ranked.len(), 1);
        let o = &ranked[0];
        assert_eq!(o.pair_id, "SOL/BNB");
        assert!(o.is_optimized);
        assert_eq!((o.z_entry, o.z_exit), (1.5, 0.25));
        assert_eq!(o.score, 3.0 * 20.0 + 1.6 * 10.0 + 0.6 * 15.0 + 10.0);
    }

    #[test]
    fn equal_scores_keep_enumeration_order() {
        let config = BotConfig::default();
        let candidates = vec![
            pair_stats("BTC", "ETH", 2.5, 3, 0.6),
            pair_stats("BTC", "SOL", 2.5, 3, 0.6),
        ];
        let ranked = rank_opportunities(candidates, &config, &HashMap::new());
        assert_eq!(ranked[0].pair_id, "BTC/ETH");
        assert_eq!(ranked[1].pair_id, "BTC/SOL");
    }

    #[test]
    fn spiking_pair_is_rated_and_signalled() {
        let (a, b) = spike_pair_closes();
        let gw = FakeGateway::new();
        let ca = gw.candles_for(&a);
        let cb = gw.candles_for(&b);
        let stats = evaluate_pair("AAA", "BBB", &ca, &cb, 2.0, &BacktestParams::new(2.0, 0.5))
            .expect("pair should have statistics");
        assert!(stats.z_score > 2.0);
        assert!(stats.trade_count >= 3);
        assert_eq!(stats.win_rate, 1.0);
        assert!(stats.quality_stars >= 3);
        assert!(stats.correlation.is_some());
    }

    /// Closes that drift upwards, wobble by `wobble` on alternate hours and
    /// jump by `spike` on the last hour of every day.
    fn daily_spike(scale: f64, spike: f64, wobble: f64) -> Vec<f64> {
        (0..SPIKE_SERIES_LEN)
            .map(|i| {
                let factor = if i % SPIKE_PERIOD == SPIKE_PERIOD - 1 {
                    spike
                } else if i % 2 == 0 {
                    1.0 + wobble
                } else {
                    1.0 - wobble
                };
                (100.0 + i as f64 * 0.01) * scale * factor
            })
            .collect()
    }

    fn five_asset_gateway(with_ccc: bool) -> FakeGateway {
        let gw = FakeGateway::new()
            .with_candles("AAA", &daily_spike(1.0, 1.03, 0.001))
            .with_candles("BBB", &daily_spike(2.0, 1.0, -0.0005))
            .with_candles("DDD", &daily_spike(0.5, 0.97, 0.0005))
            .with_candles("EEE", &daily_spike(3.0, 1.05, 0.0));
        if with_ccc {
            gw.with_candles("CCC", &daily_spike(0.25, 1.02, 0.0))
        } else {
            gw
        }
    }

    #[tokio::test]
    async fn failing_asset_is_skipped_without_aborting() {
        let gw = five_asset_gateway(true).failing("CCC");
        let settings = scan_settings(&["AAA", "BBB", "CCC", "DDD", "EEE"]);
        let store = MemoryStore::new(settings.bot.clone(), dec!(10000));
        let now = gw.now_time();

        let report = scan(Arc::new(gw), &store, &settings, &settings.bot, now)
            .await
            .unwrap();
        assert_eq!(report.pairs_evaluated, 6);
        assert_eq!(report.skipped_assets.len(), 1);
        assert_eq!(report.skipped_assets[0].asset, "CCC");

        let mut ids: Vec<&str> = report.opportunities.iter().map(|o| o.pair_id.as_str()).collect();
        ids.sort();
        assert_eq!(
            ids,
            vec!["AAA/BBB", "AAA/DDD", "AAA/EEE", "BBB/DDD", "BBB/EEE", "DDD/EEE"]
        );

        // Same outcome as a universe that never listed the failing asset.
        let gw = five_asset_gateway(false);
        let settings = scan_settings(&["AAA", "BBB", "DDD", "EEE"]);
        let without = scan(Arc::new(gw), &store, &settings, &settings.bot, now)
            .await
            .unwrap();
        assert_eq!(without.pairs_evaluated, 6);
        assert_eq!(without.opportunities, report.opportunities);
    }

    #[tokio::test]
    async fn stalled_candles_are_skipped_after_timeout() {
        let gw = five_asset_gateway(true);
        gw.stall(Stall::Candles, "CCC");
        let now = gw.now_time();
        let assets: Vec<String> = ["AAA", "CCC", "EEE"].iter().map(|s| s.to_string()).collect();

        let (histories, skipped) = fetch_histories(
            Arc::new(gw),
            &assets,
            "1h",
            now - ChronoDuration::days(8),
            now,
            Duration::from_millis(50),
        )
        .await;
        let fetched: Vec<&str> = histories.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(fetched, vec!["AAA", "EEE"]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].asset, "CCC");
        assert!(skipped[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn stalled_price_is_left_out() {
        let gw = five_asset_gateway(true);
        gw.stall(Stall::Price, "BBB");
        let assets: Vec<String> = ["AAA", "BBB", "DDD"].iter().map(|s| s.to_string()).collect();

        let prices = fetch_mid_prices(Arc::new(gw), &assets, Duration::from_millis(50)).await;
        assert_eq!(prices.len(), 2);
        assert!(prices.contains_key("AAA"));
        assert!(prices.contains_key("DDD"));
        assert!(!prices.contains_key("BBB"));
    }

    #[tokio::test]
    async fn stored_params_mark_pairs_optimized() {
        let (a, b) = spike_pair_closes();
        let gw = FakeGateway::new().with_candles("AAA", &a).with_candles("BBB", &b);
        let settings = scan_settings(&["AAA", "BBB"]);
        let store = MemoryStore::new(settings.bot.clone(), dec!(10000));
        let now = gw.now_time();
        let mut params = optimized("AAA/BBB", 1.75);
        params.expires_at = now + ChronoDuration::days(1);
        store.set_optimized_params(params).await.unwrap();

        let report = scan(Arc::new(gw), &store, &settings, &settings.bot, now)
            .await
            .unwrap();
        assert_eq!(report.opportunities.len(), 1);
        assert!(report.opportunities[0].is_optimized);
        assert_eq!(report.opportunities[0].z_entry, 1.75);
    }
}
