//! Position lifecycle controller.
//!
//! One [`SpreadEngine::run_cycle`] refreshes open spreads, closes those whose
//! exit rule fires, and opens at most one new spread. Manual control
//! operations share an operations lock with the cycle, so a position is never
//! read and written by two operations at once.

use crate::config::{BotConfig, BotConfigPatch, Settings};
use crate::error::EngineError;
use crate::model::{
    pair_id, price_ratio, BotStats, ExitReason, Leg, LegSide, OptimizedParams, Spread,
    TradeRecord, TradingMode, WorkerHeartbeat,
};
use crate::optimizer::{self, OptimizerGrid};
use crate::ports::gateway::{ClosePositionRequest, GatewayError, MarketGateway, OrderRequest};
use crate::ports::notifier::{BotEvent, EventPublisher};
use crate::scanner::{self, ScanReport};
use crate::stats::{self, RatioSample};
use crate::store::BotStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleAction {
    pub kind: ActionKind,
    pub pair_id: String,
    pub spread_id: String,
    /// Signal for opens, exit reason for closes.
    pub detail: String,
    pub size_usd: Decimal,
    pub pnl: Option<Decimal>,
}

/// Advisory summary of one cycle. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub executed: bool,
    pub skipped_reason: Option<String>,
    pub actions: Vec<CycleAction>,
    pub errors: Vec<String>,
}

impl CycleResult {
    fn skipped(reason: &str) -> Self {
        Self {
            executed: false,
            skipped_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    fn executed() -> Self {
        Self {
            executed: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub updated_at: DateTime<Utc>,
    pub enabled: bool,
    pub mode: TradingMode,
    pub equity: Decimal,
    pub balance: Decimal,
    pub peak_equity: Decimal,
    pub open_count: usize,
    pub positions: Vec<Spread>,
    pub total_trades: u64,
    pub win_rate: f64,
    pub total_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub heartbeat: WorkerHeartbeat,
    /// Running and beating within the staleness window.
    pub alive: bool,
}

/// Exit rule for an open spread, checked in priority order. `z` is only
/// consulted for mean reversion and may be absent.
pub fn decide_exit(
    spread: &Spread,
    config: &BotConfig,
    settings: &Settings,
    z: Option<f64>,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    let pnl_percent = spread.pnl_percent();
    if stop_loss_hit(spread, config) {
        return Some(ExitReason::StopLoss);
    }
    if let Some(z) = z {
        if z.abs() < spread.z_exit_threshold && spread.current_pnl > Decimal::ZERO {
            return Some(ExitReason::MeanReversion);
        }
    }
    if pnl_percent > settings.take_profit_percent {
        return Some(ExitReason::TakeProfit);
    }
    if spread.holding_time(now) > settings.max_holding() {
        return Some(ExitReason::MaxHoldingTime);
    }
    None
}

fn stop_loss_hit(spread: &Spread, config: &BotConfig) -> bool {
    spread.pnl_percent() < -config.stop_loss_percent
}

pub struct SpreadEngine {
    settings: Arc<Settings>,
    store: Arc<dyn BotStore>,
    gateway: Arc<dyn MarketGateway>,
    events: EventPublisher,
    cycle_guard: Mutex<()>,
    ops_lock: Mutex<()>,
}

impl SpreadEngine {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn BotStore>,
        gateway: Arc<dyn MarketGateway>,
        events: EventPublisher,
    ) -> Self {
        Self {
            settings,
            store,
            gateway,
            events,
            cycle_guard: Mutex::new(()),
            ops_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn BotStore> {
        &self.store
    }

    /// Runs one cycle. A cycle started while another is in flight returns
    /// immediately with `executed == false`.
    pub async fn run_cycle(&self) -> Result<CycleResult, EngineError> {
        let Ok(_cycle) = self.cycle_guard.try_lock() else {
            log::debug!("[CYCLE] previous cycle still running");
            return Ok(CycleResult::skipped("cycle already running"));
        };
        let _ops = self.ops_lock.lock().await;

        let config = self.store.get_config().await?;
        if !config.enabled {
            return Ok(CycleResult::skipped("bot disabled"));
        }
        let now = self.gateway.now();
        let expired = self.store.clean_expired_params(now).await?;
        if expired > 0 {
            log::info!("[OPT] removed {} expired parameter sets", expired);
        }

        let mut result = CycleResult::executed();
        let marked = self.refresh_positions(&mut result).await?;
        for (spread, prices) in marked {
            self.evaluate_exit(spread, prices, &config, now, &mut result)
                .await?;
        }

        let open_count = self.store.get_open_spreads().await?.len();
        if open_count < config.max_concurrent_spreads {
            self.try_enter(&config, now, &mut result).await?;
        } else {
            log::debug!(
                "[ENTRY] at capacity ({}/{})",
                open_count,
                config.max_concurrent_spreads
            );
        }

        log::info!(
            "[CYCLE] done: {} actions, {} errors",
            result.actions.len(),
            result.errors.len()
        );
        Ok(result)
    }

    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout(), fut).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::Timeout(what.to_string())),
        }
    }

    async fn pair_prices(&self, coin_a: &str, coin_b: &str) -> Result<(Decimal, Decimal), EngineError> {
        let assets = vec![coin_a.to_string(), coin_b.to_string()];
        let prices = scanner::fetch_mid_prices(
            self.gateway.clone(),
            &assets,
            self.settings.call_timeout(),
        )
        .await;
        let pa = prices
            .get(coin_a)
            .copied()
            .ok_or_else(|| EngineError::data_unavailable(coin_a, "no mid price"))?;
        let pb = prices
            .get(coin_b)
            .copied()
            .ok_or_else(|| EngineError::data_unavailable(coin_b, "no mid price"))?;
        Ok((pa, pb))
    }

    /// Logs, records and publishes a failure that only affects one item.
    async fn report_failure(
        &self,
        result: &mut CycleResult,
        context: &str,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        let message = format!("{}: {}", context, err);
        log::error!("[CYCLE] {}", message);
        self.store
            .add_log("error", &message, Some(serde_json::json!({ "context": context })))
            .await?;
        self.events.publish(BotEvent::Error(message.clone()));
        result.errors.push(message);
        Ok(())
    }

    /// Re-marks open spreads. Spreads whose leg prices are unavailable are
    /// left untouched and not returned.
    async fn refresh_positions(
        &self,
        result: &mut CycleResult,
    ) -> Result<Vec<(Spread, (Decimal, Decimal))>, EngineError> {
        let open = self.store.get_open_spreads().await?;
        if open.is_empty() {
            return Ok(Vec::new());
        }
        let assets: Vec<String> = open
            .iter()
            .flat_map(|s| [s.coin_a.clone(), s.coin_b.clone()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let prices = scanner::fetch_mid_prices(
            self.gateway.clone(),
            &assets,
            self.settings.call_timeout(),
        )
        .await;

        let mut marked = Vec::with_capacity(open.len());
        for mut spread in open {
            let (Some(pa), Some(pb)) = (prices.get(&spread.coin_a), prices.get(&spread.coin_b))
            else {
                let missing = if prices.contains_key(&spread.coin_a) {
                    &spread.coin_b
                } else {
                    &spread.coin_a
                };
                let err = EngineError::data_unavailable(missing, "no mid price");
                self.report_failure(result, &format!("refresh {}", spread.pair_id), &err)
                    .await?;
                continue;
            };
            let (pa, pb) = (*pa, *pb);
            if !spread.mark(pa, pb) {
                log::warn!("[PRICE] {} skipped: invalid prices {} / {}", spread.pair_id, pa, pb);
                continue;
            }
            self.store
                .update_spread_pnl(&spread.id, spread.current_pnl, spread.current_ratio)
                .await?;
            marked.push((spread, (pa, pb)));
        }

        let equity = self.store.refresh_peak_equity().await?;
        log::debug!("[CYCLE] equity {}", equity);
        Ok(marked)
    }

    /// Latest rolling z of a pair, `None` when history is unavailable.
    async fn latest_pair_z(&self, coin_a: &str, coin_b: &str, now: DateTime<Utc>) -> Option<f64> {
        let samples = self.pair_samples(coin_a, coin_b, now).await.ok()?;
        stats::latest_stat(&samples, self.settings.lookback_days)?.z
    }

    async fn pair_samples(
        &self,
        coin_a: &str,
        coin_b: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RatioSample>, EngineError> {
        let assets = vec![coin_a.to_string(), coin_b.to_string()];
        let (histories, skipped) = scanner::fetch_histories(
            self.gateway.clone(),
            &assets,
            &self.settings.candle_interval,
            now - self.settings.history_window(),
            now,
            self.settings.call_timeout(),
        )
        .await;
        if let Some(s) = skipped.first() {
            return Err(EngineError::data_unavailable(&s.asset, s.reason.clone()));
        }
        let [(_, candles_a), (_, candles_b)] = histories.as_slice() else {
            return Err(EngineError::InsufficientHistory {
                pair_id: pair_id(coin_a, coin_b),
            });
        };
        stats::ratio_series(candles_a, candles_b).ok_or_else(|| EngineError::InsufficientHistory {
            pair_id: pair_id(coin_a, coin_b),
        })
    }

    async fn evaluate_exit(
        &self,
        spread: Spread,
        prices: (Decimal, Decimal),
        config: &BotConfig,
        now: DateTime<Utc>,
        result: &mut CycleResult,
    ) -> Result<(), EngineError> {
        // z is only needed for a profitable spread not already stopped out
        let z = if spread.current_pnl > Decimal::ZERO && !stop_loss_hit(&spread, config) {
            let z = self.latest_pair_z(&spread.coin_a, &spread.coin_b, now).await;
            if z.is_none() {
                log::warn!("[EXIT] {} z unavailable; mean reversion skipped", spread.pair_id);
            }
            z
        } else {
            None
        };

        let Some(reason) = decide_exit(&spread, config, &self.settings, z, now) else {
            return Ok(());
        };
        log::info!(
            "[EXIT] {} reason={} pnl={} ({:.2}%)",
            spread.pair_id,
            reason,
            spread.current_pnl.round_dp(4),
            spread.pnl_percent()
        );
        match self.close_spread(&spread, reason.label(), prices, now).await {
            Ok(Some(trade)) => result.actions.push(CycleAction {
                kind: ActionKind::Close,
                pair_id: spread.pair_id.clone(),
                spread_id: spread.id.clone(),
                detail: trade.exit_reason.clone(),
                size_usd: spread.size_usd,
                pnl: Some(trade.final_pnl),
            }),
            Ok(None) => log::info!("[EXIT] {} already closed", spread.id),
            Err(e) if e.is_per_item() => {
                self.report_failure(result, &format!("close {}", spread.pair_id), &e)
                    .await?
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Realizes a spread at `prices` (paper) or at the venue fills (live).
    /// `Ok(None)` when the spread was already closed.
    async fn close_spread(
        &self,
        spread: &Spread,
        reason: &str,
        prices: (Decimal, Decimal),
        now: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, EngineError> {
        let (mut exit_a, mut exit_b) = prices;
        if spread.mode == TradingMode::Live {
            let fill_a = self
                .call(
                    "close leg A",
                    self.gateway.close_position(&ClosePositionRequest {
                        asset: spread.coin_a.clone(),
                        side: spread.leg_a.side,
                        size: spread.leg_a.size,
                    }),
                )
                .await?;
            let fill_b = match self
                .call(
                    "close leg B",
                    self.gateway.close_position(&ClosePositionRequest {
                        asset: spread.coin_b.clone(),
                        side: spread.leg_b.side,
                        size: spread.leg_b.size,
                    }),
                )
                .await
            {
                Ok(fill) => fill,
                Err(e) => {
                    log::error!(
                        "[UNHEDGED] {} leg {} closed but {} close failed: {}",
                        spread.pair_id,
                        spread.coin_a,
                        spread.coin_b,
                        e
                    );
                    return Err(e.into());
                }
            };
            exit_a = fill_a.price;
            exit_b = fill_b.price;
        }

        let exit_notional = exit_a * spread.leg_a.size + exit_b * spread.leg_b.size;
        let exit_fee = exit_notional * self.settings.fee_rate;
        let final_pnl = spread.pnl_at(exit_a, exit_b) - exit_fee;
        let trade = TradeRecord {
            position: spread.clone(),
            exit_price_a: exit_a,
            exit_price_b: exit_b,
            exit_ratio: price_ratio(exit_a, exit_b).unwrap_or(spread.current_ratio),
            exit_time: now,
            exit_reason: reason.to_string(),
            final_pnl,
        };

        let Some(stats) = self.store.commit_close(&spread.id, trade.clone()).await? else {
            return Ok(None);
        };
        log::info!(
            "[EXIT] closed {} {} final_pnl={} balance={} trades={} win_rate={:.2}",
            spread.signal,
            spread.pair_id,
            final_pnl.round_dp(4),
            stats.paper_balance.round_dp(2),
            stats.total_trades,
            stats.win_rate()
        );
        self.store
            .add_log(
                "info",
                &format!("closed {} ({})", spread.pair_id, reason),
                serde_json::to_value(&trade).ok(),
            )
            .await?;
        self.events.publish(BotEvent::Closed(trade.clone()));
        Ok(Some(trade))
    }

    async fn try_enter(
        &self,
        config: &BotConfig,
        now: DateTime<Utc>,
        result: &mut CycleResult,
    ) -> Result<(), EngineError> {
        let report = scanner::scan(
            self.gateway.clone(),
            self.store.as_ref(),
            &self.settings,
            config,
            now,
        )
        .await?;
        let open: BTreeSet<String> = self
            .store
            .get_open_spreads()
            .await?
            .into_iter()
            .map(|s| s.pair_id)
            .collect();
        let Some(candidate) = report
            .opportunities
            .into_iter()
            .find(|o| !open.contains(&o.pair_id))
        else {
            log::debug!("[ENTRY] no candidate");
            return Ok(());
        };

        let size_usd = config.max_position_usd;
        let open_fee = size_usd * self.settings.fee_rate;
        let stats = self.store.get_stats().await?;
        if stats.paper_balance < size_usd + open_fee {
            log::warn!(
                "[ENTRY] {} skipped: balance {} below {}",
                candidate.pair_id,
                stats.paper_balance,
                size_usd + open_fee
            );
            return Ok(());
        }

        let (pa, pb) = match self.pair_prices(&candidate.coin_a, &candidate.coin_b).await {
            Ok(prices) => prices,
            Err(e) if e.is_per_item() => {
                return self
                    .report_failure(result, &format!("open {}", candidate.pair_id), &e)
                    .await;
            }
            Err(e) => return Err(e),
        };

        let spread = match self
            .build_spread(&candidate, config.mode, size_usd, (pa, pb), now)
            .await
        {
            Ok(spread) => spread,
            Err(e) if e.is_per_item() => {
                return self
                    .report_failure(result, &format!("open {}", candidate.pair_id), &e)
                    .await;
            }
            Err(e) => return Err(e),
        };

        if !self
            .store
            .commit_open(spread.clone(), size_usd + open_fee)
            .await?
        {
            log::warn!("[ENTRY] {} already open", spread.pair_id);
            return Ok(());
        }
        log::info!(
            "[ENTRY] opened {} {} z={:.2} ratio={:.6} size={} mode={}",
            spread.signal,
            spread.pair_id,
            spread.entry_z_score,
            spread.entry_ratio,
            size_usd,
            spread.mode.label()
        );
        self.store
            .add_log(
                "info",
                &format!("opened {} {}", spread.signal, spread.pair_id),
                serde_json::to_value(&candidate).ok(),
            )
            .await?;
        self.events.publish(BotEvent::Opened(spread.clone()));
        result.actions.push(CycleAction {
            kind: ActionKind::Open,
            pair_id: spread.pair_id,
            spread_id: spread.id,
            detail: spread.signal.label().to_string(),
            size_usd,
            pnl: None,
        });
        Ok(())
    }

    /// Sizes both legs at half the notional each. Live mode places the
    /// orders and flattens leg A again if leg B fails.
    async fn build_spread(
        &self,
        candidate: &scanner::Opportunity,
        mode: TradingMode,
        size_usd: Decimal,
        (pa, pb): (Decimal, Decimal),
        now: DateTime<Utc>,
    ) -> Result<Spread, EngineError> {
        let entry_ratio = price_ratio(pa, pb)
            .ok_or_else(|| EngineError::data_unavailable(&candidate.pair_id, "invalid leg prices"))?;
        let half = size_usd / Decimal::TWO;
        let (side_a, side_b) = candidate.signal.leg_sides();
        let mut leg_a = Leg {
            side: side_a,
            entry_price: pa,
            size: (half / pa).round_dp(8),
        };
        let mut leg_b = Leg {
            side: side_b,
            entry_price: pb,
            size: (half / pb).round_dp(8),
        };

        if mode == TradingMode::Live {
            let fill_a = self
                .call(
                    "open leg A",
                    self.gateway.place_order(&OrderRequest {
                        asset: candidate.coin_a.clone(),
                        side: side_a,
                        size: leg_a.size,
                        reference_price: pa,
                    }),
                )
                .await?;
            let fill_b = match self
                .call(
                    "open leg B",
                    self.gateway.place_order(&OrderRequest {
                        asset: candidate.coin_b.clone(),
                        side: side_b,
                        size: leg_b.size,
                        reference_price: pb,
                    }),
                )
                .await
            {
                Ok(fill) => fill,
                Err(e) => {
                    self.unwind_leg(&candidate.coin_a, side_a, fill_a.size).await;
                    return Err(e.into());
                }
            };
            leg_a.entry_price = fill_a.price;
            leg_a.size = fill_a.size;
            leg_b.entry_price = fill_b.price;
            leg_b.size = fill_b.size;
        }

        Ok(Spread {
            id: format!("{}-{:012x}", now.timestamp_millis(), rand::random::<u64>() >> 16),
            pair_id: candidate.pair_id.clone(),
            coin_a: candidate.coin_a.clone(),
            coin_b: candidate.coin_b.clone(),
            signal: candidate.signal,
            size_usd,
            leg_a,
            leg_b,
            entry_ratio,
            entry_z_score: candidate.z_score,
            z_exit_threshold: candidate.z_exit,
            entry_time: now,
            current_pnl: Decimal::ZERO,
            current_ratio: entry_ratio,
            mode,
        })
    }

    async fn unwind_leg(&self, asset: &str, side: LegSide, size: Decimal) {
        log::warn!("[UNHEDGED] closing lone leg {} side={:?} size={}", asset, side, size);
        let request = ClosePositionRequest {
            asset: asset.to_string(),
            side,
            size,
        };
        match self
            .call("unwind leg", self.gateway.close_position(&request))
            .await
        {
            Ok(fill) => log::info!("[UNHEDGED] {} closed order_id={}", asset, fill.order_id),
            Err(e) => log::error!("[UNHEDGED] {} close failed: {}", asset, e),
        }
    }

    pub async fn start(&self) -> Result<BotConfig, EngineError> {
        self.update_config(BotConfigPatch {
            enabled: Some(true),
            ..Default::default()
        })
        .await
    }

    pub async fn stop(&self) -> Result<BotConfig, EngineError> {
        self.update_config(BotConfigPatch {
            enabled: Some(false),
            ..Default::default()
        })
        .await
    }

    /// Applies `patch` as a whole or not at all.
    pub async fn update_config(&self, patch: BotConfigPatch) -> Result<BotConfig, EngineError> {
        let _ops = self.ops_lock.lock().await;
        let next = self.store.get_config().await?.merged(&patch);
        self.commit_config(next).await
    }

    pub async fn replace_config(&self, config: BotConfig) -> Result<BotConfig, EngineError> {
        let _ops = self.ops_lock.lock().await;
        self.commit_config(config).await
    }

    async fn commit_config(&self, next: BotConfig) -> Result<BotConfig, EngineError> {
        if let Err(e) = next.validate(&self.settings.universes) {
            log::warn!("[CONFIG] update rejected: {}", e);
            return Err(e.into());
        }
        self.store.update_config(next.clone()).await?;
        log::info!(
            "[CONFIG] enabled={} mode={} max_position={} max_spreads={} entry={} exit={}",
            next.enabled,
            next.mode.label(),
            next.max_position_usd,
            next.max_concurrent_spreads,
            next.z_entry_threshold,
            next.z_exit_threshold
        );
        self.store
            .add_log("info", "configuration updated", serde_json::to_value(&next).ok())
            .await?;
        Ok(next)
    }

    /// Starts a fresh paper account. Open spreads and history are dropped.
    pub async fn reset(&self, initial_balance: Option<Decimal>) -> Result<BotStats, EngineError> {
        let balance = initial_balance.unwrap_or(self.settings.initial_balance);
        if balance <= Decimal::ZERO {
            return Err(EngineError::ConfigValidation(format!(
                "initial balance must be positive, got {}",
                balance
            )));
        }
        let _ops = self.ops_lock.lock().await;
        let stats = BotStats::new(balance);
        self.store.reset_account(stats.clone()).await?;
        log::warn!("[RESET] account reset to {}", balance);
        self.store
            .add_log("warn", &format!("account reset to {}", balance), None)
            .await?;
        Ok(stats)
    }

    pub async fn scan(&self) -> Result<ScanReport, EngineError> {
        let config = self.store.get_config().await?;
        scanner::scan(
            self.gateway.clone(),
            self.store.as_ref(),
            &self.settings,
            &config,
            self.gateway.now(),
        )
        .await
    }

    /// Closes one spread at current prices. `Ok(None)` for an unknown or
    /// already closed id.
    pub async fn close_position(
        &self,
        spread_id: &str,
        reason: &str,
    ) -> Result<Option<TradeRecord>, EngineError> {
        let _ops = self.ops_lock.lock().await;
        self.close_by_id(spread_id, reason).await
    }

    async fn close_by_id(
        &self,
        spread_id: &str,
        reason: &str,
    ) -> Result<Option<TradeRecord>, EngineError> {
        let Some(spread) = self
            .store
            .get_open_spreads()
            .await?
            .into_iter()
            .find(|s| s.id == spread_id)
        else {
            log::info!("[EXIT] {} not open", spread_id);
            return Ok(None);
        };
        let prices = self.pair_prices(&spread.coin_a, &spread.coin_b).await?;
        self.close_spread(&spread, reason, prices, self.gateway.now())
            .await
    }

    /// Closes every open spread. Failures are logged and leave that spread
    /// open.
    pub async fn close_all(&self, reason: &str) -> Result<Vec<TradeRecord>, EngineError> {
        let _ops = self.ops_lock.lock().await;
        let mut closed = Vec::new();
        for spread in self.store.get_open_spreads().await? {
            match self.close_by_id(&spread.id, reason).await {
                Ok(Some(trade)) => closed.push(trade),
                Ok(None) => {}
                Err(e) if e.is_per_item() => {
                    let message = format!("close {}: {}", spread.pair_id, e);
                    log::error!("[EXIT] {}", message);
                    self.store.add_log("error", &message, None).await?;
                    self.events.publish(BotEvent::Error(message));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(closed)
    }

    pub async fn status(&self) -> Result<StatusSnapshot, EngineError> {
        let config = self.store.get_config().await?;
        let stats = self.store.get_stats().await?;
        let positions = self.store.get_open_spreads().await?;
        Ok(StatusSnapshot {
            updated_at: Utc::now(),
            enabled: config.enabled,
            mode: config.mode,
            equity: crate::model::equity(&stats, &positions),
            balance: stats.paper_balance,
            peak_equity: stats.peak_equity,
            open_count: positions.len(),
            positions,
            total_trades: stats.total_trades,
            win_rate: stats.win_rate(),
            total_pnl: stats.total_pnl,
        })
    }

    fn optimizer_grid(&self, config: &BotConfig) -> OptimizerGrid {
        OptimizerGrid {
            min_trades: self.settings.min_backtest_trades,
            min_win_rate: config.min_win_rate,
            annualization_factor: self.settings.annualization_factor,
            ..OptimizerGrid::default()
        }
    }

    /// Grid-searches one pair and stores the winner. `Ok(None)` when no
    /// combination produces enough trades.
    pub async fn optimize_pair(
        &self,
        coin_a: &str,
        coin_b: &str,
    ) -> Result<Option<OptimizedParams>, EngineError> {
        let now = self.gateway.now();
        let id = pair_id(coin_a, coin_b);
        let samples = self.pair_samples(coin_a, coin_b, now).await?;
        let grid = self.optimizer_grid(&self.store.get_config().await?);
        let lookback = self.settings.lookback_days;
        let outcome = match tokio::task::spawn_blocking(move || {
            optimizer::optimize(&samples, lookback, &grid)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("[OPT] {} optimizer task failed: {:?}", id, e);
                return Ok(None);
            }
        };
        let Some(outcome) = outcome else {
            log::info!("[OPT] {} no combination with enough trades", id);
            return Ok(None);
        };

        let params = optimizer::to_params(&id, &outcome, now, self.params_validity());
        log::info!(
            "[OPT] {} entry={} exit={} score={:.2} baseline={:?} improvement={:?}",
            id,
            params.z_entry,
            params.z_exit,
            params.score,
            outcome.baseline_score,
            outcome.improvement_pct
        );
        self.store.set_optimized_params(params.clone()).await?;
        Ok(Some(params))
    }

    /// Optimizes every pair of the active universe from one history fetch.
    pub async fn optimize_universe(&self) -> Result<Vec<OptimizedParams>, EngineError> {
        let config = self.store.get_config().await?;
        let now = self.gateway.now();
        let assets = self.settings.resolve_universe(&config.active_universes);
        let (histories, skipped) = scanner::fetch_histories(
            self.gateway.clone(),
            &assets,
            &self.settings.candle_interval,
            now - self.settings.history_window(),
            now,
            self.settings.call_timeout(),
        )
        .await;
        for s in &skipped {
            log::warn!("[OPT] {} skipped: {}", s.asset, s.reason);
        }

        let grid = self.optimizer_grid(&config);
        let lookback = self.settings.lookback_days;
        let outcomes = tokio::task::spawn_blocking(move || {
            let mut outcomes = Vec::new();
            for i in 0..histories.len() {
                for j in (i + 1)..histories.len() {
                    let (coin_a, candles_a) = &histories[i];
                    let (coin_b, candles_b) = &histories[j];
                    let Some(samples) = stats::ratio_series(candles_a, candles_b) else {
                        continue;
                    };
                    if let Some(outcome) = optimizer::optimize(&samples, lookback, &grid) {
                        outcomes.push((pair_id(coin_a, coin_b), outcome));
                    }
                }
            }
            outcomes
        })
        .await;
        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(e) => {
                log::error!("[OPT] universe optimizer task failed: {:?}", e);
                return Ok(Vec::new());
            }
        };

        let mut stored = Vec::with_capacity(outcomes.len());
        for (id, outcome) in outcomes {
            let params = optimizer::to_params(&id, &outcome, now, self.params_validity());
            self.store.set_optimized_params(params.clone()).await?;
            stored.push(params);
        }
        log::info!("[OPT] stored parameters for {} pairs", stored.len());
        Ok(stored)
    }

    fn params_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.settings.params_validity_days)
    }

    pub async fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>, EngineError> {
        self.store.get_trade_history(limit).await
    }

    pub async fn worker_status(&self) -> Result<Option<WorkerReport>, EngineError> {
        let stale_after = chrono::Duration::seconds(self.settings.heartbeat_stale_secs as i64);
        Ok(self.store.get_worker_status().await?.map(|heartbeat| WorkerReport {
            alive: heartbeat.is_fresh(Utc::now(), stale_after),
            heartbeat,
        }))
    }

    pub async fn record_heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<(), EngineError> {
        self.store.update_heartbeat(heartbeat).await
    }
}
