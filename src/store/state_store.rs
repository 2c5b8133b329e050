use super::{write_json_atomic, BotStore, StoreResult, StoreState};
use crate::config::BotConfig;
use crate::error::EngineError;
use crate::model::{
    BotStats, LogEntry, OptimizedParams, Spread, TradeRecord, WorkerHeartbeat,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Durability policy for a [`StateStore`]. Called with the candidate state
/// before it becomes visible; an error discards the candidate.
pub trait Persist: Send + Sync {
    fn persist(&self, state: &StoreState) -> StoreResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersist;

impl Persist for NoPersist {
    fn persist(&self, _state: &StoreState) -> StoreResult<()> {
        Ok(())
    }
}

/// Whole-state JSON snapshot, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct JsonSnapshot {
    path: PathBuf,
}

impl Persist for JsonSnapshot {
    fn persist(&self, state: &StoreState) -> StoreResult<()> {
        write_json_atomic(&self.path, state).map_err(|e| {
            EngineError::persistence(format!("write {}: {}", self.path.display(), e))
        })
    }
}

/// In-process state guarded by one lock. Writes apply to a copy, persist it,
/// and only then swap it in.
pub struct StateStore<P> {
    state: Mutex<StoreState>,
    persist: P,
}

pub type MemoryStore = StateStore<NoPersist>;
pub type JsonFileStore = StateStore<JsonSnapshot>;

impl MemoryStore {
    pub fn new(config: BotConfig, initial_balance: Decimal) -> Self {
        Self::with_state(StoreState::new(config, initial_balance))
    }

    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
            persist: NoPersist,
        }
    }
}

impl JsonFileStore {
    /// Loads the snapshot at `path`, or creates it from `initial` when the
    /// file does not exist yet.
    pub fn open<Q: AsRef<Path>>(path: Q, initial: StoreState) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let persist = JsonSnapshot { path: path.clone() };
        let state = if path.exists() {
            let raw = std::fs::read(&path)?;
            let state: StoreState = serde_json::from_slice(&raw)?;
            log::info!(
                "[STORE] loaded {} ({} open, {} closed)",
                path.display(),
                state.open_spreads.len(),
                state.trade_history.len()
            );
            state
        } else {
            persist.persist(&initial)?;
            log::info!("[STORE] created {}", path.display());
            initial
        };
        Ok(Self {
            state: Mutex::new(state),
            persist,
        })
    }

    pub fn path(&self) -> &Path {
        &self.persist.path
    }
}

impl<P: Persist> StateStore<P> {
    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::persistence("state lock poisoned"))
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> StoreResult<T> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> StoreResult<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let out = f(&mut next);
        if next != *guard {
            self.persist.persist(&next)?;
            *guard = next;
        }
        Ok(out)
    }

    pub fn snapshot(&self) -> StoreResult<StoreState> {
        self.read(|s| s.clone())
    }
}

#[async_trait]
impl<P: Persist> BotStore for StateStore<P> {
    async fn get_config(&self) -> StoreResult<BotConfig> {
        self.read(|s| s.config.clone())
    }

    async fn update_config(&self, config: BotConfig) -> StoreResult<()> {
        self.write(|s| s.config = config)
    }

    async fn get_stats(&self) -> StoreResult<BotStats> {
        self.read(|s| s.stats.clone())
    }

    async fn update_stats(&self, stats: BotStats) -> StoreResult<()> {
        self.write(|s| s.stats = stats)
    }

    async fn get_open_spreads(&self) -> StoreResult<Vec<Spread>> {
        self.read(|s| s.open_spreads.clone())
    }

    async fn add_open_spread(&self, spread: Spread) -> StoreResult<bool> {
        self.write(|s| {
            if s.has_pair(&spread.pair_id) {
                return false;
            }
            s.open_spreads.push(spread);
            true
        })
    }

    async fn update_spread_pnl(&self, id: &str, pnl: Decimal, ratio: f64) -> StoreResult<bool> {
        self.write(|s| match s.open_spreads.iter_mut().find(|sp| sp.id == id) {
            Some(spread) => {
                spread.current_pnl = pnl;
                spread.current_ratio = ratio;
                true
            }
            None => false,
        })
    }

    async fn remove_open_spread(&self, id: &str) -> StoreResult<Option<Spread>> {
        self.write(|s| {
            let idx = s.open_spreads.iter().position(|sp| sp.id == id)?;
            Some(s.open_spreads.remove(idx))
        })
    }

    async fn add_trade_history(&self, trade: TradeRecord) -> StoreResult<()> {
        self.write(|s| s.push_trade(trade))
    }

    async fn get_trade_history(&self, limit: usize) -> StoreResult<Vec<TradeRecord>> {
        self.read(|s| s.trade_history.iter().rev().take(limit).cloned().collect())
    }

    async fn add_log(
        &self,
        level: &str,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        let entry = LogEntry {
            time: Utc::now(),
            level: level.to_string(),
            message: message.to_string(),
            data,
        };
        self.write(|s| s.push_log(entry))
    }

    async fn get_logs(&self, limit: usize) -> StoreResult<Vec<LogEntry>> {
        self.read(|s| s.logs.iter().rev().take(limit).cloned().collect())
    }

    async fn get_optimized_params(
        &self,
        pair_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OptimizedParams>> {
        self.read(|s| {
            s.optimized_params
                .get(pair_id)
                .filter(|p| p.is_valid_at(now))
                .cloned()
        })
    }

    async fn set_optimized_params(&self, params: OptimizedParams) -> StoreResult<()> {
        self.write(|s| {
            s.optimized_params.insert(params.pair_id.clone(), params);
        })
    }

    async fn clean_expired_params(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.write(|s| {
            let before = s.optimized_params.len();
            s.optimized_params.retain(|_, p| p.is_valid_at(now));
            before - s.optimized_params.len()
        })
    }

    async fn get_worker_status(&self) -> StoreResult<Option<WorkerHeartbeat>> {
        self.read(|s| s.worker.clone())
    }

    async fn update_heartbeat(&self, heartbeat: WorkerHeartbeat) -> StoreResult<()> {
        self.write(|s| s.worker = Some(heartbeat))
    }

    async fn commit_open(&self, spread: Spread, debit: Decimal) -> StoreResult<bool> {
        self.write(|s| {
            if s.has_pair(&spread.pair_id) {
                return false;
            }
            s.stats.record_open(debit);
            s.open_spreads.push(spread);
            let equity = s.equity();
            s.stats.observe_equity(equity);
            true
        })
    }

    async fn commit_close(
        &self,
        spread_id: &str,
        trade: TradeRecord,
    ) -> StoreResult<Option<BotStats>> {
        self.write(|s| {
            let idx = s.open_spreads.iter().position(|sp| sp.id == spread_id)?;
            let spread = s.open_spreads.remove(idx);
            s.stats.record_close(spread.size_usd, trade.final_pnl);
            s.push_trade(trade);
            let equity = s.equity();
            s.stats.observe_equity(equity);
            Some(s.stats.clone())
        })
    }

    async fn refresh_peak_equity(&self) -> StoreResult<Decimal> {
        self.write(|s| {
            let equity = s.equity();
            s.stats.observe_equity(equity);
            equity
        })
    }

    async fn reset_account(&self, stats: BotStats) -> StoreResult<()> {
        self.write(|s| {
            s.stats = stats;
            s.open_spreads.clear();
            s.trade_history.clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Leg, LegSide, SpreadSignal, TradingMode};
    use crate::stats::test_series::t0;
    use crate::store::{MAX_LOG_ENTRIES, MAX_TRADE_HISTORY};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn spread(id: &str, pair: &str) -> Spread {
        let (a, b) = pair.split_once('/').unwrap();
        Spread {
            id: id.to_string(),
            pair_id: pair.to_string(),
            coin_a: a.to_string(),
            coin_b: b.to_string(),
            signal: SpreadSignal::Short,
            size_usd: dec!(1000),
            leg_a: Leg {
                side: LegSide::Short,
                entry_price: dec!(100),
                size: dec!(5),
            },
            leg_b: Leg {
                side: LegSide::Long,
                entry_price: dec!(50),
                size: dec!(10),
            },
            entry_ratio: 2.0,
            entry_z_score: 2.4,
            z_exit_threshold: 0.5,
            entry_time: t0(),
            current_pnl: Decimal::ZERO,
            current_ratio: 2.0,
            mode: TradingMode::Paper,
        }
    }

    fn trade(position: Spread, final_pnl: Decimal) -> TradeRecord {
        TradeRecord {
            position,
            exit_price_a: dec!(95),
            exit_price_b: dec!(50),
            exit_ratio: 1.9,
            exit_time: t0() + Duration::hours(3),
            exit_reason: "mean reversion".to_string(),
            final_pnl,
        }
    }

    fn params(pair: &str, expires_in: Duration) -> OptimizedParams {
        OptimizedParams {
            pair_id: pair.to_string(),
            z_entry: 2.25,
            z_exit: 0.25,
            win_rate: 0.7,
            avg_return: 0.02,
            score: 50.0,
            optimized_at: t0(),
            expires_at: t0() + expires_in,
        }
    }

    struct FailingPersist;

    impl Persist for FailingPersist {
        fn persist(&self, _state: &StoreState) -> StoreResult<()> {
            Err(EngineError::persistence("disk full"))
        }
    }

    #[tokio::test]
    async fn open_rejects_duplicate_pair() {
        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        assert!(store.commit_open(spread("1", "BTC/ETH"), dec!(1001)).await.unwrap());
        assert!(!store.commit_open(spread("2", "BTC/ETH"), dec!(1001)).await.unwrap());
        assert!(!store.add_open_spread(spread("3", "BTC/ETH")).await.unwrap());
        assert_eq!(store.get_open_spreads().await.unwrap().len(), 1);
        assert_eq!(store.get_stats().await.unwrap().paper_balance, dec!(8999));
    }

    #[tokio::test]
    async fn close_is_atomic_and_idempotent() {
        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        let s = spread("1", "BTC/ETH");
        store.commit_open(s.clone(), dec!(1001)).await.unwrap();

        let stats = store
            .commit_close("1", trade(s.clone(), dec!(24)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.paper_balance, dec!(10023));
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.peak_equity, dec!(10023));

        assert!(store.commit_close("1", trade(s, dec!(24))).await.unwrap().is_none());
        assert_eq!(store.get_stats().await.unwrap(), stats);
        assert_eq!(store.get_trade_history(10).await.unwrap().len(), 1);
        assert!(store.get_open_spreads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn peak_only_moves_up() {
        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        store.commit_open(spread("1", "BTC/ETH"), dec!(1000)).await.unwrap();
        store.update_spread_pnl("1", dec!(50), 1.95).await.unwrap();
        assert_eq!(store.refresh_peak_equity().await.unwrap(), dec!(10050));
        store.update_spread_pnl("1", dec!(-80), 2.1).await.unwrap();
        assert_eq!(store.refresh_peak_equity().await.unwrap(), dec!(9920));
        assert_eq!(store.get_stats().await.unwrap().peak_equity, dec!(10050));
    }

    #[tokio::test]
    async fn history_and_logs_newest_first() {
        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        for i in 0..3 {
            let s = spread(&i.to_string(), "BTC/ETH");
            store.add_trade_history(trade(s, Decimal::from(i))).await.unwrap();
        }
        let history = store.get_trade_history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].final_pnl, dec!(2));

        for i in 0..(MAX_LOG_ENTRIES + 5) {
            store.add_log("info", &format!("row {}", i), None).await.unwrap();
        }
        let logs = store.get_logs(usize::MAX).await.unwrap();
        assert_eq!(logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(logs[0].message, format!("row {}", MAX_LOG_ENTRIES + 4));
    }

    #[tokio::test]
    async fn history_keeps_newest_rows_up_to_cap() {
        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        for i in 0..(MAX_TRADE_HISTORY + 3) {
            let s = spread(&i.to_string(), "BTC/ETH");
            store.add_trade_history(trade(s, Decimal::from(i))).await.unwrap();
        }
        let s = spread("last", "SOL/BNB");
        store.commit_open(s.clone(), dec!(1001)).await.unwrap();
        store.commit_close("last", trade(s, dec!(-7))).await.unwrap();

        let history = store.get_trade_history(usize::MAX).await.unwrap();
        assert_eq!(history.len(), MAX_TRADE_HISTORY);
        assert_eq!(history[0].position.id, "last");
        assert_eq!(history[MAX_TRADE_HISTORY - 1].final_pnl, Decimal::from(4));
        assert_eq!(store.get_stats().await.unwrap().total_trades, 1);
    }

    #[tokio::test]
    async fn equity_tracks_balance_plus_open_exposure() {
        fn booked(state: &StoreState) -> Decimal {
            state.stats.paper_balance
                + state
                    .open_spreads
                    .iter()
                    .map(|s| s.size_usd + s.current_pnl)
                    .sum::<Decimal>()
        }

        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        let a = spread("1", "BTC/ETH");
        let b = spread("2", "SOL/BNB");

        store.commit_open(a.clone(), dec!(1001)).await.unwrap();
        store.commit_open(b, dec!(1001)).await.unwrap();
        let state = store.snapshot().unwrap();
        assert_eq!(state.stats.paper_balance, dec!(7998));
        assert_eq!(state.equity(), dec!(9998));
        assert_eq!(state.equity(), booked(&state));

        store.update_spread_pnl("1", dec!(40), 1.9).await.unwrap();
        store.update_spread_pnl("2", dec!(-15), 2.05).await.unwrap();
        assert_eq!(store.refresh_peak_equity().await.unwrap(), dec!(10023));
        let state = store.snapshot().unwrap();
        assert_eq!(state.equity(), booked(&state));
        assert_eq!(state.stats.peak_equity, dec!(10023));

        // close books size plus the realized result, which already carries
        // the exit fee
        store.commit_close("1", trade(a, dec!(38))).await.unwrap();
        let state = store.snapshot().unwrap();
        assert_eq!(state.stats.paper_balance, dec!(9036));
        assert_eq!(state.equity(), dec!(10021));
        assert_eq!(state.equity(), booked(&state));
        assert_eq!(state.stats.peak_equity, dec!(10023));
    }

    #[tokio::test]
    async fn expired_params_are_hidden_and_cleaned() {
        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        store.set_optimized_params(params("BTC/ETH", Duration::days(7))).await.unwrap();
        store.set_optimized_params(params("SOL/BNB", Duration::hours(1))).await.unwrap();

        let later = t0() + Duration::hours(2);
        assert!(store.get_optimized_params("SOL/BNB", later).await.unwrap().is_none());
        assert!(store.get_optimized_params("BTC/ETH", later).await.unwrap().is_some());
        assert_eq!(store.clean_expired_params(later).await.unwrap(), 1);
        assert_eq!(store.clean_expired_params(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_clears_positions_and_history() {
        let store = MemoryStore::new(BotConfig::default(), dec!(10000));
        let s = spread("1", "BTC/ETH");
        store.commit_open(s.clone(), dec!(1000)).await.unwrap();
        store.add_trade_history(trade(s, dec!(1))).await.unwrap();
        store.reset_account(BotStats::new(dec!(5000))).await.unwrap();
        assert!(store.get_open_spreads().await.unwrap().is_empty());
        assert!(store.get_trade_history(10).await.unwrap().is_empty());
        assert_eq!(store.get_stats().await.unwrap().peak_equity, dec!(5000));
    }

    #[tokio::test]
    async fn failed_persist_leaves_state_untouched() {
        let store = StateStore {
            state: Mutex::new(StoreState::new(BotConfig::default(), dec!(10000))),
            persist: FailingPersist,
        };
        let err = store.commit_open(spread("1", "BTC/ETH"), dec!(1000)).await;
        assert!(matches!(err, Err(EngineError::Persistence(_))));
        assert!(store.get_open_spreads().await.unwrap().is_empty());
        assert_eq!(store.get_stats().await.unwrap().paper_balance, dec!(10000));
    }

    #[tokio::test]
    async fn json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("bot.json");
        let initial = StoreState::new(BotConfig::default(), dec!(10000));

        let store = JsonFileStore::open(&path, initial.clone()).unwrap();
        store.commit_open(spread("1", "BTC/ETH"), dec!(1001)).await.unwrap();
        let mut cfg = BotConfig::default();
        cfg.enabled = true;
        store.update_config(cfg.clone()).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path, initial).unwrap();
        assert_eq!(reopened.get_config().await.unwrap(), cfg);
        assert_eq!(reopened.get_open_spreads().await.unwrap()[0].pair_id, "BTC/ETH");
        assert_eq!(
            reopened.get_stats().await.unwrap().paper_balance,
            dec!(8999)
        );
        assert!(!path.with_extension("json.tmp").exists());
        assert!(!std::fs::read_to_string(&path).unwrap().contains('\n'));
    }
}
