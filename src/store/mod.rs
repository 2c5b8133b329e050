//! Persistent bot state.
//!
//! Every method is one atomic unit: readers never see a state in which only
//! part of a multi-record step has been applied.

mod state_store;

pub use state_store::{JsonFileStore, JsonSnapshot, MemoryStore, NoPersist, Persist, StateStore};

use crate::config::BotConfig;
use crate::error::EngineError;
use crate::model::{
    BotStats, LogEntry, OptimizedParams, Spread, TradeRecord, WorkerHeartbeat,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

/// Log rows kept in the store; older rows are dropped first.
pub const MAX_LOG_ENTRIES: usize = 500;
/// Closed trades kept in the store. Aggregates live in [`BotStats`], so
/// dropping the oldest rows loses no totals.
pub const MAX_TRADE_HISTORY: usize = 1000;

pub type StoreResult<T> = Result<T, EngineError>;

#[async_trait]
pub trait BotStore: Send + Sync {
    async fn get_config(&self) -> StoreResult<BotConfig>;
    async fn update_config(&self, config: BotConfig) -> StoreResult<()>;

    async fn get_stats(&self) -> StoreResult<BotStats>;
    async fn update_stats(&self, stats: BotStats) -> StoreResult<()>;

    async fn get_open_spreads(&self) -> StoreResult<Vec<Spread>>;
    /// Returns false when a spread on the same pair is already open.
    async fn add_open_spread(&self, spread: Spread) -> StoreResult<bool>;
    /// Returns false when no open spread has `id`.
    async fn update_spread_pnl(&self, id: &str, pnl: Decimal, ratio: f64) -> StoreResult<bool>;
    async fn remove_open_spread(&self, id: &str) -> StoreResult<Option<Spread>>;

    async fn add_trade_history(&self, trade: TradeRecord) -> StoreResult<()>;
    /// Most recent first.
    async fn get_trade_history(&self, limit: usize) -> StoreResult<Vec<TradeRecord>>;

    async fn add_log(
        &self,
        level: &str,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> StoreResult<()>;
    /// Most recent first.
    async fn get_logs(&self, limit: usize) -> StoreResult<Vec<LogEntry>>;

    /// Unexpired parameters for `pair_id` at `now`.
    async fn get_optimized_params(
        &self,
        pair_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OptimizedParams>>;
    async fn set_optimized_params(&self, params: OptimizedParams) -> StoreResult<()>;
    async fn clean_expired_params(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn get_worker_status(&self) -> StoreResult<Option<WorkerHeartbeat>>;
    async fn update_heartbeat(&self, heartbeat: WorkerHeartbeat) -> StoreResult<()>;

    /// Adds the spread and debits `debit` from the balance. Returns false,
    /// changing nothing, when the pair is already open.
    async fn commit_open(&self, spread: Spread, debit: Decimal) -> StoreResult<bool>;
    /// Removes the spread, appends `trade` and books the result. Returns
    /// `None`, changing nothing, when the spread is no longer open.
    async fn commit_close(&self, spread_id: &str, trade: TradeRecord)
        -> StoreResult<Option<BotStats>>;
    /// Raises the peak to the current equity if it is higher and returns
    /// the equity.
    async fn refresh_peak_equity(&self) -> StoreResult<Decimal>;
    /// Replaces the stats and clears open spreads and trade history.
    async fn reset_account(&self, stats: BotStats) -> StoreResult<()>;
}

/// Everything a store holds, persisted as one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub config: BotConfig,
    pub stats: BotStats,
    #[serde(default)]
    pub open_spreads: Vec<Spread>,
    #[serde(default)]
    pub trade_history: Vec<TradeRecord>,
    #[serde(default)]
    pub logs: VecDeque<LogEntry>,
    #[serde(default)]
    pub optimized_params: BTreeMap<String, OptimizedParams>,
    #[serde(default)]
    pub worker: Option<WorkerHeartbeat>,
}

impl StoreState {
    pub fn new(config: BotConfig, initial_balance: Decimal) -> Self {
        Self {
            config,
            stats: BotStats::new(initial_balance),
            open_spreads: Vec::new(),
            trade_history: Vec::new(),
            logs: VecDeque::new(),
            optimized_params: BTreeMap::new(),
            worker: None,
        }
    }

    pub fn equity(&self) -> Decimal {
        crate::model::equity(&self.stats, &self.open_spreads)
    }

    fn has_pair(&self, pair_id: &str) -> bool {
        self.open_spreads.iter().any(|s| s.pair_id == pair_id)
    }

    fn push_trade(&mut self, trade: TradeRecord) {
        self.trade_history.push(trade);
        if self.trade_history.len() > MAX_TRADE_HISTORY {
            let excess = self.trade_history.len() - MAX_TRADE_HISTORY;
            self.trade_history.drain(..excess);
        }
    }

    fn push_log(&mut self, entry: LogEntry) {
        self.logs.push_back(entry);
        while self.logs.len() > MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
    }
}

/// Serializes `value` compactly next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}
