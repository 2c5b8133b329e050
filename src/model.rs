use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub close: f64,
}

impl Candle {
    pub fn new(time: DateTime<Utc>, close: f64) -> Self {
        Self { time, close }
    }
}

pub fn pair_id(coin_a: &str, coin_b: &str) -> String {
    format!("{}/{}", coin_a, coin_b)
}

/// Direction of a spread trade on the ratio `A/B`.
///
/// `Long` buys A and sells B (ratio expected to rise), `Short` the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpreadSignal {
    Long,
    Short,
}

impl SpreadSignal {
    /// Ratio above its mean is shorted, below is bought.
    pub fn from_z(z: f64) -> Option<Self> {
        if z > 0.0 {
            Some(SpreadSignal::Short)
        } else if z < 0.0 {
            Some(SpreadSignal::Long)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SpreadSignal::Long => "LONG",
            SpreadSignal::Short => "SHORT",
        }
    }

    pub fn leg_sides(self) -> (LegSide, LegSide) {
        match self {
            SpreadSignal::Long => (LegSide::Long, LegSide::Short),
            SpreadSignal::Short => (LegSide::Short, LegSide::Long),
        }
    }
}

impl fmt::Display for SpreadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegSide {
    Long,
    Short,
}

impl LegSide {
    pub fn opposite(self) -> Self {
        match self {
            LegSide::Long => LegSide::Short,
            LegSide::Short => LegSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn label(self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }
}

impl FromStr for TradingMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "dry" => Ok(TradingMode::Paper),
            "live" | "real" => Ok(TradingMode::Live),
            other => Err(format!("unknown trading mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub side: LegSide,
    pub entry_price: Decimal,
    pub size: Decimal,
}

impl Leg {
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            LegSide::Long => (price - self.entry_price) * self.size,
            LegSide::Short => (self.entry_price - price) * self.size,
        }
    }
}

/// An open two-leg position on one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub id: String,
    pub pair_id: String,
    pub coin_a: String,
    pub coin_b: String,
    pub signal: SpreadSignal,
    pub size_usd: Decimal,
    pub leg_a: Leg,
    pub leg_b: Leg,
    pub entry_ratio: f64,
    pub entry_z_score: f64,
    pub z_exit_threshold: f64,
    pub entry_time: DateTime<Utc>,
    pub current_pnl: Decimal,
    pub current_ratio: f64,
    pub mode: TradingMode,
}

impl Spread {
    pub fn pnl_at(&self, price_a: Decimal, price_b: Decimal) -> Decimal {
        self.leg_a.pnl_at(price_a) + self.leg_b.pnl_at(price_b)
    }

    /// Re-marks the position at the given leg prices. Returns false when the
    /// prices cannot produce a ratio.
    pub fn mark(&mut self, price_a: Decimal, price_b: Decimal) -> bool {
        let Some(ratio) = price_ratio(price_a, price_b) else {
            return false;
        };
        self.current_pnl = self.pnl_at(price_a, price_b);
        self.current_ratio = ratio;
        true
    }

    pub fn pnl_percent(&self) -> f64 {
        if self.size_usd.is_zero() {
            return 0.0;
        }
        (self.current_pnl / self.size_usd * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    }

    pub fn holding_time(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.entry_time)
    }
}

pub fn price_ratio(price_a: Decimal, price_b: Decimal) -> Option<f64> {
    if price_a <= Decimal::ZERO || price_b <= Decimal::ZERO {
        return None;
    }
    (price_a / price_b).to_f64().filter(|r| r.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    MeanReversion,
    TakeProfit,
    MaxHoldingTime,
}

impl ExitReason {
    pub fn label(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop loss",
            ExitReason::MeanReversion => "mean reversion",
            ExitReason::TakeProfit => "take profit",
            ExitReason::MaxHoldingTime => "max holding time",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Closed snapshot of a spread. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position: Spread,
    pub exit_price_a: Decimal,
    pub exit_price_b: Decimal,
    pub exit_ratio: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: String,
    pub final_pnl: Decimal,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.final_pnl > Decimal::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotStats {
    pub paper_balance: Decimal,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_pnl: Decimal,
    pub peak_equity: Decimal,
}

impl BotStats {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            paper_balance: initial_balance,
            total_trades: 0,
            winning_trades: 0,
            total_pnl: Decimal::ZERO,
            peak_equity: initial_balance,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.total_trades as f64
    }

    /// Reserves capital and pays the opening fee.
    pub fn record_open(&mut self, debit: Decimal) {
        self.paper_balance -= debit;
    }

    pub fn record_close(&mut self, size_usd: Decimal, final_pnl: Decimal) {
        self.paper_balance += size_usd + final_pnl;
        self.total_trades += 1;
        if final_pnl > Decimal::ZERO {
            self.winning_trades += 1;
        }
        self.total_pnl += final_pnl;
    }

    /// Raises the peak when `equity` exceeds it; the peak never moves down.
    pub fn observe_equity(&mut self, equity: Decimal) -> bool {
        if equity > self.peak_equity {
            self.peak_equity = equity;
            true
        } else {
            false
        }
    }
}

/// Account equity: free balance plus the capital and open PnL of every spread.
pub fn equity(stats: &BotStats, open: &[Spread]) -> Decimal {
    open.iter().fold(stats.paper_balance, |acc, s| {
        acc + s.size_usd + s.current_pnl
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedParams {
    pub pair_id: String,
    pub z_entry: f64,
    pub z_exit: f64,
    pub win_rate: f64,
    pub avg_return: f64,
    pub score: f64,
    pub optimized_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OptimizedParams {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Advisory liveness record; nothing uses it for exclusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub cycles_count: u64,
    pub status: WorkerStatus,
}

impl WorkerHeartbeat {
    pub fn new(pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            started_at: now,
            last_heartbeat: now,
            cycles_count: 0,
            status: WorkerStatus::Starting,
        }
    }

    pub fn beat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.cycles_count += 1;
        self.status = WorkerStatus::Running;
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == WorkerStatus::Running
            && now.signed_duration_since(self.last_heartbeat) <= stale_after
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spread(signal: SpreadSignal) -> Spread {
        let (side_a, side_b) = signal.leg_sides();
        Spread {
            id: "AAA/BBB-1".to_string(),
            pair_id: pair_id("AAA", "BBB"),
            coin_a: "AAA".to_string(),
            coin_b: "BBB".to_string(),
            signal,
            size_usd: dec!(1000),
            leg_a: Leg {
                side: side_a,
                entry_price: dec!(100),
                size: dec!(5),
            },
            leg_b: Leg {
                side: side_b,
                entry_price: dec!(50),
                size: dec!(10),
            },
            entry_ratio: 2.0,
            entry_z_score: 2.1,
            z_exit_threshold: 0.5,
            entry_time: Utc::now(),
            current_pnl: Decimal::ZERO,
            current_ratio: 2.0,
            mode: TradingMode::Paper,
        }
    }

    #[test]
    fn short_spread_profits_when_ratio_falls() {
        let mut s = spread(SpreadSignal::Short);
        assert!(s.mark(dec!(90), dec!(50)));
        // short A: (100-90)*5 = 50, long B flat
        assert_eq!(s.current_pnl, dec!(50));
        assert!((s.current_ratio - 1.8).abs() < 1e-12);
        assert!((s.pnl_percent() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn long_spread_loses_when_ratio_falls() {
        let mut s = spread(SpreadSignal::Long);
        assert!(s.mark(dec!(100), dec!(55)));
        // long A flat, short B: (50-55)*10 = -50
        assert_eq!(s.current_pnl, dec!(-50));
    }

    #[test]
    fn mark_rejects_non_positive_price() {
        let mut s = spread(SpreadSignal::Long);
        assert!(!s.mark(dec!(100), Decimal::ZERO));
        assert_eq!(s.current_pnl, Decimal::ZERO);
    }

    #[test]
    fn signal_follows_z_sign() {
        assert_eq!(SpreadSignal::from_z(2.0), Some(SpreadSignal::Short));
        assert_eq!(SpreadSignal::from_z(-2.0), Some(SpreadSignal::Long));
        assert_eq!(SpreadSignal::from_z(0.0), None);
    }

    #[test]
    fn stats_close_accounting_and_peak() {
        let mut stats = BotStats::new(dec!(10000));
        stats.record_open(dec!(1001));
        assert_eq!(stats.paper_balance, dec!(8999));
        stats.record_close(dec!(1000), dec!(25));
        assert_eq!(stats.paper_balance, dec!(10024));
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winning_trades, 1);
        assert!(stats.observe_equity(dec!(10024)));
        assert!(!stats.observe_equity(dec!(9000)));
        assert_eq!(stats.peak_equity, dec!(10024));
    }

    #[test]
    fn equity_counts_reserved_capital_and_open_pnl() {
        let mut stats = BotStats::new(dec!(10000));
        stats.record_open(dec!(1001));
        let mut s = spread(SpreadSignal::Short);
        s.current_pnl = dec!(12);
        assert_eq!(equity(&stats, &[s]), dec!(10011));
    }
}
