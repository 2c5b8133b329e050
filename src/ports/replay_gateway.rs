use crate::model::{Candle, LegSide};
use crate::ports::gateway::{
    ClosePositionRequest, GatewayError, MarketGateway, OrderFill, OrderRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

// One line of the price dump. Older dumps carry a full book snapshot per
// symbol; only the price is read.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DumpedPrice {
    Plain(Decimal),
    Snapshot { price: Decimal },
}

impl DumpedPrice {
    fn price(&self) -> Decimal {
        match self {
            DumpedPrice::Plain(p) => *p,
            DumpedPrice::Snapshot { price } => *price,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DumpedDataEntry {
    timestamp: i64,
    prices: HashMap<String, DumpedPrice>,
}

/// Gateway that walks a recorded JSONL price dump. The cursor only moves
/// forward through [`ReplayGateway::tick`], and nothing after it is visible.
#[derive(Debug)]
pub struct ReplayGateway {
    data: Vec<DumpedDataEntry>,
    cursor: AtomicUsize,
    reject_probability: f64,
}

impl ReplayGateway {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            GatewayError::Other(format!("failed to open replay file {}: {}", path.display(), e))
        })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, GatewayError> {
        let mut data = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| GatewayError::Other(format!("failed to read replay line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedDataEntry = serde_json::from_str(&line).map_err(|e| {
                GatewayError::Other(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }

        if data.is_empty() {
            return Err(GatewayError::Other(
                "replay dump is empty or invalid".to_string(),
            ));
        }
        data.sort_by_key(|e| e.timestamp);

        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
            reject_probability: 0.0,
        })
    }

    /// Emulates venue rejects for orders with the given probability.
    pub fn with_reject_probability(mut self, probability: f64) -> Self {
        self.reject_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Places the cursor on the given entry, clamped to the last one.
    pub fn seek(&self, index: usize) {
        let index = index.min(self.data.len() - 1);
        self.cursor.store(index, AtomicOrdering::SeqCst);
    }

    // Advances the replay by one step. Returns false once the end is reached.
    pub fn tick(&self) -> bool {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if current_cursor < self.data.len() - 1 {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn current(&self) -> &DumpedDataEntry {
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        &self.data[cursor.min(self.data.len() - 1)]
    }

    fn price_of(&self, asset: &str) -> Result<Decimal, GatewayError> {
        let entry = self.current();
        entry
            .prices
            .get(asset)
            .map(DumpedPrice::price)
            .ok_or_else(|| {
                GatewayError::UnknownAsset(format!(
                    "{} not in replay entry at {}",
                    asset, entry.timestamp
                ))
            })
    }

    fn maybe_reject(&self, asset: &str) -> Result<(), GatewayError> {
        if self.reject_probability > 0.0 && rand::random::<f64>() < self.reject_probability {
            log::warn!("[REPLAY] emulated reject for {}", asset);
            return Err(GatewayError::Rejected(format!(
                "emulated reject for {}",
                asset
            )));
        }
        Ok(())
    }

    fn fill(&self, asset: &str, side: LegSide, size: Decimal, price: Decimal) -> OrderFill {
        log::info!(
            "[REPLAY_FILL] asset={}, side={:?}, size={}, price={}",
            asset,
            side,
            size,
            price
        );
        OrderFill {
            order_id: rand::random::<u64>().to_string(),
            asset: asset.to_string(),
            side,
            size,
            price,
        }
    }
}

fn to_time(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(timestamp_ms).single()
}

/// Parses candle intervals such as `1m`, `15m`, `1h`, `4h`, `1d`.
pub fn interval_millis(interval: &str) -> Option<i64> {
    let interval = interval.trim();
    if interval.len() < 2 {
        return None;
    }
    let (count, unit) = interval.split_at(interval.len() - 1);
    let count: i64 = count.parse().ok().filter(|c: &i64| *c > 0)?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        _ => return None,
    };
    Some(count * unit_ms)
}

#[async_trait]
impl MarketGateway for ReplayGateway {
    fn now(&self) -> DateTime<Utc> {
        to_time(self.current().timestamp).unwrap_or_else(Utc::now)
    }

    async fn get_mid_price(&self, asset: &str) -> Result<Decimal, GatewayError> {
        self.price_of(asset)
    }

    async fn get_candles(
        &self,
        asset: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, GatewayError> {
        let bucket_ms = interval_millis(interval)
            .ok_or_else(|| GatewayError::Other(format!("unsupported interval '{}'", interval)))?;
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());

        // last price seen in each interval bucket
        let mut candles: Vec<(i64, Candle)> = Vec::new();
        for entry in &self.data[..=cursor.min(self.data.len() - 1)] {
            if entry.timestamp < start_ms || entry.timestamp > end_ms {
                continue;
            }
            let Some(close) = entry.prices.get(asset).and_then(|p| p.price().to_f64()) else {
                continue;
            };
            let Some(time) = to_time(entry.timestamp) else {
                continue;
            };
            let bucket = entry.timestamp.div_euclid(bucket_ms);
            match candles.last_mut() {
                Some((last, candle)) if *last == bucket => *candle = Candle::new(time, close),
                _ => candles.push((bucket, Candle::new(time, close))),
            }
        }

        if candles.is_empty() {
            return Err(GatewayError::UnknownAsset(format!(
                "no replay candles for {}",
                asset
            )));
        }
        Ok(candles.into_iter().map(|(_, c)| c).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError> {
        self.maybe_reject(&order.asset)?;
        let price = self.price_of(&order.asset).unwrap_or(order.reference_price);
        Ok(self.fill(&order.asset, order.side, order.size, price))
    }

    async fn close_position(
        &self,
        request: &ClosePositionRequest,
    ) -> Result<OrderFill, GatewayError> {
        self.maybe_reject(&request.asset)?;
        let price = self.price_of(&request.asset)?;
        Ok(self.fill(&request.asset, request.side.opposite(), request.size, price))
    }
}
