// src/lib.rs
pub mod ports {
    pub mod gateway;
    pub mod notifier;
    pub mod replay_gateway;
    pub mod secrets;
}
pub mod backtest;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod scanner;
pub mod stats;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::{BotConfig, Settings};
    use crate::model::{Candle, LegSide};
    use crate::ports::gateway::{
        ClosePositionRequest, GatewayError, MarketGateway, OrderFill, OrderRequest,
    };
    use crate::stats::test_series::t0;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub const SPIKE_PERIOD: usize = 24;
    pub const SPIKE_SERIES_LEN: usize = SPIKE_PERIOD * 8;

    /// Gateway calls a [`FakeGateway`] can be told to never answer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Stall {
        Price,
        Candles,
        Order,
    }

    /// Closes of two assets whose ratio sits near 1.0 and jumps to 1.03 on
    /// the last hour of every day, reverting the hour after. The series ends
    /// on a spike.
    pub fn spike_pair_closes() -> (Vec<f64>, Vec<f64>) {
        let b: Vec<f64> = (0..SPIKE_SERIES_LEN)
            .map(|i| 100.0 + i as f64 * 0.01)
            .collect();
        let a = b
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let ratio = if i % SPIKE_PERIOD == SPIKE_PERIOD - 1 {
                    1.03
                } else if i % 2 == 0 {
                    1.001
                } else {
                    0.999
                };
                close * ratio
            })
            .collect();
        (a, b)
    }

    /// Settings with a single `test` universe over `assets` and a two-day
    /// lookback.
    pub fn scan_settings(assets: &[&str]) -> Settings {
        let mut universes = BTreeMap::new();
        universes.insert(
            "test".to_string(),
            assets.iter().map(|s| s.to_string()).collect(),
        );
        Settings {
            lookback_days: 2.0,
            universes,
            bot: BotConfig {
                enabled: true,
                active_universes: vec!["test".to_string()],
                ..BotConfig::default()
            },
            ..Settings::default()
        }
    }

    pub struct FakeGateway {
        candles: Mutex<HashMap<String, Vec<Candle>>>,
        prices: Mutex<HashMap<String, Decimal>>,
        failing: Mutex<HashSet<String>>,
        now: Mutex<DateTime<Utc>>,
        fail_orders_for: Mutex<HashSet<String>>,
        stalled: Mutex<HashSet<(Stall, String)>>,
        pub orders: AtomicUsize,
        pub closes: AtomicUsize,
        pub fail_closes: AtomicBool,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            Self {
                candles: Mutex::new(HashMap::new()),
                prices: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                now: Mutex::new(t0() + Duration::hours(SPIKE_SERIES_LEN as i64 - 1)),
                fail_orders_for: Mutex::new(HashSet::new()),
                stalled: Mutex::new(HashSet::new()),
                orders: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_closes: AtomicBool::new(false),
            }
        }

        pub fn candles_for(&self, closes: &[f64]) -> Vec<Candle> {
            closes
                .iter()
                .enumerate()
                .map(|(i, c)| Candle::new(t0() + Duration::hours(i as i64), *c))
                .collect()
        }

        /// Hourly history for `asset`; the mid price is set to the last close.
        pub fn with_candles(self, asset: &str, closes: &[f64]) -> Self {
            let candles = self.candles_for(closes);
            if let Some(last) = closes.last().and_then(|c| Decimal::from_f64(*c)) {
                self.set_price(asset, last.round_dp(8));
            }
            self.candles.lock().unwrap().insert(asset.to_string(), candles);
            self
        }

        pub fn failing(self, asset: &str) -> Self {
            self.failing.lock().unwrap().insert(asset.to_string());
            self
        }

        pub fn fail_orders_for(&self, asset: &str) {
            self.fail_orders_for.lock().unwrap().insert(asset.to_string());
        }

        pub fn stall(&self, call: Stall, asset: &str) {
            self.stalled.lock().unwrap().insert((call, asset.to_string()));
        }

        async fn hang_if_stalled(&self, call: Stall, asset: &str) {
            let stalled = self
                .stalled
                .lock()
                .unwrap()
                .contains(&(call, asset.to_string()));
            if stalled {
                std::future::pending::<()>().await;
            }
        }

        pub fn set_price(&self, asset: &str, price: Decimal) {
            self.prices.lock().unwrap().insert(asset.to_string(), price);
        }

        pub fn remove_price(&self, asset: &str) {
            self.prices.lock().unwrap().remove(asset);
        }

        pub fn set_candles(&self, asset: &str, closes: &[f64]) {
            let candles = self.candles_for(closes);
            self.candles.lock().unwrap().insert(asset.to_string(), candles);
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }

        pub fn now_time(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        pub fn price(&self, asset: &str) -> Option<Decimal> {
            self.prices.lock().unwrap().get(asset).copied()
        }
    }

    #[async_trait]
    impl MarketGateway for FakeGateway {
        fn now(&self) -> DateTime<Utc> {
            self.now_time()
        }

        async fn get_mid_price(&self, asset: &str) -> Result<Decimal, GatewayError> {
            self.hang_if_stalled(Stall::Price, asset).await;
            if self.failing.lock().unwrap().contains(asset) {
                return Err(GatewayError::Network(format!("{} unreachable", asset)));
            }
            self.price(asset)
                .ok_or_else(|| GatewayError::UnknownAsset(asset.to_string()))
        }

        async fn get_candles(
            &self,
            asset: &str,
            _interval: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, GatewayError> {
            self.hang_if_stalled(Stall::Candles, asset).await;
            if self.failing.lock().unwrap().contains(asset) {
                return Err(GatewayError::Network(format!("{} unreachable", asset)));
            }
            self.candles
                .lock()
                .unwrap()
                .get(asset)
                .cloned()
                .ok_or_else(|| GatewayError::UnknownAsset(asset.to_string()))
        }

        async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError> {
            self.hang_if_stalled(Stall::Order, &order.asset).await;
            if self.fail_orders_for.lock().unwrap().contains(&order.asset) {
                return Err(GatewayError::Rejected(format!("{} order rejected", order.asset)));
            }
            let n = self.orders.fetch_add(1, Ordering::SeqCst);
            Ok(OrderFill {
                order_id: format!("o-{}", n),
                asset: order.asset.clone(),
                side: order.side,
                size: order.size,
                price: self.price(&order.asset).unwrap_or(order.reference_price),
            })
        }

        async fn close_position(
            &self,
            request: &ClosePositionRequest,
        ) -> Result<OrderFill, GatewayError> {
            if self.fail_closes.load(Ordering::SeqCst) {
                return Err(GatewayError::Network("venue down".to_string()));
            }
            let n = self.closes.fetch_add(1, Ordering::SeqCst);
            let price = self
                .price(&request.asset)
                .ok_or_else(|| GatewayError::UnknownAsset(request.asset.clone()))?;
            Ok(OrderFill {
                order_id: format!("c-{}", n),
                asset: request.asset.clone(),
                side: match request.side {
                    LegSide::Long => LegSide::Short,
                    LegSide::Short => LegSide::Long,
                },
                size: request.size,
                price,
            })
        }
    }
}
