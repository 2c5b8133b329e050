use crate::model::{Candle, LegSide};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    Network(String),
    Rejected(String),
    UnknownAsset(String),
    Timeout(String),
    Other(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Network(e) => write!(f, "network: {}", e),
            GatewayError::Rejected(e) => write!(f, "order rejected: {}", e),
            GatewayError::UnknownAsset(e) => write!(f, "unknown asset: {}", e),
            GatewayError::Timeout(e) => write!(f, "timed out: {}", e),
            GatewayError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl Error for GatewayError {}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub asset: String,
    pub side: LegSide,
    pub size: Decimal,
    pub reference_price: Decimal,
}

/// Flattens an existing leg. `side` is the side of the leg being closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosePositionRequest {
    pub asset: String,
    pub side: LegSide,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub asset: String,
    pub side: LegSide,
    pub size: Decimal,
    pub price: Decimal,
}

/// Market data and order execution against a venue.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Venue clock. Replayed venues report the time of the current record.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn get_mid_price(&self, asset: &str) -> Result<Decimal, GatewayError>;

    /// Prices for every asset that could be fetched. Venues with a batch
    /// endpoint override this; the default asks one asset at a time.
    async fn get_mid_prices(
        &self,
        assets: &[String],
    ) -> Result<HashMap<String, Decimal>, GatewayError> {
        let mut prices = HashMap::new();
        for asset in assets {
            match self.get_mid_price(asset).await {
                Ok(price) => {
                    prices.insert(asset.clone(), price);
                }
                Err(e) => log::warn!("[PRICE] {} unavailable: {}", asset, e),
            }
        }
        Ok(prices)
    }

    /// Ordered candles in `[start, end]`.
    async fn get_candles(
        &self,
        asset: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError>;

    async fn close_position(&self, request: &ClosePositionRequest)
        -> Result<OrderFill, GatewayError>;
}
