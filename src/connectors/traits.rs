use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::BotError;
use crate::types::{CandleSeries, OrderResponse, Side};

/// Read-only market data for the configured symbol.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Closed bars for one timeframe covering the trailing `days` days,
    /// ascending and deduplicated.
    async fn fetch_candles(&self, interval: &str, days: u32) -> Result<CandleSeries, BotError>;

    async fn fetch_live_price(&self) -> Result<f64, BotError>;

    /// High/low of the most recent bar on `interval`, which may still be
    /// forming.
    async fn fetch_current_high_low(&self, interval: &str) -> Result<(f64, f64), BotError>;
}

/// Order placement and account queries. The live exchange client and the
/// paper trader both sit behind this.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn get_balance(&self, asset: &str) -> Result<f64, BotError>;

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse, BotError>;
}
