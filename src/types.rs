// src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final per-cycle trading decision after aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorical output of one indicator on one timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalLabel {
    Buy,
    Sell,
    Hold,
    Oversold,
    Overbought,
    Neutral,
    HighVolume,
    LowVolume,
}

impl fmt::Display for SignalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalLabel::Buy => "BUY",
            SignalLabel::Sell => "SELL",
            SignalLabel::Hold => "HOLD",
            SignalLabel::Oversold => "Oversold",
            SignalLabel::Overbought => "Overbought",
            SignalLabel::Neutral => "Neutral",
            SignalLabel::HighVolume => "High Volume",
            SignalLabel::LowVolume => "Low Volume",
        };
        f.write_str(s)
    }
}

/// indicator name -> timeframe -> label, rebuilt fresh every cycle.
pub type SignalSet = BTreeMap<String, BTreeMap<String, SignalLabel>>;

/// One OHLCV bar. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
    }
}

/// Ordered OHLCV bars for one symbol + timeframe, ascending by close time,
/// no duplicate close times.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    pub symbol: String,
    pub interval: String,
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// Builds a series from bars in arbitrary order: drops rows with
    /// non-finite values, sorts ascending by close time and dedupes.
    pub fn from_unordered(symbol: &str, interval: &str, mut candles: Vec<Candle>) -> Self {
        let before = candles.len();
        candles.retain(Candle::is_finite);
        if candles.len() < before {
            tracing::warn!(
                symbol,
                interval,
                dropped = before - candles.len(),
                "dropped candles with non-numeric fields"
            );
        }
        candles.sort_by_key(|c| c.close_time);
        candles.dedup_by_key(|c| c.close_time);
        Self {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            candles,
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub symbol: String,
    pub status: String,
    pub filled_price: Option<f64>,
}

/// Immutable record of a finished round trip, appended to the ledger on exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub profit_skimmed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradeSummary {
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub win_count: usize,
    pub loss_count: usize,
    pub profit_events_count: u32,
    pub profit_reserve: f64,
}

/// Base/quote holdings for the traded pair, used for the portfolio gates.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub symbol: String,
    pub base_asset: String,
    pub base_balance: f64,
    pub quote_asset: String,
    pub quote_balance: f64,
}

impl AccountSnapshot {
    /// Percentage of total portfolio value held in base and quote.
    pub fn distribution(&self, live_price: f64) -> (f64, f64) {
        let base_value = self.base_balance * live_price;
        let total = base_value + self.quote_balance;
        if total > 0.0 {
            (base_value / total * 100.0, self.quote_balance / total * 100.0)
        } else {
            (0.0, 0.0)
        }
    }
}

/// Splits a pair like LTCUSDT into base and quote assets.
pub fn parse_symbol(symbol: &str) -> (String, String) {
    for quote in ["USDT", "BUSD", "USDC"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            return (base.to_string(), quote.to_string());
        }
    }
    // Fallback: assume a three-letter base coin.
    let split = symbol.len().min(3);
    (symbol[..split].to_string(), symbol[split..].to_string())
}
