// src/connectors/paper.rs
//
// Simulated execution: every order fills instantly at the requested
// price. Balances live in memory and move exactly like the exchange
// would move them, minus fees which the position ledger accounts for.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::connectors::traits::ExecutionHandler;
use crate::error::BotError;
use crate::types::{parse_symbol, OrderResponse, Side};

pub struct PaperTrader {
    balances: Mutex<HashMap<String, f64>>,
}

impl PaperTrader {
    pub fn new(quote_asset: &str, quote_balance: f64) -> Self {
        let mut balances = HashMap::new();
        balances.insert(quote_asset.to_string(), quote_balance);
        Self {
            balances: Mutex::new(balances),
        }
    }
}

#[async_trait]
impl ExecutionHandler for PaperTrader {
    async fn get_balance(&self, asset: &str) -> Result<f64, BotError> {
        let balances = self.balances.lock().expect("balances lock");
        Ok(balances.get(asset).copied().unwrap_or(0.0))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse, BotError> {
        let price = price
            .and_then(|p| p.to_f64())
            .ok_or_else(|| BotError::Gateway("paper orders require a price".into()))?;
        let quantity = quantity
            .to_f64()
            .filter(|q| *q > 0.0)
            .ok_or_else(|| BotError::Gateway("paper order quantity must be positive".into()))?;

        let (base, quote) = parse_symbol(symbol);
        let notional = quantity * price;

        let mut balances = self.balances.lock().expect("balances lock");
        match side {
            Side::Buy => {
                let quote_balance = balances.entry(quote).or_insert(0.0);
                if *quote_balance < notional {
                    return Err(BotError::Gateway(format!(
                        "insufficient {} for paper buy: have {:.2}, need {:.2}",
                        symbol, quote_balance, notional
                    )));
                }
                *quote_balance -= notional;
                *balances.entry(base).or_insert(0.0) += quantity;
            }
            Side::Sell => {
                let base_balance = balances.entry(base).or_insert(0.0);
                if *base_balance < quantity {
                    return Err(BotError::Gateway(format!(
                        "insufficient {} for paper sell: have {}, need {}",
                        symbol, base_balance, quantity
                    )));
                }
                *base_balance -= quantity;
                *balances.entry(quote).or_insert(0.0) += notional;
            }
        }

        info!(%symbol, %side, quantity, price, "paper fill");

        Ok(OrderResponse {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            status: "FILLED".to_string(),
            filled_price: Some(price),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    #[tokio::test]
    async fn buy_then_sell_round_trip_moves_balances() {
        let trader = PaperTrader::new("USDT", 10_000.0);
        trader
            .place_order("LTCUSDT", Side::Buy, dec(10.0), Some(dec(100.0)))
            .await
            .unwrap();
        assert!((trader.get_balance("USDT").await.unwrap() - 9_000.0).abs() < 1e-9);
        assert!((trader.get_balance("LTC").await.unwrap() - 10.0).abs() < 1e-9);

        trader
            .place_order("LTCUSDT", Side::Sell, dec(10.0), Some(dec(110.0)))
            .await
            .unwrap();
        assert!((trader.get_balance("USDT").await.unwrap() - 10_100.0).abs() < 1e-9);
        assert!(trader.get_balance("LTC").await.unwrap().abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_overdraft_buy() {
        let trader = PaperTrader::new("USDT", 100.0);
        let err = trader
            .place_order("LTCUSDT", Side::Buy, dec(10.0), Some(dec(100.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Gateway(_)));
        // Nothing moved.
        assert!((trader.get_balance("USDT").await.unwrap() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_priceless_order() {
        let trader = PaperTrader::new("USDT", 100.0);
        let err = trader
            .place_order("LTCUSDT", Side::Buy, dec(1.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Gateway(_)));
    }
}
