// src/core/engine.rs
//
// The polling orchestration loop. One cycle: fetch market data, compute
// per-timeframe signals, aggregate to a single action, apply the
// portfolio gates, execute, then hand the tick to the position manager
// for risk monitoring. A failed cycle is logged and retried on the next
// tick, never fatal.

use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::connectors::traits::{ExecutionHandler, MarketData};
use crate::core::position::{AccountingMode, PositionManager};
use crate::error::BotError;
use crate::signals::aggregator::{self, IndicatorSnapshot};
use crate::storage::trade_log::{CycleRecord, IntervalRow, TradeLog};
use crate::types::{parse_symbol, AccountSnapshot, Action, ClosedTrade, Side};
use crate::utils::precision::{normalize_price, normalize_quantity};

/// Quote (or base) share of portfolio value below which the matching
/// side is skipped.
const MIN_PORTFOLIO_PCT: f64 = 10.0;
/// Discount applied to the live price on sell orders so the limit order
/// fills like a taker.
const SELL_SLIPPAGE: f64 = 0.99;

pub struct TradingEngine<M> {
    config: AppConfig,
    market: M,
    execution: Box<dyn ExecutionHandler>,
    positions: PositionManager,
    trade_log: TradeLog,
    base_asset: String,
    quote_asset: String,
}

impl<M> TradingEngine<M>
where
    M: MarketData,
{
    pub fn new(config: AppConfig, market: M, execution: Box<dyn ExecutionHandler>) -> Self {
        let (base_asset, quote_asset) = parse_symbol(&config.symbol);
        let positions = PositionManager::new(
            &config.symbol,
            config.initial_balance,
            AccountingMode::Live,
            config.risk.clone(),
        );
        let trade_log = TradeLog::new(&config.trade_log_path, &config.strategy.intervals);
        Self {
            config,
            market,
            execution,
            positions,
            trade_log,
            base_asset,
            quote_asset,
        }
    }

    /// Verifies history is reachable for every timeframe before the loop
    /// starts. A dead data source should fail fast, not on tick 1.
    async fn preflight(&self) -> Result<(), BotError> {
        for interval in &self.config.strategy.intervals {
            let series = self
                .market
                .fetch_candles(interval, self.config.strategy.history_days)
                .await?;
            info!(%interval, bars = series.len(), "historical data loaded");
        }
        Ok(())
    }

    pub async fn run(&mut self) -> Result<(), BotError> {
        info!(
            symbol = %self.config.symbol,
            live = self.config.live_trading,
            poll_secs = self.config.poll_interval_secs,
            "engine starting"
        );
        self.preflight().await?;

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        warn!(error = %e, "cycle failed, retrying next tick");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        let summary = self.positions.summarize();
        info!(
            total_pnl = summary.total_pnl,
            avg_pnl = summary.avg_pnl,
            wins = summary.win_count,
            losses = summary.loss_count,
            profit_reserve = summary.profit_reserve,
            "session summary"
        );
        Ok(())
    }

    async fn cycle(&mut self) -> Result<(), BotError> {
        let now = Utc::now();
        let live_price = self.market.fetch_live_price().await?;
        info!(symbol = %self.config.symbol, live_price, "live price");

        // Per-timeframe indicator snapshots. A timeframe without enough
        // history contributes no signal instead of a false one.
        let mut snapshots: BTreeMap<String, IndicatorSnapshot> = BTreeMap::new();
        for interval in &self.config.strategy.intervals {
            let series = self
                .market
                .fetch_candles(interval, self.config.strategy.history_days)
                .await?;
            match IndicatorSnapshot::compute(&series, &self.config.strategy) {
                Ok(snap) => {
                    snapshots.insert(interval.clone(), snap);
                }
                Err(e) => warn!(%interval, error = %e, "skipping timeframe this cycle"),
            }
        }

        let signals = aggregator::build_signal_set(&snapshots);
        info!(?signals, "generated signals");
        let (buy_votes, sell_votes) = aggregator::aggregate(&signals);
        let action = aggregator::decide(&buy_votes, &sell_votes);
        info!(%action, "strategy action");

        let account = self.account_snapshot().await?;
        let (base_pct, quote_pct) = account.distribution(live_price);
        info!(
            base_asset = %account.base_asset,
            base_balance = account.base_balance,
            quote_asset = %account.quote_asset,
            quote_balance = account.quote_balance,
            base_pct = %format!("{base_pct:.2}"),
            quote_pct = %format!("{quote_pct:.2}"),
            "account distribution"
        );

        let mut executed: Option<(Side, f64, Option<ClosedTrade>)> = None;
        match action {
            Action::Buy => {
                executed = self
                    .try_buy(live_price, &account, quote_pct)
                    .await?
                    .map(|qty| (Side::Buy, qty, None));
            }
            Action::Sell => {
                executed = self
                    .try_sell(live_price, &account, base_pct)
                    .await?
                    .map(|(qty, closed)| (Side::Sell, qty, closed));
            }
            Action::Hold => {}
        }

        // Risk monitoring runs every cycle regardless of the signal.
        let monitor_exit = self.monitor_position(live_price).await;

        if let Some(pnl) = self.positions.unrealized_pnl(live_price) {
            info!(unrealized_pnl = %format!("{pnl:.4}"), "open position");
        }

        self.append_cycle_record(now, live_price, &snapshots, action, &account, executed, monitor_exit);
        Ok(())
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, BotError> {
        Ok(AccountSnapshot {
            symbol: self.config.symbol.clone(),
            base_asset: self.base_asset.clone(),
            base_balance: self.execution.get_balance(&self.base_asset).await?,
            quote_asset: self.quote_asset.clone(),
            quote_balance: self.execution.get_balance(&self.quote_asset).await?,
        })
    }

    /// BUY path: portfolio gate, cooldown, sizing from the available
    /// quote balance, exchange-filter normalization, then the order.
    /// Returns the filled quantity when a position was opened.
    async fn try_buy(
        &mut self,
        live_price: f64,
        account: &AccountSnapshot,
        quote_pct: f64,
    ) -> Result<Option<f64>, BotError> {
        if !self.positions.is_flat() {
            info!("already in an active trade, buy signal ignored");
            return Ok(None);
        }
        let now = Utc::now();
        if self.positions.in_cooldown(now) {
            info!("cooldown active, buy signal ignored");
            return Ok(None);
        }
        if quote_pct < MIN_PORTFOLIO_PCT {
            info!(
                quote_pct = %format!("{quote_pct:.2}"),
                "not enough quote balance to buy, skipping"
            );
            return Ok(None);
        }

        let committed = account.quote_balance * self.config.risk_pct;
        let (Some(committed), Some(price)) =
            (Decimal::from_f64(committed), Decimal::from_f64(live_price))
        else {
            return Err(BotError::DataQuality("non-finite sizing inputs".into()));
        };
        let quantity = normalize_quantity(committed / price, self.config.symbol_step_size);
        let limit_price = normalize_price(price, self.config.symbol_tick_size);
        let notional = quantity * limit_price;

        if quantity.is_zero()
            || notional < Decimal::from_f64(self.config.min_notional).unwrap_or(Decimal::ZERO)
        {
            warn!(%quantity, %notional, "order below exchange minimum, skipping buy");
            return Ok(None);
        }

        info!(%quantity, %limit_price, %notional, "placing buy order");
        match self
            .execution
            .place_order(&self.config.symbol, Side::Buy, quantity, Some(limit_price))
            .await
        {
            Ok(order) => {
                let filled = order.filled_price.unwrap_or(live_price);
                let qty = quantity.to_f64().unwrap_or(0.0);
                self.positions.enter(qty, filled, "Strategy Buy Signal", now)?;
                Ok(Some(qty))
            }
            Err(e) => {
                // The position is not opened on a failed order.
                error!(error = %e, "buy order failed");
                Ok(None)
            }
        }
    }

    /// SELL path: portfolio gate, then close the tracked position (or
    /// the full base balance when no position is tracked).
    async fn try_sell(
        &mut self,
        live_price: f64,
        account: &AccountSnapshot,
        base_pct: f64,
    ) -> Result<Option<(f64, Option<ClosedTrade>)>, BotError> {
        if base_pct < MIN_PORTFOLIO_PCT {
            info!(
                base_pct = %format!("{base_pct:.2}"),
                "not enough base asset to sell, skipping"
            );
            return Ok(None);
        }
        let quantity = match self.positions.position() {
            Some(p) => p.quantity,
            None if account.base_balance > 0.0 => account.base_balance,
            None => {
                info!("no base asset available to sell, signal ignored");
                return Ok(None);
            }
        };

        let raw_price = live_price * SELL_SLIPPAGE;
        let (Some(qty), Some(price)) = (
            Decimal::from_f64(quantity),
            Decimal::from_f64(raw_price),
        ) else {
            return Err(BotError::DataQuality("non-finite sizing inputs".into()));
        };
        let quantity_dec = normalize_quantity(qty, self.config.symbol_step_size);
        let limit_price = normalize_price(price, self.config.symbol_tick_size);

        info!(%quantity_dec, %limit_price, "placing sell order");
        match self
            .execution
            .place_order(&self.config.symbol, Side::Sell, quantity_dec, Some(limit_price))
            .await
        {
            Ok(order) => {
                let filled = order.filled_price.unwrap_or(raw_price);
                let closed = self.positions.exit(filled, "Strategy Sell Signal", Utc::now());
                Ok(Some((quantity_dec.to_f64().unwrap_or(quantity), closed)))
            }
            Err(e) => {
                error!(error = %e, "sell order failed");
                Ok(None)
            }
        }
    }

    /// Hands the tick to the risk state machine. High/low come from the
    /// shortest monitoring bar; the open of the latest strategy bar
    /// drives the red-candle check.
    async fn monitor_position(&mut self, live_price: f64) -> Option<ClosedTrade> {
        if self.positions.is_flat() {
            return None;
        }
        let monitor_interval = self.config.strategy.intervals.first()?.clone();
        let (high, low) = match self.market.fetch_current_high_low(&monitor_interval).await {
            Ok(hl) => hl,
            Err(e) => {
                warn!(error = %e, "high/low fetch failed, skipping position monitoring");
                return None;
            }
        };
        let open = match self
            .market
            .fetch_candles(&monitor_interval, 1)
            .await
            .map(|s| s.last().map(|c| c.open))
        {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, "open price fetch failed, red-candle check skipped");
                None
            }
        };
        self.positions
            .monitor(live_price, open, Some(high), Some(low), Utc::now())
    }

    #[allow(clippy::too_many_arguments)]
    fn append_cycle_record(
        &self,
        timestamp: chrono::DateTime<Utc>,
        live_price: f64,
        snapshots: &BTreeMap<String, IndicatorSnapshot>,
        action: Action,
        account: &AccountSnapshot,
        executed: Option<(Side, f64, Option<ClosedTrade>)>,
        monitor_exit: Option<ClosedTrade>,
    ) {
        let intervals = snapshots
            .iter()
            .map(|(interval, snap)| IntervalRow {
                interval: interval.clone(),
                macd: snap.macd,
                macd_signal: snap.macd_signal,
                trade_signal: snap.macd_label().to_string(),
            })
            .collect();

        let (trade_executed, quantity, order_type, position_action, signal_exit) = match &executed {
            Some((Side::Buy, qty, _)) => (true, *qty, "LIMIT", "ENTER", None),
            Some((Side::Sell, qty, closed)) => (true, *qty, "LIMIT", "EXIT", closed.clone()),
            None => (false, 0.0, "NONE", "HOLD", None),
        };
        let closed = monitor_exit.or(signal_exit);
        let position_action = if closed.is_some() && position_action == "HOLD" {
            "EXIT"
        } else {
            position_action
        };

        let record = CycleRecord {
            timestamp,
            intervals,
            combined_signal: action.to_string(),
            symbol: self.config.symbol.clone(),
            trade_quantity: quantity,
            price: live_price,
            order_type: order_type.to_string(),
            base_balance: account.base_balance,
            quote_balance: account.quote_balance,
            trade_executed,
            position_action: position_action.to_string(),
            trade_pnl: closed.as_ref().map(|t| t.pnl),
            trigger_reason: closed.map(|t| t.reason).unwrap_or_default(),
            watch_mode_entered: self.positions.watch_mode(),
            cooldown_active: self.positions.in_cooldown(timestamp),
        };
        if let Err(e) = self.trade_log.append(&record) {
            warn!(error = %e, "failed to append trade log row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::connectors::paper::PaperTrader;
    use crate::types::{Candle, CandleSeries};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StaticMarket {
        series: HashMap<String, Vec<f64>>,
        price: f64,
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: i as i64 * 60_000,
                close_time: i as i64 * 60_000 + 59_999,
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 100.0,
            })
            .collect()
    }

    #[async_trait]
    impl MarketData for StaticMarket {
        async fn fetch_candles(
            &self,
            interval: &str,
            _days: u32,
        ) -> Result<CandleSeries, BotError> {
            let closes = self
                .series
                .get(interval)
                .ok_or_else(|| BotError::TransientFetch(format!("no data for {interval}")))?;
            Ok(CandleSeries::from_unordered(
                "LTCUSDT",
                interval,
                candles(closes),
            ))
        }

        async fn fetch_live_price(&self) -> Result<f64, BotError> {
            Ok(self.price)
        }

        async fn fetch_current_high_low(&self, _interval: &str) -> Result<(f64, f64), BotError> {
            Ok((self.price + 0.5, self.price - 0.5))
        }
    }

    fn engine_with(
        short: Vec<f64>,
        long: Vec<f64>,
        price: f64,
        quote_balance: f64,
    ) -> TradingEngine<StaticMarket> {
        let mut cfg = test_config();
        cfg.trade_log_path = std::env::temp_dir()
            .join(format!("engine_test_{}.csv", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        let market = StaticMarket {
            series: HashMap::from([("15m".to_string(), short), ("1h".to_string(), long)]),
            price,
        };
        let execution = Box::new(PaperTrader::new("USDT", quote_balance));
        TradingEngine::new(cfg, market, execution)
    }

    fn rising() -> Vec<f64> {
        (1..=80).map(|i| 100.0 + i as f64 * 0.1).collect()
    }

    fn falling() -> Vec<f64> {
        (1..=80).map(|i| 100.0 - i as f64 * 0.1).collect()
    }

    #[tokio::test]
    async fn buy_cycle_opens_a_position() {
        let mut engine = engine_with(rising(), rising(), 108.0, 10_000.0);
        engine.cycle().await.unwrap();

        let pos = engine.positions.position().expect("position opened");
        assert!(pos.quantity > 0.0);
        assert_eq!(pos.reason, "Strategy Buy Signal");
        // The paper trader spent quote balance on the fill.
        assert!(engine.execution.get_balance("USDT").await.unwrap() < 10_000.0);
    }

    #[tokio::test]
    async fn sell_priority_without_position_stays_flat() {
        // 1h disagrees: its sell vote dominates the 15m buy vote.
        let mut engine = engine_with(rising(), falling(), 92.0, 10_000.0);
        engine.cycle().await.unwrap();
        assert!(engine.positions.is_flat());
    }

    #[tokio::test]
    async fn undersized_order_is_skipped() {
        // 5 USDT at 85% commit sizes below the 5.5 min notional.
        let mut engine = engine_with(rising(), rising(), 108.0, 5.0);
        engine.cycle().await.unwrap();
        assert!(engine.positions.is_flat());
    }

    #[tokio::test]
    async fn missing_timeframe_fails_the_cycle_gracefully() {
        let mut engine = engine_with(rising(), rising(), 108.0, 10_000.0);
        engine.market.series.remove("1h");
        let err = engine.cycle().await.unwrap_err();
        assert!(matches!(err, BotError::TransientFetch(_)));
        assert!(engine.positions.is_flat());
    }
}
