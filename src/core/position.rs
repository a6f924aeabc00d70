// src/core/position.rs
//
// The position risk-management state machine. At most one position is
// open at a time; every price tick re-evaluates the trailing stop, the
// watch-mode escalation and the red-candle exit, independent of whatever
// the signal pipeline says that cycle.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::RiskConfig;
use crate::error::BotError;
use crate::signals::indicators::true_range;
use crate::types::{ClosedTrade, TradeSummary};

/// Whether entries move real funds or the simulated ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountingMode {
    /// Balances live on the exchange; `enter` does not touch the ledger.
    Live,
    /// Paper/backtest: `enter` deducts quantity * entry_price up front.
    Backtest,
}

/// The active trade. Entry fields are immutable until exit.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
struct TickSample {
    high: f64,
    low: f64,
    close: f64,
}

/// Fixed-capacity ring buffer of the last `atr_period + 1` (high, low,
/// close) samples. Oldest entry is evicted as new ones are appended.
#[derive(Debug, Clone)]
struct VolatilityWindow {
    buf: Vec<TickSample>,
    head: usize,
    capacity: usize,
}

impl VolatilityWindow {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    fn push(&mut self, sample: TickSample) {
        if self.buf.len() < self.capacity {
            self.buf.push(sample);
        } else {
            self.buf[self.head] = sample;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    /// Samples in chronological order, oldest first. `head` is the oldest
    /// slot once the buffer has wrapped.
    fn ordered(&self) -> impl Iterator<Item = &TickSample> {
        let (wrapped, tail) = self.buf.split_at(self.head.min(self.buf.len()));
        tail.iter().chain(wrapped.iter())
    }
}

/// Owns the single active position (if any), the volatility window and
/// the closed-trade ledger with its profit-skim accounting.
#[derive(Debug)]
pub struct PositionManager {
    symbol: String,
    mode: AccountingMode,
    risk: RiskConfig,

    initial_balance: f64,
    balance: f64,
    profit_reserve: f64,
    profit_events: u32,

    position: Option<Position>,
    highest_price: Option<f64>,
    trailing_stop: Option<f64>,
    watch_mode: bool,
    watch_mode_entered: Option<DateTime<Utc>>,

    window: VolatilityWindow,
    atr: Option<f64>,

    ledger: Vec<ClosedTrade>,
    last_exit_at: Option<DateTime<Utc>>,
}

impl PositionManager {
    pub fn new(symbol: &str, initial_balance: f64, mode: AccountingMode, risk: RiskConfig) -> Self {
        let window = VolatilityWindow::new(risk.atr_period + 1);
        Self {
            symbol: symbol.to_string(),
            mode,
            risk,
            initial_balance,
            balance: initial_balance,
            profit_reserve: 0.0,
            profit_events: 0,
            position: None,
            highest_price: None,
            trailing_stop: None,
            watch_mode: false,
            watch_mode_entered: None,
            window,
            atr: None,
            ledger: Vec::new(),
            last_exit_at: None,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn profit_reserve(&self) -> f64 {
        self.profit_reserve
    }

    pub fn watch_mode(&self) -> bool {
        self.watch_mode
    }

    pub fn watch_mode_entered(&self) -> Option<DateTime<Utc>> {
        self.watch_mode_entered
    }

    pub fn trailing_stop(&self) -> Option<f64> {
        self.trailing_stop
    }

    pub fn atr(&self) -> Option<f64> {
        self.atr
    }

    pub fn ledger(&self) -> &[ClosedTrade] {
        &self.ledger
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> Option<f64> {
        self.position
            .as_ref()
            .map(|p| (current_price - p.entry_price) * p.quantity)
    }

    /// True while BUY decisions should be ignored after a recent exit.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        if self.risk.cooldown_secs == 0 {
            return false;
        }
        self.last_exit_at
            .map(|t| (now - t).num_seconds() < self.risk.cooldown_secs as i64)
            .unwrap_or(false)
    }

    /// Opens a position. Fails if one is already active; replacing an open
    /// position silently is never allowed.
    pub fn enter(
        &mut self,
        quantity: f64,
        entry_price: f64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BotError> {
        if self.position.is_some() {
            error!("attempted to enter a position while another is active");
            return Err(BotError::AlreadyActive {
                symbol: self.symbol.clone(),
            });
        }

        self.position = Some(Position {
            symbol: self.symbol.clone(),
            quantity,
            entry_price,
            entry_time: now,
            reason: reason.to_string(),
        });

        if self.mode == AccountingMode::Backtest {
            let used_funds = quantity * entry_price;
            self.balance -= used_funds;
            info!(used_funds, balance = self.balance, "deducted funds from balance");
        }

        self.highest_price = Some(entry_price);
        self.trailing_stop = Some(entry_price * (1.0 - self.risk.trailing_stop_pct));
        self.watch_mode = false;
        self.watch_mode_entered = None;

        info!(
            symbol = %self.symbol,
            quantity,
            entry_price,
            reason,
            "entered position"
        );
        Ok(())
    }

    /// Closes the active position, settles fees and P&L, skims profit
    /// above the target ratio and appends the trade to the ledger.
    /// A no-op (with a warning) when flat.
    pub fn exit(
        &mut self,
        exit_price: f64,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let Some(position) = self.position.take() else {
            warn!("no active position to exit");
            return None;
        };

        // One fee per side.
        let fees = (position.entry_price + exit_price) * position.quantity * self.risk.fee_rate;
        let pnl = (exit_price - position.entry_price) * position.quantity - fees;

        // The realized result is credited back; in backtest accounting the
        // committed funds were already removed at entry.
        self.balance += pnl;

        // Profit skim: working capital is clamped back to the target and
        // the excess moves into the reserve.
        let target_balance = self.initial_balance * self.risk.profit_target_ratio;
        let mut profit_skimmed = 0.0;
        if self.balance > target_balance {
            profit_skimmed = self.balance - target_balance;
            self.balance = target_balance;
            self.profit_reserve += profit_skimmed;
            self.profit_events += 1;
            info!(
                profit_skimmed,
                profit_events = self.profit_events,
                profit_reserve = self.profit_reserve,
                "profit taken"
            );
        }

        let closed = ClosedTrade {
            symbol: position.symbol,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            reason: reason.to_string(),
            timestamp,
            profit_skimmed,
        };
        info!(?closed, "exited position");
        self.ledger.push(closed.clone());

        self.highest_price = None;
        self.trailing_stop = None;
        self.watch_mode = false;
        self.watch_mode_entered = None;
        self.last_exit_at = Some(timestamp);

        Some(closed)
    }

    /// Appends one (high, low, close) sample to the volatility window.
    pub fn record_tick(&mut self, high: f64, low: f64, close: f64) {
        self.window.push(TickSample { high, low, close });
        debug!(high, low, close, "updated price history");
    }

    /// Mean true range over the window; undefined until the window holds
    /// `atr_period + 1` samples.
    pub fn compute_atr(&self) -> Option<f64> {
        if !self.window.is_full() {
            debug!("not enough data to calculate ATR");
            return None;
        }
        let samples: Vec<&TickSample> = self.window.ordered().collect();
        let sum: f64 = samples
            .windows(2)
            .map(|pair| true_range(pair[1].high, pair[1].low, pair[0].close))
            .sum();
        Some(sum / self.risk.atr_period as f64)
    }

    /// Re-evaluates the trailing stop and watch-mode escalation for one
    /// price tick. Returns the closed trade if a stop fired.
    pub fn update_risk(
        &mut self,
        current_price: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let Some(position) = self.position.as_ref() else {
            warn!("no active position to monitor");
            return None;
        };
        let entry_price = position.entry_price;

        if self.highest_price.map_or(true, |h| current_price > h) {
            self.highest_price = Some(current_price);
            let candidate = match self.atr {
                Some(atr) => current_price - self.risk.stop_loss_mult * atr,
                None => current_price * (1.0 - self.risk.trailing_stop_pct),
            };
            // The stop only ratchets upward while the position is open.
            let stop = self.trailing_stop.map_or(candidate, |prev| prev.max(candidate));
            self.trailing_stop = Some(stop);
            info!(
                highest_price = current_price,
                trailing_stop = stop,
                atr_based = self.atr.is_some(),
                "updated trailing stop"
            );
        }

        if !self.watch_mode {
            if current_price >= entry_price * (1.0 + self.risk.watch_mode_threshold) {
                self.watch_mode = true;
                self.watch_mode_entered = Some(timestamp);
                info!(
                    current_price,
                    entry_price,
                    threshold = self.risk.watch_mode_threshold,
                    "watch mode activated"
                );
                // Risk exits start on the next tick.
                return None;
            }
            if self.risk.require_watch_for_trailing {
                return None;
            }
        }

        if let Some(stop) = self.trailing_stop {
            if current_price <= stop {
                info!(current_price, stop, "trailing stop triggered");
                return self.exit(current_price, "Trailing Stop", timestamp);
            }
        }
        None
    }

    /// Full per-tick evaluation: records the sample, refreshes ATR, runs
    /// the risk checks and, in watch mode, the red-candle exit.
    pub fn monitor(
        &mut self,
        current_price: f64,
        open_price: Option<f64>,
        high: Option<f64>,
        low: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        if self.position.is_none() {
            debug!("no active position to monitor");
            return None;
        }

        let high = high.unwrap_or(current_price);
        let low = low.unwrap_or(current_price);
        self.record_tick(high, low, current_price);
        self.atr = self.compute_atr();

        if let Some(closed) = self.update_risk(current_price, timestamp) {
            return Some(closed);
        }

        if self.watch_mode {
            if let Some(open_price) = open_price {
                if current_price + open_price * self.risk.red_candle_tolerance < open_price {
                    info!(
                        current_price,
                        open_price, "red candle detected in watch mode"
                    );
                    return self.exit(current_price, "Watch Mode Red Candle", timestamp);
                }
            }
        }
        None
    }

    /// Statistics over the closed-trade ledger.
    pub fn summarize(&self) -> TradeSummary {
        let total_pnl: f64 = self.ledger.iter().map(|t| t.pnl).sum();
        let win_count = self.ledger.iter().filter(|t| t.pnl > 0.0).count();
        TradeSummary {
            total_pnl,
            avg_pnl: if self.ledger.is_empty() {
                0.0
            } else {
                total_pnl / self.ledger.len() as f64
            },
            win_count,
            loss_count: self.ledger.len() - win_count,
            profit_events_count: self.profit_events,
            profit_reserve: self.profit_reserve,
        }
    }
}
