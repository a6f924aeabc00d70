// src/config.rs

use config::{Config, ConfigError, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::signals::aggregator::ConfirmationPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    /// Timeframes to evaluate each cycle, shortest first (e.g. ["15m", "1h"]).
    pub intervals: Vec<String>,
    pub history_days: u32,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub rsi_period: usize,
    pub volume_lookback: usize,
    pub volume_threshold_mult: f64,
    pub confirmation_policy: ConfirmationPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    pub atr_period: usize,
    pub trailing_stop_pct: f64,
    pub stop_loss_mult: f64,
    /// Gain over entry price that flips the position into watch mode
    /// (0.05 = 5%). Historically tuned anywhere between 5% and 45%.
    pub watch_mode_threshold: f64,
    /// Per-side fee rate (0.001 = 0.1%).
    pub fee_rate: f64,
    /// Balance above initial_balance * this ratio is skimmed into the
    /// profit reserve on exit (1.10 = keep 10% working headroom).
    pub profit_target_ratio: f64,
    /// Tolerance band for the watch-mode red-candle exit; 0 disables it.
    pub red_candle_tolerance: f64,
    /// When true the trailing stop can only fire after watch mode is on.
    pub require_watch_for_trailing: bool,
    /// Seconds after an exit during which BUY decisions are ignored.
    pub cooldown_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub secret_key: String,
    pub symbol: String,
    pub live_trading: bool,
    pub initial_balance: f64,
    pub poll_interval_secs: u64,
    /// Fraction of the available quote balance committed per entry.
    pub risk_pct: f64,
    pub min_notional: f64,
    pub symbol_step_size: Decimal,
    pub symbol_tick_size: Decimal,
    pub request_timeout_secs: u64,
    pub trade_log_path: String,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings"))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy.intervals.is_empty() {
            return Err(ConfigError::Message("strategy.intervals is empty".into()));
        }
        if self.initial_balance <= 0.0 {
            return Err(ConfigError::Message("initial_balance must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.risk.trailing_stop_pct) {
            return Err(ConfigError::Message(
                "risk.trailing_stop_pct must be in [0, 1)".into(),
            ));
        }
        if self.risk.profit_target_ratio < 1.0 {
            return Err(ConfigError::Message(
                "risk.profit_target_ratio must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Fixed configuration for unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        api_key: String::new(),
        secret_key: String::new(),
        symbol: "LTCUSDT".into(),
        live_trading: false,
        initial_balance: 10_000.0,
        poll_interval_secs: 60,
        risk_pct: 0.85,
        min_notional: 5.5,
        symbol_step_size: Decimal::new(1, 3),
        symbol_tick_size: Decimal::new(1, 2),
        request_timeout_secs: 10,
        trade_log_path: "trades_log.csv".into(),
        strategy: StrategyConfig {
            intervals: vec!["15m".into(), "1h".into()],
            history_days: 30,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            rsi_period: 14,
            volume_lookback: 20,
            volume_threshold_mult: 1.5,
            confirmation_policy: ConfirmationPolicy::BothAgree,
        },
        risk: RiskConfig {
            atr_period: 14,
            trailing_stop_pct: 0.02,
            stop_loss_mult: 1.5,
            watch_mode_threshold: 0.05,
            fee_rate: 0.001,
            profit_target_ratio: 1.10,
            red_candle_tolerance: 0.0,
            require_watch_for_trailing: true,
            cooldown_secs: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_sane_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn rejects_empty_intervals() {
        let mut cfg = test_config();
        cfg.strategy.intervals.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_profit_target_below_one() {
        let mut cfg = test_config();
        cfg.risk.profit_target_ratio = 0.9;
        assert!(cfg.validate().is_err());
    }
}
