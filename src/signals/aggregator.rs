// src/signals/aggregator.rs
//
// Turns per-timeframe indicator values into labels, collects BUY/SELL
// votes across the whole signal set and reduces them to one action.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::error::BotError;
use crate::signals::indicators;
use crate::types::{Action, CandleSeries, Side, SignalLabel, SignalSet};

pub const RSI_OVERSOLD: f64 = 30.0;
pub const RSI_OVERBOUGHT: f64 = 70.0;

/// Latest indicator values for one timeframe, recomputed every cycle.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSnapshot {
    pub macd: f64,
    pub macd_signal: f64,
    pub rsi: Option<f64>,
    pub volume: SignalLabel,
}

impl IndicatorSnapshot {
    /// Computes the snapshot for a candle series. Errors when the series
    /// is too short to evaluate the MACD/signal pair at all.
    pub fn compute(series: &CandleSeries, cfg: &StrategyConfig) -> Result<Self, BotError> {
        let closes = series.closes();
        if closes.len() < 2 {
            return Err(BotError::InsufficientHistory {
                have: closes.len(),
                need: 2,
            });
        }
        let (macd, signal) =
            indicators::compute_macd(&closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal);
        let rsi = indicators::compute_rsi(&closes, cfg.rsi_period);
        let volume = indicators::classify_volume(
            &series.volumes(),
            cfg.volume_lookback,
            cfg.volume_threshold_mult,
        );
        Ok(Self {
            macd: *macd.last().expect("non-empty closes"),
            macd_signal: *signal.last().expect("non-empty closes"),
            rsi: rsi.last().copied().flatten(),
            volume,
        })
    }

    /// MACD label is always binary at this level: BUY iff the MACD line is
    /// above its signal line.
    pub fn macd_label(&self) -> SignalLabel {
        if self.macd > self.macd_signal {
            SignalLabel::Buy
        } else {
            SignalLabel::Sell
        }
    }

    /// Undefined RSI maps to Neutral: no history never means a signal.
    pub fn rsi_label(&self) -> SignalLabel {
        match self.rsi {
            Some(rsi) if rsi < RSI_OVERSOLD => SignalLabel::Oversold,
            Some(rsi) if rsi > RSI_OVERBOUGHT => SignalLabel::Overbought,
            _ => SignalLabel::Neutral,
        }
    }
}

/// Builds the full `{indicator -> {timeframe -> label}}` mapping for one
/// cycle from per-timeframe snapshots.
pub fn build_signal_set(snapshots: &BTreeMap<String, IndicatorSnapshot>) -> SignalSet {
    let mut signals: SignalSet = SignalSet::new();
    for (interval, snap) in snapshots {
        signals
            .entry("MACD".to_string())
            .or_default()
            .insert(interval.clone(), snap.macd_label());
        signals
            .entry("RSI".to_string())
            .or_default()
            .insert(interval.clone(), snap.rsi_label());
        signals
            .entry("Volume".to_string())
            .or_default()
            .insert(interval.clone(), snap.volume);
    }
    signals
}

/// A (indicator, timeframe) pair that voted BUY or SELL.
pub type Vote = (String, String);

/// Scans every (indicator, timeframe) pair for exact BUY/SELL labels.
/// RSI and Volume labels never vote; only the MACD channel produces
/// BUY/SELL at this level.
pub fn aggregate(signals: &SignalSet) -> (Vec<Vote>, Vec<Vote>) {
    let mut buy_votes = Vec::new();
    let mut sell_votes = Vec::new();
    for (indicator, timeframes) in signals {
        for (interval, label) in timeframes {
            match label {
                SignalLabel::Buy => buy_votes.push((indicator.clone(), interval.clone())),
                SignalLabel::Sell => sell_votes.push((indicator.clone(), interval.clone())),
                _ => {}
            }
        }
    }
    (buy_votes, sell_votes)
}

/// SELL-priority reduction: any sell vote wins over any number of buy
/// votes. Capital preservation outranks entry.
pub fn decide(buy_votes: &[Vote], sell_votes: &[Vote]) -> Action {
    if !sell_votes.is_empty() {
        info!(?sell_votes, "sell votes detected");
        Action::Sell
    } else if !buy_votes.is_empty() {
        info!(?buy_votes, "buy votes detected");
        Action::Buy
    } else {
        debug!("no actionable votes, holding");
        Action::Hold
    }
}

/// How the two confirmation timeframes are merged in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    /// Trade only when both timeframes agree, otherwise hold.
    BothAgree,
    /// BUY requires both timeframes; SELL fires if either says so.
    AndBuyOrSell,
}

/// Merges the short- and long-timeframe MACD trade signals under the
/// configured policy.
pub fn combine(short: Side, long: Side, policy: ConfirmationPolicy) -> Action {
    match policy {
        ConfirmationPolicy::BothAgree => {
            if short == long {
                match short {
                    Side::Buy => Action::Buy,
                    Side::Sell => Action::Sell,
                }
            } else {
                Action::Hold
            }
        }
        ConfirmationPolicy::AndBuyOrSell => {
            if short == Side::Sell || long == Side::Sell {
                Action::Sell
            } else if short == Side::Buy && long == Side::Buy {
                Action::Buy
            } else {
                Action::Hold
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::types::Candle;

    fn series(closes: &[f64]) -> CandleSeries {
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: i as i64 * 1000,
                close_time: i as i64 * 1000 + 999,
                open: close,
                high: close,
                low: close,
                close,
                volume: 100.0,
            })
            .collect();
        CandleSeries::from_unordered("LTCUSDT", "15m", candles)
    }

    fn snapshot(macd: f64, macd_signal: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            macd,
            macd_signal,
            rsi: None,
            volume: SignalLabel::Neutral,
        }
    }

    mod snapshots {
        use super::*;

        #[test]
        fn short_series_is_insufficient_history() {
            let cfg = test_config().strategy;
            let err = IndicatorSnapshot::compute(&series(&[100.0]), &cfg).unwrap_err();
            assert!(matches!(err, BotError::InsufficientHistory { .. }));
        }

        #[test]
        fn uptrend_labels_macd_buy() {
            let cfg = test_config().strategy;
            let closes: Vec<f64> = (1..=80).map(|i| i as f64).collect();
            let snap = IndicatorSnapshot::compute(&series(&closes), &cfg).unwrap();
            assert_eq!(snap.macd_label(), SignalLabel::Buy);
        }

        #[test]
        fn macd_cross_flips_label_between_bars() {
            let cfg = test_config().strategy;
            let mut closes: Vec<f64> = (1..=60).map(|i| 100.0 + i as f64).collect();
            // Crash the price: label flips from BUY at t to SELL at t+k.
            let before = IndicatorSnapshot::compute(&series(&closes), &cfg).unwrap();
            assert_eq!(before.macd_label(), SignalLabel::Buy);
            closes.extend(std::iter::repeat(100.0).take(20));
            let after = IndicatorSnapshot::compute(&series(&closes), &cfg).unwrap();
            assert_eq!(after.macd_label(), SignalLabel::Sell);
        }

        #[test]
        fn undefined_rsi_is_neutral() {
            assert_eq!(snapshot(1.0, 0.0).rsi_label(), SignalLabel::Neutral);
        }

        #[test]
        fn rsi_threshold_labels() {
            let mut snap = snapshot(0.0, 0.0);
            snap.rsi = Some(25.0);
            assert_eq!(snap.rsi_label(), SignalLabel::Oversold);
            snap.rsi = Some(75.0);
            assert_eq!(snap.rsi_label(), SignalLabel::Overbought);
            snap.rsi = Some(50.0);
            assert_eq!(snap.rsi_label(), SignalLabel::Neutral);
        }
    }

    mod voting {
        use super::*;

        #[test]
        fn only_macd_channel_votes() {
            let mut snaps = BTreeMap::new();
            let mut snap = snapshot(1.0, 0.0); // MACD -> Buy
            snap.rsi = Some(10.0); // Oversold, never a vote
            snap.volume = SignalLabel::HighVolume;
            snaps.insert("15m".to_string(), snap);

            let signals = build_signal_set(&snaps);
            let (buys, sells) = aggregate(&signals);
            assert_eq!(buys, vec![("MACD".to_string(), "15m".to_string())]);
            assert!(sells.is_empty());
        }

        #[test]
        fn sell_priority_beats_any_number_of_buys() {
            let buys: Vec<Vote> = (0..5)
                .map(|i| ("MACD".to_string(), format!("tf{i}")))
                .collect();
            let sells = vec![("MACD".to_string(), "1h".to_string())];
            assert_eq!(decide(&buys, &sells), Action::Sell);
        }

        #[test]
        fn buys_without_sells_is_buy() {
            let buys = vec![("MACD".to_string(), "15m".to_string())];
            assert_eq!(decide(&buys, &[]), Action::Buy);
        }

        #[test]
        fn no_votes_is_hold() {
            assert_eq!(decide(&[], &[]), Action::Hold);
        }
    }

    mod confirmation {
        use super::*;

        #[test]
        fn both_agree_requires_equality() {
            let p = ConfirmationPolicy::BothAgree;
            assert_eq!(combine(Side::Buy, Side::Buy, p), Action::Buy);
            assert_eq!(combine(Side::Sell, Side::Sell, p), Action::Sell);
            assert_eq!(combine(Side::Buy, Side::Sell, p), Action::Hold);
            assert_eq!(combine(Side::Sell, Side::Buy, p), Action::Hold);
        }

        #[test]
        fn or_for_sell_dominates() {
            let p = ConfirmationPolicy::AndBuyOrSell;
            // 15m=BUY, 1h=SELL -> SELL
            assert_eq!(combine(Side::Buy, Side::Sell, p), Action::Sell);
            assert_eq!(combine(Side::Sell, Side::Buy, p), Action::Sell);
            assert_eq!(combine(Side::Buy, Side::Buy, p), Action::Buy);
            assert_eq!(combine(Side::Sell, Side::Sell, p), Action::Sell);
        }
    }
}
