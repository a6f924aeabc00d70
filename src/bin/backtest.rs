// src/bin/backtest.rs
//
// Historical simulation: the shortest configured timeframe is the
// trading heartbeat, the longer one confirms. Signals are combined
// under the configured confirmation policy; fills are instant at the
// heartbeat close with 99% of the available side committed per trade.

use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trailbot::config::{AppConfig, StrategyConfig};
use trailbot::connectors::binance::BinanceClient;
use trailbot::connectors::traits::MarketData;
use trailbot::signals::aggregator::{combine, ConfirmationPolicy};
use trailbot::signals::indicators::compute_macd;
use trailbot::storage::trade_log::{CycleRecord, IntervalRow, TradeLog};
use trailbot::types::{parse_symbol, Action, CandleSeries, Side};

/// Fraction of the available side committed per simulated trade.
const COMMIT_FRACTION: f64 = 0.99;
/// Minimum share of portfolio value a side must hold to trade it.
const MIN_SIDE_FRACTION: f64 = 0.1;

/// Per-bar MACD readout on one timeframe.
#[derive(Debug, Clone, Copy)]
struct BarSignal {
    close_time: i64,
    close: f64,
    macd: f64,
    macd_signal: f64,
    label: Side,
}

fn bar_signals(series: &CandleSeries, cfg: &StrategyConfig) -> Vec<BarSignal> {
    let closes = series.closes();
    let (macd, signal) = compute_macd(&closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal);
    series
        .candles()
        .iter()
        .zip(macd.iter().zip(&signal))
        .map(|(candle, (&macd, &macd_signal))| BarSignal {
            close_time: candle.close_time,
            close: candle.close,
            macd,
            macd_signal,
            label: if macd > macd_signal {
                Side::Buy
            } else {
                Side::Sell
            },
        })
        .collect()
}

#[derive(Debug)]
struct SimResult {
    trades: usize,
    quote_balance: f64,
    base_balance: f64,
    portfolio_value: f64,
    net_pnl: f64,
    records: Vec<CycleRecord>,
}

fn simulate(
    symbol: &str,
    short: &[BarSignal],
    long: &[BarSignal],
    short_interval: &str,
    long_interval: &str,
    policy: ConfirmationPolicy,
    initial_quote: f64,
) -> SimResult {
    let mut quote_balance = initial_quote;
    let mut base_balance = 0.0f64;
    let mut trades = 0usize;
    let mut records = Vec::with_capacity(short.len());
    let mut long_idx = 0usize;
    if long.is_empty() {
        return SimResult {
            trades: 0,
            quote_balance,
            base_balance,
            portfolio_value: quote_balance,
            net_pnl: 0.0,
            records,
        };
    }

    for bar in short {
        // Most recent confirmation bar at or before the heartbeat bar.
        while long_idx + 1 < long.len() && long[long_idx + 1].close_time <= bar.close_time {
            long_idx += 1;
        }
        let confirm = &long[long_idx];
        if confirm.close_time > bar.close_time {
            continue;
        }

        let action = combine(bar.label, confirm.label, policy);
        let price = bar.close;
        let portfolio_value = quote_balance + base_balance * price;

        let mut trade_quantity = 0.0;
        let mut trade_executed = false;
        match action {
            Action::Buy if quote_balance >= MIN_SIDE_FRACTION * portfolio_value => {
                trade_quantity = COMMIT_FRACTION * quote_balance / price;
                quote_balance -= trade_quantity * price;
                base_balance += trade_quantity;
                trade_executed = true;
            }
            Action::Sell if base_balance * price >= MIN_SIDE_FRACTION * portfolio_value => {
                trade_quantity = COMMIT_FRACTION * base_balance;
                base_balance -= trade_quantity;
                quote_balance += trade_quantity * price;
                trade_executed = true;
            }
            _ => {}
        }
        if trade_executed {
            trades += 1;
        }

        records.push(CycleRecord {
            timestamp: chrono::DateTime::from_timestamp_millis(bar.close_time)
                .unwrap_or_default(),
            intervals: vec![
                IntervalRow {
                    interval: short_interval.to_string(),
                    macd: bar.macd,
                    macd_signal: bar.macd_signal,
                    trade_signal: bar.label.to_string(),
                },
                IntervalRow {
                    interval: long_interval.to_string(),
                    macd: confirm.macd,
                    macd_signal: confirm.macd_signal,
                    trade_signal: confirm.label.to_string(),
                },
            ],
            combined_signal: action.to_string(),
            symbol: symbol.to_string(),
            trade_quantity,
            price,
            order_type: if trade_executed { "LIMIT" } else { "NONE" }.to_string(),
            base_balance,
            quote_balance,
            trade_executed,
            position_action: if trade_executed {
                action.to_string()
            } else {
                "HOLD".to_string()
            },
            trade_pnl: None,
            trigger_reason: String::new(),
            watch_mode_entered: false,
            cooldown_active: false,
        });
    }

    let last_price = short.last().map(|b| b.close).unwrap_or(0.0);
    let portfolio_value = quote_balance + base_balance * last_price;
    SimResult {
        trades,
        quote_balance,
        base_balance,
        portfolio_value,
        net_pnl: portfolio_value - initial_quote,
        records,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::new()?;
    config.validate()?;
    let [short_interval, long_interval] = match config.strategy.intervals.as_slice() {
        [s, l, ..] => [s.clone(), l.clone()],
        _ => anyhow::bail!("backtest needs two configured timeframes"),
    };

    let market = BinanceClient::new(&config)?;
    let days = config.strategy.history_days;
    info!(symbol = %config.symbol, days, "fetching historical data");
    let short_series = market.fetch_candles(&short_interval, days).await?;
    let long_series = market.fetch_candles(&long_interval, days).await?;

    let short = bar_signals(&short_series, &config.strategy);
    let long = bar_signals(&long_series, &config.strategy);

    let result = simulate(
        &config.symbol,
        &short,
        &long,
        &short_interval,
        &long_interval,
        config.strategy.confirmation_policy,
        config.initial_balance,
    );

    let log = TradeLog::new(&config.trade_log_path, &config.strategy.intervals);
    for record in &result.records {
        log.append(record)?;
    }

    let (base_coin, quote_coin) = parse_symbol(&config.symbol);
    println!("Backtesting Summary Report");
    println!("--------------------------");
    println!("Total Trades Executed: {}", result.trades);
    println!("Final {quote_coin} Balance: {:.2} {quote_coin}", result.quote_balance);
    println!("Final {base_coin} Balance: {:.4} {base_coin}", result.base_balance);
    println!("Total Portfolio Value: {:.2} {quote_coin}", result.portfolio_value);
    println!("Net PnL: {:.2} {quote_coin}", result.net_pnl);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(t: i64, close: f64, label: Side) -> BarSignal {
        BarSignal {
            close_time: t,
            close,
            macd: if label == Side::Buy { 1.0 } else { -1.0 },
            macd_signal: 0.0,
            label,
        }
    }

    #[test]
    fn disagreement_holds_under_both_agree() {
        let short = vec![bar(10, 100.0, Side::Buy)];
        let long = vec![bar(5, 100.0, Side::Sell)];
        let result = simulate(
            "LTCUSDT",
            &short,
            &long,
            "15m",
            "1h",
            ConfirmationPolicy::BothAgree,
            1_000.0,
        );
        assert_eq!(result.trades, 0);
        assert!((result.quote_balance - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn buy_then_sell_round_trip_updates_balances() {
        let short = vec![bar(10, 100.0, Side::Buy), bar(20, 110.0, Side::Sell)];
        let long = vec![bar(5, 100.0, Side::Buy), bar(15, 110.0, Side::Sell)];
        let result = simulate(
            "LTCUSDT",
            &short,
            &long,
            "15m",
            "1h",
            ConfirmationPolicy::BothAgree,
            1_000.0,
        );
        assert_eq!(result.trades, 2);
        // Bought 9.9 at 100, sold 99% of it at 110.
        assert!(result.net_pnl > 0.0);
        assert!(result.base_balance > 0.0);
    }

    #[test]
    fn skips_heartbeat_bars_before_first_confirmation_bar() {
        let short = vec![bar(1, 100.0, Side::Buy), bar(20, 100.0, Side::Buy)];
        let long = vec![bar(10, 100.0, Side::Buy)];
        let result = simulate(
            "LTCUSDT",
            &short,
            &long,
            "15m",
            "1h",
            ConfirmationPolicy::BothAgree,
            1_000.0,
        );
        // Only the second heartbeat bar has confirmation data.
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.trades, 1);
    }

    #[test]
    fn sell_without_base_holdings_is_gated() {
        let short = vec![bar(10, 100.0, Side::Sell)];
        let long = vec![bar(5, 100.0, Side::Sell)];
        let result = simulate(
            "LTCUSDT",
            &short,
            &long,
            "15m",
            "1h",
            ConfirmationPolicy::BothAgree,
            1_000.0,
        );
        assert_eq!(result.trades, 0);
    }
}
