// src/signals/indicators.rs
//
// Pure indicator transforms over a close/volume series. Callers own the
// series and persist results if they need them; nothing here is cached.

use crate::types::SignalLabel;

pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const RSI_PERIOD: usize = 14;
pub const VOLUME_LOOKBACK: usize = 20;
pub const VOLUME_THRESHOLD_MULT: f64 = 1.5;

/// Exponential moving average seeded with the first value
/// (`alpha = 2 / (period + 1)`, recursive form).
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for &value in &values[1..] {
        prev = alpha * value + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// MACD line and its signal line.
///
/// MACD = EMA(fast) - EMA(slow); signal = EMA(MACD, signal_period).
/// Output vectors have the same length as the input.
pub fn compute_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>) {
    let fast = ema(closes, fast_period);
    let slow = ema(closes, slow_period);
    let macd: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema(&macd, signal_period);
    (macd, signal)
}

/// RSI over a simple rolling mean of gains/losses.
///
/// The first `period` bars are undefined. A window with zero average gain
/// and zero average loss (flat prices) is also undefined rather than a
/// fake neutral value, so it can never produce a false signal.
pub fn compute_rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = closes.len();
    let mut out = vec![None; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let mut gains = Vec::with_capacity(n - 1);
    let mut losses = Vec::with_capacity(n - 1);
    for w in closes.windows(2) {
        let delta = w[1] - w[0];
        gains.push(delta.max(0.0));
        losses.push((-delta).max(0.0));
    }

    for i in (period - 1)..gains.len() {
        let window = &gains[i + 1 - period..=i];
        let avg_gain: f64 = window.iter().sum::<f64>() / period as f64;
        let window = &losses[i + 1 - period..=i];
        let avg_loss: f64 = window.iter().sum::<f64>() / period as f64;

        out[i + 1] = if avg_gain == 0.0 && avg_loss == 0.0 {
            None
        } else if avg_loss == 0.0 {
            Some(100.0)
        } else {
            let rs = avg_gain / avg_loss;
            Some(100.0 - 100.0 / (1.0 + rs))
        };
    }
    out
}

/// Compares the latest bar's volume against the mean of the trailing
/// `lookback` bars (the latest bar included, as in the reference data flow).
pub fn classify_volume(volumes: &[f64], lookback: usize, threshold_mult: f64) -> SignalLabel {
    let Some(&current) = volumes.last() else {
        return SignalLabel::Neutral;
    };
    let tail_start = volumes.len().saturating_sub(lookback);
    let tail = &volumes[tail_start..];
    let average = tail.iter().sum::<f64>() / tail.len() as f64;

    if average <= 0.0 {
        return SignalLabel::Neutral;
    }
    if current >= average * threshold_mult {
        SignalLabel::HighVolume
    } else if current <= average / threshold_mult {
        SignalLabel::LowVolume
    } else {
        SignalLabel::Neutral
    }
}

/// True range of a bar against the previous close.
pub fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}
