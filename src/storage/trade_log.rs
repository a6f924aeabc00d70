// src/storage/trade_log.rs
//
// Per-cycle CSV export. One row per polling cycle regardless of whether
// a trade happened, so the file doubles as a signal history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Indicator readout for one timeframe as it goes into the log.
#[derive(Debug, Clone)]
pub struct IntervalRow {
    pub interval: String,
    pub macd: f64,
    pub macd_signal: f64,
    pub trade_signal: String,
}

/// Everything one polling cycle produces, flattened for export.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub timestamp: DateTime<Utc>,
    pub intervals: Vec<IntervalRow>,
    pub combined_signal: String,
    pub symbol: String,
    pub trade_quantity: f64,
    pub price: f64,
    pub order_type: String,
    pub base_balance: f64,
    pub quote_balance: f64,
    pub trade_executed: bool,
    pub position_action: String,
    pub trade_pnl: Option<f64>,
    pub trigger_reason: String,
    pub watch_mode_entered: bool,
    pub cooldown_active: bool,
}

pub struct TradeLog {
    path: PathBuf,
    intervals: Vec<String>,
}

impl TradeLog {
    pub fn new(path: impl AsRef<Path>, intervals: &[String]) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            intervals: intervals.to_vec(),
        }
    }

    fn header(&self) -> Vec<String> {
        let mut cols = vec!["timestamp".to_string()];
        for interval in &self.intervals {
            cols.push(format!("macd_{interval}"));
            cols.push(format!("signal_{interval}"));
            cols.push(format!("trade_signal_{interval}"));
        }
        cols.extend(
            [
                "combined_signal",
                "symbol",
                "trade_quantity",
                "price",
                "order_type",
                "base_balance",
                "quote_balance",
                "trade_executed",
                "position_action",
                "trade_pnl",
                "trigger_reason",
                "watch_mode_entered",
                "cooldown_active",
            ]
            .map(String::from),
        );
        cols
    }

    fn row(&self, rec: &CycleRecord) -> Vec<String> {
        let mut cols = vec![rec.timestamp.to_rfc3339()];
        for interval in &self.intervals {
            match rec.intervals.iter().find(|r| &r.interval == interval) {
                Some(row) => {
                    cols.push(format!("{:.8}", row.macd));
                    cols.push(format!("{:.8}", row.macd_signal));
                    cols.push(row.trade_signal.clone());
                }
                None => cols.extend(["".into(), "".into(), "".into()]),
            }
        }
        cols.push(rec.combined_signal.clone());
        cols.push(rec.symbol.clone());
        cols.push(format!("{:.8}", rec.trade_quantity));
        cols.push(format!("{:.8}", rec.price));
        cols.push(rec.order_type.clone());
        cols.push(format!("{:.2}", rec.base_balance));
        cols.push(format!("{:.2}", rec.quote_balance));
        cols.push(rec.trade_executed.to_string());
        cols.push(rec.position_action.clone());
        cols.push(
            rec.trade_pnl
                .map(|p| format!("{p:.4}"))
                .unwrap_or_default(),
        );
        cols.push(rec.trigger_reason.clone());
        cols.push(rec.watch_mode_entered.to_string());
        cols.push(rec.cooldown_active.to_string());
        cols
    }

    /// Appends one cycle row, writing the header first on a fresh file.
    pub fn append(&self, rec: &CycleRecord) -> Result<()> {
        let fresh = std::fs::metadata(&self.path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open trade log {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if fresh {
            writer.write_record(self.header())?;
        }
        writer.write_record(self.row(rec))?;
        writer.flush().context("flush trade log")?;
        Ok(())
    }
}
