// src/error.rs
use thiserror::Error;

/// Error taxonomy for the bot. Everything here is recoverable at the
/// orchestration level except `Config`, which is fatal at startup.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("position already active for {symbol}")]
    AlreadyActive { symbol: String },

    #[error("no active position")]
    NoActivePosition,

    #[error("insufficient history: have {have} bars, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    #[error("data quality: {0}")]
    DataQuality(String),

    #[error("order gateway: {0}")]
    Gateway(String),

    #[error("market data fetch: {0}")]
    TransientFetch(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::TransientFetch(err.to_string())
    }
}
