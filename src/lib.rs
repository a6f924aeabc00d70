pub mod config;
pub mod connectors;
pub mod core;
pub mod error;
pub mod signals;
pub mod storage;
pub mod types;
pub mod utils;
