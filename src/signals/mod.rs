pub mod aggregator;
pub mod indicators;
