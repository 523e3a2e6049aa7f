pub mod config;
pub mod indicators;
pub mod pattern_signals;
pub mod pressure;
pub mod trendline;
