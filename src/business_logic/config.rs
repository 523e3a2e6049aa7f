/// Configuration parameters for trendline detection
#[derive(Debug, Clone)]
pub struct TrendlineConfig {
    /// Windows shorter than this produce no lines
    pub min_candles: usize,
    /// Contiguous chunks the window is split into
    pub chunk_count: usize,
    /// Neighbours checked on each side of a local extreme
    pub extrema_window: usize,
    /// Relative distance from the line that still counts as a touch (0.003 = 0.3%)
    pub touch_tolerance: f64,
    /// Lines kept per support/resistance type
    pub max_lines_per_type: usize,
}

impl Default for TrendlineConfig {
    fn default() -> Self {
        Self {
            min_candles: 10,
            chunk_count: 2,
            extrema_window: 2,
            touch_tolerance: 0.003,
            max_lines_per_type: 3,
        }
    }
}

/// Configuration for the pattern signal recorder
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Retained events, oldest evicted first
    pub max_history: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { max_history: 100 }
    }
}

/// Configuration for trade pressure tracking
#[derive(Debug, Clone)]
pub struct PressureConfig {
    /// Share of volume seen so far a single trade must exceed to flip pressure
    pub significant_trade_ratio: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            significant_trade_ratio: 0.1,
        }
    }
}
