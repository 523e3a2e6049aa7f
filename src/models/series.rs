use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationError};

use crate::models::candle::{interval_ms, supported_intervals, Candle, SeriesKey};
use crate::models::trendline::Trendline;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema, IntoParams)]
pub struct SeriesQuery {
    #[validate(length(min = 1, max = 24))]
    #[param(example = "BTC")]
    pub coin: String,
    /// Candle interval. Supported: 1m, 3m, 5m, 15m, 30m, 1h, 2h, 4h, 8h, 12h, 1d, 3d, 1w, 1M.
    #[validate(custom(function = "validate_interval"))]
    #[param(example = "5m")]
    pub interval: String,
}

impl SeriesQuery {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.coin, &self.interval)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WindowResponse {
    pub coin: String,
    pub interval: String,
    pub candles: Vec<Candle>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TrendlineResponse {
    pub coin: String,
    pub interval: String,
    pub trendlines: Vec<Trendline>,
}

pub fn validate_interval(value: &str) -> Result<(), ValidationError> {
    if interval_ms(value).is_some() {
        return Ok(());
    }

    let mut error = ValidationError::new("unsupported_interval");
    error.message = Some(format!("interval must be one of: {}", supported_intervals()).into());
    Err(error)
}
