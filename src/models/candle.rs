use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Candle {
    /// Candle open time (epoch ms)
    #[serde(rename = "t")]
    #[schema(rename = "t")]
    pub open_time: u64,
    /// Candle close time (epoch ms)
    #[serde(rename = "T")]
    #[schema(rename = "T")]
    pub close_time: u64,
    /// Instrument symbol
    #[serde(rename = "s", default)]
    #[schema(rename = "s")]
    pub instrument: String,
    /// Candle interval
    #[serde(rename = "i", default)]
    #[schema(rename = "i")]
    pub interval: String,
    /// Open price
    #[serde(rename = "o", deserialize_with = "deserialize_decimal")]
    #[schema(rename = "o")]
    pub open: f64,
    /// High price
    #[serde(rename = "h", deserialize_with = "deserialize_decimal")]
    #[schema(rename = "h")]
    pub high: f64,
    /// Low price
    #[serde(rename = "l", deserialize_with = "deserialize_decimal")]
    #[schema(rename = "l")]
    pub low: f64,
    /// Close price
    #[serde(rename = "c", deserialize_with = "deserialize_decimal")]
    #[schema(rename = "c")]
    pub close: f64,
    /// Volume
    #[serde(rename = "v", deserialize_with = "deserialize_decimal")]
    #[schema(rename = "v")]
    pub volume: f64,
    /// Number of trades
    #[serde(rename = "n")]
    #[schema(rename = "n")]
    pub trade_count: u64,
}

impl Candle {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.instrument, &self.interval)
    }

    /// Structural checks a feed payload must pass before it may enter a window.
    pub fn validate(&self) -> Result<(), String> {
        if self.open_time >= self.close_time {
            return Err(format!(
                "open time {} is not before close time {}",
                self.open_time, self.close_time
            ));
        }
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err("non-finite price or volume".to_string());
        }
        if self.low > self.high {
            return Err(format!("low {} above high {}", self.low, self.high));
        }
        if self.instrument.is_empty() || self.interval.is_empty() {
            return Err("missing instrument or interval".to_string());
        }
        Ok(())
    }
}

/// Interval names the exchange serves and their length in ms.
const INTERVALS: [(&str, u64); 14] = [
    ("1m", 60_000),
    ("3m", 180_000),
    ("5m", 300_000),
    ("15m", 900_000),
    ("30m", 1_800_000),
    ("1h", 3_600_000),
    ("2h", 7_200_000),
    ("4h", 14_400_000),
    ("8h", 28_800_000),
    ("12h", 43_200_000),
    ("1d", 86_400_000),
    ("3d", 259_200_000),
    ("1w", 604_800_000),
    ("1M", 2_592_000_000),
];

pub fn interval_ms(interval: &str) -> Option<u64> {
    INTERVALS
        .iter()
        .find(|(name, _)| *name == interval)
        .map(|&(_, ms)| ms)
}

/// Comma-separated interval names, for error messages.
pub fn supported_intervals() -> String {
    INTERVALS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Identifies one candle series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct SeriesKey {
    pub instrument: String,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(instrument: &str, interval: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            interval: interval.to_string(),
        }
    }

    pub fn cache_key(&self) -> String {
        format!("candles:{}:{}", self.instrument, self.interval)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instrument, self.interval)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Decimal {
    Text(String),
    Number(f64),
}

/// Feed payloads carry decimals as strings, cached windows carry plain numbers.
pub(crate) fn deserialize_decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = match Decimal::deserialize(deserializer)? {
        Decimal::Text(s) => s.parse::<f64>().map_err(serde::de::Error::custom)?,
        Decimal::Number(n) => n,
    };
    if !value.is_finite() {
        return Err(serde::de::Error::custom(format!("non-finite decimal {value}")));
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) fn make_candle(index: u64, low: f64, high: f64, close: f64) -> Candle {
    let open_time = index * 60_000;
    Candle {
        open_time,
        close_time: open_time + 59_999,
        instrument: "BTC".to_string(),
        interval: "1m".to_string(),
        open: close,
        high,
        low,
        close,
        volume: 1.0,
        trade_count: 1,
    }
}
