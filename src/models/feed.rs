use serde::{Deserialize, Serialize};

use crate::errors::FeedError;
use crate::models::candle::{deserialize_decimal, Candle};

/// Desired feed subscription. Equality covers topic, instrument and interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(rename = "coin", skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl Subscription {
    pub fn candles(instrument: &str, interval: &str) -> Self {
        Self {
            topic: "candle".to_string(),
            instrument: Some(instrument.to_string()),
            interval: Some(interval.to_string()),
        }
    }

    pub fn trades(instrument: &str) -> Self {
        Self {
            topic: "trades".to_string(),
            instrument: Some(instrument.to_string()),
            interval: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct SubscriptionMessage<'a> {
    method: &'static str,
    subscription: &'a Subscription,
}

#[derive(Debug, Serialize)]
struct Ping {
    method: &'static str,
}

pub fn subscribe_frame(subscription: &Subscription) -> Result<String, FeedError> {
    encode(&SubscriptionMessage {
        method: "subscribe",
        subscription,
    })
}

pub fn unsubscribe_frame(subscription: &Subscription) -> Result<String, FeedError> {
    encode(&SubscriptionMessage {
        method: "unsubscribe",
        subscription,
    })
}

pub fn ping_frame() -> Result<String, FeedError> {
    encode(&Ping { method: "ping" })
}

fn encode<T: Serialize>(value: &T) -> Result<String, FeedError> {
    serde_json::to_string(value).map_err(|e| FeedError::Malformed(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TradeSide {
    #[serde(rename = "B")]
    Buy,
    #[serde(other)]
    Sell,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trade {
    pub coin: String,
    pub side: TradeSide,
    #[serde(deserialize_with = "deserialize_decimal")]
    pub px: f64,
    #[serde(deserialize_with = "deserialize_decimal")]
    pub sz: f64,
    pub time: u64,
}

/// Parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Candles(Vec<Candle>),
    Trades(Vec<Trade>),
    /// Acks, pongs and channels nobody consumes
    Ignored(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    channel: String,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

pub fn parse_inbound(text: &str) -> Result<FeedMessage, FeedError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| FeedError::Malformed(e.to_string()))?;

    match envelope.channel.as_str() {
        "candle" => {
            let data = require_data(envelope.data, "candle")?;
            let candles: Vec<Candle> = serde_json::from_value::<OneOrMany<Candle>>(data)
                .map_err(|e| FeedError::Malformed(format!("candle payload: {e}")))?
                .into();
            for candle in &candles {
                candle
                    .validate()
                    .map_err(|e| FeedError::Malformed(format!("candle {}: {e}", candle.open_time)))?;
            }
            Ok(FeedMessage::Candles(candles))
        }
        "trades" => {
            let data = require_data(envelope.data, "trades")?;
            let trades: Vec<Trade> = serde_json::from_value::<OneOrMany<Trade>>(data)
                .map_err(|e| FeedError::Malformed(format!("trades payload: {e}")))?
                .into();
            Ok(FeedMessage::Trades(trades))
        }
        other => Ok(FeedMessage::Ignored(other.to_string())),
    }
}

fn require_data(
    data: Option<serde_json::Value>,
    channel: &str,
) -> Result<serde_json::Value, FeedError> {
    data.ok_or_else(|| FeedError::Malformed(format!("{channel} message without data")))
}
