use async_trait::async_trait;
use serde::Serialize;

use crate::errors::FeedError;
use crate::models::candle::{interval_ms, Candle, SeriesKey};

#[derive(Debug, Serialize)]
struct CandleRequest {
    #[serde(rename = "type")]
    request_type: String,
    req: CandleRequestInner,
}

#[derive(Debug, Serialize)]
struct CandleRequestInner {
    coin: String,
    interval: String,
    #[serde(rename = "startTime")]
    start_time: u64,
    #[serde(rename = "endTime")]
    end_time: u64,
}

/// Historical candles used to seed a cold window.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(
        &self,
        series: &SeriesKey,
        max_candles: usize,
        now_ms: u64,
    ) -> Result<Vec<Candle>, FeedError>;
}

#[derive(Clone)]
pub struct HyperliquidClient {
    client: reqwest::Client,
    info_url: String,
}

impl HyperliquidClient {
    pub fn new(info_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            info_url: info_url.into(),
        }
    }

    /// Fetch candles for a coin within a time range
    pub async fn fetch_candles(
        &self,
        coin: &str,
        interval: &str,
        start_time: u64,
        end_time: u64,
    ) -> Result<Vec<Candle>, FeedError> {
        let request = CandleRequest {
            request_type: "candleSnapshot".to_string(),
            req: CandleRequestInner {
                coin: coin.to_string(),
                interval: interval.to_string(),
                start_time,
                end_time,
            },
        };

        let response = self
            .client
            .post(&self.info_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Candle>>()
            .await?;

        Ok(response)
    }
}

#[async_trait]
impl SnapshotSource for HyperliquidClient {
    async fn fetch_snapshot(
        &self,
        series: &SeriesKey,
        max_candles: usize,
        now_ms: u64,
    ) -> Result<Vec<Candle>, FeedError> {
        let (start_time, end_time) = snapshot_range(&series.interval, max_candles, now_ms)
            .ok_or_else(|| FeedError::Snapshot(format!("unsupported interval {}", series.interval)))?;

        let candles = self
            .fetch_candles(&series.instrument, &series.interval, start_time, end_time)
            .await?;
        let fetched = candles.len();
        let candles = normalize_snapshot(series, candles);

        tracing::info!(
            "[{}] snapshot returned {} candles ({} usable)",
            series,
            fetched,
            candles.len()
        );
        Ok(candles)
    }
}

/// Time range covering `max_candles` intervals ending at `now_ms`.
pub fn snapshot_range(interval: &str, max_candles: usize, now_ms: u64) -> Option<(u64, u64)> {
    let span = interval_ms(interval)?.saturating_mul(max_candles.max(1) as u64);
    Some((now_ms.saturating_sub(span), now_ms))
}

/// Fill missing symbol/interval with the requested series, drop entries that
/// belong elsewhere or fail validation, and sort by open time.
fn normalize_snapshot(series: &SeriesKey, candles: Vec<Candle>) -> Vec<Candle> {
    let mut out: Vec<Candle> = candles
        .into_iter()
        .filter_map(|mut candle| {
            if candle.instrument.is_empty() {
                candle.instrument = series.instrument.clone();
            }
            if candle.interval.is_empty() {
                candle.interval = series.interval.clone();
            }
            if candle.series_key() != *series {
                return None;
            }
            match candle.validate() {
                Ok(()) => Some(candle),
                Err(e) => {
                    tracing::warn!("[{}] dropping snapshot candle: {}", series, e);
                    None
                }
            }
        })
        .collect();
    out.sort_by_key(|c| c.open_time);
    out
}
