use std::time::Duration;

use anyhow::{bail, Context};

use crate::business_logic::config::{PressureConfig, RecorderConfig, TrendlineConfig};
use crate::models::candle::{interval_ms, supported_intervals};

const DEFAULT_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const DEFAULT_INFO_URL: &str = "https://api.hyperliquid.xyz/info";

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    /// Keepalive ping period while open
    pub heartbeat: Duration,
    /// Delay before the first reconnect attempt; doubles per consecutive failure
    pub reconnect_base: Duration,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            heartbeat: Duration::from_secs(30),
            reconnect_base: Duration::from_millis(1_000),
            max_reconnect_attempts: 5,
        }
    }
}

/// Window bounds applied after every ingest
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub max_candles: usize,
    /// Candles opened longer ago than this are evicted
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_candles: 100,
            max_age: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// External cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    /// Floor for every series TTL
    pub min_ttl_secs: u64,
    /// TTL in multiples of the series interval
    pub ttl_intervals: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            min_ttl_secs: 300,
            ttl_intervals: 1,
        }
    }
}

impl CacheConfig {
    pub fn ttl_secs(&self, interval: &str) -> u64 {
        let interval_secs = interval_ms(interval).unwrap_or(0) / 1_000;
        (interval_secs * self.ttl_intervals).max(self.min_ttl_secs)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub info_url: String,
    pub instruments: Vec<String>,
    pub intervals: Vec<String>,
    pub track_pressure: bool,
    pub log_dir: Option<String>,
    pub feed: FeedConfig,
    pub retention: RetentionPolicy,
    pub cache: CacheConfig,
    pub trendlines: TrendlineConfig,
    pub recorder: RecorderConfig,
    pub pressure: PressureConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            info_url: DEFAULT_INFO_URL.to_string(),
            instruments: vec!["BTC".to_string(), "ETH".to_string()],
            intervals: vec!["5m".to_string()],
            track_pressure: true,
            log_dir: None,
            feed: FeedConfig::default(),
            retention: RetentionPolicy::default(),
            cache: CacheConfig::default(),
            trendlines: TrendlineConfig::default(),
            recorder: RecorderConfig::default(),
            pressure: PressureConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup` on the defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Some(v) = get("FEED_WS_URL") {
            config.feed.ws_url = v;
        }
        if let Some(v) = get("FEED_INFO_URL") {
            config.info_url = v;
        }
        config.cache.redis_url = get("REDIS_URL");
        config.log_dir = get("LOG_DIR");

        if let Some(v) = get("INSTRUMENTS") {
            config.instruments = parse_csv(&v, |s| s.to_uppercase());
            if config.instruments.is_empty() {
                bail!("INSTRUMENTS lists no instruments");
            }
        }
        if let Some(v) = get("INTERVALS") {
            config.intervals = parse_csv(&v, |s| s.to_string());
            if config.intervals.is_empty() {
                bail!("INTERVALS lists no intervals");
            }
        }
        for interval in &config.intervals {
            if interval_ms(interval).is_none() {
                bail!(
                    "unsupported interval {interval}; expected one of {}",
                    supported_intervals()
                );
            }
        }

        if let Some(v) = get("WINDOW_MAX_CANDLES") {
            config.retention.max_candles = parse_num(&v, "WINDOW_MAX_CANDLES")?;
        }
        if let Some(v) = get("WINDOW_MAX_AGE_SECS") {
            let secs: u64 = parse_num(&v, "WINDOW_MAX_AGE_SECS")?;
            config.retention.max_age = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = get("FEED_HEARTBEAT_SECS") {
            config.feed.heartbeat = Duration::from_secs(parse_num::<u64>(&v, "FEED_HEARTBEAT_SECS")?.max(1));
        }
        if let Some(v) = get("FEED_RECONNECT_BASE_MS") {
            config.feed.reconnect_base = Duration::from_millis(parse_num(&v, "FEED_RECONNECT_BASE_MS")?);
        }
        if let Some(v) = get("FEED_MAX_RECONNECT_ATTEMPTS") {
            config.feed.max_reconnect_attempts = parse_num(&v, "FEED_MAX_RECONNECT_ATTEMPTS")?;
        }
        if let Some(v) = get("TRACK_PRESSURE") {
            config.track_pressure = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        Ok(config)
    }
}

fn parse_csv(raw: &str, normalize: impl Fn(&str) -> String) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let item = normalize(item);
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn parse_num<T>(raw: &str, key: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("invalid value for {key}: {raw}"))
}
