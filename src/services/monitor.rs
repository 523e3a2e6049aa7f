use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::business_logic::config::{PressureConfig, TrendlineConfig};
use crate::business_logic::pattern_signals::PatternRecorder;
use crate::business_logic::pressure::PressureTracker;
use crate::business_logic::trendline::detect_trendlines;
use crate::config::AppConfig;
use crate::models::candle::{Candle, SeriesKey};
use crate::models::feed::{Subscription, Trade};
use crate::models::pattern::{PatternEvent, Pressure};
use crate::services::cache::CacheSynchronizer;
use crate::services::feed::{FeedEvent, FeedHandle};
use crate::services::market_state::SharedMarketState;

/// Drives the pipeline: feed events in, windows, trendlines and pattern
/// signals out. The only writer of the candle store.
pub struct MonitorService {
    series: Vec<SeriesKey>,
    sync: CacheSynchronizer,
    trendline_config: TrendlineConfig,
    pressure_config: PressureConfig,
    recorder: PatternRecorder,
    /// Present only when trade pressure is tracked
    pressure: Option<HashMap<String, PressureTracker>>,
    feed: FeedHandle,
    events: mpsc::UnboundedReceiver<FeedEvent>,
    shared_state: SharedMarketState,
}

impl MonitorService {
    pub fn new(
        config: &AppConfig,
        sync: CacheSynchronizer,
        feed: FeedHandle,
        events: mpsc::UnboundedReceiver<FeedEvent>,
        shared_state: SharedMarketState,
    ) -> Self {
        let series = config
            .instruments
            .iter()
            .flat_map(|instrument| {
                config
                    .intervals
                    .iter()
                    .map(move |interval| SeriesKey::new(instrument, interval))
            })
            .collect();

        let pressure = config.track_pressure.then(|| {
            config
                .instruments
                .iter()
                .map(|instrument| (instrument.clone(), PressureTracker::new(&config.pressure)))
                .collect()
        });

        Self {
            series,
            sync,
            trendline_config: config.trendlines.clone(),
            pressure_config: config.pressure.clone(),
            recorder: PatternRecorder::new(config.recorder.clone()),
            pressure,
            feed,
            events,
            shared_state,
        }
    }

    /// Seed every series window from cache or snapshot before going live
    pub async fn warmup(&mut self) {
        for key in self.series.clone() {
            let now = now_ms();
            let source = self.sync.warm(&key, now).await;
            tracing::info!(
                "Warmed up {} with {} candles ({:?})",
                key,
                self.sync.window(&key).len(),
                source
            );
            self.evaluate(&key, now).await;
        }
    }

    /// Register subscriptions, connect, then consume feed events until the feed stops
    pub async fn run(mut self) {
        for key in &self.series {
            self.feed
                .subscribe(Subscription::candles(&key.instrument, &key.interval));
        }
        if let Some(trackers) = &self.pressure {
            let mut instruments: Vec<&String> = trackers.keys().collect();
            instruments.sort();
            for instrument in instruments {
                self.feed.subscribe(Subscription::trades(instrument));
            }
        }
        self.feed.connect();

        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }

        tracing::warn!("feed event stream ended, monitor stopping");
        self.sync.shutdown().await;
    }

    async fn handle(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Candles(candles) => self.on_candles(candles).await,
            FeedEvent::Trades(trades) => self.on_trades(&trades),
            FeedEvent::Connected => tracing::info!("Feed live for {} series", self.series.len()),
            FeedEvent::Disconnected { reason } => tracing::warn!("Feed disconnected: {}", reason),
            FeedEvent::ReconnectScheduled { attempt, delay } => {
                tracing::info!("Feed reconnect {} scheduled in {:?}", attempt, delay)
            }
            FeedEvent::Terminal => tracing::error!(
                "Feed gave up after {} attempts; windows are frozen until reconnect",
                self.feed.status().reconnect_attempts
            ),
        }
    }

    async fn on_candles(&mut self, candles: Vec<Candle>) {
        let mut touched: Vec<SeriesKey> = Vec::new();
        let now = now_ms();

        for candle in candles {
            let key = candle.series_key();
            if !self.series.contains(&key) {
                tracing::debug!("ignoring candle for untracked series {}", key);
                continue;
            }
            if self.sync.ingest(candle, now).changed() && !touched.contains(&key) {
                touched.push(key);
            }
        }

        for key in touched {
            self.evaluate(&key, now).await;
        }
    }

    fn on_trades(&mut self, trades: &[Trade]) {
        let Some(trackers) = self.pressure.as_mut() else {
            return;
        };
        for trade in trades {
            let tracker = trackers
                .entry(trade.coin.clone())
                .or_insert_with(|| PressureTracker::new(&self.pressure_config));
            let before = tracker.pressure();
            let after = tracker.record(trade);
            if before != after {
                tracing::debug!(
                    "{} pressure now {} (net volume {:.4})",
                    trade.coin,
                    after.as_str(),
                    tracker.net_volume()
                );
            }
        }
    }

    /// Detect on the current window, diff against the last pass and publish
    async fn evaluate(&mut self, key: &SeriesKey, now: u64) {
        let window = self.sync.window(key);
        let lines = detect_trendlines(&window, &self.trendline_config);

        let price = self.sync.latest(key).map(|candle| candle.close);
        let events = match price {
            Some(price) => {
                let pressure = self.pressure_for(&key.instrument);
                self.recorder.record(key, &lines, price, pressure, now)
            }
            None => Vec::new(),
        };
        for event in &events {
            log_event(event);
        }

        self.shared_state.publish_series(key, window, lines).await;
        if !events.is_empty() {
            self.shared_state
                .publish_events(self.recorder.history(), events)
                .await;
        }
    }

    fn pressure_for(&self, instrument: &str) -> Option<Pressure> {
        let trackers = self.pressure.as_ref()?;
        Some(
            trackers
                .get(instrument)
                .map(PressureTracker::pressure)
                .unwrap_or_default(),
        )
    }
}

fn log_event(event: &PatternEvent) {
    tracing::warn!(
        "{} {} {} line tested at ${:.2}: {}",
        event.instrument,
        event.interval,
        event.kind.as_str(),
        event.price,
        event.message
    );
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
