use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};

use crate::models::candle::{Candle, SeriesKey};
use crate::models::pattern::PatternEvent;
use crate::models::trendline::Trendline;
use crate::services::feed::ConnectionStatus;

/// Read-side copy of everything the monitor produces. Handlers only read it.
#[derive(Debug)]
pub struct MarketStateInner {
    pub windows: RwLock<HashMap<SeriesKey, Vec<Candle>>>,
    pub trendlines: RwLock<HashMap<SeriesKey, Vec<Trendline>>>,
    /// Pattern history, newest first
    pub history: RwLock<Vec<PatternEvent>>,
    pub connection: watch::Receiver<ConnectionStatus>,
    pub broadcaster: broadcast::Sender<PatternEvent>,
}

pub type SharedMarketState = Arc<MarketStateInner>;

impl MarketStateInner {
    pub fn new(connection: watch::Receiver<ConnectionStatus>) -> SharedMarketState {
        let (broadcaster, _receiver) = broadcast::channel(64);
        Arc::new(Self {
            windows: RwLock::new(HashMap::new()),
            trendlines: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            connection,
            broadcaster,
        })
    }

    pub async fn publish_series(&self, key: &SeriesKey, window: Vec<Candle>, lines: Vec<Trendline>) {
        self.windows.write().await.insert(key.clone(), window);
        self.trendlines.write().await.insert(key.clone(), lines);
    }

    /// Replace the history and broadcast the new events under one write
    /// guard, so a reader sees each event in exactly one of the two.
    pub async fn publish_events(&self, history: Vec<PatternEvent>, events: Vec<PatternEvent>) {
        let mut guard = self.history.write().await;
        *guard = history;
        for event in events {
            // no subscribers is fine
            let _ = self.broadcaster.send(event);
        }
    }

    /// Current history plus a receiver for every event published after it.
    pub async fn subscribe_with_history(
        &self,
    ) -> (Vec<PatternEvent>, broadcast::Receiver<PatternEvent>) {
        let guard = self.history.read().await;
        let receiver = self.broadcaster.subscribe();
        (guard.clone(), receiver)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection.borrow()
    }

    #[cfg(test)]
    pub async fn is_tracked(&self, key: &SeriesKey) -> bool {
        self.windows.read().await.contains_key(key)
    }
}
