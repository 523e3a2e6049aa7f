use std::collections::{BTreeMap, HashMap};

use crate::config::RetentionPolicy;
use crate::models::candle::{Candle, SeriesKey};

/// What an ingest did to its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New open time stored
    Inserted,
    /// Forming candle replaced in place
    Updated,
    /// Update for a candle already sealed by a later one; dropped
    Sealed,
    /// Outside the retention bounds on arrival; dropped
    Expired,
}

impl IngestOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, IngestOutcome::Inserted | IngestOutcome::Updated)
    }
}

/// Ordered candles of one series keyed by open time.
///
/// Only the newest entry is the forming candle. Everything before it is sealed.
#[derive(Debug, Clone, Default)]
pub struct CandleWindow {
    candles: BTreeMap<u64, Candle>,
}

impl CandleWindow {
    pub fn ingest(&mut self, candle: Candle, policy: &RetentionPolicy, now_ms: u64) -> IngestOutcome {
        let forming = self.candles.keys().next_back().copied();

        if let Some(existing) = self.candles.get_mut(&candle.open_time) {
            if forming != Some(candle.open_time) {
                return IngestOutcome::Sealed;
            }
            *existing = candle;
            self.prune(policy, now_ms);
            return IngestOutcome::Updated;
        }

        if let Some(cutoff) = age_cutoff(policy, now_ms) {
            if candle.open_time < cutoff {
                return IngestOutcome::Expired;
            }
        }
        let max_candles = policy.max_candles.max(1);
        if self.candles.len() >= max_candles {
            if let Some(&oldest) = self.candles.keys().next() {
                if candle.open_time < oldest {
                    return IngestOutcome::Expired;
                }
            }
        }

        self.candles.insert(candle.open_time, candle);
        self.prune(policy, now_ms);
        IngestOutcome::Inserted
    }

    fn prune(&mut self, policy: &RetentionPolicy, now_ms: u64) {
        if let Some(cutoff) = age_cutoff(policy, now_ms) {
            if self.candles.keys().next().is_some_and(|&t| t < cutoff) {
                self.candles = self.candles.split_off(&cutoff);
            }
        }
        while self.candles.len() > policy.max_candles.max(1) {
            self.candles.pop_first();
        }
    }

    /// Owned copy in ascending open-time order.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.values().cloned().collect()
    }

    pub fn forming(&self) -> Option<&Candle> {
        self.candles.values().next_back()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

fn age_cutoff(policy: &RetentionPolicy, now_ms: u64) -> Option<u64> {
    policy
        .max_age
        .map(|age| now_ms.saturating_sub(age.as_millis() as u64))
}

/// Per-series candle windows. Single writer: the ingestion loop owns it.
#[derive(Debug, Default)]
pub struct CandleStore {
    policy: RetentionPolicy,
    windows: HashMap<SeriesKey, CandleWindow>,
}

impl CandleStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            windows: HashMap::new(),
        }
    }

    pub fn ingest(&mut self, candle: Candle, now_ms: u64) -> IngestOutcome {
        let key = candle.series_key();
        let window = self.windows.entry(key.clone()).or_default();
        let outcome = window.ingest(candle, &self.policy, now_ms);

        match outcome {
            IngestOutcome::Sealed => tracing::debug!("[{}] dropped update for sealed candle", key),
            IngestOutcome::Expired => tracing::debug!("[{}] dropped candle outside retention", key),
            _ => {}
        }
        outcome
    }

    /// Immutable copy of a series window; empty when the series is unknown.
    pub fn window(&self, key: &SeriesKey) -> Vec<Candle> {
        self.windows
            .get(key)
            .map(CandleWindow::snapshot)
            .unwrap_or_default()
    }

    pub fn latest(&self, key: &SeriesKey) -> Option<&Candle> {
        self.windows.get(key).and_then(CandleWindow::forming)
    }

    pub fn is_empty(&self, key: &SeriesKey) -> bool {
        self.windows.get(key).map_or(true, CandleWindow::is_empty)
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }
}
