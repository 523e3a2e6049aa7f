use std::collections::{HashMap, VecDeque};

use crate::business_logic::config::RecorderConfig;
use crate::models::candle::SeriesKey;
use crate::models::pattern::{PatternEvent, Pressure};
use crate::models::trendline::{Trendline, TrendlineKind};

/// Diffs successive detector outputs and keeps a bounded signal history.
#[derive(Debug)]
pub struct PatternRecorder {
    config: RecorderConfig,
    previous: HashMap<SeriesKey, Vec<Trendline>>,
    history: VecDeque<PatternEvent>,
}

impl PatternRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            previous: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Compare `lines` with the previous pass for `series` and emit one event
    /// per line that just started intersecting.
    ///
    /// `current_price` is the latest close, used to pick the message.
    pub fn record(
        &mut self,
        series: &SeriesKey,
        lines: &[Trendline],
        current_price: f64,
        pressure: Option<Pressure>,
        timestamp: u64,
    ) -> Vec<PatternEvent> {
        let previous = self
            .previous
            .insert(series.clone(), lines.to_vec())
            .unwrap_or_default();

        let mut emitted = Vec::new();
        for line in lines.iter().filter(|line| line.is_intersecting) {
            let Some(price) = line.intersection_price else {
                continue;
            };

            let was_intersecting = previous
                .iter()
                .any(|prev| prev.same_line(line) && prev.is_intersecting);
            if was_intersecting {
                continue;
            }

            if self.seen(&series.instrument, line.kind, price) {
                tracing::debug!(
                    "[{}] {} at {:.4} already recorded",
                    series,
                    line.kind.as_str(),
                    price
                );
                continue;
            }

            let event = PatternEvent {
                instrument: series.instrument.clone(),
                interval: series.interval.clone(),
                timestamp,
                kind: line.kind,
                price,
                message: signal_message(line.kind, current_price, price, pressure),
                pressure,
            };
            self.push(event.clone());
            emitted.push(event);
        }

        emitted
    }

    /// Retained events, newest first.
    pub fn history(&self) -> Vec<PatternEvent> {
        self.history.iter().rev().cloned().collect()
    }

    fn seen(&self, instrument: &str, kind: TrendlineKind, price: f64) -> bool {
        self.history
            .iter()
            .any(|e| e.instrument == instrument && e.kind == kind && e.price == price)
    }

    fn push(&mut self, event: PatternEvent) {
        self.history.push_back(event);
        while self.history.len() > self.config.max_history {
            self.history.pop_front();
        }
    }
}

pub fn signal_message(
    kind: TrendlineKind,
    current_price: f64,
    line_price: f64,
    pressure: Option<Pressure>,
) -> String {
    let base = match kind {
        TrendlineKind::Support if current_price < line_price => {
            "Support broken - watch for further downside movement and potential retest from below"
        }
        TrendlineKind::Support => "Potential bounce zone - watch for buying pressure",
        TrendlineKind::Resistance if current_price > line_price => {
            "Resistance broken - watch for continued upside movement and potential retest from above"
        }
        TrendlineKind::Resistance => "Potential reversal zone - watch for selling pressure",
    };

    match pressure {
        Some(pressure) => format!("{base} ({} pressure detected)", pressure.as_str()),
        None => base.to_string(),
    }
}
