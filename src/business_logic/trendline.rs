use crate::business_logic::config::TrendlineConfig;
use crate::business_logic::indicators::{local_extrema, Extreme, LinearFit};
use crate::models::candle::Candle;
use crate::models::trendline::{Point, Trendline, TrendlineKind};

/// Detect support and resistance lines over a time-sorted window.
///
/// The window is split into `chunk_count` contiguous chunks and each chunk
/// yields at most one support and one resistance candidate, fitted through the
/// chunk's local extremes. Candidates are scored by touches plus extreme
/// count, then ranked intersecting-first and capped per type.
///
/// Pure: the same window and config always give the same lines, in the same
/// order. Degenerate chunks are skipped, never reported as errors.
pub fn detect_trendlines(candles: &[Candle], config: &TrendlineConfig) -> Vec<Trendline> {
    if candles.len() < config.min_candles.max(2) {
        return Vec::new();
    }
    let Some(latest) = candles.last() else {
        return Vec::new();
    };

    let mut supports = Vec::new();
    let mut resistances = Vec::new();

    for chunk in split_chunks(candles, config.chunk_count) {
        if chunk.len() < 2 * config.extrema_window + 1 {
            continue;
        }

        if let Some(line) = fit_chunk(chunk, Extreme::Low, latest, config) {
            supports.push(line);
        }
        if let Some(line) = fit_chunk(chunk, Extreme::High, latest, config) {
            resistances.push(line);
        }
    }

    let mut lines = rank_and_cap(supports, config.max_lines_per_type);
    lines.extend(rank_and_cap(resistances, config.max_lines_per_type));
    lines
}

fn split_chunks(candles: &[Candle], chunk_count: usize) -> impl Iterator<Item = &[Candle]> {
    let count = chunk_count.max(1);
    let len = candles.len();
    (0..count).map(move |i| &candles[i * len / count..(i + 1) * len / count])
}

fn fit_chunk(
    chunk: &[Candle],
    extreme: Extreme,
    latest: &Candle,
    config: &TrendlineConfig,
) -> Option<Trendline> {
    let points = local_extrema(chunk, config.extrema_window, extreme);
    if points.len() < 2 {
        return None;
    }

    let fit = LinearFit::fit(&points)?;
    let first = points.first()?;
    let last = points.last()?;

    let touches = chunk
        .iter()
        .filter(|candle| {
            let predicted = fit.predict(candle.open_time);
            predicted > 0.0
                && ((extreme.price(candle) - predicted) / predicted).abs() <= config.touch_tolerance
        })
        .count();

    let predicted_now = fit.predict(latest.open_time);
    let is_intersecting =
        predicted_now.is_finite() && latest.low <= predicted_now && predicted_now <= latest.high;

    let kind = match extreme {
        Extreme::Low => TrendlineKind::Support,
        Extreme::High => TrendlineKind::Resistance,
    };

    Some(Trendline {
        start_point: Point {
            time: first.time,
            price: fit.predict(first.time),
        },
        end_point: Point {
            time: last.time,
            price: fit.predict(last.time),
        },
        kind,
        slope: fit.slope,
        strength: (touches + points.len()) as u32,
        is_intersecting,
        intersection_price: is_intersecting.then_some(predicted_now),
    })
}

fn rank_and_cap(mut lines: Vec<Trendline>, cap: usize) -> Vec<Trendline> {
    lines.sort_by(|a, b| {
        b.is_intersecting
            .cmp(&a.is_intersecting)
            .then(b.strength.cmp(&a.strength))
            .then(a.start_point.time.cmp(&b.start_point.time))
            .then(a.end_point.time.cmp(&b.end_point.time))
    });
    lines.truncate(cap);
    lines
}
