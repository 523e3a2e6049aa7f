use crate::models::candle::Candle;
use crate::models::trendline::Point;

/// Least-squares line with time (epoch ms) as the independent variable.
///
/// Times are measured from `origin` so the squared terms stay well inside f64
/// precision for epoch-millisecond inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub origin: u64,
    /// Price at `origin`
    pub intercept: f64,
    /// Price change per millisecond
    pub slope: f64,
}

impl LinearFit {
    /// Fit through `points`; `None` when fewer than two points or all share one timestamp.
    pub fn fit(points: &[Point]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }

        let origin = points[0].time;
        let n = points.len() as f64;
        let xs: Vec<f64> = points
            .iter()
            .map(|p| (p.time as i128 - origin as i128) as f64)
            .collect();

        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.price).sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (x, point) in xs.iter().zip(points) {
            let dx = x - mean_x;
            sxx += dx * dx;
            sxy += dx * (point.price - mean_y);
        }

        if sxx.abs() < f64::EPSILON {
            return None;
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        if !slope.is_finite() || !intercept.is_finite() {
            return None;
        }

        Some(Self {
            origin,
            intercept,
            slope,
        })
    }

    pub fn predict(&self, time: u64) -> f64 {
        let dt = time as i128 - self.origin as i128;
        self.intercept + self.slope * dt as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    Low,
    High,
}

impl Extreme {
    pub fn price(&self, candle: &Candle) -> f64 {
        match self {
            Extreme::Low => candle.low,
            Extreme::High => candle.high,
        }
    }

    /// True when `a` is strictly more extreme than `b`.
    fn beats(&self, a: f64, b: f64) -> bool {
        match self {
            Extreme::Low => a < b,
            Extreme::High => a > b,
        }
    }
}

/// Local extremes using `window` neighbours on each side.
///
/// Candles closer than `window` to either edge of the slice are never
/// reported, since their neighbourhood is incomplete.
pub fn local_extrema(candles: &[Candle], window: usize, extreme: Extreme) -> Vec<Point> {
    if window == 0 || candles.len() < 2 * window + 1 {
        return Vec::new();
    }

    (window..candles.len() - window)
        .filter(|&i| {
            let price = extreme.price(&candles[i]);
            (i - window..=i + window)
                .filter(|&j| j != i)
                .all(|j| extreme.beats(price, extreme.price(&candles[j])))
        })
        .map(|i| Point {
            time: candles[i].open_time,
            price: extreme.price(&candles[i]),
        })
        .collect()
}
