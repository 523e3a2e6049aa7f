use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A candle extreme at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Point {
    pub time: u64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TrendlineKind {
    Support,
    Resistance,
}

impl TrendlineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendlineKind::Support => "support",
            TrendlineKind::Resistance => "resistance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Trendline {
    pub start_point: Point,
    pub end_point: Point,
    #[serde(rename = "type")]
    #[schema(rename = "type")]
    pub kind: TrendlineKind,
    /// Price change per millisecond
    pub slope: f64,
    pub strength: u32,
    pub is_intersecting: bool,
    /// Line price at the latest candle, set only while intersecting
    pub intersection_price: Option<f64>,
}

impl Trendline {
    /// Price the line predicts at `time` (epoch ms).
    #[cfg(test)]
    pub fn price_at(&self, time: u64) -> f64 {
        let dt = time as i128 - self.start_point.time as i128;
        self.start_point.price + self.slope * dt as f64
    }

    /// Lines from successive detection passes are matched on kind and anchor times.
    pub fn same_line(&self, other: &Trendline) -> bool {
        self.kind == other.kind
            && self.start_point.time == other.start_point.time
            && self.end_point.time == other.end_point.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(start: (u64, f64), end: (u64, f64)) -> Trendline {
        let slope = (end.1 - start.1) / (end.0 - start.0) as f64;
        Trendline {
            start_point: Point { time: start.0, price: start.1 },
            end_point: Point { time: end.0, price: end.1 },
            kind: TrendlineKind::Support,
            slope,
            strength: 2,
            is_intersecting: false,
            intersection_price: None,
        }
    }

    #[test]
    fn price_at_extrapolates_both_directions() {
        let line = line((1_000, 100.0), (2_000, 110.0));
        assert!((line.price_at(3_000) - 120.0).abs() < 1e-9);
        assert!((line.price_at(0) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn serializes_kind_as_type() {
        let json = serde_json::to_value(line((0, 1.0), (10, 2.0))).unwrap();
        assert_eq!(json["type"], "support");
        assert!(json["intersection_price"].is_null());
    }
}
