use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::trendline::TrendlineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Buy,
    Sell,
    #[default]
    Neutral,
}

impl Pressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pressure::Buy => "buy",
            Pressure::Sell => "sell",
            Pressure::Neutral => "neutral",
        }
    }
}

/// A trendline that price started testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PatternEvent {
    pub instrument: String,
    pub interval: String,
    /// Detection time (epoch ms)
    pub timestamp: u64,
    #[serde(rename = "type")]
    #[schema(rename = "type")]
    pub kind: TrendlineKind,
    pub price: f64,
    pub message: String,
    pub pressure: Option<Pressure>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PatternHistoryResponse {
    pub events: Vec<PatternEvent>,
}
