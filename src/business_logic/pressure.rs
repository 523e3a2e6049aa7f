use crate::business_logic::config::PressureConfig;
use crate::models::feed::{Trade, TradeSide};
use crate::models::pattern::Pressure;

/// Running buy/sell pressure for one instrument.
///
/// A trade flips the pressure only when its size exceeds
/// `significant_trade_ratio` of all volume seen before it.
#[derive(Debug, Clone)]
pub struct PressureTracker {
    significant_trade_ratio: f64,
    buy_volume: f64,
    sell_volume: f64,
    pressure: Pressure,
}

impl PressureTracker {
    pub fn new(config: &PressureConfig) -> Self {
        Self {
            significant_trade_ratio: config.significant_trade_ratio,
            buy_volume: 0.0,
            sell_volume: 0.0,
            pressure: Pressure::Neutral,
        }
    }

    pub fn record(&mut self, trade: &Trade) -> Pressure {
        let seen = self.buy_volume + self.sell_volume;
        if trade.sz > seen * self.significant_trade_ratio {
            self.pressure = match trade.side {
                TradeSide::Buy => Pressure::Buy,
                TradeSide::Sell => Pressure::Sell,
            };
        }

        match trade.side {
            TradeSide::Buy => self.buy_volume += trade.sz,
            TradeSide::Sell => self.sell_volume += trade.sz,
        }

        self.pressure
    }

    pub fn pressure(&self) -> Pressure {
        self.pressure
    }

    pub fn net_volume(&self) -> f64 {
        self.buy_volume - self.sell_volume
    }
}
