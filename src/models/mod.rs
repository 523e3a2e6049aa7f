pub mod candle;
pub mod feed;
pub mod health;
pub mod pattern;
pub mod series;
pub mod trendline;
