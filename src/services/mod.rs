pub mod cache;
pub mod feed;
pub mod hyperliquid;
pub mod market_state;
pub mod monitor;
pub mod window_store;
