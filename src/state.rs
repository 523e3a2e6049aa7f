use crate::services::market_state::SharedMarketState;

#[derive(Clone)]
pub struct AppState {
    pub market: SharedMarketState,
}
