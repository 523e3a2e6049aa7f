use axum::{
    extract::{Query, State},
    Json,
};
use validator::Validate;

use crate::errors::AppError;
use crate::models::series::{SeriesQuery, TrendlineResponse, WindowResponse};
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/candles",
    params(SeriesQuery),
    responses(
        (status = 200, description = "Current candle window for the series", body = WindowResponse),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Series is not monitored", body = crate::errors::ErrorResponse)
    )
)]
pub async fn get_candles(
    State(state): State<AppState>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<WindowResponse>, AppError> {
    query
        .validate()
        .map_err(|err| AppError::Validation(err.to_string()))?;

    let key = query.key();
    let candles = state
        .market
        .windows
        .read()
        .await
        .get(&key)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("series {key} is not monitored")))?;

    Ok(Json(WindowResponse {
        coin: key.instrument,
        interval: key.interval,
        candles,
    }))
}

#[utoipa::path(
    get,
    path = "/trendlines",
    params(SeriesQuery),
    responses(
        (status = 200, description = "Latest support and resistance lines for the series", body = TrendlineResponse),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Series is not monitored", body = crate::errors::ErrorResponse)
    )
)]
pub async fn get_trendlines(
    State(state): State<AppState>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<TrendlineResponse>, AppError> {
    query
        .validate()
        .map_err(|err| AppError::Validation(err.to_string()))?;

    let key = query.key();
    let trendlines = state
        .market
        .trendlines
        .read()
        .await
        .get(&key)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("series {key} is not monitored")))?;

    Ok(Json(TrendlineResponse {
        coin: key.instrument,
        interval: key.interval,
        trendlines,
    }))
}
