use axum::{extract::State, Json};

use crate::errors::AppError;
use crate::models::health::HealthResponse;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check with feed connection state", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let connection = state.market.connection_status();
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        feed_state: connection.state.as_str().to_string(),
        reconnect_attempts: connection.reconnect_attempts,
    }))
}
