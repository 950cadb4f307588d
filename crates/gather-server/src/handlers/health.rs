//! Health check endpoint.

use axum::{Json, extract::State};

use crate::dto::{HealthResponse, ServiceStatus};
use crate::state::AppState;

/// Health check endpoint.
///
/// Returns the server version and whether the database answers. A server
/// that cannot reach its database still answers, with status "degraded".
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match gather_db::ping(&state.pool).await {
        Ok(()) => ServiceStatus {
            healthy: true,
            message: None,
        },
        Err(e) => ServiceStatus {
            healthy: false,
            message: Some(e.to_string()),
        },
    };

    Json(HealthResponse {
        status: if database.healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    })
}
