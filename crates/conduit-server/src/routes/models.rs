use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use conduit::errors::ProviderError;
use serde_json::json;

/// The backend's model catalogue, passed through so clients never see the backend address
async fn handler(State(state): State<AppState>) -> Response {
    match state.provider.models().await {
        Ok(models) => Json(models).into_response(),
        Err(ProviderError::Http { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (
                status,
                Json(json!({
                    "error": "Backend models request failed",
                    "details": body,
                })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "model catalogue unavailable");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "Failed to fetch models",
                    "details": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/models", get(handler))
        .with_state(state)
}
