//! Error handling for the axum server.
//! Maps `MeekError` to HTTP status codes and JSON error bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meek_core::MeekError;
use serde_json::json;

/// Wrapper to convert `MeekError` into an axum response.
pub struct AppError(pub MeekError);

impl From<MeekError> for AppError {
    fn from(e: MeekError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
