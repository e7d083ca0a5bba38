//! Liveness endpoint.

use axum::http::StatusCode;

/// `GET /health`: always 200 "OK" while the process serves requests.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
