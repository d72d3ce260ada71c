//! Liveness endpoint (§6): `GET /health` -> `200 OK`, used by the container
//! orchestrator. The gateway holds no persistent state, so there is nothing
//! else to check -- if the process can answer HTTP, it is healthy.

use axum::http::StatusCode;

pub async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
