//! Crate-wide error type and its mapping onto the wire contract.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors that can terminate an ingress call.
///
/// Per-device outcomes (accepted / rejected / transient) never become a
/// `GatewayError` themselves -- the dispatcher coalesces those into values
/// (see `dispatcher::DispatchOutcome`). This type only covers the three
/// caller-visible failure shapes: a malformed request, an internal bug, and
/// "some device dispatch was transient, retry the whole batch".
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    IngressMalformed(String),

    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::IngressMalformed(_) => StatusCode::BAD_REQUEST,
            Self::Transient(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn errcode(&self) -> &'static str {
        match self {
            Self::IngressMalformed(_) => "M_BAD_JSON",
            Self::Transient(_) | Self::Internal(_) => "M_UNKNOWN",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error handling ingress request");
        } else if matches!(self, Self::Transient(_)) {
            tracing::warn!(error = %self, "ingress call failing transiently");
        } else {
            tracing::info!(error = %self, "rejecting malformed ingress request");
        }

        (
            status,
            Json(json!({ "errcode": self.errcode(), "error": self.to_string() })),
        )
            .into_response()
    }
}
