//! Ingress HTTP handler for `POST /_matrix/push/v1/notify` (§6).

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::dispatcher::NotificationDispatcher;
use crate::error::GatewayError;
use crate::notification::{NotifyRequest, NotifyResponse};

pub async fn notify(
    State(dispatcher): State<Arc<NotificationDispatcher>>,
    Json(request): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, GatewayError> {
    let response = dispatcher.dispatch(request).await?;
    Ok(Json(response))
}
