//! Notification Dispatcher (§4.1): the ingress handler. Validates the
//! request, groups devices by pushkin, dispatches concurrently bounded by
//! each pushkin's own limiter, and collates outcomes into the wire reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::GatewayError;
use crate::notification::{NotifyRequest, NotifyResponse};
use crate::pushkin::DispatchOutcome;
use crate::registry::PushkinRegistry;
use crate::telemetry::TelemetrySink;

pub struct NotificationDispatcher {
    registry: Arc<PushkinRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    ingress_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        registry: Arc<PushkinRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        ingress_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            telemetry,
            ingress_timeout,
        }
    }

    pub async fn dispatch(&self, request: NotifyRequest) -> Result<NotifyResponse, GatewayError> {
        let notification = request.notification;
        notification
            .validate()
            .map_err(GatewayError::IngressMalformed)?;

        let devices = notification.devices.clone();
        let notification = Arc::new(notification);

        let mut tasks: JoinSet<DispatchOutcome> = JoinSet::new();
        for device in devices {
            let Some(pushkin) = self.registry.resolve(&device.app_id) else {
                // Unknown app_id: silently ignored (§4.1 step 2), not a rejection.
                continue;
            };
            let notification = notification.clone();
            let telemetry = self.telemetry.clone();

            tasks.spawn(async move {
                let limiter = pushkin.limiter();
                let _permit = limiter.acquire().await;
                telemetry.record_inflight_permits(pushkin.identity(), limiter.in_flight());

                let outcome = pushkin.dispatch_notification(&notification, &device).await;
                telemetry.record_dispatch(pushkin.identity(), outcome_label(&outcome));
                outcome
            });
        }

        let mut rejected = Vec::new();
        let mut transient = false;

        let drained = tokio::time::timeout(self.ingress_timeout, async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(DispatchOutcome::Accepted) => {}
                    Ok(DispatchOutcome::Rejected(pushkey)) => rejected.push(pushkey),
                    Ok(DispatchOutcome::Transient(reason)) => {
                        tracing::warn!(reason = %reason, "device dispatch failed transiently");
                        transient = true;
                    }
                    Err(join_error) => {
                        tracing::error!(error = %join_error, "dispatch task did not complete cleanly");
                        transient = true;
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            tasks.abort_all();
            tracing::warn!(
                timeout_secs = self.ingress_timeout.as_secs(),
                "ingress call timed out, cancelling pending dispatches"
            );
            return Err(GatewayError::Transient("dispatch timed out".to_string()));
        }

        if transient {
            return Err(GatewayError::Transient(
                "one or more devices failed transiently".to_string(),
            ));
        }

        Ok(NotifyResponse { rejected })
    }
}

fn outcome_label(outcome: &DispatchOutcome) -> &'static str {
    match outcome {
        DispatchOutcome::Accepted => "accepted",
        DispatchOutcome::Rejected(_) => "rejected",
        DispatchOutcome::Transient(_) => "transient",
    }
}
