//! The pushkin abstraction (§4.2, §9): a provider-bound dispatch worker.
//!
//! Polymorphism is a capability set -- `dispatch_notification` + `shutdown`
//! plus a stable `identity()` for metrics/logging -- realized as a trait with
//! concrete structs behind `Arc<dyn Pushkin>`, never a tagged dynamic
//! attribute lookup.

pub mod apns;
pub mod gcm;
pub mod webpush;

use crate::limiter::ConcurrencyLimiter;
use crate::notification::{Device, Notification};
use async_trait::async_trait;

/// The outcome of dispatching one notification to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Provider acknowledged; caller should not retry this device.
    Accepted,
    /// Device registration is dead (or the provider reported a canonical
    /// replacement); carries the pushkey the caller should forget.
    Rejected(String),
    /// Delivery may succeed later; the whole ingress call fails with 502.
    Transient(String),
}

#[async_trait]
pub trait Pushkin: Send + Sync {
    /// Stable identity used in metrics labels and log fields -- typically
    /// the configured `app_id`.
    fn identity(&self) -> &str;

    /// The concurrency gate this pushkin dispatches through. The dispatcher
    /// acquires a permit itself so outcome bookkeeping (inflight gauges)
    /// stays in one place rather than duplicated in every pushkin impl.
    fn limiter(&self) -> &ConcurrencyLimiter;

    /// Build, send, and classify one device's push. Implementations must
    /// never panic on provider response shape; unexpected shapes classify as
    /// `Transient`.
    async fn dispatch_notification(&self, notification: &Notification, device: &Device) -> DispatchOutcome;

    /// Idempotent teardown: close HTTP connections, cancel nothing in-flight
    /// (the dispatcher's own timeout/cancellation owns that). Called once
    /// per pushkin on graceful shutdown.
    async fn shutdown(&self);
}
