//! Telemetry Sink (§2 item 7, §4.10): the seam the dispatch engine calls to
//! record counters, histograms, and spans. `PrometheusTelemetry` is the only
//! implementation shipped; OpenTracing/Sentry stay external collaborators
//! per the Non-goals, but can be added later by implementing this trait
//! without touching the dispatcher or any pushkin.

use crate::metrics as prom;

pub trait TelemetrySink: Send + Sync {
    fn record_dispatch(&self, pushkin_id: &str, outcome: &str);
    fn record_token_refresh(&self, pushkin_id: &str, result: &str);
    fn record_inflight_permits(&self, pushkin_id: &str, count: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusTelemetry;

impl TelemetrySink for PrometheusTelemetry {
    fn record_dispatch(&self, pushkin_id: &str, outcome: &str) {
        prom::record_dispatch(pushkin_id, outcome);
    }

    fn record_token_refresh(&self, pushkin_id: &str, result: &str) {
        prom::record_token_refresh(pushkin_id, result);
    }

    fn record_inflight_permits(&self, pushkin_id: &str, count: usize) {
        prom::record_inflight_permits(pushkin_id, count);
    }
}
