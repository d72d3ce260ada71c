//! Apple Push Notification service pushkin (§4.3).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth_cache::AuthTokenCache;
use crate::config::{ApnsConfig, ApnsPlatform};
use crate::limiter::ConcurrencyLimiter;
use crate::notification::{Device, Notification, Priority};
use crate::pushkin::{DispatchOutcome, Pushkin};

const PRODUCTION_HOST: &str = "https://api.push.apple.com";
const SANDBOX_HOST: &str = "https://api.sandbox.push.apple.com";
/// Apple tokens are valid up to an hour; refresh well before that so a
/// dispatch never races an about-to-expire token.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Serialize)]
struct ProviderClaims {
    iss: String,
    iat: i64,
}

enum Auth {
    /// mTLS client certificate -- the `reqwest::Client` already presents the
    /// identity, no `authorization` header needed.
    Certificate,
    Token {
        key_id: String,
        team_id: String,
        encoding_key: EncodingKey,
        cache: AuthTokenCache<String>,
    },
}

pub struct ApnsPushkin {
    app_id: String,
    http: reqwest::Client,
    endpoint: String,
    topic: String,
    event_id_only: bool,
    auth: Auth,
    limiter: ConcurrencyLimiter,
}

impl ApnsPushkin {
    pub fn from_config(app_id: &str, cfg: &ApnsConfig) -> Result<Self, String> {
        let endpoint = cfg.endpoint_override.clone().unwrap_or_else(|| {
            match cfg.platform {
                ApnsPlatform::Production => PRODUCTION_HOST.to_string(),
                ApnsPlatform::Sandbox => SANDBOX_HOST.to_string(),
            }
        });

        let (http, auth) = if let Some(certfile) = &cfg.certfile {
            let pem = std::fs::read(certfile)
                .map_err(|e| format!("failed to read apns certfile {certfile}: {e}"))?;
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| format!("invalid apns client certificate: {e}"))?;
            let http = reqwest::Client::builder()
                .identity(identity)
                .http2_prior_knowledge()
                .build()
                .map_err(|e| format!("failed to build apns http client: {e}"))?;
            (http, Auth::Certificate)
        } else {
            let keyfile = cfg
                .keyfile
                .as_ref()
                .ok_or_else(|| "apns app missing keyfile".to_string())?;
            let key_id = cfg
                .key_id
                .clone()
                .ok_or_else(|| "apns app missing key_id".to_string())?;
            let team_id = cfg
                .team_id
                .clone()
                .ok_or_else(|| "apns app missing team_id".to_string())?;
            let pem = std::fs::read(keyfile)
                .map_err(|e| format!("failed to read apns keyfile {keyfile}: {e}"))?;
            let encoding_key = EncodingKey::from_ec_pem(&pem)
                .map_err(|e| format!("invalid apns signing key: {e}"))?;
            let http = reqwest::Client::builder()
                .build()
                .map_err(|e| format!("failed to build apns http client: {e}"))?;
            (
                http,
                Auth::Token {
                    key_id,
                    team_id,
                    encoding_key,
                    cache: AuthTokenCache::new(TOKEN_REFRESH_MARGIN, app_id),
                },
            )
        };

        Ok(Self {
            app_id: app_id.to_string(),
            http,
            endpoint,
            topic: cfg.topic.clone(),
            event_id_only: cfg.event_id_only,
            auth,
            limiter: ConcurrencyLimiter::new(cfg.max_connections),
        })
    }

    async fn provider_token(&self) -> Result<Option<String>, String> {
        match &self.auth {
            Auth::Certificate => Ok(None),
            Auth::Token {
                key_id,
                team_id,
                encoding_key,
                cache,
            } => {
                let token = cache
                    .get_or_refresh(|| async {
                        let now = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs() as i64;
                        let claims = ProviderClaims {
                            iss: team_id.clone(),
                            iat: now,
                        };
                        let mut header = Header::new(Algorithm::ES256);
                        header.kid = Some(key_id.clone());
                        encode(&header, &claims, encoding_key)
                            .map(|jwt| (jwt, Instant::now() + TOKEN_LIFETIME))
                            .map_err(|e| format!("failed to sign apns provider jwt: {e}"))
                    })
                    .await
                    .map_err(|e| e.0)?;
                Ok(Some(token))
            }
        }
    }

    fn invalidate_token(&self) {
        if let Auth::Token { cache, .. } = &self.auth {
            cache.invalidate();
        }
    }

    /// `device.data.default_payload` (§3) is a per-device base payload the
    /// home server supplied at registration -- our computed `aps`/event
    /// fields are merged on top of it, not nested under it, so any custom
    /// keys (or an `aps.badge` the device already wants) survive.
    fn base_payload(device: &Device) -> Value {
        device
            .data
            .as_ref()
            .and_then(|d| d.get("default_payload"))
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    fn build_payload(&self, notification: &Notification, device: &Device) -> Value {
        let mut payload = Self::base_payload(device);

        if self.event_id_only {
            merge_json(
                &mut payload,
                &json!({
                    "aps": { "content-available": 1 },
                    "event_id": notification.event_id,
                    "room_id": notification.room_id,
                    "unread": notification.counts.unread,
                    "missed_calls": notification.counts.missed_calls,
                }),
            );
            return payload;
        }

        let tweaks = device.tweaks.clone().unwrap_or_default();
        let sound = resolve_sound(&tweaks);

        let title = notification
            .room_name
            .clone()
            .or_else(|| notification.sender_display_name.clone())
            .unwrap_or_else(|| "New message".to_string());
        let body = notification
            .sender_display_name
            .clone()
            .unwrap_or_else(|| "You have a new message".to_string());

        let mut aps = serde_json::Map::new();
        aps.insert("alert".to_string(), json!({ "title": title, "body": body }));
        if let Some(sound) = sound {
            aps.insert("sound".to_string(), json!(sound));
        }

        merge_json(
            &mut payload,
            &json!({
                "aps": Value::Object(aps),
                "event_id": notification.event_id,
                "room_id": notification.room_id,
            }),
        );

        if let Some(content) = &notification.content {
            merge_json(&mut payload, &json!({ "content": content }));
        }

        payload
    }

    fn apns_priority(prio: Priority) -> &'static str {
        match prio {
            Priority::High => "10",
            Priority::Low => "5",
        }
    }

    async fn send_once(
        &self,
        notification: &Notification,
        device: &Device,
        token: &Option<String>,
    ) -> Result<(StatusCode, Value), String> {
        let url = format!("{}/3/device/{}", self.endpoint, device.pushkey);
        let mut req = self
            .http
            .post(&url)
            .header("apns-topic", &self.topic)
            .header("apns-priority", Self::apns_priority(notification.prio))
            .header(
                "apns-push-type",
                if self.event_id_only { "background" } else { "alert" },
            )
            .header("apns-expiration", "0")
            .json(&self.build_payload(notification, device));

        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}

fn reason(body: &Value) -> Option<&str> {
    body.get("reason").and_then(|v| v.as_str())
}

/// Only force a sound when the device asked to be highlighted; a plain
/// notification with no explicit tweak stays silent rather than defaulting
/// to `"default"`.
fn resolve_sound(tweaks: &crate::notification::Tweaks) -> Option<String> {
    if tweaks.highlight {
        Some(tweaks.sound.clone().unwrap_or_else(|| "default".to_string()))
    } else {
        tweaks.sound.clone()
    }
}

/// Recursively merges `overlay` onto `base`, keeping `base`'s keys when
/// `overlay` doesn't touch them. serde_json has no built-in merge; objects
/// merge key-by-key, anything else is a plain overwrite.
fn merge_json(base: &mut Value, overlay: &Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (&mut *base, overlay) {
        for (key, value) in overlay_map {
            match base_map.get_mut(key) {
                Some(existing) => merge_json(existing, value),
                None => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
    } else {
        *base = overlay.clone();
    }
}

#[async_trait]
impl Pushkin for ApnsPushkin {
    fn identity(&self) -> &str {
        &self.app_id
    }

    fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    async fn dispatch_notification(&self, notification: &Notification, device: &Device) -> DispatchOutcome {
        let token = match self.provider_token().await {
            Ok(t) => t,
            Err(e) => return DispatchOutcome::Transient(format!("apns auth: {e}")),
        };

        let (status, body) = match self.send_once(notification, device, &token).await {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::Transient(format!("apns request failed: {e}")),
        };

        match status {
            StatusCode::OK => DispatchOutcome::Accepted,
            StatusCode::GONE => DispatchOutcome::Rejected(device.pushkey.clone()),
            StatusCode::BAD_REQUEST
                if matches!(reason(&body), Some("BadDeviceToken") | Some("Unregistered")) =>
            {
                DispatchOutcome::Rejected(device.pushkey.clone())
            }
            StatusCode::FORBIDDEN if reason(&body) == Some("ExpiredProviderToken") => {
                self.invalidate_token();
                let retry_token = match self.provider_token().await {
                    Ok(t) => t,
                    Err(e) => return DispatchOutcome::Transient(format!("apns auth retry: {e}")),
                };
                match self.send_once(notification, device, &retry_token).await {
                    Ok((StatusCode::OK, _)) => DispatchOutcome::Accepted,
                    Ok((status, body)) => {
                        tracing::error!(
                            app_id = %self.app_id, status = %status, reason = ?reason(&body),
                            "apns provider token still rejected after refresh"
                        );
                        DispatchOutcome::Transient(format!("apns auth did not recover: {status}"))
                    }
                    Err(e) => DispatchOutcome::Transient(format!("apns retry failed: {e}")),
                }
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
                DispatchOutcome::Transient(format!("apns transient status {status}"))
            }
            other if other.is_client_error() => {
                tracing::error!(
                    app_id = %self.app_id, status = %other, reason = ?reason(&body),
                    "apns rejected request for a reason that looks like misconfiguration"
                );
                DispatchOutcome::Transient(format!("apns config error: {other}"))
            }
            other => DispatchOutcome::Transient(format!("apns unexpected status {other}")),
        }
    }

    async fn shutdown(&self) {
        tracing::debug!(app_id = %self.app_id, "apns pushkin shutting down");
    }
}
