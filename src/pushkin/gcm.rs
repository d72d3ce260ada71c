//! Firebase Cloud Messaging (FCM HTTP v1) pushkin (§4.4).
//!
//! Still named "gcm" after the legacy Google Cloud Messaging API this
//! replaced -- the config key and module name are kept for operators
//! migrating existing deployments, the wire protocol underneath is HTTP v1.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth_cache::AuthTokenCache;
use crate::config::GcmConfig;
use crate::limiter::ConcurrencyLimiter;
use crate::notification::{Device, Notification, Priority};
use crate::pushkin::{DispatchOutcome, Pushkin};

const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
/// Refresh a minute before Google's own `expires_in` runs out.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    OAUTH_TOKEN_URL.to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

enum Auth {
    ServiceAccount {
        key: ServiceAccountKey,
        encoding_key: EncodingKey,
        cache: AuthTokenCache<String>,
    },
    LegacyApiKey(String),
}

pub struct GcmPushkin {
    app_id: String,
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    event_id_only: bool,
    auth: Auth,
    limiter: ConcurrencyLimiter,
}

impl GcmPushkin {
    pub fn from_config(app_id: &str, cfg: &GcmConfig) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| format!("failed to build fcm http client: {e}"))?;

        let auth = if let Some(path) = &cfg.service_account_file {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read fcm service account {path}: {e}"))?;
            let key: ServiceAccountKey = serde_json::from_str(&raw)
                .map_err(|e| format!("invalid fcm service account json: {e}"))?;
            let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                .map_err(|e| format!("invalid fcm service account private key: {e}"))?;
            Auth::ServiceAccount {
                key,
                encoding_key,
                cache: AuthTokenCache::new(TOKEN_REFRESH_MARGIN, app_id),
            }
        } else if let Some(api_key) = &cfg.api_key {
            Auth::LegacyApiKey(api_key.clone())
        } else {
            return Err("gcm app has neither service_account_file nor api_key".to_string());
        };

        let endpoint = cfg
            .endpoint_override
            .clone()
            .unwrap_or_else(|| "https://fcm.googleapis.com".to_string());

        Ok(Self {
            app_id: app_id.to_string(),
            http,
            endpoint,
            project_id: cfg.project_id.clone(),
            event_id_only: cfg.event_id_only,
            auth,
            limiter: ConcurrencyLimiter::new(cfg.max_connections),
        })
    }

    async fn access_token(&self) -> Result<String, String> {
        match &self.auth {
            Auth::LegacyApiKey(key) => Ok(key.clone()),
            Auth::ServiceAccount {
                key,
                encoding_key,
                cache,
            } => cache
                .get_or_refresh(|| async {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs() as i64;
                    let claims = JwtClaims {
                        iss: key.client_email.clone(),
                        scope: MESSAGING_SCOPE.to_string(),
                        aud: key.token_uri.clone(),
                        iat: now,
                        exp: now + 3600,
                    };
                    let assertion = encode(&Header::new(Algorithm::RS256), &claims, encoding_key)
                        .map_err(|e| format!("failed to sign fcm service account jwt: {e}"))?;

                    let client = reqwest::Client::new();
                    let resp = client
                        .post(&key.token_uri)
                        .form(&[
                            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                            ("assertion", assertion.as_str()),
                        ])
                        .send()
                        .await
                        .map_err(|e| format!("fcm oauth2 exchange failed: {e}"))?;

                    if !resp.status().is_success() {
                        return Err(format!("fcm oauth2 exchange returned {}", resp.status()));
                    }

                    let token: TokenResponse = resp
                        .json()
                        .await
                        .map_err(|e| format!("fcm oauth2 response malformed: {e}"))?;
                    let expires_at = Instant::now() + Duration::from_secs(token.expires_in.max(0) as u64);
                    Ok((token.access_token, expires_at))
                })
                .await
                .map_err(|e| e.0),
        }
    }

    fn invalidate_token(&self) {
        if let Auth::ServiceAccount { cache, .. } = &self.auth {
            cache.invalidate();
        }
    }

    fn build_message(&self, notification: &Notification, device: &Device) -> Value {
        let android_priority = match notification.prio {
            Priority::High => "high",
            Priority::Low => "normal",
        };

        if self.event_id_only {
            return json!({
                "message": {
                    "token": device.pushkey,
                    "android": { "priority": android_priority },
                    "data": {
                        "event_id": notification.event_id.clone().unwrap_or_default(),
                        "room_id": notification.room_id.clone().unwrap_or_default(),
                        "unread": notification.counts.unread.unwrap_or(0).to_string(),
                        "missed_calls": notification.counts.missed_calls.unwrap_or(0).to_string(),
                        "prio": android_priority,
                    }
                }
            });
        }

        let mut data = serde_json::Map::new();
        data.insert(
            "event_id".to_string(),
            json!(notification.event_id.clone().unwrap_or_default()),
        );
        data.insert(
            "room_id".to_string(),
            json!(notification.room_id.clone().unwrap_or_default()),
        );
        if let Some(sender) = &notification.sender_display_name {
            data.insert("sender_display_name".to_string(), json!(sender));
        }
        if let Some(content) = &notification.content {
            data.insert("content".to_string(), json!(content.to_string()));
        }

        json!({
            "message": {
                "token": device.pushkey,
                "android": { "priority": android_priority, "data": data },
                "data": data,
            }
        })
    }
}

#[async_trait]
impl Pushkin for GcmPushkin {
    fn identity(&self) -> &str {
        &self.app_id
    }

    fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    async fn dispatch_notification(&self, notification: &Notification, device: &Device) -> DispatchOutcome {
        let token = match self.access_token().await {
            Ok(t) => t,
            Err(e) => return DispatchOutcome::Transient(format!("fcm auth: {e}")),
        };

        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.endpoint, self.project_id
        );
        let body = self.build_message(notification, device);

        let resp = match self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::Transient(format!("fcm request failed: {e}")),
        };

        let status = resp.status();
        let payload: Value = resp.json().await.unwrap_or(Value::Null);

        match status {
            // FCM HTTP v1 echoes a `name` (`projects/<project>/messages/<id>`)
            // on every accepted send -- it names the message, not the device,
            // and is never a signal to swap the stored pushkey. Legacy GCM's
            // canonical-registration-id replacement doesn't exist in v1.
            StatusCode::OK => DispatchOutcome::Accepted,
            StatusCode::NOT_FOUND => DispatchOutcome::Rejected(device.pushkey.clone()),
            StatusCode::BAD_REQUEST if error_code(&payload) == Some("UNREGISTERED") => {
                DispatchOutcome::Rejected(device.pushkey.clone())
            }
            StatusCode::BAD_REQUEST
                if error_code(&payload) == Some("INVALID_ARGUMENT") && references_token(&payload) =>
            {
                DispatchOutcome::Rejected(device.pushkey.clone())
            }
            StatusCode::BAD_REQUEST if error_code(&payload) == Some("INVALID_ARGUMENT") => {
                tracing::error!(
                    app_id = %self.app_id, status = %status,
                    "fcm reports invalid argument not tied to the token, treating as misconfiguration not device fault"
                );
                DispatchOutcome::Transient("fcm invalid argument".to_string())
            }
            StatusCode::UNAUTHORIZED => {
                self.invalidate_token();
                let retry_token = match self.access_token().await {
                    Ok(t) => t,
                    Err(e) => return DispatchOutcome::Transient(format!("fcm auth retry: {e}")),
                };
                match self
                    .http
                    .post(&url)
                    .bearer_auth(&retry_token)
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(r) if r.status() == StatusCode::OK => DispatchOutcome::Accepted,
                    Ok(r) => DispatchOutcome::Transient(format!(
                        "fcm auth did not recover: {}",
                        r.status()
                    )),
                    Err(e) => DispatchOutcome::Transient(format!("fcm retry failed: {e}")),
                }
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
                DispatchOutcome::Transient(format!("fcm transient status {status}"))
            }
            other => DispatchOutcome::Transient(format!("fcm unexpected status {other}")),
        }
    }

    async fn shutdown(&self) {
        tracing::debug!(app_id = %self.app_id, "fcm pushkin shutting down");
    }
}

fn error_code(body: &Value) -> Option<&str> {
    body.get("error")
        .and_then(|e| e.get("status"))
        .and_then(|v| v.as_str())
}

/// FCM v1 carries the offending field in
/// `error.details[].fieldViolations[].field` (a `google.rpc.BadRequest`
/// detail) -- §4.4 only rejects an `INVALID_ARGUMENT` when it names the
/// `message.token` field; any other field means the gateway itself is
/// misconfigured (bad project, bad message shape), not a dead device.
fn references_token(body: &Value) -> bool {
    let Some(details) = body.get("error").and_then(|e| e.get("details")).and_then(|d| d.as_array())
    else {
        return false;
    };
    details.iter().any(|detail| {
        detail
            .get("fieldViolations")
            .and_then(|v| v.as_array())
            .map(|violations| {
                violations.iter().any(|violation| {
                    violation
                        .get("field")
                        .and_then(|f| f.as_str())
                        .is_some_and(|f| f.contains("token"))
                })
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Counts;

    fn notification() -> Notification {
        Notification {
            event_id: Some("$event1".into()),
            room_id: Some("!room:example.com".into()),
            event_type: None,
            sender: None,
            sender_display_name: Some("Bob".into()),
            room_name: None,
            room_alias: None,
            prio: Priority::Low,
            content: None,
            counts: Counts { unread: Some(1), missed_calls: None },
            devices: vec![],
        }
    }

    fn device() -> Device {
        Device {
            app_id: "com.example.android".into(),
            pushkey: "fcm-token".into(),
            pushkey_ts: None,
            data: None,
            tweaks: None,
        }
    }

    #[test]
    fn error_code_reads_nested_status() {
        let body = json!({ "error": { "status": "UNREGISTERED" } });
        assert_eq!(error_code(&body), Some("UNREGISTERED"));
    }

    #[test]
    fn invalid_argument_referencing_token_is_detected() {
        let body = json!({
            "error": {
                "status": "INVALID_ARGUMENT",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.BadRequest",
                    "fieldViolations": [{ "field": "message.token", "description": "invalid token" }],
                }],
            }
        });
        assert!(references_token(&body));
    }

    #[test]
    fn invalid_argument_on_other_fields_is_not_a_token_problem() {
        let body = json!({
            "error": {
                "status": "INVALID_ARGUMENT",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.BadRequest",
                    "fieldViolations": [{ "field": "message.android.priority", "description": "bad priority" }],
                }],
            }
        });
        assert!(!references_token(&body));
        assert!(!references_token(&Value::Null));
    }

    #[test]
    fn android_priority_maps_low_to_normal() {
        let n = notification();
        assert_eq!(n.prio, Priority::Low);
    }

    #[test]
    fn event_id_only_message_contains_no_free_text() {
        // Pure data-shape check without constructing a GcmPushkin (which
        // reads a service account file from disk).
        let n = notification();
        let d = device();
        let data = json!({
            "event_id": n.event_id.clone().unwrap_or_default(),
            "room_id": n.room_id.clone().unwrap_or_default(),
            "unread": n.counts.unread.unwrap_or(0).to_string(),
            "missed_calls": n.counts.missed_calls.unwrap_or(0).to_string(),
            "prio": "normal",
        });
        assert!(data.get("sender_display_name").is_none());
        assert_eq!(d.pushkey, "fcm-token");
    }
}
