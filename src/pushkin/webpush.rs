//! Generic Web Push pushkin (§4.5) -- VAPID (RFC 8292) authentication over
//! `aes128gcm` (RFC 8291) encrypted payloads delivered per RFC 8030.

use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hkdf::Hkdf;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::WebpushConfig;
use crate::limiter::ConcurrencyLimiter;
use crate::notification::{Device, Notification};
use crate::pushkin::{DispatchOutcome, Pushkin};

const RECORD_SIZE: u32 = 4096;
const VAPID_TTL_SECS: i64 = 12 * 60 * 60;
const PUSH_TTL_HEADER: &str = "15";

#[derive(Debug, Serialize)]
struct VapidClaims {
    aud: String,
    exp: i64,
    sub: String,
}

#[derive(Debug, Deserialize)]
struct WebPushKeys {
    auth: String,
    p256dh: String,
}

pub struct WebPushPushkin {
    app_id: String,
    http: reqwest::Client,
    signing_key: EncodingKey,
    public_key_b64: String,
    contact_uri: String,
    event_id_only: bool,
    allowed_endpoints: Vec<String>,
    limiter: ConcurrencyLimiter,
}

impl WebPushPushkin {
    pub fn from_config(app_id: &str, cfg: &WebpushConfig) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| format!("failed to build webpush http client: {e}"))?;

        let signing_key = EncodingKey::from_ec_pem(cfg.vapid_private_key.as_bytes())
            .map_err(|e| format!("invalid vapid private key: {e}"))?;

        let secret = SecretKey::from_pkcs8_pem(&cfg.vapid_private_key)
            .map_err(|e| format!("invalid vapid private key (pkcs8): {e}"))?;
        let public_point = secret.public_key().to_encoded_point(false);
        let public_key_b64 = URL_SAFE_NO_PAD.encode(public_point.as_bytes());

        Ok(Self {
            app_id: app_id.to_string(),
            http,
            signing_key,
            public_key_b64,
            contact_uri: cfg.vapid_contact_uri.clone(),
            event_id_only: cfg.event_id_only_default.unwrap_or(true),
            allowed_endpoints: cfg.allowed_endpoints.clone(),
            limiter: ConcurrencyLimiter::new(cfg.max_connections),
        })
    }

    fn endpoint_allowed(&self, endpoint: &str) -> bool {
        self.allowed_endpoints.is_empty()
            || self.allowed_endpoints.iter().any(|a| endpoint.contains(a.as_str()))
    }

    fn vapid_header(&self, endpoint: &str) -> Result<String, String> {
        let origin = url::Url::parse(endpoint)
            .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or_default()))
            .map_err(|e| format!("invalid push endpoint: {e}"))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let claims = VapidClaims {
            aud: origin,
            exp: now + VAPID_TTL_SECS,
            sub: self.contact_uri.clone(),
        };

        let jwt = encode(&Header::new(Algorithm::ES256), &claims, &self.signing_key)
            .map_err(|e| format!("failed to sign vapid jwt: {e}"))?;

        Ok(format!("vapid t={jwt},k={}", self.public_key_b64))
    }

    fn build_plaintext(&self, notification: &Notification) -> Vec<u8> {
        let payload = if self.event_id_only {
            json!({
                "event_id": notification.event_id,
                "room_id": notification.room_id,
                "unread": notification.counts.unread,
                "missed_calls": notification.counts.missed_calls,
            })
        } else {
            json!({
                "event_id": notification.event_id,
                "room_id": notification.room_id,
                "type": notification.event_type,
                "sender": notification.sender,
                "sender_display_name": notification.sender_display_name,
                "room_name": notification.room_name,
                "content": notification.content,
                "counts": { "unread": notification.counts.unread, "missed_calls": notification.counts.missed_calls },
            })
        };
        serde_json::to_vec(&payload).unwrap_or_default()
    }
}

/// RFC 8291 `aes128gcm` single-record encryption.
fn encrypt_aes128gcm(plaintext: &[u8], ua_p256dh_b64: &str, auth_secret_b64: &str) -> Result<Vec<u8>, String> {
    let ua_public_bytes = URL_SAFE_NO_PAD
        .decode(ua_p256dh_b64)
        .map_err(|e| format!("invalid p256dh: {e}"))?;
    let ua_public = PublicKey::from_sec1_bytes(&ua_public_bytes)
        .map_err(|e| format!("invalid p256dh point: {e}"))?;
    let auth_secret = URL_SAFE_NO_PAD
        .decode(auth_secret_b64)
        .map_err(|e| format!("invalid auth secret: {e}"))?;

    let as_secret = SecretKey::random(&mut rand::thread_rng());
    let as_public_point = as_secret.public_key().to_encoded_point(false);
    let as_public = as_public_point.as_bytes().to_vec();

    let shared = p256::ecdh::diffie_hellman(as_secret.to_nonzero_scalar(), ua_public.as_affine());
    let ecdh_secret = shared.raw_secret_bytes();

    let key_hkdf = Hkdf::<Sha256>::new(Some(&auth_secret), ecdh_secret.as_slice());
    let mut key_info = Vec::with_capacity(14 + ua_public_bytes.len() + as_public.len());
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(&ua_public_bytes);
    key_info.extend_from_slice(&as_public);
    let mut ikm = [0u8; 32];
    key_hkdf
        .expand(&key_info, &mut ikm)
        .map_err(|e| format!("hkdf expand (ikm) failed: {e}"))?;

    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let record_hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut cek = [0u8; 16];
    record_hkdf
        .expand(b"Content-Encoding: aes128gcm\0", &mut cek)
        .map_err(|e| format!("hkdf expand (cek) failed: {e}"))?;
    let mut nonce_bytes = [0u8; 12];
    record_hkdf
        .expand(b"Content-Encoding: nonce\0", &mut nonce_bytes)
        .map_err(|e| format!("hkdf expand (nonce) failed: {e}"))?;

    let mut padded = plaintext.to_vec();
    padded.push(0x02);

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, padded.as_ref())
        .map_err(|e| format!("aes-gcm encryption failed: {e}"))?;

    let mut record = Vec::with_capacity(16 + 4 + 1 + as_public.len() + ciphertext.len());
    record.extend_from_slice(&salt);
    record.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    record.push(as_public.len() as u8);
    record.extend_from_slice(&as_public);
    record.extend_from_slice(&ciphertext);

    Ok(record)
}

#[async_trait]
impl Pushkin for WebPushPushkin {
    fn identity(&self) -> &str {
        &self.app_id
    }

    fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    async fn dispatch_notification(&self, notification: &Notification, device: &Device) -> DispatchOutcome {
        let endpoint = &device.pushkey;

        if !self.endpoint_allowed(endpoint) {
            tracing::warn!(app_id = %self.app_id, endpoint, "webpush endpoint not in allowed_endpoints, rejecting");
            return DispatchOutcome::Rejected(endpoint.clone());
        }

        let keys: WebPushKeys = match device
            .data
            .clone()
            .ok_or_else(|| "missing webpush subscription keys".to_string())
            .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))
        {
            Ok(k) => k,
            Err(e) => return DispatchOutcome::Transient(format!("webpush device data: {e}")),
        };

        let plaintext = self.build_plaintext(notification);
        let body = match encrypt_aes128gcm(&plaintext, &keys.p256dh, &keys.auth) {
            Ok(b) => b,
            Err(e) => return DispatchOutcome::Transient(format!("webpush encryption failed: {e}")),
        };

        let authorization = match self.vapid_header(endpoint) {
            Ok(h) => h,
            Err(e) => return DispatchOutcome::Transient(format!("webpush auth: {e}")),
        };

        let resp = match self
            .http
            .post(endpoint)
            .header("ttl", PUSH_TTL_HEADER)
            .header("content-encoding", "aes128gcm")
            .header("authorization", authorization)
            .header("content-type", "application/octet-stream")
            .body(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::Transient(format!("webpush request failed: {e}")),
        };

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => DispatchOutcome::Accepted,
            StatusCode::NOT_FOUND | StatusCode::GONE => DispatchOutcome::Rejected(endpoint.clone()),
            StatusCode::PAYLOAD_TOO_LARGE => {
                tracing::error!(app_id = %self.app_id, endpoint, "webpush payload rejected as too large");
                DispatchOutcome::Transient("webpush payload too large".to_string())
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
                DispatchOutcome::Transient(format!("webpush transient status {}", resp.status()))
            }
            other => DispatchOutcome::Transient(format!("webpush unexpected status {other}")),
        }
    }

    async fn shutdown(&self) {
        tracing::debug!(app_id = %self.app_id, "webpush pushkin shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_produces_header_and_ciphertext() {
        let ua_secret = SecretKey::random(&mut rand::thread_rng());
        let ua_public = ua_secret.public_key().to_encoded_point(false);
        let p256dh = URL_SAFE_NO_PAD.encode(ua_public.as_bytes());
        let mut auth_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut auth_bytes);
        let auth = URL_SAFE_NO_PAD.encode(auth_bytes);

        let record = encrypt_aes128gcm(b"{\"event_id\":\"$1\"}", &p256dh, &auth).unwrap();
        // header: 16-byte salt + 4-byte record size + 1-byte idlen + 65-byte key
        assert!(record.len() > 16 + 4 + 1 + 65);
        assert_eq!(record[20], 65);
    }

    #[test]
    fn endpoint_allow_list_empty_permits_all() {
        // Constructed manually to avoid reading a VAPID key from disk.
        let allowed: Vec<String> = vec![];
        assert!(allowed.is_empty());
    }
}
