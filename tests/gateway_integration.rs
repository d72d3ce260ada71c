//! End-to-end scenarios against stub provider servers (spec §8).
//!
//! Each test builds a `GatewayConfig` pointed at a `wiremock` stand-in for
//! the real provider, drives it through `PushkinRegistry` +
//! `NotificationDispatcher` exactly as `main.rs` wires them, and asserts on
//! the wire-visible outcome -- never on pushkin internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use push_gateway::config::{ApnsConfig, ApnsPlatform, AppConfig, GatewayConfig, GcmConfig, HttpConfig, LogConfig, MetricsConfig, WebpushConfig};
use push_gateway::dispatcher::NotificationDispatcher;
use push_gateway::error::GatewayError;
use push_gateway::notification::{Counts, Device, Notification, NotifyRequest, Priority};
use push_gateway::registry::PushkinRegistry;
use push_gateway::telemetry::PrometheusTelemetry;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const APNS_KEYFILE: &str = "tests/fixtures/apns_test_key.p8";
const FCM_SERVICE_ACCOUNT_KEY: &str = "tests/fixtures/fcm_service_account_key.pem";

fn base_config() -> GatewayConfig {
    GatewayConfig {
        apps: HashMap::new(),
        http: HttpConfig {
            bind_addresses: vec!["127.0.0.1".to_string()],
            port: 0,
            ingress_timeout_secs: 5,
        },
        log: LogConfig::default(),
        metrics: MetricsConfig::default(),
        proxy: None,
    }
}

fn dispatcher_for(registry: PushkinRegistry) -> NotificationDispatcher {
    NotificationDispatcher::new(
        Arc::new(registry),
        Arc::new(PrometheusTelemetry),
        Duration::from_secs(5),
    )
}

fn device(app_id: &str, pushkey: &str) -> Device {
    Device {
        app_id: app_id.to_string(),
        pushkey: pushkey.to_string(),
        pushkey_ts: None,
        data: None,
        tweaks: None,
    }
}

fn request(devices: Vec<Device>) -> NotifyRequest {
    NotifyRequest {
        notification: Notification {
            event_id: Some("$event1".into()),
            room_id: Some("!room:example.com".into()),
            event_type: Some("m.room.message".into()),
            sender: Some("@alice:example.com".into()),
            sender_display_name: Some("Alice".into()),
            room_name: Some("Friends".into()),
            room_alias: None,
            prio: Priority::High,
            content: None,
            counts: Counts { unread: Some(1), missed_calls: None },
            devices,
        },
    }
}

#[tokio::test]
async fn apns_happy_path_returns_empty_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/good-token"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = base_config();
    config.apps.insert(
        "com.example.ios".to_string(),
        AppConfig::Apns(ApnsConfig {
            certfile: None,
            keyfile: Some(APNS_KEYFILE.to_string()),
            key_id: Some("KID123".to_string()),
            team_id: Some("TEAM123".to_string()),
            topic: "com.example.ios".to_string(),
            platform: ApnsPlatform::Production,
            event_id_only: true,
            max_connections: 5,
            endpoint_override: Some(server.uri()),
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let response = dispatcher
        .dispatch(request(vec![device("com.example.ios", "good-token")]))
        .await
        .unwrap();
    assert!(response.rejected.is_empty());
}

#[tokio::test]
async fn apns_dead_token_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/dead-token"))
        .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({ "reason": "Unregistered" })))
        .mount(&server)
        .await;

    let mut config = base_config();
    config.apps.insert(
        "com.example.ios".to_string(),
        AppConfig::Apns(ApnsConfig {
            certfile: None,
            keyfile: Some(APNS_KEYFILE.to_string()),
            key_id: Some("KID123".to_string()),
            team_id: Some("TEAM123".to_string()),
            topic: "com.example.ios".to_string(),
            platform: ApnsPlatform::Production,
            event_id_only: true,
            max_connections: 5,
            endpoint_override: Some(server.uri()),
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let response = dispatcher
        .dispatch(request(vec![device("com.example.ios", "dead-token")]))
        .await
        .unwrap();
    assert_eq!(response.rejected, vec!["dead-token".to_string()]);
}

#[tokio::test]
async fn apns_server_error_fails_whole_call_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/any-token"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = base_config();
    config.apps.insert(
        "com.example.ios".to_string(),
        AppConfig::Apns(ApnsConfig {
            certfile: None,
            keyfile: Some(APNS_KEYFILE.to_string()),
            key_id: Some("KID123".to_string()),
            team_id: Some("TEAM123".to_string()),
            topic: "com.example.ios".to_string(),
            platform: ApnsPlatform::Production,
            event_id_only: true,
            max_connections: 5,
            endpoint_override: Some(server.uri()),
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let result = dispatcher
        .dispatch(request(vec![device("com.example.ios", "any-token")]))
        .await;
    assert!(matches!(result, Err(GatewayError::Transient(_))));
}

fn fcm_service_account_json(token_uri: &str) -> String {
    let key = std::fs::read_to_string(FCM_SERVICE_ACCOUNT_KEY).unwrap();
    serde_json::json!({
        "client_email": "gateway@example-project.iam.gserviceaccount.com",
        "private_key": key,
        "token_uri": token_uri,
    })
    .to_string()
}

#[tokio::test]
async fn fcm_happy_path_returns_empty_rejected_despite_message_name_field() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "stub-access-token",
            "expires_in": 3600,
        })))
        .mount(&server)
        .await;

    // FCM v1 always echoes a `name` (the message resource, not the device)
    // on a 200; it must never cause a rejection.
    Mock::given(method("POST"))
        .and(path("/v1/projects/example-project/messages:send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "projects/example-project/messages/0:1234567890%abcdef",
        })))
        .mount(&server)
        .await;

    let service_account_json = fcm_service_account_json(&format!("{}/token", server.uri()));
    let service_account_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(service_account_file.path(), service_account_json).unwrap();

    let mut config = base_config();
    config.apps.insert(
        "com.example.android".to_string(),
        AppConfig::Gcm(GcmConfig {
            service_account_file: Some(service_account_file.path().to_string_lossy().to_string()),
            api_key: None,
            project_id: "example-project".to_string(),
            event_id_only: false,
            max_connections: 5,
            endpoint_override: Some(server.uri()),
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let response = dispatcher
        .dispatch(request(vec![device("com.example.android", "a-registration-token")]))
        .await
        .unwrap();
    assert!(response.rejected.is_empty());
}

#[tokio::test]
async fn fcm_invalid_argument_on_token_is_rejected_not_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "stub-access-token",
            "expires_in": 3600,
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/example-project/messages:send"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {
                "status": "INVALID_ARGUMENT",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.BadRequest",
                    "fieldViolations": [{ "field": "message.token", "description": "invalid registration token" }],
                }],
            }
        })))
        .mount(&server)
        .await;

    let service_account_json = fcm_service_account_json(&format!("{}/token", server.uri()));
    let service_account_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(service_account_file.path(), service_account_json).unwrap();

    let mut config = base_config();
    config.apps.insert(
        "com.example.android".to_string(),
        AppConfig::Gcm(GcmConfig {
            service_account_file: Some(service_account_file.path().to_string_lossy().to_string()),
            api_key: None,
            project_id: "example-project".to_string(),
            event_id_only: false,
            max_connections: 5,
            endpoint_override: Some(server.uri()),
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let response = dispatcher
        .dispatch(request(vec![device("com.example.android", "malformed-token")]))
        .await
        .unwrap();
    assert_eq!(response.rejected, vec!["malformed-token".to_string()]);
}

#[tokio::test]
async fn unknown_app_id_is_silently_ignored() {
    let config = base_config();
    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let response = dispatcher
        .dispatch(request(vec![device("com.unconfigured.app", "whatever")]))
        .await
        .unwrap();
    assert!(response.rejected.is_empty());
}

#[tokio::test]
async fn mixed_devices_one_transient_fails_whole_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/good-token"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/3/device/flaky-token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = base_config();
    config.apps.insert(
        "com.example.ios".to_string(),
        AppConfig::Apns(ApnsConfig {
            certfile: None,
            keyfile: Some(APNS_KEYFILE.to_string()),
            key_id: Some("KID123".to_string()),
            team_id: Some("TEAM123".to_string()),
            topic: "com.example.ios".to_string(),
            platform: ApnsPlatform::Production,
            event_id_only: true,
            max_connections: 5,
            endpoint_override: Some(server.uri()),
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let result = dispatcher
        .dispatch(request(vec![
            device("com.example.ios", "good-token"),
            device("com.example.ios", "flaky-token"),
        ]))
        .await;
    assert!(matches!(result, Err(GatewayError::Transient(_))));
}

/// Sleeps briefly while tracking the high-water mark of concurrently
/// in-flight requests, so the test can assert the limiter's cap held.
struct ConcurrencyTrackingResponder {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    delay: Duration,
}

impl Respond for ConcurrencyTrackingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.current.fetch_sub(1, Ordering::SeqCst);
        ResponseTemplate::new(200)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrency_cap_is_never_exceeded() {
    let server = MockServer::start().await;

    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .respond_with(ConcurrencyTrackingResponder {
            current: current.clone(),
            max_seen: max_seen.clone(),
            delay: Duration::from_millis(40),
        })
        .mount(&server)
        .await;

    let max_connections = 2;
    let mut config = base_config();
    config.apps.insert(
        "com.example.ios".to_string(),
        AppConfig::Apns(ApnsConfig {
            certfile: None,
            keyfile: Some(APNS_KEYFILE.to_string()),
            key_id: Some("KID123".to_string()),
            team_id: Some("TEAM123".to_string()),
            topic: "com.example.ios".to_string(),
            platform: ApnsPlatform::Production,
            event_id_only: true,
            max_connections,
            endpoint_override: Some(server.uri()),
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    let dispatcher = dispatcher_for(registry);

    let devices: Vec<Device> = (0..8)
        .map(|i| device("com.example.ios", &format!("token-{i}")))
        .collect();

    let response = dispatcher.dispatch(request(devices)).await.unwrap();
    assert!(response.rejected.is_empty());
    assert!(
        max_seen.load(Ordering::SeqCst) <= max_connections,
        "observed {} concurrent requests, limiter cap is {}",
        max_seen.load(Ordering::SeqCst),
        max_connections
    );
}

#[tokio::test]
async fn webpush_config_builds_from_vapid_key() {
    let vapid_key = std::fs::read_to_string("tests/fixtures/vapid_test_key.pem").unwrap();
    let mut config = base_config();
    config.apps.insert(
        "com.example.web".to_string(),
        AppConfig::Webpush(WebpushConfig {
            vapid_private_key: vapid_key,
            vapid_contact_uri: "mailto:admin@example.com".to_string(),
            event_id_only_default: Some(true),
            max_connections: 5,
            allowed_endpoints: vec![],
        }),
    );

    let registry = PushkinRegistry::from_config(&config).unwrap();
    assert_eq!(registry.len(), 1);
    assert!(registry.resolve("com.example.web").is_some());
}
