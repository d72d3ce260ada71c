//! Typed startup configuration, loaded once from YAML (§6).
//!
//! Mirrors the teacher's `FederationConfig::from_env` pattern (environment
//! overrides with sane defaults) but for the gateway the bulk of
//! configuration -- per-app pushkin definitions -- only makes sense as a
//! document, so it is loaded from a YAML file and validated before the HTTP
//! listener ever binds.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Keyed by `app_id_pattern` (§3): an exact `app_id`, or a glob
    /// containing `*`, resolved by `PushkinRegistry` at routing time.
    pub apps: HashMap<String, AppConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AppConfig {
    Apns(ApnsConfig),
    Gcm(GcmConfig),
    Webpush(WebpushConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApnsConfig {
    pub certfile: Option<String>,
    pub keyfile: Option<String>,
    pub key_id: Option<String>,
    pub team_id: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub platform: ApnsPlatform,
    #[serde(default)]
    pub event_id_only: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Overrides the `api.push.apple.com` / `api.sandbox.push.apple.com` host;
    /// used by tests to point at a stub server.
    pub endpoint_override: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApnsPlatform {
    #[default]
    Production,
    Sandbox,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcmConfig {
    pub service_account_file: Option<String>,
    pub api_key: Option<String>,
    pub project_id: String,
    #[serde(default)]
    pub event_id_only: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    pub endpoint_override: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebpushConfig {
    pub vapid_private_key: String,
    pub vapid_contact_uri: String,
    #[serde(default)]
    pub event_id_only_default: Option<bool>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
}

fn default_max_connections() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addresses")]
    pub bind_addresses: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ingress_timeout_secs")]
    pub ingress_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addresses: default_bind_addresses(),
            port: default_port(),
            ingress_timeout_secs: default_ingress_timeout_secs(),
        }
    }
}

fn default_bind_addresses() -> Vec<String> {
    vec!["0.0.0.0".to_string()]
}

fn default_port() -> u16 {
    5000
}

fn default_ingress_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    pub setup: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,
    pub address: Option<String>,
    pub port: Option<u16>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: None,
            port: None,
        }
    }
}

/// Everything that can go wrong loading or validating the config document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config for app '{app_id}': {reason}")]
    Invalid { app_id: String, reason: String },
}

impl GatewayConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: GatewayConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on config that would otherwise blow up lazily on first
    /// dispatch -- every app must carry enough auth material for its type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (app_id, app) in &self.apps {
            match app {
                AppConfig::Apns(cfg) => {
                    let has_cert = cfg.certfile.is_some();
                    let has_token_auth =
                        cfg.keyfile.is_some() && cfg.key_id.is_some() && cfg.team_id.is_some();
                    if !has_cert && !has_token_auth {
                        return Err(ConfigError::Invalid {
                            app_id: app_id.clone(),
                            reason: "apns apps require either certfile, or keyfile+key_id+team_id"
                                .to_string(),
                        });
                    }
                }
                AppConfig::Gcm(cfg) => {
                    if cfg.service_account_file.is_none() && cfg.api_key.is_none() {
                        return Err(ConfigError::Invalid {
                            app_id: app_id.clone(),
                            reason: "gcm apps require either service_account_file or api_key"
                                .to_string(),
                        });
                    }
                    if cfg.project_id.trim().is_empty() {
                        return Err(ConfigError::Invalid {
                            app_id: app_id.clone(),
                            reason: "gcm apps require a non-empty project_id".to_string(),
                        });
                    }
                }
                AppConfig::Webpush(cfg) => {
                    if cfg.vapid_private_key.trim().is_empty() {
                        return Err(ConfigError::Invalid {
                            app_id: app_id.clone(),
                            reason: "webpush apps require vapid_private_key".to_string(),
                        });
                    }
                    if cfg.vapid_contact_uri.trim().is_empty() {
                        return Err(ConfigError::Invalid {
                            app_id: app_id.clone(),
                            reason: "webpush apps require vapid_contact_uri".to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
