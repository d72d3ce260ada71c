//! Wire types for the ingress notification contract (`POST /_matrix/push/v1/notify`).

use serde::{Deserialize, Serialize};

/// The envelope the home server posts: `{"notification": <Notification>}`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyRequest {
    pub notification: Notification,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub event_id: Option<String>,
    pub room_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub sender: Option<String>,
    pub sender_display_name: Option<String>,
    pub room_name: Option<String>,
    pub room_alias: Option<String>,
    #[serde(default = "default_prio")]
    pub prio: Priority,
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub counts: Counts,
    pub devices: Vec<Device>,
}

fn default_prio() -> Priority {
    Priority::High
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Counts {
    pub unread: Option<u64>,
    pub missed_calls: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub app_id: String,
    pub pushkey: String,
    pub pushkey_ts: Option<u64>,
    pub data: Option<serde_json::Value>,
    pub tweaks: Option<Tweaks>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tweaks {
    pub sound: Option<String>,
    #[serde(default)]
    pub highlight: bool,
}

/// The gateway's reply: `{"rejected": [<pushkey>, ...]}`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NotifyResponse {
    pub rejected: Vec<String>,
}

impl Notification {
    /// Validate the shape the dispatcher requires before any dispatch begins.
    ///
    /// Returns the index of the first offending device, if any, alongside a
    /// human-readable reason -- used to build a 400 without dispatching
    /// anything (spec §8: "devices entry missing pushkey -> 400; no other
    /// devices dispatched").
    pub fn validate(&self) -> Result<(), String> {
        if self.devices.is_empty() {
            return Err("notification.devices must not be empty".to_string());
        }
        for (idx, device) in self.devices.iter().enumerate() {
            if device.app_id.trim().is_empty() {
                return Err(format!("devices[{idx}].app_id is required"));
            }
            if device.pushkey.trim().is_empty() {
                return Err(format!("devices[{idx}].pushkey is required"));
            }
        }
        Ok(())
    }
}
