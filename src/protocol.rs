// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Broker protocol definitions
//!
//! Topic layout, inbound commands and the small JSON payloads exchanged on
//! the status topic.
//!
//! Outbound: `{prefix}/{deviceId}/up/{data|config|status}`.
//! Inbound: `{prefix}/{deviceId}/down/{command}` and `{prefix}/down/{command}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::BrokerSettings;
use crate::error::TransportError;

/// Maximum length of a status text, in characters
pub const MAX_STATUS_CHARS: usize = 200;

/// Status texts reported on `up/status`
pub mod status {
    pub const CONFIG_UPDATED: &str = "configuration updated - rebooting shortly";
    pub const CONFIG_SAVED: &str = "configuration updated";
    pub const CONFIG_TEST_FAILED: &str = "configuration test failed - keeping current settings";
    pub const CONFIG_TEST_BUSY: &str = "configuration test in progress - connection settings ignored";
    pub const CONFIG_SAVE_FAILED: &str = "Error saving configuration";
    pub const CA_INSTALLED: &str = "installed and tested new CA - rebooting shortly";
    pub const CA_TEST_FAILED: &str = "Connecting using the new CA failed - reverting";
    pub const CERT_WRITE_FAILED: &str = "Error writing cert to FS";
    pub const CA_REMOVE_FAILED: &str = "Could not remove original CA - giving up";
    pub const CA_REPLACE_PANIC: &str = "Could not replace original CA with new CA - PANIC - giving up";
    pub const ROOT_CA_INSTALLED: &str = "installed new root CA";
    pub const WIFI_RESET: &str = "resetting wifi - rebooting shortly";
    pub const REBOOTING: &str = "rebooting";
    pub const DISCONNECTED: &str = "disconnected";
}

/// Severity of a status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Severity {
    /// Informational event
    #[default]
    Info = 1,
    /// Low importance
    Low = 2,
    /// Medium importance
    Medium = 3,
    /// High importance
    High = 4,
    /// Device may be unreachable
    Critical = 5,
}

impl Severity {
    /// Level used when logging the event locally
    pub fn log_level(&self) -> log::Level {
        match self {
            Severity::Info | Severity::Low => log::Level::Info,
            Severity::Medium => log::Level::Warn,
            Severity::High | Severity::Critical => log::Level::Error,
        }
    }
}

/// Topic names for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    device_id: u16,
}

impl Topics {
    /// Topics under `prefix` for `device_id`
    pub fn new(prefix: impl Into<String>, device_id: u16) -> Self {
        Self {
            prefix: prefix.into(),
            device_id,
        }
    }

    /// Topics derived from broker settings
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(settings.topic.clone(), settings.device_id)
    }

    fn up(&self, kind: &str) -> String {
        format!("{}/{}/up/{}", self.prefix, self.device_id, kind)
    }

    /// Telemetry topic
    pub fn up_data(&self) -> String {
        self.up("data")
    }

    /// Configuration snapshot topic
    pub fn up_config(&self) -> String {
        self.up("config")
    }

    /// Status text topic
    pub fn up_status(&self) -> String {
        self.up("status")
    }

    /// Device-specific command filter
    pub fn down_device(&self) -> String {
        format!("{}/{}/down/#", self.prefix, self.device_id)
    }

    /// Device-agnostic command filter
    pub fn down_all(&self) -> String {
        format!("{}/down/#", self.prefix)
    }

    /// Command name of an inbound topic, `None` if the topic is not ours
    pub fn command_name<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let device = self.device_id.to_string();
        let rest = match rest.strip_prefix(device.as_str()) {
            Some(r) if r.starts_with('/') => &r[1..],
            _ => rest,
        };
        rest.strip_prefix("down/").filter(|name| !name.is_empty())
    }
}

/// Commands accepted on the `down` topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Re-publish the configuration snapshot
    GetConfig,
    /// Apply a field document
    SetConfig,
    /// Replace the broker trust anchor (tested)
    InstallMqttRootCa,
    /// Replace the generic root certificate (untested)
    InstallRootCa,
    /// Forget wireless credentials
    ResetWifi,
    /// Restart the device
    Reboot,
}

impl Command {
    /// Exact-match lookup; unknown names yield `None`
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "getConfig" => Some(Self::GetConfig),
            "setConfig" => Some(Self::SetConfig),
            "installMqttRootCa" => Some(Self::InstallMqttRootCa),
            "installRootCa" => Some(Self::InstallRootCa),
            "resetWifi" => Some(Self::ResetWifi),
            "reboot" => Some(Self::Reboot),
            _ => None,
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetConfig => "getConfig",
            Self::SetConfig => "setConfig",
            Self::InstallMqttRootCa => "installMqttRootCa",
            Self::InstallRootCa => "installRootCa",
            Self::ResetWifi => "resetWifi",
            Self::Reboot => "reboot",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{"msg": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub msg: String,
}

/// `{"online": true, "connectionAttempts": n}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlinePayload {
    pub online: bool,
    pub connection_attempts: u32,
}

/// `{"test": true}`, published by trial connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPayload {
    pub test: bool,
}

/// Serialized status payload; texts over [`MAX_STATUS_CHARS`] are refused
pub fn status_payload(text: &str) -> Result<Vec<u8>, TransportError> {
    let chars = text.chars().count();
    if chars > MAX_STATUS_CHARS {
        return Err(TransportError::PayloadTooLarge {
            size: chars,
            max: MAX_STATUS_CHARS,
        });
    }
    to_bytes(&StatusPayload {
        msg: text.to_string(),
    })
}

/// Serialized online announcement
pub fn online_payload(connection_attempts: u32) -> Vec<u8> {
    to_bytes(&OnlinePayload {
        online: true,
        connection_attempts,
    })
    .unwrap_or_default()
}

/// Serialized trial marker
pub fn test_payload() -> Vec<u8> {
    to_bytes(&TestPayload { test: true }).unwrap_or_default()
}

/// Serialized last will
pub fn last_will_payload() -> Vec<u8> {
    to_bytes(&StatusPayload {
        msg: status::DISCONNECTED.to_string(),
    })
    .unwrap_or_default()
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Malformed(e.to_string()))
}
