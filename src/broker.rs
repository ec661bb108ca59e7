// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Broker connection abstraction
//!
//! The session manager and the trial connections of the configuration
//! protocol talk to the broker through [`BrokerConnector`] and [`BrokerLink`].
//! Implementations:
//! - [`memory::MemoryBroker`]: in-process broker for tests and simulation
//! - [`tcp::TcpConnector`]: MQTT 3.1.1 over TCP, optionally TLS

pub mod memory;
pub mod mqtt;
pub mod tcp;

use std::time::Duration;

use crate::config::BrokerSettings;
use crate::error::TransportError;
use crate::tls::TrustMaterial;

/// Default connect and publish timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Message the broker publishes on our behalf if we vanish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Everything needed to open one broker session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    /// Skip server certificate validation
    pub insecure: bool,
    pub trust: TrustMaterial,
    pub last_will: Option<LastWill>,
    pub keep_alive: Duration,
    /// Bound on connect and on each blocking operation
    pub timeout: Duration,
}

impl ConnectOptions {
    /// Options for `settings`, without last will
    pub fn from_settings(settings: &BrokerSettings, client_id: impl Into<String>, trust: TrustMaterial) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            host: settings.host.clone(),
            port: settings.port,
            client_id: client_id.into(),
            username: non_empty(&settings.username),
            password: non_empty(&settings.password),
            use_tls: settings.use_tls,
            insecure: settings.insecure,
            trust,
            last_will: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the last will
    pub fn with_last_will(mut self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        self.last_will = Some(LastWill {
            topic: topic.into(),
            payload: payload.into(),
        });
        self
    }

    /// Set the connect and operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the server certificate must be validated
    pub fn validates_certificate(&self) -> bool {
        self.use_tls && !self.insecure
    }
}

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// One open broker session
pub trait BrokerLink: Send {
    /// Publish `payload` on `topic` (at most once)
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to a topic filter
    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Next inbound message if one is ready; never blocks for long
    fn poll(&mut self) -> Result<Option<InboundMessage>, TransportError>;

    /// Whether the session is still usable
    fn is_connected(&self) -> bool;

    /// Close the session
    fn disconnect(&mut self);
}

/// Opens broker sessions
pub trait BrokerConnector: Send + Sync {
    /// Open a session; blocks at most `options.timeout`
    fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn BrokerLink>, TransportError>;
}

/// MQTT topic filter match (`+` one level, `#` remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("solarmonitor/7/down/#", "solarmonitor/7/down/setConfig"));
        assert!(topic_matches("solarmonitor/down/#", "solarmonitor/down/reboot"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("solarmonitor/7/down/#", "solarmonitor/8/down/reboot"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn test_options_from_settings() {
        let settings = BrokerSettings {
            device_id: 3,
            topic: "t".to_string(),
            host: "broker".to_string(),
            port: 8883,
            username: String::new(),
            password: "secret".to_string(),
            use_tls: true,
            insecure: false,
        };
        let options = ConnectOptions::from_settings(&settings, "app-3-aa", TrustMaterial::new())
            .with_last_will("t/3/up/status", b"bye".to_vec());
        assert_eq!(options.username, None);
        assert_eq!(options.password.as_deref(), Some("secret"));
        assert!(options.validates_certificate());
        assert_eq!(options.last_will.unwrap().topic, "t/3/up/status");
    }
}
