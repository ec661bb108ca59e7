// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Device configuration record
//!
//! [`DeviceConfig`] has no public setters: every field is written through its
//! descriptor in [`device_registry`]. The process-wide live instance is shared
//! behind [`LiveConfig`], a single-writer lock.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{self, ParamError};
use crate::param::{Capability, Document, Parameter};
use crate::registry::Registry;
use crate::store::ConfigStore;

/// Parameter identifiers (file and wire keys)
pub mod ids {
    pub const DEVICE_ID: &str = "deviceId";
    pub const MQTT_TOPIC: &str = "mqttTopic";
    pub const MQTT_USERNAME: &str = "mqttUsername";
    pub const MQTT_PASSWORD: &str = "mqttPassword";
    pub const MQTT_HOST: &str = "mqttHost";
    pub const MQTT_SERVER_PORT: &str = "mqttServerPort";
    pub const MQTT_USE_TLS: &str = "mqttUseTls";
    pub const MQTT_INSECURE: &str = "mqttInsecure";
    pub const TIMEZONE: &str = "timezone";
    pub const CONTROLLER_NODE_ID: &str = "controllerNodeId";
    pub const HAS_RELAIS: &str = "hasRelais";
    pub const RELAIS_DURATION: &str = "relaisDuration";
    pub const HAS_LORA: &str = "hasLora";
    pub const WIFI: &str = "wifi";
    pub const LIVE_DATA_INT: &str = "liveDataInt";
    pub const STATS_DATA_INT: &str = "statsDataInt";
    pub const TEMP_OFFSET: &str = "tempOffset";
    pub const LOW_BATTERY_V: &str = "lowBatteryV";
    pub const LOG_LEVEL: &str = "logLevel";
}

/// Fields never published in the configuration snapshot
pub const SNAPSHOT_EXCLUDED: &[&str] = &[ids::DEVICE_ID, ids::MQTT_PASSWORD];

/// Labels of [`LogLevel`], indexed by ordinal
pub const LOG_LEVEL_LABELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Default verbosity of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    /// Level for a stored ordinal
    pub fn from_ordinal(ordinal: u16) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Error),
            1 => Some(Self::Warn),
            2 => Some(Self::Info),
            3 => Some(Self::Debug),
            4 => Some(Self::Trace),
            _ => None,
        }
    }

    /// Label used in files and filters
    pub fn as_str(&self) -> &'static str {
        LOG_LEVEL_LABELS[*self as usize]
    }

    /// Matching `log` filter
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

/// The device configuration record
///
/// `Default` yields a blank record; use [`DeviceConfig::with_defaults`] for a
/// record initialised from the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    device_id: u16,
    mqtt_topic: String,
    mqtt_username: String,
    mqtt_password: String,
    mqtt_host: String,
    mqtt_server_port: u16,
    mqtt_use_tls: bool,
    mqtt_insecure: bool,
    timezone: String,
    controller_node_id: u8,
    has_relais: bool,
    relais_duration: u8,
    has_lora: bool,
    wifi: bool,
    live_data_int: u32,
    stats_data_int: u32,
    temp_offset: i16,
    low_battery_v: f32,
    log_level: LogLevel,
}

impl DeviceConfig {
    /// Record with every descriptor's default applied
    pub fn with_defaults(registry: &Registry<DeviceConfig>) -> Self {
        let mut config = Self::default();
        registry.fill_defaults(&mut config);
        config
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_username(&self) -> &str {
        &self.mqtt_username
    }

    pub fn mqtt_password(&self) -> &str {
        &self.mqtt_password
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_server_port(&self) -> u16 {
        self.mqtt_server_port
    }

    pub fn mqtt_use_tls(&self) -> bool {
        self.mqtt_use_tls
    }

    pub fn mqtt_insecure(&self) -> bool {
        self.mqtt_insecure
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn controller_node_id(&self) -> u8 {
        self.controller_node_id
    }

    pub fn has_relais(&self) -> bool {
        self.has_relais
    }

    pub fn relais_duration(&self) -> u8 {
        self.relais_duration
    }

    pub fn has_lora(&self) -> bool {
        self.has_lora
    }

    pub fn wifi(&self) -> bool {
        self.wifi
    }

    /// Live data interval in seconds, zero disables
    pub fn live_data_int(&self) -> u32 {
        self.live_data_int
    }

    /// Statistics interval in seconds, zero disables
    pub fn stats_data_int(&self) -> u32 {
        self.stats_data_int
    }

    /// Heatsink temperature correction in hundredths of a degree
    pub fn temp_offset(&self) -> i16 {
        self.temp_offset
    }

    /// Low battery warning threshold in volts, zero disables
    pub fn low_battery_v(&self) -> f32 {
        self.low_battery_v
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Connectivity view of this record
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            device_id: self.device_id,
            topic: self.mqtt_topic.clone(),
            host: self.mqtt_host.clone(),
            port: self.mqtt_server_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            use_tls: self.mqtt_use_tls,
            insecure: self.mqtt_insecure,
        }
    }
}

/// The schema of [`DeviceConfig`]
pub fn device_registry() -> Result<Registry<DeviceConfig>, ParamError> {
    type P = Parameter<DeviceConfig>;

    let params = [
        P::unsigned(
            ids::DEVICE_ID,
            "Device ID",
            |c| c.device_id.into(),
            |c, v| c.device_id = v as u16,
            0,
            0,
            u16::MAX.into(),
        )
        .with_capability(Capability::Broker),
        P::text(
            ids::MQTT_TOPIC,
            "MQTT topic prefix",
            |c| c.mqtt_topic.as_str(),
            |c, v| c.mqtt_topic = v,
            "solarmonitor",
            32,
        )
        .with_capability(Capability::Broker),
        P::text(
            ids::MQTT_USERNAME,
            "MQTT username",
            |c| c.mqtt_username.as_str(),
            |c, v| c.mqtt_username = v,
            "solarmonitor",
            32,
        )
        .with_capability(Capability::Broker),
        P::text(
            ids::MQTT_PASSWORD,
            "MQTT password",
            |c| c.mqtt_password.as_str(),
            |c, v| c.mqtt_password = v,
            "solarmonitor",
            64,
        )
        .with_capability(Capability::Broker),
        P::text(
            ids::MQTT_HOST,
            "MQTT host",
            |c| c.mqtt_host.as_str(),
            |c, v| c.mqtt_host = v,
            "127.0.0.1",
            64,
        )
        .with_capability(Capability::Broker),
        P::unsigned(
            ids::MQTT_SERVER_PORT,
            "MQTT port",
            |c| c.mqtt_server_port.into(),
            |c, v| c.mqtt_server_port = v as u16,
            1883,
            1,
            u16::MAX.into(),
        )
        .with_capability(Capability::Broker),
        P::boolean(
            ids::MQTT_USE_TLS,
            "MQTT use TLS",
            |c| c.mqtt_use_tls,
            |c, v| c.mqtt_use_tls = v,
            false,
        )
        .with_capability(Capability::Broker),
        P::boolean(
            ids::MQTT_INSECURE,
            "MQTT skip certificate check",
            |c| c.mqtt_insecure,
            |c, v| c.mqtt_insecure = v,
            false,
        )
        .with_capability(Capability::Broker),
        P::text(
            ids::TIMEZONE,
            "Timezone",
            |c| c.timezone.as_str(),
            |c, v| c.timezone = v,
            "NZST-12NZDT,M9.5.0,M4.1.0/3",
            30,
        )
        .with_capability(Capability::Remote),
        P::unsigned(
            ids::CONTROLLER_NODE_ID,
            "Controller node ID",
            |c| c.controller_node_id.into(),
            |c, v| c.controller_node_id = v as u8,
            1,
            1,
            247,
        )
        .with_capability(Capability::Remote)
        .restart_required(),
        P::boolean(
            ids::HAS_RELAIS,
            "Relais fitted",
            |c| c.has_relais,
            |c, v| c.has_relais = v,
            false,
        )
        .with_capability(Capability::Remote),
        P::unsigned(
            ids::RELAIS_DURATION,
            "Relais duration (s)",
            |c| c.relais_duration.into(),
            |c, v| c.relais_duration = v as u8,
            3,
            1,
            60,
        )
        .with_capability(Capability::Remote),
        P::boolean(
            ids::HAS_LORA,
            "LoRa fitted",
            |c| c.has_lora,
            |c, v| c.has_lora = v,
            false,
        )
        .restart_required(),
        P::boolean(ids::WIFI, "WiFi enabled", |c| c.wifi, |c, v| c.wifi = v, true)
            .restart_required(),
        P::unsigned(
            ids::LIVE_DATA_INT,
            "Live data interval (s)",
            |c| c.live_data_int.into(),
            |c, v| c.live_data_int = v as u32,
            300,
            10,
            u32::MAX.into(),
        )
        .allow_zero()
        .with_capability(Capability::Remote),
        P::unsigned(
            ids::STATS_DATA_INT,
            "Statistics interval (s)",
            |c| c.stats_data_int.into(),
            |c, v| c.stats_data_int = v as u32,
            3600,
            60,
            u32::MAX.into(),
        )
        .allow_zero()
        .with_capability(Capability::Remote),
        P::signed(
            ids::TEMP_OFFSET,
            "Temperature offset (0.01 C)",
            |c| c.temp_offset.into(),
            |c, v| c.temp_offset = v as i16,
            0,
            -1000,
            1000,
        )
        .with_capability(Capability::Remote),
        P::float(
            ids::LOW_BATTERY_V,
            "Low battery warning (V)",
            |c| c.low_battery_v,
            |c, v| c.low_battery_v = v,
            11.5,
            9.0,
            16.0,
            2,
        )
        .allow_zero()
        .with_capability(Capability::Remote),
        P::enumeration(
            ids::LOG_LEVEL,
            "Log level",
            |c| c.log_level as u16,
            |c, v| c.log_level = LogLevel::from_ordinal(v).unwrap_or_default(),
            LogLevel::Info as u16,
            LOG_LEVEL_LABELS,
            0,
            (LOG_LEVEL_LABELS.len() - 1) as u16,
        )
        .with_capability(Capability::Remote)
        .restart_required(),
    ];

    let mut registry = Registry::new();
    for param in params {
        registry.push(param)?;
    }
    Ok(registry)
}

/// Configuration snapshot published on `up/config`
///
/// Every descriptor except [`SNAPSHOT_EXCLUDED`], plus `appVersion`.
pub fn config_snapshot(
    registry: &Registry<DeviceConfig>,
    config: &DeviceConfig,
    app_version: &str,
) -> Document {
    let mut document = Document::new();
    document.insert("appVersion".to_string(), app_version.into());
    for param in registry
        .iter()
        .filter(|p| !SNAPSHOT_EXCLUDED.contains(&p.id()))
    {
        param.encode(config, &mut document);
    }
    document
}

/// Broker connectivity settings extracted from a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub device_id: u16,
    pub topic: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub insecure: bool,
}

impl BrokerSettings {
    /// Loopback or unset host: the device runs without a broker
    pub fn is_local_only(&self) -> bool {
        let host = self.host.trim();
        host.is_empty() || host == "127.0.0.1" || host == "localhost"
    }

    /// Whether the server certificate must be validated
    pub fn validates_certificate(&self) -> bool {
        self.use_tls && !self.insecure
    }
}

/// Shared handle on the live configuration record
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    inner: Arc<RwLock<DeviceConfig>>,
}

impl LiveConfig {
    /// Wrap an initial record
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> DeviceConfig {
        self.read(DeviceConfig::clone)
    }

    /// Run `f` with shared access
    pub fn read<R>(&self, f: impl FnOnce(&DeviceConfig) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&*guard)
    }

    /// Run `f` with exclusive access; callers mutate through descriptors only
    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceConfig) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard)
    }

    /// Broker settings of the current record
    pub fn broker_settings(&self) -> BrokerSettings {
        self.read(DeviceConfig::broker_settings)
    }

    /// Copy the fields `ids` of `source` onto the current record, persist the
    /// merged record and make it live
    ///
    /// The lock is held from merge to swap, so fields outside `ids` keep their
    /// current values on storage as well as in memory. A failed save leaves
    /// the live record untouched.
    pub fn commit_fields(
        &self,
        registry: &Registry<DeviceConfig>,
        store: &ConfigStore,
        source: &DeviceConfig,
        ids: &[&str],
    ) -> error::Result<()> {
        self.update(|live| -> error::Result<()> {
            let mut merged = live.clone();
            for param in ids.iter().filter_map(|id| registry.get(id)) {
                param.copy_value(source, &mut merged);
            }
            store.save(registry, &merged)?;
            *live = merged;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    #[test]
    fn test_registry_builds() {
        let registry = device_registry().unwrap();
        assert_eq!(registry.len(), 19);
        assert_eq!(registry.select_by_capability(Capability::Broker).count(), 8);
        assert_eq!(registry.select_by_capability(Capability::Local).count(), 2);
    }

    #[test]
    fn test_defaults() {
        let registry = device_registry().unwrap();
        let config = DeviceConfig::with_defaults(&registry);
        assert_eq!(config.mqtt_host(), "127.0.0.1");
        assert_eq!(config.mqtt_server_port(), 1883);
        assert_eq!(config.timezone(), "NZST-12NZDT,M9.5.0,M4.1.0/3");
        assert_eq!(config.live_data_int(), 300);
        assert_eq!(config.log_level(), LogLevel::Info);
        assert_relative_eq!(config.low_battery_v(), 11.5);
        assert!(config.wifi());
        assert!(registry.validate(&config).is_ok());
    }

    #[test]
    fn test_every_field_has_one_descriptor() {
        let registry = device_registry().unwrap();
        let blank = DeviceConfig::default();
        let defaults = DeviceConfig::with_defaults(&registry);
        // Copying every field one descriptor at a time must rebuild the record
        let mut rebuilt = blank.clone();
        for param in registry.iter() {
            param.copy_value(&defaults, &mut rebuilt);
        }
        assert_eq!(rebuilt, defaults);
    }

    #[test]
    fn test_log_level_label_and_ordinal() {
        let registry = device_registry().unwrap();
        let mut config = DeviceConfig::with_defaults(&registry);
        let param = registry.get(ids::LOG_LEVEL).unwrap();
        assert_eq!(param.render(&config), "info");
        assert!(param.parse_and_apply(&mut config, "debug").is_updated());
        assert_eq!(config.log_level(), LogLevel::Debug);
        assert_eq!(config.log_level().to_level_filter(), log::LevelFilter::Debug);
        assert_eq!(param.ordinal(&config).unwrap(), 3);
    }

    #[test]
    fn test_snapshot_excludes_secrets() {
        let registry = device_registry().unwrap();
        let config = DeviceConfig::with_defaults(&registry);
        let snapshot = config_snapshot(&registry, &config, "1.2.3");
        assert_eq!(snapshot["appVersion"], json!("1.2.3"));
        assert!(!snapshot.contains_key(ids::DEVICE_ID));
        assert!(!snapshot.contains_key(ids::MQTT_PASSWORD));
        assert_eq!(snapshot[ids::MQTT_HOST], json!("127.0.0.1"));
        assert_eq!(snapshot[ids::LOG_LEVEL], json!(2));
    }

    #[test]
    fn test_broker_settings_local_only() {
        let registry = device_registry().unwrap();
        let mut config = DeviceConfig::with_defaults(&registry);
        assert!(config.broker_settings().is_local_only());
        registry
            .get(ids::MQTT_HOST)
            .unwrap()
            .parse_and_apply(&mut config, "broker.example.org");
        let settings = config.broker_settings();
        assert!(!settings.is_local_only());
        assert!(!settings.validates_certificate());
    }

    #[test]
    fn test_live_config_update() {
        let registry = device_registry().unwrap();
        let live = LiveConfig::new(DeviceConfig::with_defaults(&registry));
        let param = registry.get(ids::MQTT_SERVER_PORT).unwrap();
        let outcome = live.update(|c| param.parse_and_apply(c, "8883"));
        assert!(outcome.is_updated());
        assert_eq!(live.broker_settings().port, 8883);
        assert_eq!(live.snapshot().mqtt_server_port(), 8883);
    }

    #[test]
    fn test_commit_fields_merges_onto_current_record() {
        let registry = device_registry().unwrap();
        let backend = Arc::new(crate::store::MemoryStore::new());
        let store = ConfigStore::new(backend.clone());
        let live = LiveConfig::new(DeviceConfig::with_defaults(&registry));

        // Request built from a copy taken before another writer changed the record
        let mut source = live.snapshot();
        registry.get(ids::MQTT_HOST).unwrap().parse_and_apply(&mut source, "broker-b");
        live.update(|c| {
            registry
                .get(ids::RELAIS_DURATION)
                .unwrap()
                .parse_and_apply(c, "10")
        });

        live.commit_fields(&registry, &store, &source, &[ids::MQTT_HOST])
            .unwrap();
        let current = live.snapshot();
        assert_eq!(current.mqtt_host(), "broker-b");
        assert_eq!(current.relais_duration(), 10);

        let mut persisted = DeviceConfig::default();
        store.load(&registry, &mut persisted).unwrap();
        assert_eq!(persisted, current);
    }

    #[test]
    fn test_commit_fields_save_failure_keeps_live() {
        let registry = device_registry().unwrap();
        let backend = Arc::new(crate::store::MemoryStore::new());
        backend.fail_writes(true);
        let store = ConfigStore::new(backend);
        let live = LiveConfig::new(DeviceConfig::with_defaults(&registry));
        let mut source = live.snapshot();
        registry.get(ids::MQTT_HOST).unwrap().parse_and_apply(&mut source, "broker-b");
        assert!(live
            .commit_fields(&registry, &store, &source, &[ids::MQTT_HOST])
            .is_err());
        assert_eq!(live.snapshot().mqtt_host(), "127.0.0.1");
    }
}
