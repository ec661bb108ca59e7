// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Remote configuration protocol
//!
//! Handles `setConfig` documents received from the broker:
//!
//! 1. Decode the document (malformed input changes nothing)
//! 2. Apply `Remote` fields to a candidate copy of the live record
//! 3. Apply `Broker` fields to a shadow of that candidate; if any changed,
//!    open a trial connection with the shadow settings and promote the shadow
//!    only when the trial publish succeeds
//! 4. Persist the candidate, then copy the changed fields into the live
//!    record and schedule a restart when needed
//!
//! The live session is never touched by a failing trial.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::Value;

use crate::broker::{BrokerConnector, ConnectOptions};
use crate::config::{BrokerSettings, DeviceConfig, LiveConfig};
use crate::error::{Error, Result, TransportError};
use crate::param::{ApplyOutcome, Capability, Document};
use crate::platform::{Restarter, RESTART_GRACE};
use crate::protocol::{status, test_payload, Topics};
use crate::queue::TransportQueue;
use crate::registry::{LoadReport, Registry};
use crate::staged::{StageOutcome, StagedChange, TestGate};
use crate::store::ConfigStore;
use crate::tls::TrustMaterial;

/// Opens a trial connection with candidate settings
pub trait ConnectionTester: Send + Sync {
    /// Connect with `settings` and publish the test marker on their status topic
    fn test(&self, settings: &BrokerSettings, trust: &TrustMaterial) -> std::result::Result<(), TransportError>;
}

/// [`ConnectionTester`] that uses a real [`BrokerConnector`]
pub struct BrokerTester {
    connector: Arc<dyn BrokerConnector>,
    app_name: String,
    hardware_id: String,
    timeout: Duration,
}

impl BrokerTester {
    /// Tester connecting through `connector`
    pub fn new(connector: Arc<dyn BrokerConnector>, app_name: impl Into<String>, hardware_id: impl Into<String>) -> Self {
        Self {
            connector,
            app_name: app_name.into(),
            hardware_id: hardware_id.into(),
            timeout: crate::broker::DEFAULT_TIMEOUT,
        }
    }

    /// Bound on the trial connect and publish
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ConnectionTester for BrokerTester {
    fn test(&self, settings: &BrokerSettings, trust: &TrustMaterial) -> std::result::Result<(), TransportError> {
        // Distinct client id so the trial never takes over the live session
        let client_id = format!(
            "{}-{}-{}-test",
            self.app_name, settings.device_id, self.hardware_id
        );
        let options = ConnectOptions::from_settings(settings, client_id, trust.clone())
            .with_timeout(self.timeout);
        let mut link = self.connector.connect(&options)?;
        let result = link.publish(&Topics::from_settings(settings).up_status(), &test_payload());
        link.disconnect();
        result
    }
}

/// Tunables of the protocol
#[derive(Debug, Clone)]
pub struct RemoteConfigOptions {
    /// Delay between a committed change and the restart
    pub restart_grace: Duration,
}

impl Default for RemoteConfigOptions {
    fn default() -> Self {
        Self {
            restart_grace: RESTART_GRACE,
        }
    }
}

/// What happened to one `setConfig` request
#[derive(Debug, Clone, PartialEq)]
pub struct SetConfigReport {
    /// Per-field outcomes, registry order, fields absent from the document omitted
    pub fields: LoadReport,
    /// Result of the connectivity stage, `None` when no connectivity field changed
    pub connectivity: Option<StageOutcome<Error>>,
    /// Connectivity fields ignored because another trial was in flight
    pub busy: bool,
    /// Whether the candidate record was persisted and made live
    pub committed: bool,
    /// Whether a restart was scheduled
    pub restart_scheduled: bool,
}

impl SetConfigReport {
    /// Outcome recorded for `id`
    pub fn outcome(&self, id: &str) -> Option<ApplyOutcome> {
        self.fields.outcome(id)
    }
}

/// Remote configuration protocol handler
pub struct RemoteConfig {
    registry: Arc<Registry<DeviceConfig>>,
    live: LiveConfig,
    store: ConfigStore,
    tester: Arc<dyn ConnectionTester>,
    restarter: Arc<dyn Restarter>,
    queue: Arc<TransportQueue>,
    gate: Arc<TestGate>,
    options: RemoteConfigOptions,
}

impl RemoteConfig {
    pub fn new(
        registry: Arc<Registry<DeviceConfig>>,
        live: LiveConfig,
        store: ConfigStore,
        tester: Arc<dyn ConnectionTester>,
        restarter: Arc<dyn Restarter>,
        queue: Arc<TransportQueue>,
    ) -> Self {
        Self {
            registry,
            live,
            store,
            tester,
            restarter,
            queue,
            gate: Arc::new(TestGate::new()),
            options: RemoteConfigOptions::default(),
        }
    }

    /// Override the tunables
    pub fn with_options(mut self, options: RemoteConfigOptions) -> Self {
        self.options = options;
        self
    }

    /// Share the in-flight guard with another staged change
    pub fn with_gate(mut self, gate: Arc<TestGate>) -> Self {
        self.gate = gate;
        self
    }

    /// The in-flight guard
    pub fn gate(&self) -> Arc<TestGate> {
        Arc::clone(&self.gate)
    }

    /// Whether a connectivity trial is in flight
    pub fn is_testing(&self) -> bool {
        self.gate.is_busy()
    }

    /// Handle one `setConfig` body
    pub fn apply(&self, payload: &[u8]) -> Result<SetConfigReport> {
        let document = match serde_json::from_slice::<Value>(payload)? {
            Value::Object(document) => document,
            other => {
                return Err(Error::Document(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        };
        Ok(self.apply_document(&document))
    }

    /// Handle one decoded `setConfig` document
    pub fn apply_document(&self, document: &Document) -> SetConfigReport {
        let registry = &self.registry;
        let mut candidate = self.live.snapshot();

        let direct = registry.load_selected(&mut candidate, document, false, |p| {
            p.capability() == Capability::Remote
        });
        let mut shadow = candidate.clone();
        let broker = registry.load_selected(&mut shadow, document, false, |p| {
            p.capability() == Capability::Broker
        });

        let mut report = SetConfigReport {
            fields: self.field_outcomes(document, &direct, &broker),
            connectivity: None,
            busy: false,
            committed: false,
            restart_scheduled: false,
        };

        let mut changed: Vec<&'static str> = direct.updated().collect();
        let mut restart = changed.iter().any(|id| self.restart_required(id));

        if broker.any_updated() {
            let broker_ids: Vec<&'static str> = broker.updated().collect();
            match self.gate.try_enter() {
                None => {
                    warn!("Connectivity change ignored, another test is in flight");
                    report.busy = true;
                    self.queue.push_status(status::CONFIG_TEST_BUSY);
                }
                Some(_guard) => {
                    let trust = TrustMaterial::load(self.store.backend().as_ref());
                    let mut ids = changed.clone();
                    ids.extend(broker_ids.iter().copied());
                    let outcome = StagedChange::stage("broker settings", shadow).run(
                        |s| {
                            self.tester
                                .test(&s.broker_settings(), &trust)
                                .map_err(Error::from)
                        },
                        |s| self.persist_and_promote(&s, &ids),
                        |_| info!("Discarding untested broker settings"),
                    );
                    match &outcome {
                        StageOutcome::Committed => {
                            report.committed = true;
                            restart = true;
                            changed = ids;
                        }
                        StageOutcome::RolledBack(_) => {
                            self.queue.push_status(status::CONFIG_TEST_FAILED);
                        }
                        StageOutcome::CommitFailed(_) => {
                            self.queue.push_status(status::CONFIG_SAVE_FAILED);
                            changed.clear();
                        }
                    }
                    report.connectivity = Some(outcome);
                }
            }
        }

        // Remote-only changes commit without a trial
        if !report.committed && !changed.is_empty() && !matches!(report.connectivity, Some(StageOutcome::CommitFailed(_))) {
            let outcome = StagedChange::stage("device settings", candidate)
                .commit_untested(|c| self.persist_and_promote(&c, &changed));
            if outcome.is_committed() {
                report.committed = true;
            } else {
                self.queue.push_status(status::CONFIG_SAVE_FAILED);
            }
        }

        if report.committed {
            if restart {
                self.queue.push_status(status::CONFIG_UPDATED);
                self.restarter
                    .schedule_restart(self.options.restart_grace, status::CONFIG_UPDATED);
                report.restart_scheduled = true;
            } else {
                self.queue.push_status(status::CONFIG_SAVED);
            }
        }
        report
    }

    fn restart_required(&self, id: &str) -> bool {
        self.registry
            .get(id)
            .map(|p| p.is_restart_required())
            .unwrap_or(false)
    }

    /// Merge the fields `ids` of `record` into the live record and persist it
    fn persist_and_promote(&self, record: &DeviceConfig, ids: &[&'static str]) -> Result<()> {
        self.live
            .commit_fields(&self.registry, &self.store, record, ids)?;
        info!("Committed {} field(s): {}", ids.len(), ids.join(", "));
        Ok(())
    }

    /// Merge per-field outcomes, rejecting fields the channel may not change
    fn field_outcomes(&self, document: &Document, direct: &LoadReport, broker: &LoadReport) -> LoadReport {
        let mut fields = LoadReport::default();
        for param in self.registry.iter() {
            if !document.contains_key(param.id()) {
                continue;
            }
            let outcome = match param.capability() {
                Capability::Remote => direct.outcome(param.id()),
                Capability::Broker => broker.outcome(param.id()),
                Capability::Local => {
                    warn!("{} cannot be changed remotely", param.id());
                    Some(ApplyOutcome::WrongType)
                }
            };
            if let Some(outcome) = outcome {
                fields.outcomes.push((param.id(), outcome));
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::{device_registry, ids};
    use crate::error::StoreError;
    use crate::platform::RecordingRestarter;
    use crate::queue::MessageClass;
    use crate::store::{KeyValueStore, MemoryStore, CONFIG_KEY};
    use serde_json::json;
    use std::sync::Mutex;

    /// Accepts every trial, committing a direct edit through `other` meanwhile
    struct EditDuringTrial {
        other: Mutex<Option<RemoteConfig>>,
    }

    impl ConnectionTester for EditDuringTrial {
        fn test(
            &self,
            _settings: &BrokerSettings,
            _trust: &TrustMaterial,
        ) -> std::result::Result<(), TransportError> {
            if let Some(other) = self.other.lock().unwrap().take() {
                assert!(other.apply(br#"{"relaisDuration": 10}"#).unwrap().committed);
            }
            Ok(())
        }
    }

    struct Fixture {
        broker: MemoryBroker,
        backend: Arc<MemoryStore>,
        restarter: Arc<RecordingRestarter>,
        queue: Arc<TransportQueue>,
        live: LiveConfig,
        remote: RemoteConfig,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(device_registry().unwrap());
        let broker = MemoryBroker::new();
        broker.reachable("broker-a", 1883);
        let backend = Arc::new(MemoryStore::new());
        let store = ConfigStore::new(backend.clone());
        let mut config = DeviceConfig::with_defaults(&registry);
        registry
            .get(ids::MQTT_HOST)
            .unwrap()
            .parse_and_apply(&mut config, "broker-a");
        let live = LiveConfig::new(config);
        let restarter = Arc::new(RecordingRestarter::new());
        let queue = Arc::new(TransportQueue::new());
        let tester = Arc::new(BrokerTester::new(Arc::new(broker.clone()), "solarmon", "aabb"));
        let remote = RemoteConfig::new(
            registry,
            live.clone(),
            store,
            tester,
            restarter.clone(),
            queue.clone(),
        );
        Fixture {
            broker,
            backend,
            restarter,
            queue,
            live,
            remote,
        }
    }

    fn statuses(queue: &TransportQueue) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(message) = queue.peek() {
            if message.class == MessageClass::Status {
                let payload: crate::protocol::StatusPayload =
                    serde_json::from_slice(&message.payload).unwrap();
                texts.push(payload.msg);
            }
            queue.complete_head(true);
        }
        texts
    }

    #[test]
    fn test_malformed_document_changes_nothing() {
        let f = fixture();
        let before = f.live.snapshot();
        assert!(matches!(f.remote.apply(b"{oops"), Err(Error::Document(_))));
        assert!(matches!(f.remote.apply(b"[1,2]"), Err(Error::Document(_))));
        assert_eq!(f.live.snapshot(), before);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_remote_field_applied_without_trial() {
        let f = fixture();
        let report = f.remote.apply(br#"{"liveDataInt": 60}"#).unwrap();
        assert!(report.committed);
        assert!(report.connectivity.is_none());
        assert!(!report.restart_scheduled);
        assert_eq!(f.live.snapshot().live_data_int(), 60);
        assert_eq!(f.broker.connect_attempts(), 0);
        assert!(f.backend.exists(CONFIG_KEY));
        assert_eq!(statuses(&f.queue), vec![status::CONFIG_SAVED.to_string()]);
    }

    #[test]
    fn test_restart_flag_schedules_restart() {
        let f = fixture();
        let report = f.remote.apply(br#"{"logLevel": "debug"}"#).unwrap();
        assert!(report.restart_scheduled);
        assert_eq!(
            f.restarter.requests(),
            vec![(RESTART_GRACE, status::CONFIG_UPDATED.to_string())]
        );
    }

    #[test]
    fn test_unreachable_host_keeps_live_settings() {
        let f = fixture();
        let report = f.remote.apply(br#"{"mqttHost": "broker-b"}"#).unwrap();
        assert!(matches!(report.connectivity, Some(StageOutcome::RolledBack(_))));
        assert!(!report.committed);
        assert_eq!(f.live.snapshot().mqtt_host(), "broker-a");
        assert!(!f.restarter.is_scheduled());
        assert!(!f.backend.exists(CONFIG_KEY));
        assert_eq!(statuses(&f.queue), vec![status::CONFIG_TEST_FAILED.to_string()]);
    }

    #[test]
    fn test_reachable_host_promoted() {
        let f = fixture();
        f.broker.reachable("broker-b", 1883);
        let report = f.remote.apply(br#"{"mqttHost": "broker-b", "timezone": "UTC0"}"#).unwrap();
        assert_eq!(report.connectivity, Some(StageOutcome::Committed));
        assert!(report.restart_scheduled);
        let live = f.live.snapshot();
        assert_eq!(live.mqtt_host(), "broker-b");
        assert_eq!(live.timezone(), "UTC0");
        assert_eq!(
            f.broker.published_on("solarmonitor/0/up/status"),
            vec![br#"{"test":true}"#.to_vec()]
        );
        assert_eq!(f.restarter.requests()[0].0, Duration::from_millis(2000));
    }

    #[test]
    fn test_failed_trial_still_commits_remote_fields() {
        let f = fixture();
        let report = f
            .remote
            .apply(br#"{"mqttServerPort": 8883, "relaisDuration": 10}"#)
            .unwrap();
        assert!(matches!(report.connectivity, Some(StageOutcome::RolledBack(_))));
        assert!(report.committed);
        let live = f.live.snapshot();
        assert_eq!(live.mqtt_server_port(), 1883);
        assert_eq!(live.relais_duration(), 10);
    }

    #[test]
    fn test_unchanged_connectivity_skips_trial() {
        let f = fixture();
        let report = f.remote.apply(br#"{"mqttHost": "broker-a"}"#).unwrap();
        assert_eq!(report.outcome(ids::MQTT_HOST), Some(ApplyOutcome::Unchanged));
        assert!(report.connectivity.is_none());
        assert!(!report.committed);
        assert_eq!(f.broker.connect_attempts(), 0);
    }

    #[test]
    fn test_local_and_invalid_fields_rejected_per_field() {
        let f = fixture();
        let report = f
            .remote
            .apply(br#"{"wifi": false, "controllerNodeId": 250, "timezone": 5, "hasRelais": true}"#)
            .unwrap();
        assert_eq!(report.outcome(ids::WIFI), Some(ApplyOutcome::WrongType));
        assert_eq!(report.outcome(ids::CONTROLLER_NODE_ID), Some(ApplyOutcome::OutOfRange));
        assert_eq!(report.outcome(ids::TIMEZONE), Some(ApplyOutcome::WrongType));
        assert_eq!(report.outcome(ids::HAS_RELAIS), Some(ApplyOutcome::Updated));
        let live = f.live.snapshot();
        assert!(live.wifi());
        assert!(live.has_relais());
        assert_eq!(live.controller_node_id(), 1);
    }

    #[test]
    fn test_save_failure_is_fatal_for_request() {
        let f = fixture();
        f.broker.reachable("broker-b", 1883);
        f.backend.fail_writes(true);
        let report = f.remote.apply(br#"{"mqttHost": "broker-b"}"#).unwrap();
        assert!(matches!(
            report.connectivity,
            Some(StageOutcome::CommitFailed(Error::Store(StoreError::Io { .. })))
        ));
        assert!(!report.committed);
        assert_eq!(f.live.snapshot().mqtt_host(), "broker-a");
        assert!(!f.restarter.is_scheduled());
        assert_eq!(statuses(&f.queue), vec![status::CONFIG_SAVE_FAILED.to_string()]);
    }

    #[test]
    fn test_edit_during_trial_survives_promotion() {
        let registry = Arc::new(device_registry().unwrap());
        let backend = Arc::new(MemoryStore::new());
        let store = ConfigStore::new(backend.clone());
        let live = LiveConfig::new(DeviceConfig::with_defaults(&registry));
        let other = RemoteConfig::new(
            registry.clone(),
            live.clone(),
            store.clone(),
            Arc::new(BrokerTester::new(Arc::new(MemoryBroker::new()), "solarmon", "aabb")),
            Arc::new(RecordingRestarter::new()),
            Arc::new(TransportQueue::new()),
        );
        let remote = RemoteConfig::new(
            registry,
            live.clone(),
            store,
            Arc::new(EditDuringTrial {
                other: Mutex::new(Some(other)),
            }),
            Arc::new(RecordingRestarter::new()),
            Arc::new(TransportQueue::new()),
        );

        let report = remote.apply(br#"{"mqttHost": "broker-b"}"#).unwrap();
        assert_eq!(report.connectivity, Some(StageOutcome::Committed));
        let current = live.snapshot();
        assert_eq!(current.mqtt_host(), "broker-b");
        assert_eq!(current.relais_duration(), 10);

        let saved: Value = serde_json::from_slice(&backend.read(CONFIG_KEY).unwrap()).unwrap();
        assert_eq!(saved[ids::MQTT_HOST], json!("broker-b"));
        assert_eq!(saved[ids::RELAIS_DURATION], json!(10));
    }

    #[test]
    fn test_connectivity_rejected_while_trial_in_flight() {
        let f = fixture();
        f.broker.reachable("broker-b", 1883);
        let _held = f.remote.gate.try_enter().unwrap();
        let report = f
            .remote
            .apply(br#"{"mqttHost": "broker-b", "hasRelais": true}"#)
            .unwrap();
        assert!(report.busy);
        assert!(report.connectivity.is_none());
        let live = f.live.snapshot();
        assert_eq!(live.mqtt_host(), "broker-a");
        assert!(live.has_relais());
    }
}
