// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Device agent
//!
//! Composition root of the library. The agent loads the configuration
//! record, owns the transport queue and the protocol handlers, and
//! dispatches inbound commands:
//!
//! | command             | action                                     |
//! |---------------------|--------------------------------------------|
//! | `getConfig`         | enqueue a configuration snapshot           |
//! | `setConfig`         | remote configuration protocol (worker)     |
//! | `installMqttRootCa` | certificate installer (worker)             |
//! | `installRootCa`     | write the generic root authority           |
//! | `resetWifi`         | forget wireless credentials and restart    |
//! | `reboot`            | restart after a short grace period         |
//!
//! Commands that open trial connections run on worker threads so the
//! session loop keeps draining the queue meanwhile.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::broker::{BrokerConnector, InboundMessage};
use crate::certs::CertificateInstaller;
use crate::config::{config_snapshot, device_registry, DeviceConfig, LiveConfig};
use crate::error::{Result, TransportError};
use crate::param::ApplyOutcome;
use crate::platform::{LinkControl, Restarter, REBOOT_GRACE, RESTART_GRACE};
use crate::protocol::{status, Command, Topics};
use crate::queue::{OutboundMessage, QueueConfig, TransportQueue};
use crate::registry::Registry;
use crate::remote::{BrokerTester, ConnectionTester, RemoteConfig, RemoteConfigOptions};
use crate::session::{InboundHandler, SessionConfig, SessionManager};
use crate::staged::TestGate;
use crate::store::{ConfigLoad, ConfigStore};
use crate::telemetry::{ChargeController, Sample, TelemetryCollector};

/// Agent tunables
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Reported as `appVersion` in snapshots
    pub app_version: String,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub remote: RemoteConfigOptions,
    /// Bound on trial connections
    pub test_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_version: crate::VERSION.to_string(),
            queue: QueueConfig::default(),
            session: SessionConfig::default(),
            remote: RemoteConfigOptions::default(),
            test_timeout: crate::broker::DEFAULT_TIMEOUT,
        }
    }
}

/// One descriptor as listed by the local portal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    pub id: &'static str,
    pub label: &'static str,
    pub kind: &'static str,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<&'static [&'static str]>,
    pub remote: bool,
    pub restart_required: bool,
}

/// The device agent
pub struct Agent {
    registry: Arc<Registry<DeviceConfig>>,
    live: LiveConfig,
    store: ConfigStore,
    queue: Arc<TransportQueue>,
    connector: Arc<dyn BrokerConnector>,
    link: Arc<dyn LinkControl>,
    restarter: Arc<dyn Restarter>,
    remote: Arc<RemoteConfig>,
    certs: Arc<CertificateInstaller>,
    config: AgentConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Load the configuration and wire the handlers
    pub fn new(
        store: ConfigStore,
        connector: Arc<dyn BrokerConnector>,
        link: Arc<dyn LinkControl>,
        restarter: Arc<dyn Restarter>,
        config: AgentConfig,
    ) -> Result<Self> {
        let tester = Arc::new(
            BrokerTester::new(
                Arc::clone(&connector),
                config.session.app_name.clone(),
                link.hardware_id(),
            )
            .with_timeout(config.test_timeout),
        );
        Self::with_tester(store, connector, tester, link, restarter, config)
    }

    /// Like [`Self::new`] with a custom trial connection
    pub fn with_tester(
        store: ConfigStore,
        connector: Arc<dyn BrokerConnector>,
        tester: Arc<dyn ConnectionTester>,
        link: Arc<dyn LinkControl>,
        restarter: Arc<dyn Restarter>,
        config: AgentConfig,
    ) -> Result<Self> {
        let registry = Arc::new(device_registry()?);
        let mut record = DeviceConfig::default();
        match store.load(&*registry, &mut record)? {
            ConfigLoad::Initialized => info!("Configuration initialised with defaults"),
            ConfigLoad::Loaded(report) => {
                for id in report.rejected() {
                    warn!("Stored value of {} rejected, using default", id);
                }
            }
        }
        let live = LiveConfig::new(record);
        let queue = Arc::new(TransportQueue::with_config(config.queue.clone()));
        let gate = Arc::new(TestGate::new());

        let remote = RemoteConfig::new(
            Arc::clone(&registry),
            live.clone(),
            store.clone(),
            Arc::clone(&tester),
            Arc::clone(&restarter),
            Arc::clone(&queue),
        )
        .with_options(config.remote.clone())
        .with_gate(Arc::clone(&gate));
        let certs = CertificateInstaller::new(
            Arc::clone(&registry),
            live.clone(),
            store.clone(),
            tester,
            Arc::clone(&restarter),
            Arc::clone(&queue),
        )
        .with_gate(gate)
        .with_restart_grace(config.remote.restart_grace);

        Ok(Self {
            registry,
            live,
            store,
            queue,
            connector,
            link,
            restarter,
            remote: Arc::new(remote),
            certs: Arc::new(certs),
            config,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry<DeviceConfig>> {
        &self.registry
    }

    pub fn live(&self) -> &LiveConfig {
        &self.live
    }

    pub fn queue(&self) -> &Arc<TransportQueue> {
        &self.queue
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Session manager bound to this agent's record and queue
    pub fn session(&self, start: Instant) -> SessionManager {
        SessionManager::new(
            Arc::clone(&self.connector),
            self.live.clone(),
            self.store.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.link),
            self.config.session.clone(),
            start,
        )
    }

    /// Report the start-up cause and the current configuration
    pub fn announce_start(&self, reset_reason: &str) {
        info!("Starting, reset reason: {}", reset_reason);
        self.queue
            .push_status(&format!("Reset reason: {}", reset_reason));
        self.publish_config();
    }

    /// Enqueue a configuration snapshot
    pub fn publish_config(&self) {
        let snapshot = self.live.read(|c| {
            config_snapshot(&self.registry, c, &self.config.app_version)
        });
        match OutboundMessage::config(&snapshot).and_then(|m| self.queue.enqueue(m)) {
            Ok(()) => debug!("Configuration snapshot queued"),
            Err(e) => warn!("Configuration snapshot dropped: {}", e),
        }
    }

    /// Enqueue a telemetry sample and its warning
    pub fn publish_sample(&self, sample: Sample) {
        match OutboundMessage::data(&sample.document).and_then(|m| self.queue.enqueue(m)) {
            Ok(()) => {}
            Err(TransportError::NotConnected) => debug!("Not connected, telemetry discarded"),
            Err(e) => warn!("Telemetry dropped: {}", e),
        }
        if let Some(warning) = sample.warning {
            self.queue.push_status(&warning);
        }
    }

    /// Poll `collector` against the live record and enqueue what it yields
    pub fn collect<T: ChargeController>(&self, collector: &mut TelemetryCollector<T>, now: Instant) {
        let config = self.live.snapshot();
        match collector.poll(now, &config) {
            Ok(Some(sample)) => self.publish_sample(sample),
            Ok(None) => {}
            Err(e) => warn!("Reading charge controller failed: {}", e),
        }
    }

    /// Descriptors with their current values, for the local portal
    pub fn parameters(&self) -> Vec<ParameterInfo> {
        self.live.read(|c| {
            self.registry
                .iter()
                .map(|p| ParameterInfo {
                    id: p.id(),
                    label: p.label(),
                    kind: p.kind().name(),
                    value: p.render(c),
                    min: p.min_text(),
                    max: p.max_text(),
                    ordinal: p.ordinal(c).ok(),
                    labels: p.enum_labels(),
                    remote: p.capability().is_remote(),
                    restart_required: p.is_restart_required(),
                })
                .collect()
        })
    }

    /// Apply a local (portal) edit of one field and persist it
    ///
    /// Local edits are not tested against the broker; a restart is scheduled
    /// when the field requires one.
    pub fn apply_local(&self, id: &str, text: &str) -> Result<ApplyOutcome> {
        let param = self.registry.require(id)?;
        let mut candidate = self.live.snapshot();
        let outcome = param.parse_and_apply(&mut candidate, text);
        if !outcome.is_updated() {
            return Ok(outcome);
        }
        self.live
            .commit_fields(&self.registry, &self.store, &candidate, &[param.id()])?;
        info!("{} set locally to {}", id, param.render(&candidate));
        if param.is_restart_required() {
            self.restarter
                .schedule_restart(RESTART_GRACE, status::CONFIG_UPDATED);
        }
        Ok(outcome)
    }

    /// Dispatch one command
    pub fn dispatch(&self, command: Command, payload: &[u8]) {
        info!("Command {}", command);
        match command {
            Command::GetConfig => self.publish_config(),
            Command::SetConfig => {
                let remote = Arc::clone(&self.remote);
                let queue = Arc::clone(&self.queue);
                let registry = Arc::clone(&self.registry);
                let live = self.live.clone();
                let version = self.config.app_version.clone();
                let payload = payload.to_vec();
                self.spawn("set-config", move || match remote.apply(&payload) {
                    Ok(report) if report.committed && !report.restart_scheduled => {
                        let snapshot = live.read(|c| config_snapshot(&registry, c, &version));
                        if let Err(e) =
                            OutboundMessage::config(&snapshot).and_then(|m| queue.enqueue(m))
                        {
                            warn!("Configuration snapshot dropped: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("setConfig ignored: {}", e),
                });
            }
            Command::InstallMqttRootCa => {
                let certs = Arc::clone(&self.certs);
                let payload = payload.to_vec();
                self.spawn("install-ca", move || {
                    let outcome = certs.install_mqtt_root_ca(&payload);
                    info!("MQTT root CA installation: {:?}", outcome);
                });
            }
            Command::InstallRootCa => {
                self.certs.install_root_ca(payload);
            }
            Command::ResetWifi => {
                self.queue.push_status(status::WIFI_RESET);
                self.link.reset_credentials();
                self.restarter
                    .schedule_restart(RESTART_GRACE, status::WIFI_RESET);
            }
            Command::Reboot => {
                self.queue.push_status(status::REBOOTING);
                self.restarter
                    .schedule_restart(REBOOT_GRACE, status::REBOOTING);
            }
        }
    }

    /// Wait for every worker spawned so far
    pub fn wait_idle(&self) {
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("Command worker panicked");
            }
        }
    }

    fn spawn(&self, name: &str, job: impl FnOnce() + Send + 'static) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|w| !w.is_finished());
        match thread::Builder::new().name(name.to_string()).spawn(job) {
            Ok(handle) => workers.push(handle),
            Err(e) => error!("Could not start {} worker: {}", name, e),
        }
    }
}

impl InboundHandler for Agent {
    fn handle(&self, message: &InboundMessage) {
        let topics = Topics::from_settings(&self.live.broker_settings());
        let Some(name) = topics.command_name(&message.topic) else {
            debug!("Ignoring message on {}", message.topic);
            return;
        };
        match Command::parse(name) {
            Some(command) => self.dispatch(command, &message.payload),
            None => debug!("Ignoring unknown command {}", name),
        }
    }
}
