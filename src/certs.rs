// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Certificate installer
//!
//! Replaces the broker root authority without ever overwriting the active
//! file in place:
//!
//! 1. Write the received bytes to the staging key
//! 2. Trial-connect with the staged authority (skipped when the transport
//!    does not validate certificates)
//! 3. Remove the active file, then rename the staged one over it
//! 4. Restart so the session picks the new file up
//!
//! A failed trial deletes the staged file and leaves the active one alone.

use std::sync::Arc;
use std::time::Duration;

use log::{info, log, warn};
use thiserror::Error;

use crate::config::{ids, DeviceConfig, LiveConfig};
use crate::error::{StoreError, TransportError};
use crate::platform::{Restarter, RESTART_GRACE};
use crate::protocol::{status, Severity};
use crate::queue::TransportQueue;
use crate::registry::Registry;
use crate::remote::ConnectionTester;
use crate::staged::{StageOutcome, StagedChange, TestGate};
use crate::store::ConfigStore;
use crate::tls::{TrustMaterial, MQTT_ROOT_CA, MQTT_ROOT_CA_STAGED, ROOT_CA};

/// Result of one installation request
#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    /// The new file is active; `tested` is false when the trial was skipped
    Installed { tested: bool },
    /// Another staged change was in flight
    Busy,
    /// The bytes could not be staged
    WriteFailed(StoreError),
    /// Trial connection failed; the staged file was discarded
    TestFailed(TransportError),
    /// The active file could not be removed; it is still in effect
    RemoveFailed(StoreError),
    /// The active file is gone and the staged one could not take its place
    ReplaceFailed(StoreError),
}

impl InstallOutcome {
    /// Whether the new certificate is in effect
    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }
}

#[derive(Debug, Error)]
enum CertError {
    #[error("trial connection failed: {0}")]
    Test(TransportError),
    #[error("removing active CA failed: {0}")]
    Remove(StoreError),
    #[error("renaming staged CA failed: {0}")]
    Rename(StoreError),
}

/// Installs trust material received on the command topics
pub struct CertificateInstaller {
    registry: Arc<Registry<DeviceConfig>>,
    live: LiveConfig,
    store: ConfigStore,
    tester: Arc<dyn ConnectionTester>,
    restarter: Arc<dyn Restarter>,
    queue: Arc<TransportQueue>,
    gate: Arc<TestGate>,
    restart_grace: Duration,
}

impl CertificateInstaller {
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
            restart_grace: RESTART_GRACE,
        }
    }

    /// Share the in-flight guard with the remote configuration protocol
    pub fn with_gate(mut self, gate: Arc<TestGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Delay between installation and restart
    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    /// Stage, test and activate a new broker root authority
    pub fn install_mqtt_root_ca(&self, pem: &[u8]) -> InstallOutcome {
        let Some(_guard) = self.gate.try_enter() else {
            warn!("Certificate ignored, another test is in flight");
            self.queue.push_status(status::CONFIG_TEST_BUSY);
            return InstallOutcome::Busy;
        };

        let backend = self.store.backend();
        if let Err(e) = backend.write(MQTT_ROOT_CA_STAGED, pem) {
            warn!("Staging CA failed: {}", e);
            self.queue.push_status(status::CERT_WRITE_FAILED);
            return InstallOutcome::WriteFailed(e);
        }

        let settings = self.live.broker_settings();
        let tested = settings.validates_certificate();
        let staged = StagedChange::stage("mqtt root CA", pem.to_vec());
        let outcome = if tested {
            let trust = TrustMaterial::load(backend.as_ref());
            staged.run(
                |pem| {
                    let trust = trust.clone().with_root_ca(pem.clone());
                    self.tester.test(&settings, &trust).map_err(CertError::Test)
                },
                |_| self.replace_active(),
                |_| self.discard_staged(),
            )
        } else {
            info!("Certificates are not validated, skipping trial");
            staged.commit_untested(|_| self.replace_active())
        };

        let error = match outcome {
            StageOutcome::Committed => {
                self.queue.push_status(status::CA_INSTALLED);
                self.restarter
                    .schedule_restart(self.restart_grace, status::CA_INSTALLED);
                return InstallOutcome::Installed { tested };
            }
            StageOutcome::RolledBack(e) | StageOutcome::CommitFailed(e) => e,
        };
        match error {
            CertError::Test(e) => {
                self.queue.push_status(status::CA_TEST_FAILED);
                InstallOutcome::TestFailed(e)
            }
            CertError::Remove(e) => {
                self.discard_staged();
                self.queue.push_status(status::CA_REMOVE_FAILED);
                InstallOutcome::RemoveFailed(e)
            }
            CertError::Rename(e) => {
                log!(
                    Severity::Critical.log_level(),
                    "No active CA left, falling back to insecure transport"
                );
                self.fall_back_insecure();
                self.queue.push_status(status::CA_REPLACE_PANIC);
                self.restarter
                    .schedule_restart(self.restart_grace, status::CA_REPLACE_PANIC);
                InstallOutcome::ReplaceFailed(e)
            }
        }
    }

    /// Write the generic root authority; it is not used by the broker link
    pub fn install_root_ca(&self, pem: &[u8]) -> InstallOutcome {
        match self.store.backend().write(ROOT_CA, pem) {
            Ok(()) => {
                info!("Installed root CA ({} bytes)", pem.len());
                self.queue.push_status(status::ROOT_CA_INSTALLED);
                InstallOutcome::Installed { tested: false }
            }
            Err(e) => {
                warn!("Writing root CA failed: {}", e);
                self.queue.push_status(status::CERT_WRITE_FAILED);
                InstallOutcome::WriteFailed(e)
            }
        }
    }

    fn replace_active(&self) -> Result<(), CertError> {
        let backend = self.store.backend();
        if backend.exists(MQTT_ROOT_CA) {
            backend.remove(MQTT_ROOT_CA).map_err(CertError::Remove)?;
        }
        backend
            .rename(MQTT_ROOT_CA_STAGED, MQTT_ROOT_CA)
            .map_err(CertError::Rename)
    }

    fn discard_staged(&self) {
        if let Err(e) = self.store.backend().remove(MQTT_ROOT_CA_STAGED) {
            warn!("Could not remove staged CA: {}", e);
        }
    }

    /// Keep the device reachable without an authority file
    fn fall_back_insecure(&self) {
        let Some(param) = self.registry.get(ids::MQTT_INSECURE) else {
            return;
        };
        let record = self.live.update(|c| {
            param.parse_and_apply(c, "true");
            c.clone()
        });
        if let Err(e) = self.store.save(&*self.registry, &record) {
            warn!("Could not persist insecure fallback: {}", e);
        }
    }
}
