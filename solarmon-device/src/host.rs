// SolarMon Device - Host platform
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Host implementations of the platform collaborators.
//!
//! A restart is a process exit with [`RESTART_EXIT_CODE`]; the supervisor
//! (systemd, a container runtime) starts the process again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use solarmon::{KeyValueStore, LinkControl, Restarter, StoreError};
use tracing::{error, info, warn};

/// Exit code asking the supervisor for a restart
pub const RESTART_EXIT_CODE: i32 = 3;

/// Key of the generated hardware identifier
pub const HARDWARE_ID_KEY: &str = "hardware_id";

/// Key of the stored wireless credentials
pub const WIFI_CREDENTIALS_KEY: &str = "wifi.json";

/// Exits the process after the requested delay
#[derive(Debug, Default)]
pub struct ProcessRestarter {
    scheduled: AtomicBool,
}

impl ProcessRestarter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Restarter for ProcessRestarter {
    fn schedule_restart(&self, delay: Duration, reason: &str) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            info!("Restart already scheduled, ignoring: {}", reason);
            return;
        }
        info!("Restarting in {} ms: {}", delay.as_millis(), reason);
        let spawned = thread::Builder::new()
            .name("restart".to_string())
            .spawn(move || {
                thread::sleep(delay);
                std::process::exit(RESTART_EXIT_CODE);
            });
        if let Err(e) = spawned {
            error!("Could not schedule restart: {}", e);
            self.scheduled.store(false, Ordering::SeqCst);
        }
    }
}

/// Network link of the host
pub struct HostLink {
    store: Arc<dyn KeyValueStore>,
    hardware_id: String,
}

impl HostLink {
    /// Link whose identifier is persisted in `store`, generated on first use
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let hardware_id = match store.read(HARDWARE_ID_KEY) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(StoreError::NotFound(_)) => {
                let id = generate_hardware_id();
                store.write(HARDWARE_ID_KEY, id.as_bytes())?;
                info!("Generated hardware id {}", id);
                id
            }
            Err(e) => return Err(e),
        };
        Ok(Self { store, hardware_id })
    }
}

impl LinkControl for HostLink {
    fn is_link_up(&self) -> bool {
        true
    }

    fn reset_credentials(&self) {
        if !self.store.exists(WIFI_CREDENTIALS_KEY) {
            return;
        }
        match self.store.remove(WIFI_CREDENTIALS_KEY) {
            Ok(()) => info!("Wireless credentials removed"),
            Err(e) => warn!("Could not remove wireless credentials: {}", e),
        }
    }

    fn hardware_id(&self) -> String {
        self.hardware_id.clone()
    }
}

/// Locally administered MAC-style identifier
fn generate_hardware_id() -> String {
    let mut bytes: [u8; 6] = rand::thread_rng().gen();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use solarmon::FsStore;

    #[test]
    fn test_hardware_id_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(FsStore::open(dir.path()).unwrap());
        let first = HostLink::open(store.clone()).unwrap().hardware_id();
        assert_eq!(first.len(), 12);
        let second = HostLink::open(store).unwrap().hardware_id();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_credentials_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(FsStore::open(dir.path()).unwrap());
        store.write(WIFI_CREDENTIALS_KEY, b"{}").unwrap();
        let link = HostLink::open(store.clone()).unwrap();
        link.reset_credentials();
        assert!(!store.exists(WIFI_CREDENTIALS_KEY));
        link.reset_credentials();
    }

    #[test]
    fn test_generated_id_is_locally_administered() {
        let id = generate_hardware_id();
        let first = u8::from_str_radix(&id[..2], 16).unwrap();
        assert_eq!(first & 0x03, 0x02);
    }
}
