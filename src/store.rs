// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Persistent storage
//!
//! The device filesystem is consumed through the [`KeyValueStore`] trait: whole
//! byte blobs addressed by flat keys. [`ConfigStore`] keeps the configuration
//! record in one JSON document on top of it.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};

use crate::error::{Result, StoreError};
use crate::param::Document;
use crate::registry::{LoadReport, Registry};

/// Key of the configuration document
pub const CONFIG_KEY: &str = "config.json";

/// Byte budget of the configuration document
pub const MAX_CONFIG_BYTES: usize = 1800;

/// Byte-blob storage addressed by flat keys
pub trait KeyValueStore: Send + Sync {
    /// Read a whole blob
    fn read(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError>;

    /// Create or replace a blob
    fn write(&self, key: &str, data: &[u8]) -> std::result::Result<(), StoreError>;

    /// Delete a blob
    fn remove(&self, key: &str) -> std::result::Result<(), StoreError>;

    /// Move a blob; fails with [`StoreError::AlreadyExists`] if `to` exists
    fn rename(&self, from: &str, to: &str) -> std::result::Result<(), StoreError>;

    /// Whether a blob exists
    fn exists(&self, key: &str) -> bool;
}

/// In-memory store with optional failure injection
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
    fail_renames: AtomicBool,
    locked: Mutex<Vec<String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent remove fail
    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent remove of `key` fail
    pub fn lock_key(&self, key: &str) {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.to_string());
    }

    /// Make every subsequent rename fail
    pub fn fail_renames(&self, fail: bool) {
        self.fail_renames.store(fail, Ordering::SeqCst);
    }

    /// Stored keys in order
    pub fn keys(&self) -> Vec<String> {
        self.blobs().keys().cloned().collect()
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected(flag: &AtomicBool, key: &str, op: &str) -> std::result::Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                key: key.to_string(),
                reason: format!("{} failed", op),
            });
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError> {
        self.blobs()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, data: &[u8]) -> std::result::Result<(), StoreError> {
        Self::injected(&self.fail_writes, key, "write")?;
        self.blobs().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StoreError> {
        Self::injected(&self.fail_removes, key, "remove")?;
        let locked = self
            .locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|k| k == key);
        if locked {
            return Err(StoreError::Io {
                key: key.to_string(),
                reason: "key locked".to_string(),
            });
        }
        self.blobs()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> std::result::Result<(), StoreError> {
        Self::injected(&self.fail_renames, from, "rename")?;
        let mut blobs = self.blobs();
        if blobs.contains_key(to) {
            return Err(StoreError::AlreadyExists(to.to_string()));
        }
        let data = blobs
            .remove(from)
            .ok_or_else(|| StoreError::NotFound(from.to_string()))?;
        blobs.insert(to.to_string(), data);
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.blobs().contains_key(key)
    }
}

/// Store backed by one directory, one file per key
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) the directory `root`
    pub fn open(root: impl AsRef<Path>) -> std::result::Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StoreError::Io {
            key: root.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { root })
    }

    /// Directory holding the blobs
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> std::result::Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(StoreError::Io {
                key: key.to_string(),
                reason: "invalid key".to_string(),
            });
        }
        Ok(self.root.join(key))
    }

    fn io_error(key: &str, e: std::io::Error) -> StoreError {
        match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
            _ => StoreError::Io {
                key: key.to_string(),
                reason: e.to_string(),
            },
        }
    }
}

impl KeyValueStore for FsStore {
    fn read(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError> {
        fs::read(self.path(key)?).map_err(|e| Self::io_error(key, e))
    }

    fn write(&self, key: &str, data: &[u8]) -> std::result::Result<(), StoreError> {
        fs::write(self.path(key)?, data).map_err(|e| Self::io_error(key, e))
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StoreError> {
        fs::remove_file(self.path(key)?).map_err(|e| Self::io_error(key, e))
    }

    fn rename(&self, from: &str, to: &str) -> std::result::Result<(), StoreError> {
        let target = self.path(to)?;
        if target.exists() {
            return Err(StoreError::AlreadyExists(to.to_string()));
        }
        fs::rename(self.path(from)?, target).map_err(|e| Self::io_error(from, e))
    }

    fn exists(&self, key: &str) -> bool {
        self.path(key).map(|p| p.is_file()).unwrap_or(false)
    }
}

/// How the configuration record was obtained at start-up
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigLoad {
    /// Document found and applied
    Loaded(LoadReport),
    /// Document absent or unreadable: defaults written back
    Initialized,
}

/// Loads and saves a configuration record through its registry
#[derive(Clone)]
pub struct ConfigStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
    max_bytes: usize,
}

impl ConfigStore {
    /// Configuration store on `store` using the default key and budget
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            key: CONFIG_KEY.to_string(),
            max_bytes: MAX_CONFIG_BYTES,
        }
    }

    /// Override the byte budget
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// The underlying blob store
    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Fill `record` from the stored document
    ///
    /// Every field ends up defined: missing keys take their default and
    /// rejected values keep it. An absent or malformed document is replaced
    /// by the defaults.
    pub fn load<C>(&self, registry: &Registry<C>, record: &mut C) -> Result<ConfigLoad> {
        registry.fill_defaults(record);
        let document = match self.store.read(&self.key) {
            Ok(bytes) => match serde_json::from_slice::<Document>(&bytes) {
                Ok(document) => Some(document),
                Err(e) => {
                    warn!("Configuration document unreadable, using defaults: {}", e);
                    None
                }
            },
            Err(StoreError::NotFound(_)) => {
                info!("No configuration document, writing defaults");
                None
            }
            Err(e) => return Err(e.into()),
        };

        match document {
            Some(document) => Ok(ConfigLoad::Loaded(
                registry.load_from_document(record, &document, true),
            )),
            None => {
                self.save(registry, record)?;
                Ok(ConfigLoad::Initialized)
            }
        }
    }

    /// Persist `record`, returning the document size
    pub fn save<C>(&self, registry: &Registry<C>, record: &C) -> Result<usize> {
        let document = registry.save_to_document(record);
        let bytes = serde_json::to_vec(&document)?;
        if bytes.len() > self.max_bytes {
            return Err(StoreError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            }
            .into());
        }
        self.store.write(&self.key, &bytes)?;
        info!("Saved configuration ({} bytes)", bytes.len());
        Ok(bytes.len())
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("key", &self.key)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{device_registry, ids, DeviceConfig};
    use crate::error::Error;
    use tempfile::TempDir;

    #[test]
    fn test_memory_rename_refuses_overwrite() {
        let store = MemoryStore::new();
        store.write("a", b"one").unwrap();
        store.write("b", b"two").unwrap();
        assert_eq!(
            store.rename("a", "b"),
            Err(StoreError::AlreadyExists("b".to_string()))
        );
        store.remove("b").unwrap();
        store.rename("a", "b").unwrap();
        assert_eq!(store.read("b").unwrap(), b"one");
        assert!(!store.exists("a"));
    }

    #[test]
    fn test_memory_failure_injection() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        assert!(matches!(store.write("k", b"v"), Err(StoreError::Io { .. })));
        store.fail_writes(false);
        store.write("k", b"v").unwrap();
        assert_eq!(store.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path().join("data")).unwrap();
        store.write("mqtt_root_ca.tmp", b"pem").unwrap();
        assert!(store.exists("mqtt_root_ca.tmp"));
        store.rename("mqtt_root_ca.tmp", "mqtt_root_ca.pem").unwrap();
        assert_eq!(store.read("mqtt_root_ca.pem").unwrap(), b"pem");
        assert_eq!(
            store.read("mqtt_root_ca.tmp"),
            Err(StoreError::NotFound("mqtt_root_ca.tmp".to_string()))
        );
        assert!(store.write("../escape", b"x").is_err());
    }

    #[test]
    fn test_fs_store_rename_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        store.write("a", b"1").unwrap();
        store.write("b", b"2").unwrap();
        assert!(matches!(store.rename("a", "b"), Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.read("b").unwrap(), b"2");
    }

    #[test]
    fn test_load_initializes_missing_document() {
        let registry = device_registry().unwrap();
        let backend = Arc::new(MemoryStore::new());
        let store = ConfigStore::new(backend.clone());
        let mut config = DeviceConfig::default();
        assert_eq!(store.load(&registry, &mut config).unwrap(), ConfigLoad::Initialized);
        assert_eq!(config, DeviceConfig::with_defaults(&registry));
        assert!(backend.exists(CONFIG_KEY));
    }

    #[test]
    fn test_load_malformed_document_uses_defaults() {
        let registry = device_registry().unwrap();
        let backend = Arc::new(MemoryStore::new());
        backend.write(CONFIG_KEY, b"{not json").unwrap();
        let store = ConfigStore::new(backend.clone());
        let mut config = DeviceConfig::default();
        assert_eq!(store.load(&registry, &mut config).unwrap(), ConfigLoad::Initialized);
        assert_eq!(config.mqtt_topic(), "solarmonitor");
        let saved: Document = serde_json::from_slice(&backend.read(CONFIG_KEY).unwrap()).unwrap();
        assert_eq!(saved.len(), registry.len());
    }

    #[test]
    fn test_save_then_load() {
        let registry = device_registry().unwrap();
        let backend = Arc::new(MemoryStore::new());
        let store = ConfigStore::new(backend);
        let mut config = DeviceConfig::with_defaults(&registry);
        registry
            .get(ids::MQTT_HOST)
            .unwrap()
            .parse_and_apply(&mut config, "mqtt.example.org");
        let size = store.save(&registry, &config).unwrap();
        assert!(size <= MAX_CONFIG_BYTES);

        let mut loaded = DeviceConfig::default();
        assert!(matches!(
            store.load(&registry, &mut loaded).unwrap(),
            ConfigLoad::Loaded(_)
        ));
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_over_budget() {
        let registry = device_registry().unwrap();
        let store = ConfigStore::new(Arc::new(MemoryStore::new())).with_max_bytes(64);
        let config = DeviceConfig::with_defaults(&registry);
        assert!(matches!(
            store.save(&registry, &config),
            Err(Error::Store(StoreError::TooLarge { max: 64, .. }))
        ));
    }
}
