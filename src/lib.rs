//! # SolarMon - Solar charge controller telemetry
//!
//! Device-side configuration and broker session management for a solar
//! charge controller monitor.
//!
//! ## Key Features
//!
//! - **Descriptor-driven configuration**: every field is declared once, with
//!   bounds, default, capability and restart flag
//! - **Test-before-commit**: broker settings and root certificates are tried
//!   on a separate connection before they replace the working ones
//! - **Bounded outbound queue**: telemetry is best effort, status and
//!   configuration messages are retried until sent
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use solarmon::broker::memory::MemoryBroker;
//! use solarmon::{Agent, AgentConfig, Command, ConfigStore, MemoryStore};
//! use solarmon::{RecordingRestarter, StaticLink};
//!
//! let agent = Agent::new(
//!     ConfigStore::new(Arc::new(MemoryStore::new())),
//!     Arc::new(MemoryBroker::new()),
//!     Arc::new(StaticLink::new("aabbccddeeff")),
//!     Arc::new(RecordingRestarter::new()),
//!     AgentConfig::default(),
//! )?;
//!
//! agent.dispatch(Command::SetConfig, br#"{"liveDataInt": 60}"#);
//! agent.wait_idle();
//! assert_eq!(agent.live().snapshot().live_data_int(), 60);
//! # Ok::<(), solarmon::Error>(())
//! ```
//!
//! ## Modules
//!
//! - [`param`] and [`registry`]: parameter descriptors and their registry
//! - [`config`]: the device configuration record
//! - [`store`]: persistence of the record and of trust material
//! - [`remote`]: the `setConfig` protocol
//! - [`certs`]: root certificate installation
//! - [`session`] and [`queue`]: the broker session and its outbound queue
//! - [`agent`]: composition root and command dispatch

// Modules
pub mod agent;
pub mod broker;
pub mod certs;
pub mod config;
pub mod error;
pub mod param;
pub mod platform;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod session;
pub mod staged;
pub mod store;
pub mod telemetry;
pub mod tls;

// Re-exports for convenient access
pub use agent::{Agent, AgentConfig, ParameterInfo};
pub use broker::{BrokerConnector, BrokerLink, ConnectOptions, InboundMessage};
pub use certs::{CertificateInstaller, InstallOutcome};
pub use config::{device_registry, BrokerSettings, DeviceConfig, LiveConfig, LogLevel};
pub use error::{Error, ParamError, Result, StoreError, TransportError};
pub use param::{ApplyOutcome, Capability, Document, ParamKind, Parameter};
pub use platform::{LinkControl, RecordingRestarter, Restarter, StaticLink};
pub use protocol::{Command, Severity, Topics};
pub use queue::{MessageClass, OutboundMessage, QueueConfig, TransportQueue};
pub use registry::{LoadReport, Registry};
pub use remote::{BrokerTester, ConnectionTester, RemoteConfig, RemoteConfigOptions, SetConfigReport};
pub use session::{InboundHandler, LinkMonitor, SessionConfig, SessionManager};
pub use staged::{StageOutcome, StagedChange, TestGate};
pub use store::{ConfigLoad, ConfigStore, FsStore, KeyValueStore, MemoryStore};
pub use telemetry::{ChargeController, LiveData, StatsData, TelemetryCollector, TelemetryScheduler};
pub use tls::TrustMaterial;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
