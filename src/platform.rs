// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Platform collaborators
//!
//! Restarting the device and the wireless link are owned by the platform;
//! the library only talks to them through these traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Grace period before a restart following a committed change
pub const RESTART_GRACE: Duration = Duration::from_millis(2000);

/// Grace period before a restart requested by the `reboot` command
pub const REBOOT_GRACE: Duration = Duration::from_millis(1000);

/// Schedules device restarts
pub trait Restarter: Send + Sync {
    /// Restart after `delay`; must not block the caller
    fn schedule_restart(&self, delay: Duration, reason: &str);
}

/// Network link owned by the platform
pub trait LinkControl: Send + Sync {
    /// Whether the network link is associated
    fn is_link_up(&self) -> bool;

    /// Forget stored wireless credentials
    fn reset_credentials(&self);

    /// Hardware identifier used in the client id (MAC address)
    fn hardware_id(&self) -> String;
}

/// Restarter that only records requests
#[derive(Debug, Default)]
pub struct RecordingRestarter {
    requests: Mutex<Vec<(Duration, String)>>,
}

impl RecordingRestarter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(delay, reason)` of every request so far
    pub fn requests(&self) -> Vec<(Duration, String)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any restart was requested
    pub fn is_scheduled(&self) -> bool {
        !self.requests().is_empty()
    }
}

impl Restarter for RecordingRestarter {
    fn schedule_restart(&self, delay: Duration, reason: &str) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((delay, reason.to_string()));
    }
}

/// Link with a fixed identity whose state can be toggled
#[derive(Debug)]
pub struct StaticLink {
    up: AtomicBool,
    resets: AtomicUsize,
    hardware_id: String,
}

impl StaticLink {
    /// Link reporting `hardware_id`, initially up
    pub fn new(hardware_id: impl Into<String>) -> Self {
        Self {
            up: AtomicBool::new(true),
            resets: AtomicUsize::new(0),
            hardware_id: hardware_id.into(),
        }
    }

    /// Change the association state
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Number of credential resets requested
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl LinkControl for StaticLink {
    fn is_link_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn reset_credentials(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn hardware_id(&self) -> String {
        self.hardware_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_restarter() {
        let restarter = RecordingRestarter::new();
        assert!(!restarter.is_scheduled());
        restarter.schedule_restart(RESTART_GRACE, "config");
        assert_eq!(restarter.requests(), vec![(RESTART_GRACE, "config".to_string())]);
    }

    #[test]
    fn test_static_link() {
        let link = StaticLink::new("aabbccddeeff");
        assert!(link.is_link_up());
        link.set_up(false);
        assert!(!link.is_link_up());
        link.reset_credentials();
        assert_eq!(link.resets(), 1);
        assert_eq!(link.hardware_id(), "aabbccddeeff");
    }
}
