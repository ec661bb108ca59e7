// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry acquisition
//!
//! Readings come from a [`ChargeController`]; [`TelemetryCollector`] decides
//! when each kind is due, merges the due readings into one flat data
//! document and raises a low battery warning.

use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::param::Document;

/// Shortest live data interval, in seconds
pub const LIVE_DATA_MIN_INTERVAL: u32 = 10;

/// Shortest statistics interval, in seconds
pub const STATS_DATA_MIN_INTERVAL: u32 = 60;

/// Instantaneous readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveData {
    #[serde(rename = "panel_mV")]
    pub panel_mv: u16,
    #[serde(rename = "load_mV")]
    pub load_mv: u16,
    #[serde(rename = "battery_mV")]
    pub battery_mv: u16,
    #[serde(rename = "panel_mA")]
    pub panel_ma: u16,
    #[serde(rename = "load_mA")]
    pub load_ma: u16,
    #[serde(rename = "battery_mA")]
    pub battery_ma: u16,
    #[serde(rename = "batterySoc")]
    pub battery_soc: u16,
    #[serde(rename = "batteryCurrent_mA")]
    pub battery_current_ma: u16,
}

/// Daily statistics and status words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsData {
    #[serde(rename = "battery_min_mV")]
    pub battery_min_mv: u16,
    #[serde(rename = "battery_max_mV")]
    pub battery_max_mv: u16,
    #[serde(rename = "panel_min_mV")]
    pub panel_min_mv: u16,
    #[serde(rename = "panel_max_mV")]
    pub panel_max_mv: u16,
    #[serde(rename = "consumed_Wh")]
    pub consumed_wh: u16,
    #[serde(rename = "generated_Wh")]
    pub generated_wh: u16,
    #[serde(rename = "heatsinkTempCenti")]
    pub heatsink_temp_centi: i32,
    #[serde(rename = "statusBattery")]
    pub status_battery: u16,
    #[serde(rename = "statusCharger")]
    pub status_charger: u16,
    #[serde(rename = "statusDischarger")]
    pub status_discharger: u16,
}

/// Source of controller readings (Modbus on the device)
pub trait ChargeController: Send {
    fn read_live(&mut self) -> Result<LiveData>;

    fn read_stats(&mut self) -> Result<StatsData>;
}

/// Kind of reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKind {
    Live,
    Stats,
}

impl ReadingKind {
    fn min_interval(&self) -> u32 {
        match self {
            Self::Live => LIVE_DATA_MIN_INTERVAL,
            Self::Stats => STATS_DATA_MIN_INTERVAL,
        }
    }

    fn interval(&self, config: &DeviceConfig) -> u32 {
        match self {
            Self::Live => config.live_data_int(),
            Self::Stats => config.stats_data_int(),
        }
    }
}

/// Decides when each reading kind is due
///
/// A kind is due when its interval is at least the minimum (zero disables it)
/// and the interval has elapsed since its last sample. The first sample after
/// start-up is taken once a tenth of the interval has elapsed.
#[derive(Debug, Clone)]
pub struct TelemetryScheduler {
    start: Instant,
    last_live: Option<Instant>,
    last_stats: Option<Instant>,
}

impl TelemetryScheduler {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            last_live: None,
            last_stats: None,
        }
    }

    /// Whether `kind` is due at `now` under `config`
    pub fn is_due(&self, kind: ReadingKind, now: Instant, config: &DeviceConfig) -> bool {
        let secs = kind.interval(config);
        if secs < kind.min_interval() {
            return false;
        }
        let interval = Duration::from_secs(secs.into());
        let due_at = match self.last(kind) {
            Some(last) => last + interval,
            None => self.start + interval / 10,
        };
        now >= due_at
    }

    /// Due kinds at `now`, marking them sampled
    pub fn take_due(&mut self, now: Instant, config: &DeviceConfig) -> Vec<ReadingKind> {
        let due: Vec<ReadingKind> = [ReadingKind::Live, ReadingKind::Stats]
            .into_iter()
            .filter(|k| self.is_due(*k, now, config))
            .collect();
        for kind in &due {
            match kind {
                ReadingKind::Live => self.last_live = Some(now),
                ReadingKind::Stats => self.last_stats = Some(now),
            }
        }
        due
    }

    fn last(&self, kind: ReadingKind) -> Option<Instant> {
        match kind {
            ReadingKind::Live => self.last_live,
            ReadingKind::Stats => self.last_stats,
        }
    }
}

/// One collected sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Flat data document for `up/data`
    pub document: Document,
    /// Low battery warning text, raised once per excursion
    pub warning: Option<String>,
}

/// Reads the controller on schedule and builds data documents
pub struct TelemetryCollector<T> {
    controller: T,
    scheduler: TelemetryScheduler,
    low_battery: bool,
}

impl<T: ChargeController> TelemetryCollector<T> {
    pub fn new(controller: T, start: Instant) -> Self {
        Self {
            controller,
            scheduler: TelemetryScheduler::new(start),
            low_battery: false,
        }
    }

    /// Access the controller
    pub fn controller_mut(&mut self) -> &mut T {
        &mut self.controller
    }

    /// Collect the readings due at `now`; `None` when nothing is due
    pub fn poll(&mut self, now: Instant, config: &DeviceConfig) -> Result<Option<Sample>> {
        let due = self.scheduler.take_due(now, config);
        if due.is_empty() {
            return Ok(None);
        }
        let mut document = Document::new();
        let mut warning = None;
        for kind in due {
            debug!("Reading {:?} data", kind);
            match kind {
                ReadingKind::Live => {
                    let live = self.controller.read_live()?;
                    warning = self.check_battery(&live, config);
                    merge(&mut document, &live)?;
                }
                ReadingKind::Stats => {
                    let mut stats = self.controller.read_stats()?;
                    stats.heatsink_temp_centi += i32::from(config.temp_offset());
                    merge(&mut document, &stats)?;
                }
            }
        }
        Ok(Some(Sample { document, warning }))
    }

    fn check_battery(&mut self, live: &LiveData, config: &DeviceConfig) -> Option<String> {
        let threshold = config.low_battery_v();
        if threshold <= 0.0 {
            self.low_battery = false;
            return None;
        }
        let volts = f32::from(live.battery_mv) / 1000.0;
        if volts >= threshold {
            self.low_battery = false;
            return None;
        }
        if self.low_battery {
            return None;
        }
        self.low_battery = true;
        warn!("Battery at {:.2}V below {:.2}V", volts, threshold);
        Some(format!("low battery: {:.2}V (threshold {:.2}V)", volts, threshold))
    }
}

fn merge<S: Serialize>(document: &mut Document, reading: &S) -> Result<()> {
    match serde_json::to_value(reading)? {
        Value::Object(fields) => {
            document.extend(fields);
            Ok(())
        }
        other => Err(Error::Acquisition(format!("reading encoded as {}", other))),
    }
}
