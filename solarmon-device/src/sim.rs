// SolarMon Device - Simulated charge controller
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Charge controller stand-in for host runs.
//!
//! Produces plausible 12 V system readings: a noisy panel voltage, a battery
//! that drifts with the net current, and daily extremes tracked across calls.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use solarmon::{ChargeController, LiveData, Result, StatsData};

/// Random-walk charge controller
pub struct SimulatedController {
    rng: StdRng,
    battery_mv: f64,
    stats: StatsData,
}

impl SimulatedController {
    /// Controller seeded from the OS
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic controller
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            battery_mv: 12_800.0,
            stats: StatsData {
                battery_min_mv: u16::MAX,
                panel_min_mv: u16::MAX,
                ..StatsData::default()
            },
        }
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl ChargeController for SimulatedController {
    fn read_live(&mut self) -> Result<LiveData> {
        let panel_mv: u16 = self.rng.gen_range(16_000..21_500);
        let panel_ma: u16 = self.rng.gen_range(0..4_000);
        let load_ma: u16 = self.rng.gen_range(100..1_500);
        let net_ma = f64::from(panel_ma) - f64::from(load_ma);
        self.battery_mv = (self.battery_mv + net_ma / 500.0).clamp(10_500.0, 14_400.0);
        let battery_mv = self.battery_mv.round() as u16;

        let stats = &mut self.stats;
        stats.battery_min_mv = stats.battery_min_mv.min(battery_mv);
        stats.battery_max_mv = stats.battery_max_mv.max(battery_mv);
        stats.panel_min_mv = stats.panel_min_mv.min(panel_mv);
        stats.panel_max_mv = stats.panel_max_mv.max(panel_mv);
        stats.generated_wh = stats.generated_wh.saturating_add(panel_ma / 200);
        stats.consumed_wh = stats.consumed_wh.saturating_add(load_ma / 200);

        let soc = ((self.battery_mv - 10_500.0) / 39.0).clamp(0.0, 100.0);
        Ok(LiveData {
            panel_mv,
            load_mv: battery_mv,
            battery_mv,
            panel_ma,
            load_ma,
            battery_ma: net_ma.abs() as u16,
            battery_soc: soc.round() as u16,
            battery_current_ma: net_ma.max(0.0) as u16,
        })
    }

    fn read_stats(&mut self) -> Result<StatsData> {
        let mut stats = self.stats;
        stats.heatsink_temp_centi = self.rng.gen_range(1_800..4_500);
        if stats.battery_min_mv == u16::MAX {
            stats.battery_min_mv = 0;
            stats.panel_min_mv = 0;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readings_in_range() {
        let mut controller = SimulatedController::seeded(7);
        for _ in 0..100 {
            let live = controller.read_live().unwrap();
            assert!((16_000..21_500).contains(&live.panel_mv));
            assert!((10_500..=14_400).contains(&live.battery_mv));
            assert!(live.battery_soc <= 100);
        }
    }

    #[test]
    fn test_stats_track_extremes() {
        let mut controller = SimulatedController::seeded(1);
        let readings: Vec<LiveData> = (0..20).map(|_| controller.read_live().unwrap()).collect();
        let stats = controller.read_stats().unwrap();
        let min = readings.iter().map(|r| r.battery_mv).min().unwrap();
        let max = readings.iter().map(|r| r.panel_mv).max().unwrap();
        assert_eq!(stats.battery_min_mv, min);
        assert_eq!(stats.panel_max_mv, max);
    }

    #[test]
    fn test_stats_before_any_reading() {
        let mut controller = SimulatedController::seeded(3);
        let stats = controller.read_stats().unwrap();
        assert_eq!(stats.battery_min_mv, 0);
        assert!((1_800..4_500).contains(&stats.heatsink_temp_centi));
    }
}
