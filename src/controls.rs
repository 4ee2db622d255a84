//! Charging control algorithms for EvseBridge
//!
//! This module contains the business logic for the three charging modes
//! (MANUAL, AUTO, SCHEDULED) plus the AUTO start/stop hysteresis and the
//! time/price-feed schedule evaluators that back SCHEDULED.

use crate::error::Result;
use crate::logging::get_logger;
use chrono::{Datelike, Timelike, Utc};
use chrono_tz::Tz;

/// Charging mode enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingMode {
    /// Manual control - user sets current directly
    Manual = 0,
    /// Automatic control - solar-excess-optimized charging
    Auto = 1,
    /// Scheduled control - time- or price-feed-based charging
    Scheduled = 2,
}

/// Start/stop state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStopState {
    Stopped = 0,
    Enabled = 1,
}

/// Charging control system
pub struct ChargingControls {
    logger: crate::logging::StructuredLogger,
}

impl ChargingControls {
    pub fn new() -> Self {
        Self {
            logger: get_logger("controls"),
        }
    }
}

impl Default for ChargingControls {
    fn default() -> Self {
        Self::new()
    }
}

impl ChargingControls {
    /// Compute the raw desired current for the active mode, before AUTO
    /// start/stop hysteresis is applied. `solar_power` is the smoothed
    /// excess-PV signal in Watts, meaningful only in AUTO mode.
    #[allow(clippy::too_many_arguments)]
    pub async fn compute_effective_current(
        &self,
        mode: ChargingMode,
        start_stop: StartStopState,
        requested_current: f32,
        station_max_current: f32,
        solar_power: Option<f32>,
        config: &crate::config::Config,
        assumed_phases: u8,
    ) -> Result<f32> {
        if start_stop == StartStopState::Stopped {
            return Ok(0.0);
        }

        let effective = match mode {
            ChargingMode::Manual => requested_current
                .clamp(0.0, config.controls.max_set_current)
                .min(station_max_current),
            ChargingMode::Auto => {
                Self::auto_current_from_excess(solar_power, station_max_current, config, assumed_phases)
            }
            ChargingMode::Scheduled => {
                self.scheduled_current(config, station_max_current).await
            }
        };

        Ok(effective)
    }

    fn auto_current_from_excess(
        solar_power: Option<f32>,
        station_max_current: f32,
        config: &crate::config::Config,
        assumed_phases: u8,
    ) -> f32 {
        let excess_watts = solar_power.unwrap_or(0.0).max(0.0);
        let nominal_voltage = 230.0f32;
        let phases = assumed_phases.clamp(1, 3) as f32;
        let amps_raw = excess_watts / (phases * nominal_voltage);
        let min_current = config.controls.min_set_current.max(0.0);
        let amps = if amps_raw < min_current { 0.0 } else { amps_raw };
        amps.min(station_max_current)
    }

    async fn scheduled_current(&self, config: &crate::config::Config, station_max_current: f32) -> f32 {
        match config.schedule.mode.as_str() {
            "pricefeed" => {
                let (allowed, reason) = self.evaluate_pricefeed(config).await;
                self.logger.debug(&reason);
                if allowed {
                    self.schedule_current_for_now(config).unwrap_or(station_max_current)
                } else {
                    0.0
                }
            }
            other => {
                if other != "time" {
                    self.logger.warn(&format!(
                        "Unknown schedule.mode='{}' — defaulting to time-based schedule",
                        other
                    ));
                }
                if Self::is_within_any_schedule(config) {
                    self.schedule_current_for_now(config).unwrap_or(station_max_current)
                } else {
                    0.0
                }
            }
        }
    }

    #[cfg(feature = "pricefeed")]
    async fn evaluate_pricefeed(&self, config: &crate::config::Config) -> (bool, String) {
        let mut client = crate::pricefeed::PriceFeedClient::new();
        match crate::pricefeed::check_pricefeed_schedule(&config.pricefeed, &mut client).await {
            Ok(result) => result,
            Err(err) => (false, format!("price feed check failed: {} — not charging", err)),
        }
    }

    #[cfg(not(feature = "pricefeed"))]
    async fn evaluate_pricefeed(&self, config: &crate::config::Config) -> (bool, String) {
        crate::pricefeed::check_pricefeed_schedule(&config.pricefeed)
            .await
            .unwrap_or_else(|e| (false, e.to_string()))
    }

    /// Per-window current override, if the active schedule item names one.
    fn schedule_current_for_now(&self, config: &crate::config::Config) -> Option<f32> {
        let (weekday, minutes_now) = Self::local_weekday_and_minute(config);
        config
            .schedule
            .items
            .iter()
            .find(|item| Self::item_matches(item, weekday, minutes_now))
            .and_then(|item| item.current_amps)
    }

    fn local_weekday_and_minute(config: &crate::config::Config) -> (u8, u32) {
        let tz: Tz = config
            .timezone
            .parse()
            .unwrap_or_else(|_| "UTC".parse().unwrap());
        let now_local = Utc::now().with_timezone(&tz);
        (
            now_local.weekday().num_days_from_monday() as u8,
            now_local.hour() * 60 + now_local.minute(),
        )
    }

    fn item_matches(item: &crate::config::ScheduleItem, weekday: u8, minutes_now: u32) -> bool {
        if !item.active {
            return false;
        }
        if !item.days.is_empty() && !item.days.contains(&weekday) {
            return false;
        }
        let start_min = Self::parse_hhmm(&item.start_time);
        let end_min = Self::parse_hhmm(&item.end_time);
        if start_min == end_min {
            return false;
        }
        let overnight = start_min >= end_min;
        if overnight {
            minutes_now >= start_min || minutes_now < end_min
        } else {
            minutes_now >= start_min && minutes_now < end_min
        }
    }

    fn is_within_any_schedule(config: &crate::config::Config) -> bool {
        let (weekday, minutes_now) = Self::local_weekday_and_minute(config);
        config
            .schedule
            .items
            .iter()
            .any(|item| Self::item_matches(item, weekday, minutes_now))
    }

    fn parse_hhmm(s: &str) -> u32 {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return 0;
        }
        let h = parts[0].parse::<u32>().unwrap_or(0) % 24;
        let m = parts[1].parse::<u32>().unwrap_or(0) % 60;
        h * 60 + m
    }

    /// Public helper to check if any schedule window is currently active
    pub fn is_schedule_active(config: &crate::config::Config) -> bool {
        Self::is_within_any_schedule(config)
    }
}

/// AUTO-mode start/stop hysteresis: requires the desired current to stay
/// above `min_set_current` for `enable_hold_seconds` before charging starts,
/// and below it for `disable_hold_seconds` before charging stops. This
/// absorbs brief cloud-cover dips without toggling the contactor.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoHoldTimers {
    /// Seconds the desired current has continuously been >= min_set_current
    pub seconds_above_min: f32,
    /// Seconds the desired current has continuously been < min_set_current
    pub seconds_below_min: f32,
}

impl AutoHoldTimers {
    /// Advance the timers by `dt_seconds` given the latest desired current,
    /// then decide whether charging should be enabled.
    pub fn advance(
        &mut self,
        desired_current: f32,
        min_set_current: f32,
        dt_seconds: f32,
        currently_enabled: bool,
        enable_hold_seconds: f32,
        disable_hold_seconds: f32,
    ) -> bool {
        if desired_current >= min_set_current {
            self.seconds_above_min += dt_seconds;
            self.seconds_below_min = 0.0;
        } else {
            self.seconds_below_min += dt_seconds;
            self.seconds_above_min = 0.0;
        }

        if currently_enabled {
            self.seconds_below_min < disable_hold_seconds || disable_hold_seconds <= 0.0
        } else {
            self.seconds_above_min >= enable_hold_seconds
        }
    }
}

/// Decide the phase count (1 or 3) a given desired current calls for, with
/// hysteresis around the 1-phase/3-phase boundary so a setpoint hovering near
/// the limit doesn't flip back and forth. In AUTO mode the amp-based
/// hysteresis band is widened by `auto_phase_hysteresis_watts` converted to
/// an equivalent amperage, since the excess-PV signal it's derived from is
/// noisier than a user-entered MANUAL/SCHEDULED current.
pub fn desired_phase_count(
    desired_amps: f32,
    current_phases: u8,
    is_auto_mode: bool,
    cfg: &crate::config::ControlsConfig,
) -> u8 {
    if !cfg.auto_phase_switch {
        return if current_phases >= 3 { 3 } else { 1 };
    }

    let single_max = cfg.single_phase_max_current;
    let mut hysteresis = cfg.phase_hysteresis_amps;
    if is_auto_mode {
        let phases_for_conversion = if current_phases >= 3 { 3.0 } else { 1.0 };
        hysteresis += cfg.auto_phase_hysteresis_watts / (230.0 * phases_for_conversion);
    }

    if desired_amps > single_max {
        3
    } else if desired_amps <= single_max - hysteresis {
        1
    } else if current_phases >= 3 {
        3
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(ChargingControls::parse_hhmm("08:30"), 8 * 60 + 30);
        assert_eq!(ChargingControls::parse_hhmm("23:59"), 23 * 60 + 59);
        assert_eq!(ChargingControls::parse_hhmm("24:00"), 0);
        assert_eq!(ChargingControls::parse_hhmm("bad"), 0);
    }

    fn make_config_active_now() -> crate::config::Config {
        let mut cfg = crate::config::Config {
            timezone: "UTC".to_string(),
            ..crate::config::Config::default()
        };
        let now = Utc::now();
        let weekday = now.weekday().num_days_from_monday() as u8;
        let start_min = now.minute().saturating_sub(1);
        let end_min = (now.minute() + 1).min(59);
        cfg.schedule.items.push(crate::config::ScheduleItem {
            active: true,
            days: vec![weekday],
            start_time: format!("{:02}:{:02}", now.hour(), start_min),
            end_time: format!("{:02}:{:02}", now.hour(), end_min),
            current_amps: None,
        });
        cfg
    }

    #[test]
    fn schedule_active_now_returns_true() {
        let cfg = make_config_active_now();
        assert!(ChargingControls::is_schedule_active(&cfg));
    }

    #[tokio::test]
    async fn manual_clamps_to_station_max() {
        let controls = ChargingControls::new();
        let cfg = crate::config::Config::default();
        let manual = controls
            .compute_effective_current(
                ChargingMode::Manual,
                StartStopState::Enabled,
                40.0,
                32.0,
                None,
                &cfg,
                3,
            )
            .await
            .unwrap();
        assert!((manual - 32.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn auto_below_minimum_floors_to_zero() {
        let controls = ChargingControls::new();
        let mut cfg = crate::config::Config::default();
        cfg.controls.min_set_current = 6.0;
        let auto_low = controls
            .compute_effective_current(
                ChargingMode::Auto,
                StartStopState::Enabled,
                0.0,
                32.0,
                Some(3000.0), // ~4.3A at 3 phases, below 6A minimum
                &cfg,
                3,
            )
            .await
            .unwrap();
        assert_eq!(auto_low, 0.0);
    }

    #[tokio::test]
    async fn auto_above_minimum_converts_watts_to_amps() {
        let controls = ChargingControls::new();
        let cfg = crate::config::Config::default();
        let watts = 5000.0f32;
        let auto_high = controls
            .compute_effective_current(
                ChargingMode::Auto,
                StartStopState::Enabled,
                0.0,
                32.0,
                Some(watts),
                &cfg,
                3,
            )
            .await
            .unwrap();
        let expected = watts / (3.0 * 230.0);
        assert!((auto_high - expected).abs() < 0.01);
    }

    #[tokio::test]
    async fn scheduled_uses_time_window() {
        let controls = ChargingControls::new();
        let cfg = make_config_active_now();
        let amps = controls
            .compute_effective_current(
                ChargingMode::Scheduled,
                StartStopState::Enabled,
                0.0,
                20.0,
                None,
                &cfg,
                3,
            )
            .await
            .unwrap();
        assert_eq!(amps, 20.0);
    }

    #[tokio::test]
    async fn stopped_state_always_yields_zero() {
        let controls = ChargingControls::new();
        let cfg = crate::config::Config::default();
        let amps = controls
            .compute_effective_current(
                ChargingMode::Manual,
                StartStopState::Stopped,
                20.0,
                32.0,
                None,
                &cfg,
                3,
            )
            .await
            .unwrap();
        assert_eq!(amps, 0.0);
    }

    #[test]
    fn hold_timers_require_sustained_current_before_enabling() {
        let mut timers = AutoHoldTimers::default();
        assert!(!timers.advance(10.0, 6.0, 10.0, false, 30.0, 60.0));
        assert!(!timers.advance(10.0, 6.0, 10.0, false, 30.0, 60.0));
        assert!(timers.advance(10.0, 6.0, 15.0, false, 30.0, 60.0));
    }

    #[test]
    fn hold_timers_require_sustained_absence_before_disabling() {
        let mut timers = AutoHoldTimers::default();
        timers.seconds_above_min = 999.0;
        assert!(timers.advance(0.0, 6.0, 30.0, true, 30.0, 60.0));
        assert!(!timers.advance(0.0, 6.0, 40.0, true, 30.0, 60.0));
    }

    #[test]
    fn phase_selection_switches_up_above_single_phase_max() {
        let cfg = crate::config::ControlsConfig::default();
        assert_eq!(desired_phase_count(17.0, 1, false, &cfg), 3);
    }

    #[test]
    fn phase_selection_switches_down_below_hysteresis_band() {
        let cfg = crate::config::ControlsConfig::default();
        assert_eq!(desired_phase_count(13.0, 3, false, &cfg), 1);
    }

    #[test]
    fn phase_selection_holds_inside_hysteresis_band() {
        let cfg = crate::config::ControlsConfig::default();
        // 15 A is between (single_phase_max - hysteresis) = 14 and single_phase_max = 16:
        // stays on whichever phase count is already active.
        assert_eq!(desired_phase_count(15.0, 3, false, &cfg), 3);
        assert_eq!(desired_phase_count(15.0, 1, false, &cfg), 1);
    }

    #[test]
    fn phase_selection_disabled_keeps_current_phases() {
        let mut cfg = crate::config::ControlsConfig::default();
        cfg.auto_phase_switch = false;
        assert_eq!(desired_phase_count(30.0, 1, false, &cfg), 1);
        assert_eq!(desired_phase_count(0.0, 3, false, &cfg), 3);
    }

    #[test]
    fn phase_selection_in_auto_mode_widens_hysteresis_with_watts() {
        let cfg = crate::config::ControlsConfig::default();
        // auto_phase_hysteresis_watts=300 at 3-phase adds 300/(230*3)=0.43 A
        // on top of the 2 A amp-based hysteresis, so 13.6 A (just below the
        // amp-only cutoff of 14 A) still holds 3-phase in AUTO.
        assert_eq!(desired_phase_count(13.6, 3, true, &cfg), 3);
    }
}
