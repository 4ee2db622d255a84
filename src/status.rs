//! Canonical charger status state machine.
//!
//! The Alfen station reports IEC 61851 mode-3 states (A, B1/B2, C1/C2, D1/D2,
//! E, F) as an ASCII string. This module folds that raw state, together with
//! the engine's own mode/start-stop policy, into the smaller canonical status
//! the rest of the system (session tracker, D-Bus, web API) actually reasons
//! about.

use serde::{Deserialize, Serialize};

/// Canonical charger status, independent of the wire-level mode-3 letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerStatus {
    /// No vehicle plugged in (mode-3 state A)
    Disconnected,
    /// Vehicle plugged in but not drawing power (B1/B2, or C/D with 0 A applied)
    Connected,
    /// Vehicle actively drawing power (C1/C2, D1/D2 with non-zero current)
    Charging,
    /// Vehicle plugged in, was charging, and has tapered to near-zero power
    Charged,
    /// AUTO mode is holding for more excess solar before it starts charging
    WaitSun,
    /// SCHEDULED mode is holding until its next active window
    WaitStart,
    /// Charging is held because the vehicle's state of charge is below the
    /// configured minimum and house load currently needs priority
    LowSoc,
}

impl ChargerStatus {
    /// Victron `/Status` enumeration code, as published on the D-Bus.
    pub fn victron_code(self) -> u8 {
        match self {
            ChargerStatus::Disconnected => 0,
            ChargerStatus::Connected => 1,
            ChargerStatus::Charging => 2,
            ChargerStatus::WaitSun => 4,
            ChargerStatus::WaitStart => 6,
            ChargerStatus::LowSoc => 7,
            ChargerStatus::Charged => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChargerStatus::Disconnected => "disconnected",
            ChargerStatus::Connected => "connected",
            ChargerStatus::Charging => "charging",
            ChargerStatus::Charged => "charged",
            ChargerStatus::WaitSun => "wait_sun",
            ChargerStatus::WaitStart => "wait_start",
            ChargerStatus::LowSoc => "low_soc",
        }
    }
}

/// Map the raw Alfen mode-3 status string to a base connected/charging
/// reading, ignoring engine-level policy. Keyed off the full two-character
/// state rather than just the leading letter: `C1`/`D1` (cable plugged, PWM
/// off, not permitted to draw) and `C2`/`D2` (permitted to draw) read
/// differently even though they share a first letter.
fn base_from_mode3(mode3: &str) -> ChargerStatus {
    match mode3.trim().to_ascii_uppercase().as_str() {
        "A" => ChargerStatus::Disconnected,
        "B1" | "B2" => ChargerStatus::Connected,
        "C2" | "D2" => ChargerStatus::Charging,
        "C1" | "D1" => ChargerStatus::Connected,
        // E (fault/no power) and F (unavailable) are reported as Disconnected.
        "E" | "F" => ChargerStatus::Disconnected,
        _ => ChargerStatus::Disconnected,
    }
}

/// Whether a raw mode-3 string is one of the recognised IEC 61851 states.
/// Used by the poll loop to decide whether an unrecognised reading deserves
/// a warning rather than silently falling back to `Disconnected`.
pub fn is_known_mode3(mode3: &str) -> bool {
    matches!(
        mode3.trim().to_ascii_uppercase().as_str(),
        "A" | "B1" | "B2" | "C1" | "C2" | "D1" | "D2" | "E" | "F"
    )
}

/// Inputs the policy layer needs to refine the raw mode-3 reading into the
/// canonical status. All timers are "seconds this condition has held" so the
/// driver owns wall-clock bookkeeping and this function stays pure.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusInputs {
    pub mode3: Option<&'static str>,
    pub applied_current_a: f32,
    pub real_power_w: f32,
    pub low_power_hold_seconds: f32,
    pub is_auto_mode: bool,
    pub is_scheduled_mode: bool,
    pub waiting_for_solar: bool,
    pub waiting_for_schedule: bool,
    pub soc_below_minimum: bool,
}

/// Real power must stay under this threshold continuously for
/// `CHARGED_HOLD_SECONDS` before a Charging session is considered Charged.
pub const CHARGED_POWER_THRESHOLD_W: f32 = 100.0;
pub const CHARGED_HOLD_SECONDS: f32 = 30.0;

/// Derive the canonical status from a raw mode-3 string plus engine policy
/// state, applying the precedence: disconnected > low-soc hold > wait-sun /
/// wait-start > charged-taper > base reading.
pub fn derive(mode3_str: &str, inputs: StatusInputs) -> ChargerStatus {
    let base = base_from_mode3(mode3_str);

    if base == ChargerStatus::Disconnected {
        return ChargerStatus::Disconnected;
    }

    if inputs.soc_below_minimum && (inputs.is_auto_mode || inputs.is_scheduled_mode) {
        return ChargerStatus::LowSoc;
    }

    if inputs.is_auto_mode && inputs.waiting_for_solar && base != ChargerStatus::Charging {
        return ChargerStatus::WaitSun;
    }

    if inputs.is_scheduled_mode && inputs.waiting_for_schedule && base != ChargerStatus::Charging {
        return ChargerStatus::WaitStart;
    }

    if base == ChargerStatus::Charging
        && inputs.real_power_w < CHARGED_POWER_THRESHOLD_W
        && inputs.low_power_hold_seconds >= CHARGED_HOLD_SECONDS
    {
        return ChargerStatus::Charged;
    }

    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> StatusInputs {
        StatusInputs::default()
    }

    #[test]
    fn disconnected_overrides_everything() {
        let mut i = inputs();
        i.soc_below_minimum = true;
        i.is_auto_mode = true;
        assert_eq!(derive("A", i), ChargerStatus::Disconnected);
    }

    #[test]
    fn plugged_not_charging_is_connected() {
        assert_eq!(derive("B1", inputs()), ChargerStatus::Connected);
    }

    #[test]
    fn c2_and_d2_are_charging_regardless_of_applied_current() {
        // The raw mode-3 state alone decides the base reading; a stale or
        // in-flight applied-current value must not override it.
        assert_eq!(derive("C2", inputs()), ChargerStatus::Charging);
        assert_eq!(derive("D2", inputs()), ChargerStatus::Charging);

        let mut i = inputs();
        i.applied_current_a = 6.0;
        assert_eq!(derive("C2", i), ChargerStatus::Charging);
    }

    #[test]
    fn c1_and_d1_are_connected_not_charging() {
        // PWM off: cable plugged in, but the vehicle is not permitted to draw.
        let mut i = inputs();
        i.applied_current_a = 6.0;
        assert_eq!(derive("C1", i), ChargerStatus::Connected);
        assert_eq!(derive("D1", i), ChargerStatus::Connected);
    }

    #[test]
    fn e_and_f_are_disconnected() {
        assert_eq!(derive("E", inputs()), ChargerStatus::Disconnected);
        assert_eq!(derive("F", inputs()), ChargerStatus::Disconnected);
    }

    #[test]
    fn unrecognised_mode3_is_not_known() {
        assert!(is_known_mode3("B1"));
        assert!(!is_known_mode3("Z9"));
        assert_eq!(derive("Z9", inputs()), ChargerStatus::Disconnected);
    }

    #[test]
    fn low_soc_takes_precedence_over_charging() {
        let mut i = inputs();
        i.applied_current_a = 6.0;
        i.is_auto_mode = true;
        i.soc_below_minimum = true;
        assert_eq!(derive("C2", i), ChargerStatus::LowSoc);
    }

    #[test]
    fn wait_sun_shown_while_auto_withholds_current() {
        let mut i = inputs();
        i.is_auto_mode = true;
        i.waiting_for_solar = true;
        assert_eq!(derive("B2", i), ChargerStatus::WaitSun);
    }

    #[test]
    fn wait_start_shown_while_scheduled_inactive() {
        let mut i = inputs();
        i.is_scheduled_mode = true;
        i.waiting_for_schedule = true;
        assert_eq!(derive("C1", i), ChargerStatus::WaitStart);
    }

    #[test]
    fn charged_requires_sustained_low_power() {
        let mut i = inputs();
        i.applied_current_a = 6.0;
        i.real_power_w = 50.0;
        i.low_power_hold_seconds = 10.0;
        assert_eq!(derive("C2", i), ChargerStatus::Charging);

        i.low_power_hold_seconds = 31.0;
        assert_eq!(derive("C2", i), ChargerStatus::Charged);
    }

    #[test]
    fn victron_codes_match_status_register_convention() {
        assert_eq!(ChargerStatus::Disconnected.victron_code(), 0);
        assert_eq!(ChargerStatus::Connected.victron_code(), 1);
        assert_eq!(ChargerStatus::Charging.victron_code(), 2);
        assert_eq!(ChargerStatus::WaitSun.victron_code(), 4);
        assert_eq!(ChargerStatus::WaitStart.victron_code(), 6);
        assert_eq!(ChargerStatus::LowSoc.victron_code(), 7);
        assert_eq!(ChargerStatus::Charged.victron_code(), 8);
    }
}
