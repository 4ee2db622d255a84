//! Configuration management for EvseBridge
//!
//! This module handles loading, validation, and management of the application
//! configuration from a YAML file. The shape is closed (unknown top-level
//! keys are rejected) so a typo in a deployed config surfaces at startup
//! rather than silently doing nothing.

use crate::error::{BridgeError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Modbus TCP connection configuration
    pub modbus: ModbusConfig,

    /// Device instance for D-Bus service naming
    pub device_instance: u32,

    /// Require D-Bus to be available; fail fast on startup if unavailable
    #[serde(default = "default_true")]
    pub require_dbus: bool,

    /// Modbus register address mappings
    pub registers: RegistersConfig,

    /// Default operational values
    pub defaults: DefaultsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Charging schedule configuration
    pub schedule: ScheduleConfig,

    /// Dynamic price feed configuration, consulted by SCHEDULED mode
    pub pricefeed: PriceFeedConfig,

    /// Control and safety limit configuration
    pub controls: ControlsConfig,

    /// Web server binding configuration
    pub web: WebConfig,

    /// Pricing configuration for session cost calculation
    pub pricing: PricingConfig,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Timezone for schedule operations (IANA name, e.g. "Europe/Amsterdam")
    pub timezone: String,
}

/// Modbus TCP connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ModbusConfig {
    /// IP address of the EV charger
    pub ip: String,

    /// TCP port (typically 502)
    pub port: u16,

    /// Slave ID for socket-related (measurement) registers
    pub socket_slave_id: u8,

    /// Slave ID for station configuration registers
    pub station_slave_id: u8,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Per-operation timeout in milliseconds
    pub operation_timeout_ms: u64,

    /// Maximum attempts for a bounded-retry operation before giving up
    pub max_retry_attempts: u32,

    /// Initial backoff delay in milliseconds, doubled after each failed attempt
    pub retry_backoff_initial_ms: u64,

    /// Ceiling on the exponential backoff delay in milliseconds
    pub retry_backoff_max_ms: u64,
}

/// Modbus register address mappings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RegistersConfig {
    /// Voltage register addresses (L1, L2, L3)
    pub voltages: u16,

    /// Current register addresses (L1, L2, L3)
    pub currents: u16,

    /// Power register addresses
    pub power: u16,

    /// Energy counter register address
    pub energy: u16,

    /// Status string register address
    pub status: u16,

    /// Current setting register address
    pub amps_config: u16,

    /// Phase configuration register address
    pub phases: u16,

    /// Firmware version register addresses
    pub firmware_version: u16,
    pub firmware_version_count: u16,

    /// Serial number register addresses
    pub station_serial: u16,
    pub station_serial_count: u16,

    /// Manufacturer register addresses
    pub manufacturer: u16,
    pub manufacturer_count: u16,

    /// Platform type register addresses
    pub platform_type: u16,
    pub platform_type_count: u16,

    /// Station max current register address
    pub station_max_current: u16,

    /// Station status register address
    pub station_status: u16,
}

/// Default operational values
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Default charging current in amperes
    pub intended_set_current: f32,

    /// Default max current if the identity read fails
    pub station_max_current: f32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Console sink level override; falls back to `level` when unset
    pub console_level: Option<String>,

    /// File sink level override; falls back to `level` when unset
    pub file_level: Option<String>,

    /// Web log-stream sink level override; falls back to `level` when unset
    pub web_level: Option<String>,

    /// Path to log file
    pub file: String,

    /// Log format (structured or simple)
    pub format: String,

    /// Max log file size in MB before rotation
    pub max_file_size_mb: u32,

    /// Number of rotated backup files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON formatting for file output
    pub json_format: bool,
}

/// A single named charging window.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScheduleItem {
    /// Whether this window is currently enabled
    pub active: bool,

    /// Days this window applies to (0=Monday .. 6=Sunday); empty means every day
    pub days: Vec<u8>,

    /// Start time in HH:MM (local schedule timezone)
    pub start_time: String,

    /// End time in HH:MM. A window where end <= start wraps past midnight.
    pub end_time: String,

    /// Current to apply while this window is active, in amperes. `None` means
    /// charge at the station's maximum.
    pub current_amps: Option<f32>,
}

/// Schedule configuration container
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Dispatch mode for SCHEDULED charging: "time" (use `items`) or
    /// "pricefeed" (derive virtual windows from the dynamic price feed).
    #[serde(default = "default_schedule_mode")]
    pub mode: String,

    /// List of schedule items, evaluated in order; first match wins
    pub items: Vec<ScheduleItem>,
}

fn default_schedule_mode() -> String {
    "time".to_string()
}

/// Dynamic price feed configuration, used by SCHEDULED mode when
/// `schedule.mode == "pricefeed"`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PriceFeedConfig {
    /// Whether the feed is consulted at all
    pub enabled: bool,

    /// HTTP endpoint returning day-ahead price points as JSON
    pub url: String,

    /// Bearer token sent as `Authorization: Bearer <token>`, if non-empty
    pub api_token: String,

    /// Selection strategy: "level", "threshold", or "percentile"
    pub strategy: String,

    /// Absolute price ceiling for the "threshold" strategy
    pub max_price_total: f64,

    /// Allowed fraction above the cheapest price still considered acceptable
    /// for the "threshold" strategy (0.0 = only the single cheapest price)
    pub threshold_tolerance: f64,

    /// Fraction of the cheapest prices in the horizon considered chargeable
    /// for the "percentile" strategy (0.0..=1.0)
    pub cheap_percentile: f64,

    /// Charge when the feed reports price level CHEAP
    pub charge_on_cheap: bool,

    /// Charge when the feed reports price level VERY_CHEAP
    pub charge_on_very_cheap: bool,

    /// How many hours ahead to request and evaluate
    pub horizon_hours: u32,

    /// How long a successful fetch is cached before refetching, in minutes
    pub cache_minutes: u32,

    /// HTTP request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Maximum retry attempts for a failed fetch
    pub max_retries: u32,
}

/// Control and safety limits
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct ControlsConfig {
    /// Tolerance for current write verification, in amperes
    pub current_tolerance: f32,

    /// Minimum difference between desired and last-applied current that
    /// triggers a new write, in amperes
    pub update_difference_threshold: f32,

    /// Delay before verifying a write by reading the register back, in seconds
    pub verification_delay: f64,

    /// Delay between write retries, in seconds
    pub retry_delay: f64,

    /// Max write-verify retry attempts
    pub max_retries: u32,

    /// Watchdog interval in seconds: a periodic re-assertion of the current
    /// setpoint even when unchanged, to recover from a charger-side reset
    pub watchdog_interval_seconds: u32,

    /// Max settable current, hard ceiling regardless of mode
    pub max_set_current: f32,

    /// Minimum non-zero current to apply in AUTO mode; below this the
    /// computed current is floored to 0 A to avoid oscillating with
    /// sub-minimum setpoints. Typical EVSE minimum is 6 A.
    pub min_set_current: f32,

    /// Minimum charge duration in seconds once charging has started, used to
    /// avoid rapid on/off chatter in AUTO mode
    pub min_charge_duration_seconds: u32,

    /// How long AUTO/SCHEDULED must stay below `min_set_current` before the
    /// engine stops charging, in seconds
    pub disable_hold_seconds: u32,

    /// How long AUTO/SCHEDULED must stay above `min_set_current` before the
    /// engine starts charging, in seconds
    pub enable_hold_seconds: u32,

    /// Interval for refreshing current settings, in milliseconds
    pub current_update_interval: u32,

    /// Verification delay in milliseconds (fine-grained write-verify cycle)
    pub verify_delay_ms: u32,

    /// Time window to compensate measurement lag between the Victron house
    /// load reading and charger Modbus readings, in milliseconds. During
    /// this window after a set-current change we subtract the expected EV
    /// power (derived from the last sent current) from house consumption
    /// instead of the charger-reported power, to avoid double counting.
    pub ev_reporting_lag_ms: u32,

    /// Exponential moving average smoothing factor for PV excess (0..1).
    /// Lower values increase smoothing; 0 disables smoothing.
    pub pv_excess_ema_alpha: f32,

    /// Whether AUTO mode may switch between 1-phase and 3-phase charging
    pub auto_phase_switch: bool,

    /// Maximum current an EVSE connection may draw while on a single phase,
    /// in amperes; above this AUTO prefers 3-phase
    pub single_phase_max_current: f32,

    /// Hysteresis band, in amperes, around the 1-phase/3-phase boundary to
    /// avoid rapid back-and-forth switching
    pub phase_hysteresis_amps: f32,

    /// Hysteresis band, in Watts, applied on top of the Amp-based hysteresis
    pub auto_phase_hysteresis_watts: f32,

    /// Minimum time between two phase switches, in seconds
    pub phase_switch_grace_seconds: u32,

    /// Required settle time at 0 A before a phase switch is applied while
    /// the charger is actively charging, in seconds
    pub phase_switch_settle_seconds: u32,

    /// What to do with the setpoint on clean shutdown: "safe" (write 0 A) or
    /// "hold" (leave the last setpoint in place)
    pub start_stop_on_exit: String,

    /// Minimum battery state of charge, as a percentage (0-100), required in
    /// AUTO mode before charging is allowed; below this the engine forces
    /// the applied current to 0 and reports `LowSoc`. SOC exactly equal to
    /// this threshold does not trigger the override, only strictly less.
    pub min_soc: f32,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

/// Pricing configuration for session cost accounting
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Source: "static" (use `static_rate_eur_per_kwh`) or "pricefeed"
    pub source: String,

    /// Static rate, currency per kWh
    pub static_rate_eur_per_kwh: f64,

    /// Currency symbol used in reporting
    pub currency_symbol: String,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.100".to_string(),
            port: 502,
            socket_slave_id: 1,
            station_slave_id: 200,
            connect_timeout_ms: 5_000,
            operation_timeout_ms: 3_000,
            max_retry_attempts: 3,
            retry_backoff_initial_ms: 100,
            retry_backoff_max_ms: 2_000,
        }
    }
}

impl Default for RegistersConfig {
    fn default() -> Self {
        Self {
            voltages: 306,
            currents: 320,
            power: 344,
            energy: 374,
            status: 1201,
            amps_config: 1210,
            phases: 1215,
            firmware_version: 123,
            firmware_version_count: 17,
            station_serial: 157,
            station_serial_count: 11,
            manufacturer: 117,
            manufacturer_count: 5,
            platform_type: 140,
            platform_type_count: 17,
            station_max_current: 1100,
            station_status: 1201,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            intended_set_current: 6.0,
            station_max_current: 32.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            web_level: None,
            file: "/tmp/evse-bridge.log".to_string(),
            format: "structured".to_string(),
            max_file_size_mb: 10,
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_token: String::new(),
            strategy: "level".to_string(),
            max_price_total: 0.0,
            threshold_tolerance: 0.0,
            cheap_percentile: 0.3,
            charge_on_cheap: true,
            charge_on_very_cheap: true,
            horizon_hours: 24,
            cache_minutes: 15,
            request_timeout_seconds: 10,
            max_retries: 2,
        }
    }
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            current_tolerance: 0.5,
            update_difference_threshold: 0.1,
            verification_delay: 0.1,
            retry_delay: 0.5,
            max_retries: 3,
            watchdog_interval_seconds: 30,
            max_set_current: 64.0,
            min_set_current: 6.0,
            min_charge_duration_seconds: 300,
            disable_hold_seconds: 60,
            enable_hold_seconds: 30,
            current_update_interval: 30_000,
            verify_delay_ms: 100,
            ev_reporting_lag_ms: 2_000,
            pv_excess_ema_alpha: 0.4,
            auto_phase_switch: true,
            single_phase_max_current: 16.0,
            phase_hysteresis_amps: 2.0,
            auto_phase_hysteresis_watts: 300.0,
            phase_switch_grace_seconds: 60,
            phase_switch_settle_seconds: 5,
            start_stop_on_exit: "safe".to_string(),
            min_soc: 20.0,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            source: "static".to_string(),
            static_rate_eur_per_kwh: 0.25,
            currency_symbol: "€".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modbus: ModbusConfig::default(),
            device_instance: 0,
            require_dbus: true,
            registers: RegistersConfig::default(),
            defaults: DefaultsConfig::default(),
            logging: LoggingConfig::default(),
            schedule: ScheduleConfig::default(),
            pricefeed: PriceFeedConfig::default(),
            controls: ControlsConfig::default(),
            poll_interval_ms: 1000,
            timezone: "UTC".to_string(),
            web: WebConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with validation, searching default locations and
    /// falling back to built-in defaults when none exist.
    pub fn load() -> Result<Self> {
        let default_paths = [
            "evse_bridge_config.yaml",
            "/data/evse_bridge_config.yaml",
            "/etc/evse-bridge/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit override path when provided,
    /// otherwise fall back to the default search locations used by `load`.
    /// Unlike `load`, a provided override path must exist and be valid;
    /// no fallback to built-in defaults occurs in that case.
    pub fn load_with_override(config_path_override: Option<&Path>) -> Result<Self> {
        match config_path_override {
            Some(path) => Self::from_file(path),
            None => Self::load(),
        }
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration, returning the first violation found as a
    /// field-pathed `BridgeError::Validation`.
    pub fn validate(&self) -> Result<()> {
        if self.modbus.ip.is_empty() {
            return Err(BridgeError::validation(
                "modbus.ip",
                "IP address cannot be empty",
            ));
        }

        if self.modbus.port == 0 {
            return Err(BridgeError::validation(
                "modbus.port",
                "Port must be greater than 0",
            ));
        }

        if self.defaults.intended_set_current <= 0.0 {
            return Err(BridgeError::validation(
                "defaults.intended_set_current",
                "Must be positive",
            ));
        }

        if self.defaults.station_max_current <= 0.0 {
            return Err(BridgeError::validation(
                "defaults.station_max_current",
                "Must be positive",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(BridgeError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        if !matches!(self.schedule.mode.as_str(), "time" | "pricefeed") {
            return Err(BridgeError::validation(
                "schedule.mode",
                "Must be \"time\" or \"pricefeed\"",
            ));
        }

        if !matches!(
            self.pricefeed.strategy.as_str(),
            "level" | "threshold" | "percentile"
        ) {
            return Err(BridgeError::validation(
                "pricefeed.strategy",
                "Must be \"level\", \"threshold\", or \"percentile\"",
            ));
        }

        if !(0.0..=1.0).contains(&self.pricefeed.cheap_percentile) {
            return Err(BridgeError::validation(
                "pricefeed.cheap_percentile",
                "Must be between 0.0 and 1.0",
            ));
        }

        if !matches!(self.controls.start_stop_on_exit.as_str(), "safe" | "hold") {
            return Err(BridgeError::validation(
                "controls.start_stop_on_exit",
                "Must be \"safe\" or \"hold\"",
            ));
        }

        if self.controls.min_set_current > self.controls.max_set_current {
            return Err(BridgeError::validation(
                "controls.min_set_current",
                "Must not exceed controls.max_set_current",
            ));
        }

        if !(0.0..=100.0).contains(&self.controls.min_soc) {
            return Err(BridgeError::validation(
                "controls.min_soc",
                "Must be between 0 and 100",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.modbus.port, 502);
        assert_eq!(config.device_instance, 0);
        assert_eq!(config.poll_interval_ms, 1000);
        assert!(config.require_dbus);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.modbus.ip = String::new();
        assert!(config.validate().is_err());

        config = Config::default();
        config.modbus.port = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.pricefeed.strategy = "bogus".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.controls.min_set_current = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.modbus.port, deserialized.modbus.port);
        assert_eq!(config.pricefeed.strategy, deserialized.pricefeed.strategy);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let yaml = format!(
            "{}\nbogus_key: true\n",
            serde_yaml::to_string(&Config::default()).unwrap()
        );
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }
}
