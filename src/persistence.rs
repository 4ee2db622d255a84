//! Durable state for the control engine.
//!
//! Every write is atomic: the new content lands in a temp file in the same
//! directory as the target, which is then renamed over it. A reader can
//! never observe a partially-written file, even if the process is killed
//! mid-write.

use crate::error::Result;
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent state structure, written after every applied change and read
/// back once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    /// Mode (Manual=0, Auto=1, Scheduled=2)
    pub mode: u32,

    /// Start/stop state (Stopped=0, Enabled=1)
    pub start_stop: u32,

    /// Intended (user-requested) current, amperes
    pub set_current: f32,

    /// Last current actually written to the charger, amperes
    pub last_applied_current: f32,

    /// Last phase count actually applied (1 or 3)
    pub last_applied_phases: u8,

    /// Energy counter carry, Wh, accumulated across charger reboots so
    /// session energy stays monotonically non-decreasing
    pub carried_energy_wh: f64,

    /// Last raw energy counter reading observed from the charger, Wh
    pub last_raw_energy_wh: f64,

    /// Last canonical status, as `status::ChargerStatus::as_str()`
    pub last_status: String,

    /// Timestamp (unix seconds) an insufficient-solar hold began, 0 if none
    pub insufficient_solar_start: f64,

    /// Open or most-recently-closed session, as JSON
    pub session: serde_json::Value,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            mode: 0,
            start_stop: 0,
            set_current: 6.0,
            last_applied_current: 0.0,
            last_applied_phases: 3,
            carried_energy_wh: 0.0,
            last_raw_energy_wh: 0.0,
            last_status: "disconnected".to_string(),
            insufficient_solar_start: 0.0,
            session: serde_json::Value::Null,
        }
    }
}

/// Persistence manager: owns the in-memory copy of `PersistentState` and
/// flushes it to disk atomically.
pub struct PersistenceManager {
    file_path: PathBuf,
    state: PersistentState,
    logger: crate::logging::StructuredLogger,
}

impl PersistenceManager {
    /// Create a new persistence manager
    pub fn new(file_path: &str) -> Self {
        let logger = get_logger("persistence");
        Self {
            file_path: PathBuf::from(file_path),
            state: PersistentState::default(),
            logger,
        }
    }

    /// Load state from disk, leaving defaults in place if no file exists yet
    /// or the file cannot be parsed (a corrupt state file must never prevent
    /// startup).
    pub fn load(&mut self) -> Result<()> {
        if !self.file_path.exists() {
            self.logger
                .info("No persistent state file found, using defaults");
            return Ok(());
        }

        let contents = std::fs::read_to_string(&self.file_path)?;
        match serde_json::from_str(&contents) {
            Ok(state) => {
                self.state = state;
                self.logger.info("Loaded persistent state from disk");
            }
            Err(e) => {
                self.logger.error(&format!(
                    "persistent state file is corrupt, starting from defaults: {}",
                    e
                ));
            }
        }

        Ok(())
    }

    /// Save state to disk atomically: write to a sibling temp file, then
    /// rename over the target so readers never see a half-written file.
    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.state)?;

        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let file_name = self
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let tmp_path = dir.join(format!(".{}.tmp", file_name));

        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.file_path)?;

        self.logger.debug("Saved persistent state to disk");
        Ok(())
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn set_mode(&mut self, value: u32) {
        self.state.mode = value;
    }

    pub fn set_start_stop(&mut self, value: u32) {
        self.state.start_stop = value;
    }

    pub fn set_set_current(&mut self, value: f32) {
        self.state.set_current = value;
    }

    pub fn set_last_applied(&mut self, current: f32, phases: u8) {
        self.state.last_applied_current = current;
        self.state.last_applied_phases = phases;
    }

    pub fn set_energy_counters(&mut self, carried_wh: f64, last_raw_wh: f64) {
        self.state.carried_energy_wh = carried_wh;
        self.state.last_raw_energy_wh = last_raw_wh;
    }

    pub fn set_last_status(&mut self, status: &str) {
        self.state.last_status = status.to_string();
    }

    pub fn set_insufficient_solar_start(&mut self, value: f64) {
        self.state.insufficient_solar_start = value;
    }

    pub fn get_section(&self, section: &str) -> Option<serde_json::Value> {
        match section {
            "session" => Some(self.state.session.clone()),
            _ => None,
        }
    }

    pub fn set_section(&mut self, section: &str, data: serde_json::Value) -> Result<()> {
        if section == "session" {
            self.state.session = data;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut mgr = PersistenceManager::new(path.to_str().unwrap());
        mgr.set_mode(1);
        mgr.set_last_applied(16.0, 3);
        mgr.set_energy_counters(12.5, 8.0);
        mgr.save().unwrap();

        let mut mgr2 = PersistenceManager::new(path.to_str().unwrap());
        mgr2.load().unwrap();
        assert_eq!(mgr2.state().mode, 1);
        assert_eq!(mgr2.state().last_applied_current, 16.0);
        assert_eq!(mgr2.state().carried_energy_wh, 12.5);
    }

    #[test]
    fn missing_file_leaves_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let mut mgr = PersistenceManager::new(path.to_str().unwrap());
        mgr.load().unwrap();
        assert_eq!(mgr.state().mode, 0);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut mgr = PersistenceManager::new(path.to_str().unwrap());
        assert!(mgr.load().is_ok());
        assert_eq!(mgr.state().mode, 0);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mgr = PersistenceManager::new(path.to_str().unwrap());
        mgr.save().unwrap();
        assert!(path.exists());
    }
}
