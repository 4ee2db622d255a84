//! Charging session tracking.
//!
//! A session spans one plug-in-to-unplug (or stop-to-start) cycle. Energy is
//! derived from the charger's cumulative energy counter rather than
//! integrated power, so a session's delivered energy must be rebased
//! whenever the counter itself resets (a charger reboot) to stay
//! monotonically non-decreasing across the discontinuity.

use crate::error::{BridgeError, Result};
use crate::logging::get_logger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Charging session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// Raw charger energy-counter reading at session start, kWh
    pub start_energy_kwh: f64,
    pub end_energy_kwh: Option<f64>,

    /// Energy delivered so far, kWh, rebase-corrected
    pub energy_delivered_kwh: f64,

    pub peak_power_w: f64,
    pub average_power_w: f64,

    /// Accumulated cost, in the configured currency, if a rate is known
    pub cost: Option<f64>,

    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
    Interrupted,
    Failed,
}

/// A session older than this is not resumed on startup; it is closed out as
/// `Interrupted` instead, since its duration/average-power figures would no
/// longer be meaningful.
const MAX_RESUMABLE_SESSION_AGE_HOURS: i64 = 24;

/// Session manager for tracking charging sessions
pub struct ChargingSessionManager {
    pub current_session: Option<ChargingSession>,
    pub last_session: Option<ChargingSession>,
    session_history: Vec<ChargingSession>,
    max_history_size: usize,

    /// Raw charger counter reading at the moment of the last counter-decrease
    /// rebase, kWh. Added to subsequent raw readings so the in-session energy
    /// figure never drops when the charger's own counter resets.
    carried_kwh: f64,
    last_raw_kwh: f64,

    /// Persisted throttle: avoid writing to disk more than once per interval
    /// while a session is open.
    last_persist_at: Option<DateTime<Utc>>,

    logger: crate::logging::StructuredLogger,
}

impl ChargingSessionManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            current_session: None,
            last_session: None,
            session_history: Vec::with_capacity(max_history_size),
            max_history_size,
            carried_kwh: 0.0,
            last_raw_kwh: 0.0,
            last_persist_at: None,
            logger: get_logger("session"),
        }
    }

    /// Start a new charging session at the given raw energy-counter reading.
    pub fn start_session(&mut self, start_energy_kwh: f64) -> Result<()> {
        if self.current_session.is_some() {
            return Err(BridgeError::generic("Session already active"));
        }

        self.carried_kwh = 0.0;
        self.last_raw_kwh = start_energy_kwh;

        let session = ChargingSession {
            id: uuid::Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            end_time: None,
            start_energy_kwh,
            end_energy_kwh: None,
            energy_delivered_kwh: 0.0,
            peak_power_w: 0.0,
            average_power_w: 0.0,
            cost: None,
            status: SessionStatus::Active,
        };

        self.logger
            .info(&format!("Started charging session {}", session.id));
        self.current_session = Some(session);

        Ok(())
    }

    /// Absorb a charger counter reset (reboot) into `carried_kwh` and rebase
    /// the active session's baseline to the post-reset counter value, so
    /// `energy_delivered_kwh` holds at the pre-reset accumulated amount
    /// instead of jumping backward. A no-op if the counter hasn't decreased.
    fn rebase_on_decrease(&mut self, raw_energy_kwh: f64) {
        if raw_energy_kwh + 1e-9 < self.last_raw_kwh {
            self.carried_kwh += self.last_raw_kwh - self.current_session_start();
            self.logger.warn(&format!(
                "energy counter decreased ({:.3} -> {:.3} kWh); rebasing session accumulator",
                self.last_raw_kwh, raw_energy_kwh
            ));
            if let Some(session) = self.current_session.as_mut() {
                session.start_energy_kwh = raw_energy_kwh;
            }
        }
        self.last_raw_kwh = raw_energy_kwh;
    }

    /// Feed a new raw energy-counter reading and instantaneous power into the
    /// active session. If `raw_energy_kwh` has decreased since the last
    /// reading, the charger's counter reset (reboot); the drop is absorbed
    /// into `carried_kwh` so `energy_delivered_kwh` keeps climbing instead of
    /// jumping backward.
    pub fn update(&mut self, power_w: f64, raw_energy_kwh: f64, rate_per_kwh: Option<f64>) {
        self.rebase_on_decrease(raw_energy_kwh);

        let Some(session) = self.current_session.as_mut() else {
            return;
        };

        let effective = self.carried_kwh + raw_energy_kwh - session.start_energy_kwh;
        session.energy_delivered_kwh = effective.max(0.0);

        if power_w > session.peak_power_w {
            session.peak_power_w = power_w;
        }

        let duration_hours = (Utc::now() - session.start_time).num_seconds() as f64 / 3600.0;
        if duration_hours > 0.0 {
            session.average_power_w = session.energy_delivered_kwh / duration_hours * 1000.0;
        }

        if let Some(rate) = rate_per_kwh {
            session.cost = Some(session.energy_delivered_kwh * rate);
        }
    }

    fn current_session_start(&self) -> f64 {
        self.current_session
            .as_ref()
            .map(|s| s.start_energy_kwh)
            .unwrap_or(0.0)
    }

    /// Whether the open session should be flushed to persistence now, given
    /// `throttle_seconds` between writes.
    pub fn due_for_persist(&mut self, throttle_seconds: i64) -> bool {
        if self.current_session.is_none() {
            return false;
        }
        let now = Utc::now();
        match self.last_persist_at {
            Some(prev) if (now - prev).num_seconds() < throttle_seconds => false,
            _ => {
                self.last_persist_at = Some(now);
                true
            }
        }
    }

    /// End the current session at the given raw energy-counter reading.
    pub fn end_session(&mut self, end_energy_kwh: f64) -> Result<()> {
        self.close_session(end_energy_kwh, SessionStatus::Completed)
    }

    /// End the current session as interrupted (e.g. on shutdown or an
    /// unexpected disconnect) rather than a clean completion.
    pub fn interrupt_session(&mut self, end_energy_kwh: f64) -> Result<()> {
        self.close_session(end_energy_kwh, SessionStatus::Interrupted)
    }

    fn close_session(&mut self, end_energy_kwh: f64, status: SessionStatus) -> Result<()> {
        self.rebase_on_decrease(end_energy_kwh);

        let Some(mut session) = self.current_session.take() else {
            return Err(BridgeError::generic("No active session to end"));
        };

        session.end_time = Some(Utc::now());
        session.end_energy_kwh = Some(end_energy_kwh);
        session.energy_delivered_kwh =
            (self.carried_kwh + end_energy_kwh - session.start_energy_kwh).max(0.0);
        session.status = status;

        self.logger.info(&format!(
            "Ended charging session {}, delivered {:.3} kWh ({:?})",
            session.id, session.energy_delivered_kwh, status
        ));

        self.last_session = Some(session.clone());
        self.session_history.push(session);
        if self.session_history.len() > self.max_history_size {
            self.session_history.remove(0);
        }
        self.last_persist_at = None;

        Ok(())
    }

    pub fn get_session_stats(&self) -> serde_json::Value {
        let mut stats = serde_json::Map::new();

        if let Some(session) = &self.current_session {
            stats.insert("session_active".to_string(), true.into());
            stats.insert(
                "session_duration_min".to_string(),
                (((Utc::now() - session.start_time).num_seconds() / 60) as u64).into(),
            );
            stats.insert(
                "energy_delivered_kwh".to_string(),
                session.energy_delivered_kwh.into(),
            );
            stats.insert("cost".to_string(), session.cost.into());
        } else {
            stats.insert("session_active".to_string(), false.into());
            stats.insert("session_duration_min".to_string(), serde_json::Value::Null);
            stats.insert("energy_delivered_kwh".to_string(), serde_json::Value::Null);
            stats.insert("cost".to_string(), serde_json::Value::Null);
        }

        serde_json::Value::Object(stats)
    }

    /// Serialize everything needed to resume or report on session state
    /// across a process restart.
    pub fn get_state(&self) -> serde_json::Value {
        serde_json::json!({
            "current_session": self.current_session,
            "last_session": self.last_session,
            "carried_kwh": self.carried_kwh,
            "last_raw_kwh": self.last_raw_kwh,
        })
    }

    /// Restore from a previously serialized state. A session more than
    /// `MAX_RESUMABLE_SESSION_AGE_HOURS` old is not resumed as Active; it is
    /// filed as Interrupted in history instead.
    pub fn restore_state(&mut self, state: serde_json::Value) -> Result<()> {
        if state.is_null() {
            return Ok(());
        }

        if let Some(v) = state.get("carried_kwh").and_then(|v| v.as_f64()) {
            self.carried_kwh = v;
        }
        if let Some(v) = state.get("last_raw_kwh").and_then(|v| v.as_f64()) {
            self.last_raw_kwh = v;
        }
        if let Some(last) = state.get("last_session")
            && !last.is_null()
            && let Ok(session) = serde_json::from_value::<ChargingSession>(last.clone())
        {
            self.last_session = Some(session);
        }

        if let Some(cur) = state.get("current_session")
            && !cur.is_null()
            && let Ok(session) = serde_json::from_value::<ChargingSession>(cur.clone())
        {
            let age_hours = (Utc::now() - session.start_time).num_hours();
            if age_hours <= MAX_RESUMABLE_SESSION_AGE_HOURS {
                self.logger.info(&format!(
                    "Resuming in-progress session {} ({} h old)",
                    session.id, age_hours
                ));
                self.current_session = Some(session);
            } else {
                self.logger.warn(&format!(
                    "Stale session {} ({} h old) not resumed; filing as interrupted",
                    session.id, age_hours
                ));
                let mut stale = session;
                stale.end_time = Some(stale.start_time);
                stale.status = SessionStatus::Interrupted;
                self.last_session = Some(stale.clone());
                self.session_history.push(stale);
            }
        }

        Ok(())
    }
}

impl Default for ChargingSessionManager {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lifecycle_tracks_energy() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.start_session(100.0).unwrap();
        mgr.update(5000.0, 101.5, None);
        assert!((mgr.current_session.as_ref().unwrap().energy_delivered_kwh - 1.5).abs() < 1e-9);

        mgr.end_session(102.0).unwrap();
        assert!(mgr.current_session.is_none());
        let last = mgr.last_session.unwrap();
        assert!((last.energy_delivered_kwh - 2.0).abs() < 1e-9);
        assert_eq!(last.status, SessionStatus::Completed);
    }

    #[test]
    fn counter_decrease_is_rebased_not_lost() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.start_session(100.0).unwrap();
        mgr.update(5000.0, 105.0, None); // 5 kWh delivered
        mgr.update(5000.0, 0.2, None); // charger rebooted, counter reset near 0
        let delivered = mgr.current_session.as_ref().unwrap().energy_delivered_kwh;
        // 5 kWh carried forward, plus whatever the new counter adds (~0.2 - 0 carried basis)
        assert!(delivered >= 5.0);
    }

    #[test]
    fn counter_decrease_rebases_start_energy_and_holds_accumulated_value() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.start_session(1.0).unwrap();
        mgr.update(1000.0, 1.5, None);
        let delivered = mgr.current_session.as_ref().unwrap().energy_delivered_kwh;
        assert!((delivered - 0.5).abs() < 1e-9);

        // Charger reboots; raw counter drops below the pre-reboot baseline.
        mgr.update(1000.0, 0.2, None);
        let delivered = mgr.current_session.as_ref().unwrap().energy_delivered_kwh;
        assert!(
            (delivered - 0.5).abs() < 1e-9,
            "expected delivered energy to hold at 0.5 kWh across the reset, got {delivered}"
        );

        // As the post-reboot counter climbs, delivered energy keeps growing from there.
        mgr.update(1000.0, 0.7, None);
        let delivered = mgr.current_session.as_ref().unwrap().energy_delivered_kwh;
        assert!((delivered - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cost_accumulates_when_rate_known() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.start_session(0.0).unwrap();
        mgr.update(1000.0, 2.0, Some(0.30));
        let cost = mgr.current_session.as_ref().unwrap().cost.unwrap();
        assert!((cost - 0.6).abs() < 1e-9);
    }

    #[test]
    fn restore_resumes_recent_session_but_not_stale_one() {
        let mut mgr = ChargingSessionManager::new(10);
        let recent = ChargingSession {
            id: "r".into(),
            start_time: Utc::now(),
            end_time: None,
            start_energy_kwh: 0.0,
            end_energy_kwh: None,
            energy_delivered_kwh: 0.0,
            peak_power_w: 0.0,
            average_power_w: 0.0,
            cost: None,
            status: SessionStatus::Active,
        };
        let state = serde_json::json!({
            "current_session": recent,
            "last_session": null,
            "carried_kwh": 0.0,
            "last_raw_kwh": 0.0,
        });
        mgr.restore_state(state).unwrap();
        assert!(mgr.current_session.is_some());

        let mut mgr2 = ChargingSessionManager::new(10);
        let mut stale = mgr.current_session.take().unwrap();
        stale.start_time = Utc::now() - chrono::Duration::hours(48);
        let state2 = serde_json::json!({
            "current_session": stale,
            "last_session": null,
            "carried_kwh": 0.0,
            "last_raw_kwh": 0.0,
        });
        mgr2.restore_state(state2).unwrap();
        assert!(mgr2.current_session.is_none());
        assert_eq!(mgr2.last_session.unwrap().status, SessionStatus::Interrupted);
    }
}
