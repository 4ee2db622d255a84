use chrono::Utc;
use evse_bridge::session::{ChargingSession, ChargingSessionManager, SessionStatus};
use serde_json::json;

fn sample_session(id: &str, status: SessionStatus) -> ChargingSession {
    ChargingSession {
        id: id.to_string(),
        start_time: Utc::now(),
        end_time: None,
        start_energy_kwh: 10.0,
        end_energy_kwh: None,
        energy_delivered_kwh: 0.5,
        peak_power_w: 2000.0,
        average_power_w: 1500.0,
        cost: None,
        status,
    }
}

#[test]
fn restore_session_state_resumes_recent_current_session() {
    let mut mgr = ChargingSessionManager::new(5);

    let state = json!({
        "current_session": sample_session("cur", SessionStatus::Active),
        "last_session": sample_session("last", SessionStatus::Completed),
        "carried_kwh": 1.5,
        "last_raw_kwh": 11.5,
    });

    mgr.restore_state(state).unwrap();

    assert!(mgr.current_session.is_some());
    assert_eq!(mgr.current_session.as_ref().unwrap().id, "cur");
    assert!(mgr.last_session.is_some());
    assert_eq!(mgr.last_session.as_ref().unwrap().id, "last");

    // Restored carry state feeds into subsequent updates
    mgr.update(1000.0, 12.0, None);
    let delivered = mgr.current_session.as_ref().unwrap().energy_delivered_kwh;
    assert!((delivered - (1.5 + 12.0 - 10.0)).abs() < 1e-9);
}

#[test]
fn restore_state_is_a_noop_on_null() {
    let mut mgr = ChargingSessionManager::new(5);
    mgr.restore_state(serde_json::Value::Null).unwrap();
    assert!(mgr.current_session.is_none());
    assert!(mgr.last_session.is_none());
}
