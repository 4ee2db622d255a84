use evse_bridge::persistence::{PersistenceManager, PersistentState};
use serde_json::json;

#[test]
fn default_state_values() {
    let s = PersistentState::default();
    assert_eq!(s.mode, 0);
    assert_eq!(s.start_stop, 0);
    assert!((s.set_current - 6.0).abs() < f32::EPSILON);
}

#[test]
fn load_save_roundtrip() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.path().to_string_lossy().to_string();

    let mut mgr = PersistenceManager::new(&path);
    mgr.set_mode(2);
    mgr.set_start_stop(1);
    mgr.set_set_current(10.5);
    mgr.set_insufficient_solar_start(123.0);
    mgr.save().unwrap();

    let mut mgr2 = PersistenceManager::new(&path);
    mgr2.load().unwrap();
    assert_eq!(mgr2.state().mode, 2);
    assert_eq!(mgr2.state().start_stop, 1);
    assert!((mgr2.state().set_current - 10.5).abs() < 1e-6);
    assert!((mgr2.state().insufficient_solar_start - 123.0).abs() < 1e-6);
}

#[test]
fn set_section_round_trips_session_blob() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.path().to_string_lossy().to_string();

    let mut mgr = PersistenceManager::new(&path);
    mgr.set_section("session", json!({"dummy": true})).unwrap();
    mgr.save().unwrap();

    let mut mgr2 = PersistenceManager::new(&path);
    mgr2.load().unwrap();
    let section = mgr2.get_section("session").unwrap();
    assert_eq!(section.get("dummy").and_then(|v| v.as_bool()), Some(true));

    // Unrecognized sections are ignored rather than erroring
    assert!(mgr2.get_section("nonexistent").is_none());
}
