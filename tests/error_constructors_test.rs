use evse_bridge::error::BridgeError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(
        BridgeError::config("x"),
        BridgeError::Config { .. }
    ));
    assert!(matches!(
        BridgeError::modbus("x"),
        BridgeError::Modbus { .. }
    ));
    assert!(matches!(BridgeError::dbus("x"), BridgeError::DBus { .. }));
    assert!(matches!(BridgeError::web("x"), BridgeError::Web { .. }));
}

#[test]
fn error_constructors_group_2() {
    let ser = BridgeError::Serialization {
        message: "s".into(),
    };
    assert!(matches!(ser, BridgeError::Serialization { .. }));
    assert!(matches!(BridgeError::io("x"), BridgeError::Io { .. }));
    assert!(matches!(
        BridgeError::network("x"),
        BridgeError::Network { .. }
    ));
    assert!(matches!(BridgeError::api("x"), BridgeError::Api { .. }));
}

#[test]
fn error_constructors_group_3() {
    assert!(matches!(BridgeError::auth("x"), BridgeError::Auth { .. }));
    assert!(matches!(
        BridgeError::validation("f", "m"),
        BridgeError::Validation { .. }
    ));
    assert!(matches!(
        BridgeError::timeout("x"),
        BridgeError::Timeout { .. }
    ));
    assert!(matches!(
        BridgeError::update("x"),
        BridgeError::Update { .. }
    ));
    assert!(matches!(
        BridgeError::generic("x"),
        BridgeError::Generic { .. }
    ));
}

#[test]
fn display_messages() {
    let e = BridgeError::validation("field", "bad");
    let s = format!("{}", e);
    assert!(s.contains("Validation error"));
}
