#[tokio::test]
async fn new_with_config_override_invalid_path_errors() {
    use evse_bridge::driver::ChargerEngine;
    use tokio::sync::mpsc;
    let (tx, rx) = mpsc::unbounded_channel();
    let res = ChargerEngine::new_with_config_override(
        rx,
        tx,
        Some(std::path::PathBuf::from("/definitely/missing/config.yaml")),
    )
    .await;
    assert!(res.is_err());
}
