//! Application construction and collaborator API smoke tests.

use std::path::PathBuf;

use rust_decimal_macros::dec;

use keel_bot::{AppConfig, Application};
use keel_core::{OrderSide, Signal, SignalReason, Size};
use keel_governor::CircuitState;
use keel_pipeline::SubmitOutcome;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("keel_app_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(name: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.persistence.data_dir = temp_dir(name).to_string_lossy().into_owned();
    config
}

#[tokio::test]
async fn test_application_constructs_from_defaults() {
    let config = test_config("construct");
    let dir = config.persistence.data_dir.clone();

    let app = Application::new(config).unwrap();
    assert_eq!(app.get_circuit_state().state, CircuitState::Closed);
    assert!(app.get_position("BTC/USD").is_none());
    assert!(app.get_balance("USD").is_none());

    let health = app.get_health_snapshot();
    assert_eq!(health.queue_depth, 0);
    assert!(health.data_age_ms.is_none());

    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_submit_signal_dedupes_through_app_handle() {
    let config = test_config("submit");
    let dir = config.persistence.data_dir.clone();
    let app = Application::new(config).unwrap();

    let signal = Signal::new(
        "BTC/USD",
        OrderSide::Buy,
        dec!(0.8),
        Size::new(dec!(0.1)),
        SignalReason::Momentum,
    );
    assert_eq!(
        app.submit_signal(signal.clone()).await.unwrap(),
        SubmitOutcome::Accepted
    );
    assert_eq!(
        app.submit_signal(signal).await.unwrap(),
        SubmitOutcome::Deduplicated
    );

    std::fs::remove_dir_all(dir).ok();
}
