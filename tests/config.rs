use std::time::Duration;

use avmcore::config::CoreConfig;

#[test]
fn test_partial_config() {
    let config: CoreConfig = serde_json::from_str(
        r#"{"checkpointMessageInterval": 5, "idleWaitMs": 10}"#,
    )
    .unwrap();
    assert_eq!(config.checkpoint_message_interval, 5);
    assert_eq!(config.idle_wait(), Duration::from_millis(10));
    assert_eq!(
        config.checkpoint_gas_interval,
        CoreConfig::default().checkpoint_gas_interval
    );
    assert_eq!(config.max_gas_per_run, 10_000_000);
}

#[test]
fn test_empty_config_is_default() {
    let config: CoreConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, CoreConfig::default());
}

#[test]
fn test_bad_config() {
    assert!(serde_json::from_str::<CoreConfig>(
        r#"{"maxMessagesPerRun": "many"}"#
    )
    .is_err());
    assert!(serde_json::from_str::<CoreConfig>(
        r#"{"maxGasPerRun": -1}"#
    )
    .is_err());
}
