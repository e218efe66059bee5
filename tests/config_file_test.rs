//! Integration tests for loading the service configuration from disk.

use control_loop_service::config::ServiceConfig;
use control_loop_service::ControlLoopService;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"

        [server]
        name = "Reactor Controllers"
        uuid = "2b0e5a3e-7f0c-4b16-9a57-6c3c1f7b8d21"

        [sampling]
        poll_interval_ms = 25
        relative_tolerance = 1e-6

        [[simulation.channels]]
        name = "Reactor_Temperature"
        set_point = 60.0
        actual_value = 21.0

        [[simulation.channels]]
        name = "Reactor_ReactionLoop"
        response = 0.5
        "#,
    );

    let config = ServiceConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.server.name, "Reactor Controllers");
    assert_eq!(config.server.server_type, "TestServer");
    assert_eq!(
        config.server.uuid_or_random().to_string(),
        "2b0e5a3e-7f0c-4b16-9a57-6c3c1f7b8d21"
    );
    assert_eq!(config.sampling.poll_interval(), Duration::from_millis(25));
    assert_eq!(config.sampling.tolerance().relative, 1e-6);
    assert_eq!(config.sampling.tolerance().absolute, 0.0);

    let channels = &config.simulation.channels;
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0].set_point, 60.0);
    assert_eq!(channels[0].response, 0.1);
    assert_eq!(channels[1].response, 0.5);
    assert_eq!(channels[1].actual_value, 0.0);
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.sampling.poll_interval_ms, 100);
    assert!(config.simulation.channels.is_empty());
}

#[test]
fn test_malformed_value_is_a_config_error() {
    let file = write_config(
        r#"
        [sampling]
        poll_interval_ms = "fast"
        "#,
    );
    let err = ServiceConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error"), "{err}");
}

#[test]
fn test_invalid_values_fail_validation() {
    let file = write_config(
        r#"
        [sampling]
        poll_interval_ms = 0
        "#,
    );
    let config = ServiceConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_service_from_config_file() {
    let file = write_config(
        r#"
        [sampling]
        poll_interval_ms = 5

        [[simulation.channels]]
        name = "Zone1_Ctrl"
        set_point = 30.0

        [[simulation.channels]]
        name = "Zone2_Ctrl"
        set_point = 40.0

        [[simulation.channels]]
        name = "Zone3_Ctrl"
        set_point = 50.0
        "#,
    );
    let config = ServiceConfig::load_from(file.path()).unwrap();
    let service = ControlLoopService::start(config.simulation.build_channels(), config.sampling)
        .await
        .unwrap();

    assert_eq!(service.channel_count(), 3);
    let meta = control_loop_service::CallMetadata::channel(2);
    assert_eq!(
        service.bind_set_point_subscription(&meta).unwrap().try_recv(),
        Some(50.0)
    );
    assert!(service.shutdown().await.is_empty());
}
