//! Integration tests for configuration loading

use parking_relay::infra::{Config, FramingMode};
use parking_relay::io::RegistryConfig;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-lot"

[backend]
base_url = "http://gpms.test:9000"
request_timeout_ms = 2500

[devices]
reconnect_delay_ms = 250
framing = "raw"
outbound_queue = 8

[notifier]
enabled = false
topic_prefix = "/ui"

[metrics]
interval_secs = 15
http_port = 9191

[[facilities]]
facilitiesId = "PAY-01"
dtFacilitiesId = "DT-PAY-01"
ip = "10.1.1.20"
port = 7979
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-lot");
    assert_eq!(config.backend_base_url(), "http://gpms.test:9000");
    assert_eq!(config.backend().request_timeout(), Duration::from_millis(2500));
    assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    assert!(!config.notifier().enabled);
    assert_eq!(config.notifier().topic_prefix, "/ui");
    assert_eq!(config.http_port(), 9191);
    assert_eq!(config.device_count(), 1);
    assert_eq!(config.config_file(), temp_file.path().display().to_string());

    let registry = RegistryConfig::from_config(&config);
    assert_eq!(registry.framing, FramingMode::Raw);
    assert_eq!(registry.outbound_queue, 8);
    assert_eq!(registry.reconnect_delay, Duration::from_millis(250));
    assert_eq!(registry.delimiter, b'\n');
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.backend_base_url(), "http://localhost:8080");
    assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
    assert_eq!(config.device_count(), 0);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_invalid_toml_falls_back_to_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[devices\nframing = ").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
    let config = Config::load_from_path(temp_file.path().to_str().unwrap());
    assert_eq!(config.site_id(), "parking-relay");
}

#[test]
fn test_dev_config_loads() {
    let config = Config::from_file("config/dev.toml").unwrap();
    assert_eq!(config.device_count(), 2);
    let table = config.facility_table();
    assert_eq!(table.find_by_address("127.0.0.1:7979").unwrap().facilities_id, "BRK-IN-01");
    assert_eq!(table.find_by_address("127.0.0.1:7980").unwrap().gate_id, None);
}
