//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::facility::{FacilityInfo, FacilityTable};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// How inbound device bytes are split into frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Frames end at `delimiter` (newline by default)
    Delimited,
    /// Every socket read is one frame
    Raw,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "parking-relay".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_backend_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_backend_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_backend_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_backend_connect_timeout_ms() -> u64 {
    3000
}

fn default_backend_request_timeout_ms() -> u64 {
    10_000
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
            connect_timeout_ms: default_backend_connect_timeout_ms(),
            request_timeout_ms: default_backend_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    /// Fixed delay between reconnect attempts (no backoff growth)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Per-connection outbound command queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_framing")]
    pub framing: FramingMode,
    /// Frame delimiter byte for `delimited` framing
    #[serde(default = "default_delimiter")]
    pub delimiter: u8,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_write_timeout_ms() -> u64 {
    3000
}

fn default_outbound_queue() -> usize {
    64
}

fn default_framing() -> FramingMode {
    FramingMode::Delimited
}

fn default_delimiter() -> u8 {
    b'\n'
}

fn default_max_frame_len() -> usize {
    64 * 1024
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            outbound_queue: default_outbound_queue(),
            framing: default_framing(),
            delimiter: default_delimiter(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notifier_enabled")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// UI events go to `<prefix>/connect` and `<prefix>/disconnect`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_notifier_queue")]
    pub queue: usize,
}

fn default_notifier_enabled() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "/subscribe".to_string()
}

fn default_notifier_queue() -> usize {
    256
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: default_notifier_enabled(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            queue: default_notifier_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Metrics / control HTTP port (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_http_port() -> u16 {
    9100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), http_port: default_http_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub facilities: Vec<FacilityInfo>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    backend: BackendConfig,
    devices: DevicesConfig,
    notifier: NotifierConfig,
    metrics_interval_secs: u64,
    http_port: u16,
    facilities: Vec<FacilityInfo>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            backend: BackendConfig::default(),
            devices: DevicesConfig::default(),
            notifier: NotifierConfig::default(),
            metrics_interval_secs: default_metrics_interval(),
            http_port: default_http_port(),
            facilities: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from the command line or environment
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        if let Some(path) = cli {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;

        if toml_config.devices.max_frame_len == 0 {
            anyhow::bail!("devices.max_frame_len must be greater than zero");
        }
        if toml_config.devices.outbound_queue == 0 {
            anyhow::bail!("devices.outbound_queue must be greater than zero");
        }

        Ok(Self {
            site_id: toml_config.site.id,
            backend: toml_config.backend,
            devices: toml_config.devices,
            notifier: toml_config.notifier,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            http_port: toml_config.metrics.http_port,
            facilities: toml_config.facilities,
            config_file: "inline".to_string(),
        })
    }

    /// Load configuration from a path, falling back to defaults on error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Build the read-only address -> facility table
    pub fn facility_table(&self) -> FacilityTable {
        FacilityTable::new(self.facilities.clone())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn backend_base_url(&self) -> &str {
        &self.backend.base_url
    }

    pub fn devices(&self) -> &DevicesConfig {
        &self.devices
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.devices.reconnect_delay_ms)
    }

    pub fn notifier(&self) -> &NotifierConfig {
        &self.notifier
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn facilities(&self) -> &[FacilityInfo] {
        &self.facilities
    }

    /// Number of devices to dial, used to size the I/O worker pool
    pub fn device_count(&self) -> usize {
        self.facilities.len()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "parking-relay");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.devices().framing, FramingMode::Delimited);
        assert_eq!(config.devices().delimiter, b'\n');
        assert_eq!(config.notifier().topic_prefix, "/subscribe");
        assert_eq!(config.device_count(), 0);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = Config::from_toml_str("[backend]\nbase_url = \"http://gpms:8080\"\n").unwrap();
        assert_eq!(config.backend_base_url(), "http://gpms:8080");
        assert_eq!(config.backend().request_timeout(), Duration::from_secs(10));
        assert_eq!(config.http_port(), 9100);
    }

    #[test]
    fn test_facilities_table() {
        let config = Config::from_toml_str(
            r#"
[[facilities]]
facilitiesId = "PAY01"
ip = "127.0.0.1"
port = 7979

[[facilities]]
facilitiesId = "BRK01"
category = "BREAKER"
ip = "127.0.0.1"
port = 4001
"#,
        )
        .unwrap();

        assert_eq!(config.device_count(), 2);
        let table = config.facility_table();
        assert_eq!(table.find_by_address("127.0.0.1:7979").unwrap().facilities_id, "PAY01");
        assert_eq!(table.find_by_address("127.0.0.1:4001").unwrap().category, "BREAKER");
    }

    #[test]
    fn test_rejects_zero_frame_len() {
        let err = Config::from_toml_str("[devices]\nmax_frame_len = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_frame_len"));
    }

    #[test]
    fn test_resolve_config_path_default() {
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_prefers_cli() {
        assert_eq!(Config::resolve_config_path(Some("config/site.toml")), "config/site.toml");
    }
}
