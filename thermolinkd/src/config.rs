use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_API_HOST, DEFAULT_API_PORT};
use shared::types::NetSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Seed for the stored network settings, applied only when none are stored yet
    #[serde(default)]
    pub network: Option<NetSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// 96-bit unique hardware id as three words
    pub hardware_id: [u32; 3],
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
}

impl DeviceConfig {
    /// Device identity sent with every request: the hardware id as hex
    pub fn device_id(&self) -> String {
        let bytes: Vec<u8> = self
            .hardware_id
            .iter()
            .flat_map(|word| word.to_be_bytes())
            .collect();
        hex::encode(bytes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_link_idle_interval")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    /// Well-known external host probed for liveness
    #[serde(default = "default_ping_target")]
    pub ping_target: Ipv4Addr,
    #[serde(default = "default_expected_radio_version")]
    pub expected_radio_version: String,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,
    /// Watchdog on the link unit's mailbox, disabled when absent
    #[serde(default)]
    pub watchdog_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_session_idle_interval")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    #[serde(default = "default_settings_debounce")]
    pub settings_debounce_secs: u64,
    #[serde(default = "default_sensor_count")]
    pub sensor_count: usize,
    #[serde(default = "default_output_count")]
    pub output_count: usize,
    #[serde(default)]
    pub watchdog_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_firmware_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_link_idle_interval() -> u64 {
    500
}

fn default_scan_interval() -> u64 {
    1000
}

fn default_ping_target() -> Ipv4Addr {
    Ipv4Addr::new(8, 8, 8, 8)
}

fn default_expected_radio_version() -> String {
    "1.24".to_string()
}

fn default_network_timeout() -> u64 {
    60
}

fn default_api_host() -> String {
    DEFAULT_API_HOST.to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_session_idle_interval() -> u64 {
    250
}

fn default_report_interval() -> u64 {
    5
}

fn default_settings_debounce() -> u64 {
    60
}

fn default_sensor_count() -> usize {
    2
}

fn default_output_count() -> usize {
    2
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/thermolink/settings.db")
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_link_idle_interval(),
            scan_interval_ms: default_scan_interval(),
            ping_target: default_ping_target(),
            expected_radio_version: default_expected_radio_version(),
            network_timeout_secs: default_network_timeout(),
            watchdog_secs: None,
        }
    }
}

impl LinkConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            idle_interval_ms: default_session_idle_interval(),
            report_interval_secs: default_report_interval(),
            settings_debounce_secs: default_settings_debounce(),
            sensor_count: default_sensor_count(),
            output_count: default_output_count(),
            watchdog_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn settings_debounce(&self) -> Duration {
        Duration::from_secs(self.settings_debounce_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
