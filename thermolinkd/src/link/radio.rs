use std::fmt;
use std::str::FromStr;
use std::net::Ipv4Addr;
use async_trait::async_trait;
use thiserror::Error;
use shared::types::{NetSettings, SecurityMode};

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio call {op} failed with code {code}")]
    Call { op: &'static str, code: i32 },
    #[error("radio not started")]
    NotStarted,
    #[error("invalid radio version {0:?}")]
    InvalidVersion(String),
}

/// DHCP lease parameters as reported by the radio. Every address is stored
/// least-significant octet first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpParams {
    /// Zero on success
    pub status: i32,
    pub ip_addr: [u8; 4],
    pub subnet_mask: [u8; 4],
    pub default_gateway: [u8; 4],
    pub dhcp_server: [u8; 4],
    pub dns_server: [u8; 4],
}

impl DhcpParams {
    pub fn resolved(&self) -> bool {
        self.status == 0
    }
}

/// Dotted-decimal text for a radio-order address
pub fn format_radio_addr(addr: [u8; 4]) -> String {
    format!("{}.{}.{}.{}", addr[3], addr[2], addr[1], addr[0])
}

/// Radio-order octets for an address
pub fn radio_addr(addr: Ipv4Addr) -> [u8; 4] {
    let mut octets = addr.octets();
    octets.reverse();
    octets
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingReport {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub min_round_time: u32,
    pub avg_round_time: u32,
    pub max_round_time: u32,
}

impl PingReport {
    pub fn succeeded(&self) -> bool {
        self.packets_sent > 0 && self.packets_received > 0
    }
}

/// Radio firmware ("service pack") version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioVersion {
    pub package_id: u8,
    pub package_build: u8,
}

impl fmt::Display for RadioVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.package_id, self.package_build)
    }
}

/// Parses the "id.build" form produced by `Display`
impl FromStr for RadioVersion {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RadioError::InvalidVersion(s.to_string());
        let (id, build) = s.split_once('.').ok_or_else(invalid)?;
        Ok(RadioVersion {
            package_id: id.parse().map_err(|_| invalid())?,
            package_build: build.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub bssid: [u8; 6],
    pub rssi: i16,
    pub security_mode: SecurityMode,
}

/// One record drained from the radio's scan result list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Results still queued in the radio, this one included
    pub networks_found: u32,
    pub complete: bool,
    pub valid: bool,
    pub network: ScannedNetwork,
}

/// The low-level radio driver. Asynchronous outcomes (association, DHCP,
/// ping replies) are not returned here; the driver publishes them on the bus.
#[async_trait]
pub trait Radio: Send {
    async fn start(&mut self) -> Result<(), RadioError>;
    async fn stop(&mut self) -> Result<(), RadioError>;

    async fn firmware_version(&mut self) -> Result<RadioVersion, RadioError>;
    async fn apply_patch(&mut self) -> Result<(), RadioError>;

    /// Connection policy, lease timeouts and static-or-DHCP addressing
    async fn apply_network_config(&mut self, settings: &NetSettings) -> Result<(), RadioError>;

    async fn mac_address(&mut self) -> Result<[u8; 6], RadioError>;

    async fn connect(
        &mut self,
        security_mode: SecurityMode,
        ssid: &str,
        passphrase: &str,
    ) -> Result<(), RadioError>;
    async fn disconnect(&mut self) -> Result<(), RadioError>;

    async fn set_scan(&mut self, enabled: bool) -> Result<(), RadioError>;
    async fn scan_result(&mut self) -> Result<ScanResult, RadioError>;

    /// Send one echo request; the report arrives later as a bus event
    async fn ping(&mut self, target: Ipv4Addr) -> Result<(), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_addresses_format_msb_last() {
        assert_eq!(format_radio_addr([10, 1, 168, 192]), "192.168.1.10");
        assert_eq!(radio_addr(Ipv4Addr::new(192, 168, 1, 10)), [10, 1, 168, 192]);
        assert_eq!(
            format_radio_addr(radio_addr(Ipv4Addr::new(8, 8, 4, 4))),
            "8.8.4.4"
        );
    }

    #[test]
    fn test_mac_format() {
        assert_eq!(
            format_mac([0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0xff]),
            "00:1A:2B:3C:4D:FF"
        );
    }

    #[test]
    fn test_version_parses_display_form() {
        let version: RadioVersion = "1.24".parse().unwrap();
        assert_eq!(version, RadioVersion { package_id: 1, package_build: 24 });
        assert_eq!(version.to_string(), "1.24");
        assert!("1".parse::<RadioVersion>().is_err());
        assert!("1.x".parse::<RadioVersion>().is_err());
    }

    #[test]
    fn test_ping_success_needs_sent_and_received() {
        let mut report = PingReport::default();
        assert!(!report.succeeded());
        report.packets_sent = 4;
        assert!(!report.succeeded());
        report.packets_received = 1;
        assert!(report.succeeded());
    }
}
