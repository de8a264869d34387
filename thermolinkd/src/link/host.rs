use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use shared::types::{NetSettings, SecurityMode, StaticIp};
use crate::bus::{Bus, Event};
use crate::link::radio::{
    radio_addr, DhcpParams, PingReport, Radio, RadioError, RadioVersion, ScanResult,
    ScannedNetwork,
};

const ASSOCIATE_DELAY: Duration = Duration::from_millis(200);
const PROBE_PORT: u16 = 53;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Radio driver backed by the host's own network stack. Association always
/// succeeds, the lease is whatever address routes to the probe target, and
/// a ping is a TCP handshake against the target's DNS port.
pub struct HostRadio {
    bus: Bus,
    mac: [u8; 6],
    version: RadioVersion,
    probe_target: Ipv4Addr,
    started: bool,
    static_ip: Option<StaticIp>,
    associated: Option<(String, SecurityMode)>,
    association: Option<JoinHandle<()>>,
    scan_pending: bool,
}

impl HostRadio {
    pub fn new(bus: Bus, mac: [u8; 6], version: RadioVersion, probe_target: Ipv4Addr) -> Self {
        Self {
            bus,
            mac,
            version,
            probe_target,
            started: false,
            static_ip: None,
            associated: None,
            association: None,
            scan_pending: false,
        }
    }

    /// Drop any association still in flight so it never reports
    fn abandon_association(&mut self) {
        if let Some(task) = self.association.take() {
            task.abort();
        }
    }

    fn ensure_started(&self) -> Result<(), RadioError> {
        if self.started {
            Ok(())
        } else {
            Err(RadioError::NotStarted)
        }
    }
}

/// Address the host would use to reach `target`
async fn local_route(target: Ipv4Addr) -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((target, PROBE_PORT)).await?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(std::io::Error::other("no IPv4 route")),
    }
}

async fn lease(target: Ipv4Addr, static_ip: Option<StaticIp>) -> DhcpParams {
    if let Some(fixed) = static_ip {
        return DhcpParams {
            status: 0,
            ip_addr: radio_addr(fixed.ip),
            subnet_mask: radio_addr(fixed.subnet_mask),
            default_gateway: radio_addr(fixed.gateway),
            dhcp_server: [0; 4],
            dns_server: radio_addr(fixed.dns_server),
        };
    }

    match local_route(target).await {
        Ok(ip) => DhcpParams {
            status: 0,
            ip_addr: radio_addr(ip),
            subnet_mask: [0; 4],
            default_gateway: [0; 4],
            dhcp_server: [0; 4],
            dns_server: [0; 4],
        },
        Err(e) => {
            tracing::warn!("No route to {}: {}", target, e);
            DhcpParams {
                status: -1,
                ip_addr: [0; 4],
                subnet_mask: [0; 4],
                default_gateway: [0; 4],
                dhcp_server: [0; 4],
                dns_server: [0; 4],
            }
        }
    }
}

#[async_trait]
impl Radio for HostRadio {
    async fn start(&mut self) -> Result<(), RadioError> {
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RadioError> {
        self.started = false;
        self.associated = None;
        self.abandon_association();
        Ok(())
    }

    async fn firmware_version(&mut self) -> Result<RadioVersion, RadioError> {
        self.ensure_started()?;
        Ok(self.version)
    }

    async fn apply_patch(&mut self) -> Result<(), RadioError> {
        self.ensure_started()?;
        tracing::debug!("Host radio has no firmware to patch");
        Ok(())
    }

    async fn apply_network_config(&mut self, settings: &NetSettings) -> Result<(), RadioError> {
        self.ensure_started()?;
        self.static_ip = settings.static_ip;
        Ok(())
    }

    async fn mac_address(&mut self) -> Result<[u8; 6], RadioError> {
        self.ensure_started()?;
        Ok(self.mac)
    }

    async fn connect(
        &mut self,
        security_mode: SecurityMode,
        ssid: &str,
        _passphrase: &str,
    ) -> Result<(), RadioError> {
        self.ensure_started()?;
        self.abandon_association();
        self.associated = Some((ssid.to_string(), security_mode));

        let bus = self.bus.clone();
        let target = self.probe_target;
        let static_ip = self.static_ip;
        self.association = Some(tokio::spawn(async move {
            tokio::time::sleep(ASSOCIATE_DELAY).await;
            bus.publish(Event::RadioAssociated);
            bus.publish(Event::RadioDhcpComplete(lease(target, static_ip).await));
        }));

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), RadioError> {
        self.ensure_started()?;
        self.abandon_association();
        if self.associated.take().is_some() {
            self.bus.publish(Event::RadioDisassociated);
        }
        Ok(())
    }

    async fn set_scan(&mut self, enabled: bool) -> Result<(), RadioError> {
        self.ensure_started()?;
        // A finished scan leaves exactly one result to drain
        self.scan_pending = !enabled;
        Ok(())
    }

    async fn scan_result(&mut self) -> Result<ScanResult, RadioError> {
        self.ensure_started()?;

        let found = std::mem::take(&mut self.scan_pending);
        let (ssid, security_mode) = match (&self.associated, found) {
            (Some((ssid, mode)), true) => (ssid.clone(), *mode),
            _ => {
                return Ok(ScanResult {
                    networks_found: 0,
                    complete: true,
                    valid: false,
                    network: ScannedNetwork {
                        ssid: String::new(),
                        bssid: [0; 6],
                        rssi: 0,
                        security_mode: SecurityMode::Unsecured,
                    },
                })
            }
        };

        Ok(ScanResult {
            networks_found: 1,
            complete: true,
            valid: true,
            network: ScannedNetwork {
                ssid,
                bssid: self.mac,
                rssi: -40,
                security_mode,
            },
        })
    }

    async fn ping(&mut self, target: Ipv4Addr) -> Result<(), RadioError> {
        self.ensure_started()?;

        let bus = self.bus.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let reached = matches!(
                tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((target, PROBE_PORT))).await,
                Ok(Ok(_))
            );
            let rtt = started.elapsed().as_millis() as u32;

            let report = if reached {
                PingReport {
                    packets_sent: 1,
                    packets_received: 1,
                    min_round_time: rtt,
                    avg_round_time: rtt,
                    max_round_time: rtt,
                }
            } else {
                PingReport {
                    packets_sent: 1,
                    ..Default::default()
                }
            };
            bus.publish(Event::RadioPingReport(report));
        });

        Ok(())
    }
}

impl Drop for HostRadio {
    fn drop(&mut self) {
        self.abandon_association();
    }
}
