use std::net::Ipv4Addr;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::{LinkState, LinkStatus};
use crate::bus::{Bus, Delivery, Event, Mailbox, Topic};
use crate::config::LinkConfig;
use crate::link::radio::{format_mac, format_radio_addr, DhcpParams, PingReport, Radio};
use crate::link::table::{NetworkRecord, NetworkTable, Upsert};
use crate::store_manager::StoreHandle;

/// Assume the echo was lost and retry this soon
const PING_SEND_FAST_PERIOD: Duration = Duration::from_secs(30);
/// Steady-state probe rate once replies are coming back
const PING_SEND_SLOW_PERIOD: Duration = Duration::from_secs(60);
/// No reply for this long means the link is dead even without a disassociation
const PING_RECV_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Bound on scan records drained per cycle
const MAX_SCAN_RESULTS: usize = 64;

pub const TOPICS: &[Topic] = &[
    Topic::NetworkSettingsChanged,
    Topic::RadioAssociated,
    Topic::RadioDisassociated,
    Topic::RadioDhcpComplete,
    Topic::RadioPingReport,
    Topic::ScanStart,
    Topic::ScanStop,
];

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub ping_target: Ipv4Addr,
    pub expected_radio_version: String,
    pub scan_interval: Duration,
    pub network_timeout: Duration,
    /// Pause between dropping a stale association and connecting again
    pub reconnect_settle: Duration,
}

impl From<&LinkConfig> for LinkSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            ping_target: config.ping_target,
            expected_radio_version: config.expected_radio_version.clone(),
            scan_interval: config.scan_interval(),
            network_timeout: config.network_timeout(),
            reconnect_settle: Duration::from_millis(100),
        }
    }
}

/// Owns the radio: association, DHCP, the discovered-network table and
/// ping-based liveness.
pub struct LinkManager<R: Radio> {
    radio: R,
    store: StoreHandle,
    bus: Bus,
    settings: LinkSettings,
    status: LinkStatus,
    /// State as of the last publish
    last_state: LinkState,
    table: NetworkTable,
    next_ping_send: Instant,
    ping_timeout: Instant,
    /// Cleared whenever network settings change
    radio_config_applied: bool,
}

impl<R: Radio> LinkManager<R> {
    pub fn new(radio: R, store: StoreHandle, bus: Bus, settings: LinkSettings) -> Self {
        let now = Instant::now();
        Self {
            radio,
            store,
            bus,
            settings,
            status: LinkStatus::default(),
            last_state: LinkState::Disconnected,
            table: NetworkTable::new(),
            next_ping_send: now,
            ping_timeout: now + PING_RECV_TIMEOUT,
            radio_config_applied: false,
        }
    }

    pub async fn run(mut self, mut mailbox: Mailbox, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Starting link manager");

        if let Err(e) = self.initialize_and_connect(Instant::now()).await {
            tracing::warn!("Initial connect failed: {:#}", e);
        }

        loop {
            tokio::select! {
                delivery = mailbox.next() => {
                    let now = Instant::now();
                    match delivery {
                        Delivery::Event(event) => self.handle_event(event, now).await,
                        Delivery::Idle => self.on_idle(now).await,
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Link manager shutting down");
                    break;
                }
            }
        }

        let undelivered = mailbox.drain();
        if !undelivered.is_empty() {
            tracing::debug!("Dropping {} undelivered events", undelivered.len());
        }
        Ok(())
    }

    pub async fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::RadioAssociated => {
                tracing::info!("Associated, waiting for DHCP");
                self.set_state(LinkState::WaitDhcp);
                self.publish_status();
                self.ping_timeout = now + PING_RECV_TIMEOUT;
                self.next_ping_send = now;
            }
            Event::RadioDisassociated => {
                let next = if self.status.state == LinkState::Connecting {
                    LinkState::ConnectFailed
                } else {
                    LinkState::Disconnected
                };
                tracing::info!("Disassociated in {:?}, now {:?}", self.status.state, next);
                self.set_state(next);
                self.status.dhcp_resolved = false;
                self.publish_status();
            }
            Event::RadioDhcpComplete(params) => {
                self.set_state(LinkState::Connected);
                self.apply_dhcp(&params);
                tracing::info!(
                    "DHCP complete: ip={} gw={} dns={} resolved={}",
                    self.status.ip_addr,
                    self.status.gateway,
                    self.status.dns_server,
                    self.status.dhcp_resolved
                );
                self.publish_status();
            }
            Event::RadioPingReport(report) => self.on_ping_report(report, now),
            Event::NetworkSettingsChanged => {
                tracing::info!("Network settings changed, reconnecting");
                self.radio_config_applied = false;
                self.set_state(LinkState::Connect);
            }
            Event::ScanStart => {
                tracing::info!("Network scan started");
                if !self.table.is_empty() {
                    tracing::debug!("Forgetting {} known networks", self.table.len());
                }
                self.table.clear();
                self.status.scan_active = true;
                self.publish_status();
            }
            Event::ScanStop => {
                tracing::info!("Network scan stopped");
                self.status.scan_active = false;
                self.publish_status();
            }
            other => {
                tracing::debug!("Link manager ignoring {:?}", other.topic());
            }
        }
    }

    pub async fn on_idle(&mut self, now: Instant) {
        if self.status.scan_active {
            if let Err(e) = self.scan_cycle(now).await {
                tracing::warn!("Scan cycle failed: {:#}", e);
            }
            return;
        }

        if self.status.state.needs_init() {
            if let Err(e) = self.initialize_and_connect(now).await {
                tracing::warn!("Initialize-and-connect failed: {:#}", e);
            }
        }

        if self.status.state != self.last_state {
            self.publish_status();
        }

        self.check_liveness(now).await;
    }

    fn set_state(&mut self, state: LinkState) {
        self.status.state = state;
        if state != LinkState::Connected {
            self.status.dhcp_resolved = false;
        }
    }

    fn publish_status(&mut self) {
        self.last_state = self.status.state;
        self.bus.publish(Event::LinkStatus(self.status.clone()));
    }

    fn apply_dhcp(&mut self, params: &DhcpParams) {
        self.status.dhcp_resolved = params.resolved();
        self.status.ip_addr = format_radio_addr(params.ip_addr);
        self.status.subnet_mask = format_radio_addr(params.subnet_mask);
        self.status.gateway = format_radio_addr(params.default_gateway);
        self.status.dhcp_server = format_radio_addr(params.dhcp_server);
        self.status.dns_server = format_radio_addr(params.dns_server);
    }

    fn on_ping_report(&mut self, report: PingReport, now: Instant) {
        tracing::debug!(
            "Ping report sent={} received={} rtt min/avg/max={}/{}/{}",
            report.packets_sent,
            report.packets_received,
            report.min_round_time,
            report.avg_round_time,
            report.max_round_time
        );

        if report.succeeded() {
            self.ping_timeout = now + PING_RECV_TIMEOUT;
            self.next_ping_send = now + PING_SEND_SLOW_PERIOD;
        }
    }

    async fn check_liveness(&mut self, now: Instant) {
        if now > self.next_ping_send {
            self.next_ping_send = now + PING_SEND_FAST_PERIOD;

            tracing::debug!("Sending ping to {}", self.settings.ping_target);
            if let Err(e) = self.radio.ping(self.settings.ping_target).await {
                tracing::warn!("Ping send failed: {}", e);
            }
        }

        if now > self.ping_timeout {
            tracing::warn!("No ping reply for {:?}, reconnecting", PING_RECV_TIMEOUT);
            if let Err(e) = self.initialize_and_connect(now).await {
                tracing::warn!("Reconnect after ping timeout failed: {:#}", e);
            }
        }
    }

    async fn initialize_and_connect(&mut self, now: Instant) -> Result<()> {
        let net = self
            .store
            .net_settings()
            .await
            .context("Failed to read network settings")?;

        self.set_state(LinkState::Disconnected);
        self.publish_status();

        self.ping_timeout = now + PING_RECV_TIMEOUT;
        self.next_ping_send = now + PING_SEND_FAST_PERIOD;

        self.radio.stop().await.context("Radio stop failed")?;
        self.radio.start().await.context("Radio start failed")?;

        let version = self.radio.firmware_version().await.context("Radio version read failed")?;
        self.status.radio_fw_version = version.to_string();
        tracing::info!("Radio firmware version {}", self.status.radio_fw_version);

        if self.status.radio_fw_version != self.settings.expected_radio_version {
            tracing::info!(
                "Radio firmware is not {}, applying patch",
                self.settings.expected_radio_version
            );
            self.radio.apply_patch().await.context("Radio patch failed")?;

            let version = self
                .radio
                .firmware_version()
                .await
                .context("Radio version read failed")?;
            self.status.radio_fw_version = version.to_string();
            tracing::info!("Radio firmware updated to {}", self.status.radio_fw_version);
        }

        if !self.radio_config_applied {
            self.radio
                .apply_network_config(&net)
                .await
                .context("Applying network config failed")?;
            self.radio.stop().await.context("Radio stop failed")?;
            self.radio.start().await.context("Radio start failed")?;
            self.radio_config_applied = true;
        }

        let mac = self.radio.mac_address().await.context("MAC read failed")?;
        self.status.mac_addr = format_mac(mac);

        if net.ssid.is_empty() {
            tracing::debug!("No SSID configured, staying disconnected");
            return Ok(());
        }

        self.set_state(LinkState::Connecting);
        self.publish_status();
        tracing::info!("Connecting to {} ({:?})", net.ssid, net.security_mode);

        self.radio.disconnect().await.context("Radio disconnect failed")?;
        tokio::time::sleep(self.settings.reconnect_settle).await;
        self.radio
            .connect(net.security_mode, &net.ssid, &net.passphrase)
            .await
            .context("Radio connect failed")?;

        Ok(())
    }

    async fn scan_cycle(&mut self, now: Instant) -> Result<()> {
        self.radio.set_scan(true).await.context("Enabling scan failed")?;
        tokio::time::sleep(self.settings.scan_interval).await;
        self.radio.set_scan(false).await.context("Disabling scan failed")?;

        let seen = now + self.settings.scan_interval;
        for _ in 0..MAX_SCAN_RESULTS {
            let result = self.radio.scan_result().await.context("Reading scan result failed")?;

            if result.complete && result.valid {
                self.record_network(NetworkRecord::from_scan(result.network, seen));
            }

            if result.networks_found <= 1 {
                break;
            }
        }

        for record in self.table.prune(seen, self.settings.network_timeout) {
            tracing::info!("Network {} timed out", record.ssid);
            self.bus.publish(Event::NetworkTimeout(record));
        }

        Ok(())
    }

    fn record_network(&mut self, record: NetworkRecord) {
        match self.table.upsert(record) {
            Upsert::Inserted(record) => {
                tracing::info!("Discovered network {} rssi={}", record.ssid, record.rssi);
                self.bus.publish(Event::NetworkDiscovered(record));
            }
            Upsert::Updated(record) => {
                tracing::debug!("Updated network {} rssi={}", record.ssid, record.rssi);
                self.bus.publish(Event::NetworkUpdated(record));
            }
            Upsert::Full => {
                tracing::debug!("Network table full, not recording scan result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use async_trait::async_trait;
    use shared::types::{NetSettings, SecurityMode};
    use crate::link::radio::{RadioError, RadioVersion, ScanResult, ScannedNetwork};
    use crate::store::db::SettingsDb;

    #[derive(Default)]
    struct MockRadio {
        calls: Vec<&'static str>,
        version: (u8, u8),
        patch_to: Option<(u8, u8)>,
        scan_results: VecDeque<ScanResult>,
        fail_on: Option<&'static str>,
        pings: Vec<Ipv4Addr>,
    }

    impl MockRadio {
        fn new() -> Self {
            Self {
                version: (1, 24),
                ..Default::default()
            }
        }

        fn call(&mut self, op: &'static str) -> Result<(), RadioError> {
            self.calls.push(op);
            if self.fail_on == Some(op) {
                return Err(RadioError::Call { op, code: -1 });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Radio for MockRadio {
        async fn start(&mut self) -> Result<(), RadioError> {
            self.call("start")
        }

        async fn stop(&mut self) -> Result<(), RadioError> {
            self.call("stop")
        }

        async fn firmware_version(&mut self) -> Result<RadioVersion, RadioError> {
            self.call("firmware_version")?;
            Ok(RadioVersion {
                package_id: self.version.0,
                package_build: self.version.1,
            })
        }

        async fn apply_patch(&mut self) -> Result<(), RadioError> {
            self.call("apply_patch")?;
            if let Some(version) = self.patch_to {
                self.version = version;
            }
            Ok(())
        }

        async fn apply_network_config(&mut self, _settings: &NetSettings) -> Result<(), RadioError> {
            self.call("apply_network_config")
        }

        async fn mac_address(&mut self) -> Result<[u8; 6], RadioError> {
            self.call("mac_address")?;
            Ok([0x08, 0x00, 0x28, 0x01, 0x02, 0x03])
        }

        async fn connect(
            &mut self,
            _security_mode: SecurityMode,
            _ssid: &str,
            _passphrase: &str,
        ) -> Result<(), RadioError> {
            self.call("connect")
        }

        async fn disconnect(&mut self) -> Result<(), RadioError> {
            self.call("disconnect")
        }

        async fn set_scan(&mut self, enabled: bool) -> Result<(), RadioError> {
            self.call(if enabled { "scan_on" } else { "scan_off" })
        }

        async fn scan_result(&mut self) -> Result<ScanResult, RadioError> {
            self.call("scan_result")?;
            Ok(self.scan_results.pop_front().unwrap_or(ScanResult {
                networks_found: 0,
                complete: true,
                valid: false,
                network: scanned(""),
            }))
        }

        async fn ping(&mut self, target: Ipv4Addr) -> Result<(), RadioError> {
            self.call("ping")?;
            self.pings.push(target);
            Ok(())
        }
    }

    fn scanned(ssid: &str) -> ScannedNetwork {
        ScannedNetwork {
            ssid: ssid.to_string(),
            bssid: [0x02, 0, 0, 0, 0, 9],
            rssi: -55,
            security_mode: SecurityMode::Wpa2,
        }
    }

    /// Queue one scan batch: the radio reports how many results remain
    fn queue_scan(radio: &mut MockRadio, ssids: &[&str]) {
        let total = ssids.len() as u32;
        for (i, ssid) in ssids.iter().enumerate() {
            radio.scan_results.push_back(ScanResult {
                networks_found: total - i as u32,
                complete: true,
                valid: true,
                network: scanned(ssid),
            });
        }
    }

    fn settings() -> LinkSettings {
        LinkSettings {
            ping_target: Ipv4Addr::new(8, 8, 8, 8),
            expected_radio_version: "1.24".to_string(),
            scan_interval: Duration::ZERO,
            network_timeout: Duration::from_secs(60),
            reconnect_settle: Duration::ZERO,
        }
    }

    async fn store_with_ssid(ssid: &str) -> StoreHandle {
        let store = StoreHandle::spawn(SettingsDb::open(":memory:").unwrap());
        store
            .set_net_settings(NetSettings {
                ssid: ssid.to_string(),
                passphrase: "secret".to_string(),
                security_mode: SecurityMode::Wpa2,
                static_ip: None,
            })
            .await
            .unwrap();
        store
    }

    fn probe(bus: &Bus) -> Mailbox {
        bus.subscribe(
            "probe",
            &[
                Topic::LinkStatus,
                Topic::NetworkDiscovered,
                Topic::NetworkUpdated,
                Topic::NetworkTimeout,
            ],
            Duration::from_secs(3600),
        )
    }

    fn link_states(events: &[Event]) -> Vec<LinkState> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::LinkStatus(status) => Some(status.state),
                _ => None,
            })
            .collect()
    }

    fn dhcp(status: i32) -> DhcpParams {
        DhcpParams {
            status,
            ip_addr: [10, 1, 168, 192],
            subnet_mask: [0, 255, 255, 255],
            default_gateway: [1, 1, 168, 192],
            dhcp_server: [1, 1, 168, 192],
            dns_server: [8, 8, 8, 8],
        }
    }

    #[tokio::test]
    async fn test_idle_connects_with_configured_ssid() {
        let bus = Bus::new();
        let probe = probe(&bus);
        let mut link = LinkManager::new(
            MockRadio::new(),
            store_with_ssid("brewery").await,
            bus.clone(),
            settings(),
        );

        link.on_idle(Instant::now()).await;

        assert_eq!(link.status.state, LinkState::Connecting);
        assert_eq!(link.status.mac_addr, "08:00:28:01:02:03");
        assert_eq!(link.status.radio_fw_version, "1.24");
        assert_eq!(
            link.radio.calls,
            vec![
                "stop",
                "start",
                "firmware_version",
                "apply_network_config",
                "stop",
                "start",
                "mac_address",
                "disconnect",
                "connect",
            ]
        );
        assert_eq!(
            link_states(&probe.drain()),
            vec![LinkState::Disconnected, LinkState::Connecting]
        );
    }

    #[tokio::test]
    async fn test_network_config_applied_once_until_settings_change() {
        let bus = Bus::new();
        let mut link = LinkManager::new(
            MockRadio::new(),
            store_with_ssid("brewery").await,
            bus.clone(),
            settings(),
        );
        let now = Instant::now();

        link.on_idle(now).await;
        link.handle_event(Event::RadioDisassociated, now).await;
        assert_eq!(link.status.state, LinkState::ConnectFailed);

        link.radio.calls.clear();
        link.on_idle(now).await;
        assert!(!link.radio.calls.contains(&"apply_network_config"));

        link.handle_event(Event::NetworkSettingsChanged, now).await;
        assert_eq!(link.status.state, LinkState::Connect);
        link.radio.calls.clear();
        link.on_idle(now).await;
        assert!(link.radio.calls.contains(&"apply_network_config"));
        assert_eq!(link.status.state, LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_no_ssid_stays_disconnected() {
        let bus = Bus::new();
        let store = StoreHandle::spawn(SettingsDb::open(":memory:").unwrap());
        let mut link = LinkManager::new(MockRadio::new(), store, bus.clone(), settings());

        link.on_idle(Instant::now()).await;

        assert_eq!(link.status.state, LinkState::Disconnected);
        assert!(!link.radio.calls.contains(&"connect"));
        assert!(link.radio.calls.contains(&"mac_address"));
    }

    #[tokio::test]
    async fn test_outdated_radio_firmware_is_patched() {
        let bus = Bus::new();
        let mut radio = MockRadio::new();
        radio.version = (1, 19);
        radio.patch_to = Some((1, 24));
        let mut link =
            LinkManager::new(radio, store_with_ssid("brewery").await, bus.clone(), settings());

        link.on_idle(Instant::now()).await;

        assert!(link.radio.calls.contains(&"apply_patch"));
        assert_eq!(link.status.radio_fw_version, "1.24");
    }

    #[tokio::test]
    async fn test_association_and_dhcp() {
        let bus = Bus::new();
        let probe = probe(&bus);
        let mut link = LinkManager::new(
            MockRadio::new(),
            store_with_ssid("brewery").await,
            bus.clone(),
            settings(),
        );
        let now = Instant::now();
        link.on_idle(now).await;
        probe.drain();

        link.handle_event(Event::RadioAssociated, now).await;
        assert_eq!(link.status.state, LinkState::WaitDhcp);
        assert!(!link.status.dhcp_resolved);

        link.handle_event(Event::RadioDhcpComplete(dhcp(0)), now).await;
        let status = &link.status;
        assert_eq!(status.state, LinkState::Connected);
        assert!(status.dhcp_resolved);
        assert_eq!(status.ip_addr, "192.168.1.10");
        assert_eq!(status.subnet_mask, "255.255.255.0");
        assert_eq!(status.gateway, "192.168.1.1");
        assert_eq!(status.dns_server, "8.8.8.8");

        assert_eq!(
            link_states(&probe.drain()),
            vec![LinkState::WaitDhcp, LinkState::Connected]
        );
    }

    #[tokio::test]
    async fn test_failed_dhcp_is_connected_but_unresolved() {
        let bus = Bus::new();
        let store = StoreHandle::spawn(SettingsDb::open(":memory:").unwrap());
        let mut link = LinkManager::new(MockRadio::new(), store, bus, settings());

        link.handle_event(Event::RadioDhcpComplete(dhcp(-1)), Instant::now()).await;
        assert_eq!(link.status.state, LinkState::Connected);
        assert!(!link.status.dhcp_resolved);
    }

    #[tokio::test]
    async fn test_disassociation_outcome_depends_on_state() {
        let bus = Bus::new();
        let mut link = LinkManager::new(
            MockRadio::new(),
            store_with_ssid("brewery").await,
            bus,
            settings(),
        );
        let now = Instant::now();

        link.on_idle(now).await;
        assert_eq!(link.status.state, LinkState::Connecting);
        link.handle_event(Event::RadioDisassociated, now).await;
        assert_eq!(link.status.state, LinkState::ConnectFailed);

        link.handle_event(Event::RadioAssociated, now).await;
        link.handle_event(Event::RadioDhcpComplete(dhcp(0)), now).await;
        link.handle_event(Event::RadioDisassociated, now).await;
        assert_eq!(link.status.state, LinkState::Disconnected);
        assert!(!link.status.dhcp_resolved);
    }

    #[tokio::test]
    async fn test_dhcp_resolved_only_while_connected() {
        let store = store_with_ssid("brewery").await;
        let kinds = 5usize;
        let length = 4u32;

        for combo in 0..kinds.pow(length) {
            let bus = Bus::new();
            let mut link =
                LinkManager::new(MockRadio::new(), store.clone(), bus, settings());
            let now = Instant::now();

            let mut rest = combo;
            for _ in 0..length {
                let event = match rest % kinds {
                    0 => Event::RadioAssociated,
                    1 => Event::RadioDisassociated,
                    2 => Event::RadioDhcpComplete(dhcp(0)),
                    3 => Event::NetworkSettingsChanged,
                    _ => Event::ScanStart,
                };
                rest /= kinds;
                let was_dhcp = matches!(event, Event::RadioDhcpComplete(_));

                link.handle_event(event, now).await;

                let status = &link.status;
                if status.dhcp_resolved {
                    assert_eq!(status.state, LinkState::Connected, "combo {combo}");
                }
                if was_dhcp {
                    assert!(status.dhcp_resolved, "combo {combo}");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_ping_schedule_and_timeout_reconnect() {
        let bus = Bus::new();
        let mut link = LinkManager::new(
            MockRadio::new(),
            store_with_ssid("brewery").await,
            bus,
            settings(),
        );
        let t0 = Instant::now();
        link.on_idle(t0).await;
        link.handle_event(Event::RadioAssociated, t0).await;
        link.handle_event(Event::RadioDhcpComplete(dhcp(0)), t0).await;
        link.radio.calls.clear();

        // Association set the send deadline to now, so the next tick pings
        link.on_idle(t0 + Duration::from_millis(500)).await;
        assert_eq!(link.radio.pings, vec![Ipv4Addr::new(8, 8, 8, 8)]);

        // No reply: fast retry 30s later, not before
        link.on_idle(t0 + Duration::from_secs(30)).await;
        assert_eq!(link.radio.pings.len(), 1);
        link.on_idle(t0 + Duration::from_secs(31)).await;
        assert_eq!(link.radio.pings.len(), 2);
        assert!(!link.radio.calls.contains(&"stop"));

        // Two minutes of silence since association triggers a full reconnect
        link.on_idle(t0 + Duration::from_secs(121)).await;
        assert!(link.radio.calls.contains(&"stop"));
        assert!(link.radio.calls.contains(&"connect"));
        assert_eq!(link.status.state, LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_ping_reply_slows_probe_and_extends_timeout() {
        let bus = Bus::new();
        let mut link = LinkManager::new(
            MockRadio::new(),
            store_with_ssid("brewery").await,
            bus,
            settings(),
        );
        let t0 = Instant::now();
        link.on_idle(t0).await;
        link.handle_event(Event::RadioAssociated, t0).await;
        link.handle_event(Event::RadioDhcpComplete(dhcp(0)), t0).await;
        link.on_idle(t0 + Duration::from_secs(1)).await;
        assert_eq!(link.radio.pings.len(), 1);

        let reply = PingReport {
            packets_sent: 1,
            packets_received: 1,
            ..Default::default()
        };
        let t1 = t0 + Duration::from_secs(100);
        link.handle_event(Event::RadioPingReport(reply), t1).await;
        link.radio.calls.clear();

        // Past the original two-minute deadline but within the extended one
        link.on_idle(t0 + Duration::from_secs(150)).await;
        assert!(!link.radio.calls.contains(&"stop"));
        // Slow period: nothing sent until 60s after the reply
        assert_eq!(link.radio.pings.len(), 1);
        link.on_idle(t1 + Duration::from_secs(61)).await;
        assert_eq!(link.radio.pings.len(), 2);

        // A report with no replies changes nothing
        let lost = PingReport {
            packets_sent: 1,
            ..Default::default()
        };
        link.handle_event(Event::RadioPingReport(lost), t1 + Duration::from_secs(62)).await;
        link.on_idle(t1 + Duration::from_secs(121)).await;
        assert!(link.radio.calls.contains(&"stop"));
    }

    #[tokio::test]
    async fn test_radio_failure_aborts_tick_then_recovers() {
        let bus = Bus::new();
        let mut radio = MockRadio::new();
        radio.fail_on = Some("start");
        let mut link =
            LinkManager::new(radio, store_with_ssid("brewery").await, bus, settings());
        let now = Instant::now();

        link.on_idle(now).await;
        assert_eq!(link.status.state, LinkState::Disconnected);
        assert!(!link.radio.calls.contains(&"connect"));

        link.radio.fail_on = None;
        link.on_idle(now + Duration::from_millis(500)).await;
        assert_eq!(link.status.state, LinkState::Connecting);
        assert!(link.radio.calls.contains(&"connect"));
    }

    #[tokio::test]
    async fn test_scan_discovers_and_updates_networks() {
        let bus = Bus::new();
        let probe = probe(&bus);
        let store = StoreHandle::spawn(SettingsDb::open(":memory:").unwrap());
        let mut link = LinkManager::new(MockRadio::new(), store, bus.clone(), settings());
        let t0 = Instant::now();

        link.handle_event(Event::ScanStart, t0).await;
        assert!(link.status.scan_active);
        probe.drain();

        queue_scan(&mut link.radio, &["cellar", "garage"]);
        link.on_idle(t0).await;
        assert_eq!(link.table.len(), 2);

        queue_scan(&mut link.radio, &["cellar"]);
        link.on_idle(t0 + Duration::from_secs(1)).await;

        let events = probe.drain();
        let discovered: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::NetworkDiscovered(r) => Some(r.ssid.as_str()),
                _ => None,
            })
            .collect();
        let updated: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::NetworkUpdated(r) => Some(r.ssid.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(discovered, vec!["cellar", "garage"]);
        assert_eq!(updated, vec!["cellar"]);

        // Scanning skips connect and liveness entirely
        assert!(!link.radio.calls.contains(&"connect"));
        assert!(!link.radio.calls.contains(&"ping"));
    }

    #[tokio::test]
    async fn test_scan_table_full_is_silent() {
        let bus = Bus::new();
        let probe = probe(&bus);
        let store = StoreHandle::spawn(SettingsDb::open(":memory:").unwrap());
        let mut link = LinkManager::new(MockRadio::new(), store, bus.clone(), settings());
        let t0 = Instant::now();
        link.handle_event(Event::ScanStart, t0).await;
        probe.drain();

        let names: Vec<String> = (0..17).map(|i| format!("net-{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        queue_scan(&mut link.radio, &refs);
        link.on_idle(t0).await;

        assert_eq!(link.table.len(), 16);
        assert!(link.table.find("net-16").is_none());
        let discovered = probe
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::NetworkDiscovered(_)))
            .count();
        assert_eq!(discovered, 16);
    }

    #[tokio::test]
    async fn test_unseen_network_pruned_exactly_once() {
        let bus = Bus::new();
        let probe = probe(&bus);
        let store = StoreHandle::spawn(SettingsDb::open(":memory:").unwrap());
        let mut link = LinkManager::new(MockRadio::new(), store, bus.clone(), settings());
        let t0 = Instant::now();
        link.handle_event(Event::ScanStart, t0).await;

        queue_scan(&mut link.radio, &["fleeting", "steady"]);
        link.on_idle(t0).await;
        probe.drain();

        queue_scan(&mut link.radio, &["steady"]);
        link.on_idle(t0 + Duration::from_secs(60)).await;
        assert!(link.table.find("fleeting").is_some());

        queue_scan(&mut link.radio, &["steady"]);
        link.on_idle(t0 + Duration::from_secs(61)).await;
        queue_scan(&mut link.radio, &["steady"]);
        link.on_idle(t0 + Duration::from_secs(62)).await;

        let events = probe.drain();
        let timeouts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::NetworkTimeout(r) => Some(r.ssid.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(timeouts, vec!["fleeting".to_string()]);
        assert!(link.table.find("fleeting").is_none());

        // Seen again after pruning: discovered, not updated
        queue_scan(&mut link.radio, &["fleeting"]);
        link.on_idle(t0 + Duration::from_secs(63)).await;
        let events = probe.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::NetworkDiscovered(r) if r.ssid == "fleeting")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::NetworkUpdated(r) if r.ssid == "fleeting")));
    }

    #[tokio::test]
    async fn test_scan_start_clears_table_and_stop_resumes_connect() {
        let bus = Bus::new();
        let mut link = LinkManager::new(
            MockRadio::new(),
            store_with_ssid("brewery").await,
            bus,
            settings(),
        );
        let t0 = Instant::now();
        link.handle_event(Event::ScanStart, t0).await;
        queue_scan(&mut link.radio, &["cellar"]);
        link.on_idle(t0).await;
        assert_eq!(link.table.len(), 1);

        link.handle_event(Event::ScanStart, t0).await;
        assert!(link.table.is_empty());

        link.handle_event(Event::ScanStop, t0).await;
        assert!(!link.status.scan_active);
        link.on_idle(t0).await;
        assert_eq!(link.status.state, LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_settings_change_publishes_through_reconnect() {
        let bus = Bus::new();
        let probe = probe(&bus);
        let store = StoreHandle::spawn(SettingsDb::open(":memory:").unwrap());
        let mut radio = MockRadio::new();
        // Keep the reconnect from running so the changed state is observable
        radio.fail_on = Some("stop");
        let mut link = LinkManager::new(radio, store, bus.clone(), settings());
        let now = Instant::now();

        link.handle_event(Event::NetworkSettingsChanged, now).await;
        assert!(probe.drain().is_empty());

        link.on_idle(now).await;
        // Published before the radio failed
        assert_eq!(link_states(&probe.drain()), vec![LinkState::Disconnected]);
        assert_eq!(link.status.state, LinkState::Disconnected);

        // Retried on the next tick
        link.on_idle(now).await;
        assert_eq!(link_states(&probe.drain()), vec![LinkState::Disconnected]);
        assert_eq!(link.radio.calls, vec!["stop", "stop"]);
    }
}
