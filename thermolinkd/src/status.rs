use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::types::{LinkStatus, SessionState, SessionStatus};
use crate::bus::{Delivery, Event, Mailbox, Topic};
use crate::link::table::NetworkRecord;

pub const TOPICS: &[Topic] = &[
    Topic::LinkStatus,
    Topic::NetworkDiscovered,
    Topic::NetworkUpdated,
    Topic::NetworkTimeout,
    Topic::SessionStatus,
    Topic::FirmwareUpdateCheckResponse,
    Topic::ControlHalt,
    Topic::ControlStart,
];

/// A published value and when the tracker saw it
#[derive(Debug, Clone, Serialize)]
pub struct Stamped<T> {
    #[serde(flatten)]
    pub value: T,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> Stamped<T> {
    fn initial(value: T) -> Self {
        Self {
            value,
            updated_at: None,
        }
    }

    fn now(value: T) -> Self {
        Self {
            value,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Read side of the tracker, cloned into the API state
#[derive(Clone)]
pub struct StatusView {
    pub link: watch::Receiver<Stamped<LinkStatus>>,
    pub session: watch::Receiver<Stamped<SessionStatus>>,
    pub networks: watch::Receiver<Vec<NetworkRecord>>,
}

/// Mirrors the latest snapshots published on the bus
pub struct StatusTracker {
    link: watch::Sender<Stamped<LinkStatus>>,
    session: watch::Sender<Stamped<SessionStatus>>,
    networks: watch::Sender<Vec<NetworkRecord>>,
    known: BTreeMap<String, NetworkRecord>,
}

impl StatusTracker {
    pub fn new() -> (Self, StatusView) {
        let (link_tx, link_rx) = watch::channel(Stamped::initial(LinkStatus::default()));
        let (session_tx, session_rx) = watch::channel(Stamped::initial(SessionStatus {
            state: SessionState::AwaitingNetConnection,
            activation_token: None,
        }));
        let (networks_tx, networks_rx) = watch::channel(Vec::new());

        let tracker = Self {
            link: link_tx,
            session: session_tx,
            networks: networks_tx,
            known: BTreeMap::new(),
        };
        let view = StatusView {
            link: link_rx,
            session: session_rx,
            networks: networks_rx,
        };
        (tracker, view)
    }

    pub fn apply(&mut self, event: Event) {
        match event {
            Event::LinkStatus(status) => {
                let scan_started = status.scan_active && !self.link.borrow().value.scan_active;
                if scan_started {
                    self.known.clear();
                    self.publish_networks();
                }
                self.link.send_replace(Stamped::now(status));
            }
            Event::NetworkDiscovered(record) | Event::NetworkUpdated(record) => {
                self.known.insert(record.ssid.clone(), record);
                self.publish_networks();
            }
            Event::NetworkTimeout(record) => {
                self.known.remove(&record.ssid);
                self.publish_networks();
            }
            Event::SessionStatus(status) => {
                if let Some(token) = &status.activation_token {
                    tracing::info!("Activation pending, token {}", token);
                }
                self.session.send_replace(Stamped::now(status));
            }
            Event::FirmwareUpdateCheckResponse(check) => {
                tracing::info!(
                    "Firmware update available={} version={} size={}",
                    check.update_available,
                    check.version,
                    check.binary_size
                );
            }
            Event::ControlHalt => tracing::info!("Control halted for settings update"),
            Event::ControlStart(command) => tracing::info!(
                "Control restarted: {} controllers, {} outputs",
                command.controllers.len(),
                command.outputs.len()
            ),
            other => tracing::debug!("Status tracker ignoring {:?}", other.topic()),
        }
    }

    fn publish_networks(&self) {
        self.networks.send_replace(self.known.values().cloned().collect());
    }

    pub async fn run(mut self, mut mailbox: Mailbox, cancel: CancellationToken) {
        loop {
            tokio::select! {
                delivery = mailbox.next() => {
                    if let Delivery::Event(event) = delivery {
                        self.apply(event);
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;
    use shared::types::{LinkState, SecurityMode};

    fn record(ssid: &str, rssi: i16) -> NetworkRecord {
        NetworkRecord {
            ssid: ssid.to_string(),
            bssid: [0x02, 0, 0, 0, 0, 7],
            rssi,
            security_mode: SecurityMode::Wpa2,
            last_seen: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_tracks_latest_link_and_session() {
        let (mut tracker, view) = StatusTracker::new();
        assert!(view.link.borrow().updated_at.is_none());

        tracker.apply(Event::LinkStatus(LinkStatus {
            state: LinkState::Connected,
            dhcp_resolved: true,
            ..Default::default()
        }));
        tracker.apply(Event::SessionStatus(SessionStatus {
            state: SessionState::AwaitingActivation,
            activation_token: Some("K7Q2".to_string()),
        }));

        assert_eq!(view.link.borrow().value.state, LinkState::Connected);
        assert!(view.link.borrow().updated_at.is_some());
        assert_eq!(
            view.session.borrow().value.activation_token.as_deref(),
            Some("K7Q2")
        );
    }

    #[tokio::test]
    async fn test_network_list_follows_events() {
        let (mut tracker, view) = StatusTracker::new();

        tracker.apply(Event::NetworkDiscovered(record("garage", -70)));
        tracker.apply(Event::NetworkDiscovered(record("cellar", -60)));
        tracker.apply(Event::NetworkUpdated(record("garage", -40)));
        {
            let networks = view.networks.borrow();
            assert_eq!(networks.len(), 2);
            assert_eq!(networks[1].ssid, "garage");
            assert_eq!(networks[1].rssi, -40);
        }

        tracker.apply(Event::NetworkTimeout(record("cellar", -60)));
        assert_eq!(view.networks.borrow().len(), 1);

        // A new scan starts from an empty list
        tracker.apply(Event::LinkStatus(LinkStatus {
            scan_active: true,
            ..Default::default()
        }));
        assert!(view.networks.borrow().is_empty());
    }
}
