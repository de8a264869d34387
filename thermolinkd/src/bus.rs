use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::protocol::{FirmwareChunk, FirmwareUpdateCheck};
use shared::types::{
    ControlCommand, LinkStatus, OutputId, SensorId, SensorSample, SessionStatus,
};
use crate::link::radio::{DhcpParams, PingReport};
use crate::link::table::NetworkRecord;

/// Everything that travels over the bus. Payloads are value copies.
#[derive(Debug, Clone)]
pub enum Event {
    NetworkSettingsChanged,

    RadioAssociated,
    RadioDisassociated,
    RadioDhcpComplete(DhcpParams),
    RadioPingReport(PingReport),

    ScanStart,
    ScanStop,

    LinkStatus(LinkStatus),
    NetworkDiscovered(NetworkRecord),
    NetworkUpdated(NetworkRecord),
    NetworkTimeout(NetworkRecord),

    SensorSample(SensorSample),
    SensorTimeout(SensorId),
    ControllerSettingsChanged(SensorId),
    OutputSettingsChanged(OutputId),
    FirmwareUpdateCheckRequest,
    FirmwareDownloadStartRequest { version: String },

    SessionStatus(SessionStatus),
    FirmwareUpdateCheckResponse(FirmwareUpdateCheck),
    FirmwareDownloadChunk(FirmwareChunk),
    ControlHalt,
    ControlStart(ControlCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NetworkSettingsChanged,
    RadioAssociated,
    RadioDisassociated,
    RadioDhcpComplete,
    RadioPingReport,
    ScanStart,
    ScanStop,
    LinkStatus,
    NetworkDiscovered,
    NetworkUpdated,
    NetworkTimeout,
    SensorSample,
    SensorTimeout,
    ControllerSettingsChanged,
    OutputSettingsChanged,
    FirmwareUpdateCheckRequest,
    FirmwareDownloadStartRequest,
    SessionStatus,
    FirmwareUpdateCheckResponse,
    FirmwareDownloadChunk,
    ControlHalt,
    ControlStart,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::NetworkSettingsChanged => Topic::NetworkSettingsChanged,
            Event::RadioAssociated => Topic::RadioAssociated,
            Event::RadioDisassociated => Topic::RadioDisassociated,
            Event::RadioDhcpComplete(_) => Topic::RadioDhcpComplete,
            Event::RadioPingReport(_) => Topic::RadioPingReport,
            Event::ScanStart => Topic::ScanStart,
            Event::ScanStop => Topic::ScanStop,
            Event::LinkStatus(_) => Topic::LinkStatus,
            Event::NetworkDiscovered(_) => Topic::NetworkDiscovered,
            Event::NetworkUpdated(_) => Topic::NetworkUpdated,
            Event::NetworkTimeout(_) => Topic::NetworkTimeout,
            Event::SensorSample(_) => Topic::SensorSample,
            Event::SensorTimeout(_) => Topic::SensorTimeout,
            Event::ControllerSettingsChanged(_) => Topic::ControllerSettingsChanged,
            Event::OutputSettingsChanged(_) => Topic::OutputSettingsChanged,
            Event::FirmwareUpdateCheckRequest => Topic::FirmwareUpdateCheckRequest,
            Event::FirmwareDownloadStartRequest { .. } => Topic::FirmwareDownloadStartRequest,
            Event::SessionStatus(_) => Topic::SessionStatus,
            Event::FirmwareUpdateCheckResponse(_) => Topic::FirmwareUpdateCheckResponse,
            Event::FirmwareDownloadChunk(_) => Topic::FirmwareDownloadChunk,
            Event::ControlHalt => Topic::ControlHalt,
            Event::ControlStart(_) => Topic::ControlStart,
        }
    }
}

struct Listener {
    name: &'static str,
    topics: Vec<Topic>,
    tx: flume::Sender<Event>,
}

/// Typed publish/subscribe bus with one mailbox per listener
#[derive(Clone, Default)]
pub struct Bus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `topics`. The mailbox also yields an idle
    /// wake-up every `idle` even when events keep arriving.
    pub fn subscribe(&self, name: &'static str, topics: &[Topic], idle: Duration) -> Mailbox {
        let (tx, rx) = flume::unbounded();

        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener {
                name,
                topics: topics.to_vec(),
                tx,
            });

        Mailbox {
            name,
            rx,
            idle,
            next_idle: Instant::now() + idle,
            watchdog: None,
        }
    }

    /// Fan out a copy of `event` to every subscribed mailbox. The event is in
    /// each mailbox by the time this returns.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let mut dropped = false;

        {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            for listener in listeners.iter().filter(|l| l.topics.contains(&topic)) {
                if listener.tx.send(event.clone()).is_err() {
                    tracing::debug!("Listener {} is gone, dropping {:?}", listener.name, topic);
                    dropped = true;
                }
            }
        }

        if dropped {
            self.listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|l| !l.tx.is_disconnected());
        }
    }
}

/// What a unit wakes up for
#[derive(Debug)]
pub enum Delivery {
    Event(Event),
    Idle,
}

pub struct Mailbox {
    name: &'static str,
    rx: flume::Receiver<Event>,
    idle: Duration,
    next_idle: Instant,
    watchdog: Option<Watchdog>,
}

impl Mailbox {
    /// Supervise this mailbox: the owning unit must come back for its next
    /// delivery within `max_silence`.
    pub fn watch(&mut self, max_silence: Duration) -> Watchdog {
        let watchdog = Watchdog {
            name: self.name,
            max_silence,
            last_kick: Arc::new(Mutex::new(Instant::now())),
        };
        self.watchdog = Some(watchdog.clone());
        watchdog
    }

    /// Wait for the next event or the idle deadline, whichever comes first.
    pub async fn next(&mut self) -> Delivery {
        if let Some(watchdog) = &self.watchdog {
            watchdog.kick();
        }

        // Checked before waiting: a mailbox that never runs empty must still
        // hand out its idle tick.
        let delivery = if Instant::now() >= self.next_idle {
            self.next_idle = Instant::now() + self.idle;
            Delivery::Idle
        } else {
            match tokio::time::timeout_at(self.next_idle, self.rx.recv_async()).await {
                Ok(Ok(event)) => Delivery::Event(event),
                // The bus keeps every sender alive, so a closed channel only
                // means shutdown; keep ticking until the unit is cancelled.
                Ok(Err(_)) | Err(_) => {
                    tokio::time::sleep_until(self.next_idle).await;
                    self.next_idle = Instant::now() + self.idle;
                    Delivery::Idle
                }
            }
        };

        if let Some(watchdog) = &self.watchdog {
            watchdog.kick();
        }
        delivery
    }

    /// Take everything currently queued without waiting
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}

/// Tracks when a unit last returned to its mailbox
#[derive(Clone)]
pub struct Watchdog {
    name: &'static str,
    max_silence: Duration,
    last_kick: Arc<Mutex<Instant>>,
}

impl Watchdog {
    fn kick(&self) {
        *self.last_kick.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn overdue(&self, now: Instant) -> bool {
        let last = *self.last_kick.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last) > self.max_silence
    }
}

/// Check every watchdog once per second. A unit that stays silent too long is
/// a supervision failure and shuts the daemon down.
pub async fn supervise(watchdogs: Vec<Watchdog>, cancel: CancellationToken) {
    if watchdogs.is_empty() {
        return;
    }

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                if let Some(stuck) = watchdogs.iter().find(|w| w.overdue(now)) {
                    tracing::error!(
                        "Watchdog expired for {} (silent > {:?}), shutting down",
                        stuck.name,
                        stuck.max_silence
                    );
                    cancel.cancel();
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
