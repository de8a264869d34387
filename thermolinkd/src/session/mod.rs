pub mod transport;

use std::time::Duration;
use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::codec::MessageCodec;
use shared::protocol::{
    ApiMessage, DeviceReport, DeviceSettingsNotification, SensorReport, WireControllerSettings,
    WireOutputSettings,
};
use shared::quantity::Quantity;
use shared::types::{
    ControlCommand, ControllerSettings, LinkState, OutputSettings, SessionState, SessionStatus,
    TempProfile,
};
use crate::bus::{Bus, Delivery, Event, Mailbox, Topic};
use crate::config::{DeviceConfig, SessionConfig};
use crate::store_manager::StoreHandle;
use self::transport::{Endpoint, Transport, TransportState};

/// Wait before reopening after the transport drops
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub const TOPICS: &[Topic] = &[
    Topic::LinkStatus,
    Topic::SensorSample,
    Topic::SensorTimeout,
    Topic::ControllerSettingsChanged,
    Topic::OutputSettingsChanged,
    Topic::FirmwareUpdateCheckRequest,
    Topic::FirmwareDownloadStartRequest,
];

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub device_id: String,
    pub firmware_version: String,
    pub endpoint: Endpoint,
    pub report_interval: Duration,
    pub settings_debounce: Duration,
    pub sensor_count: usize,
    pub output_count: usize,
}

impl SessionSettings {
    pub fn new(device: &DeviceConfig, session: &SessionConfig) -> Self {
        Self {
            device_id: device.device_id(),
            firmware_version: device.firmware_version.clone(),
            endpoint: Endpoint {
                host: session.host.clone(),
                port: session.port,
            },
            report_interval: session.report_interval(),
            settings_debounce: session.settings_debounce(),
            sensor_count: session.sensor_count,
            output_count: session.output_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SensorSlot {
    new_sample: bool,
    new_settings: bool,
    last_sample: Option<Quantity>,
}

/// The cloud API session: handshake, steady-state sync and reconnects.
///
/// Until the session reaches `Connected` the only frame it will put on the
/// wire is the handshake request for its current state.
pub struct CloudSession<T: Transport, C: MessageCodec> {
    transport: T,
    codec: C,
    store: StoreHandle,
    bus: Bus,
    settings: SessionSettings,
    state: SessionState,
    activation_token: Option<String>,
    published: Option<SessionStatus>,
    sensors: Vec<SensorSlot>,
    /// Per-output "settings changed locally" flags
    outputs: Vec<bool>,
    last_report: Instant,
    settings_pending_since: Option<Instant>,
    next_connect: Option<Instant>,
}

impl<T: Transport, C: MessageCodec> CloudSession<T, C> {
    pub fn new(
        transport: T,
        codec: C,
        store: StoreHandle,
        bus: Bus,
        settings: SessionSettings,
    ) -> Self {
        let sensors = vec![SensorSlot::default(); settings.sensor_count];
        let outputs = vec![false; settings.output_count];
        Self {
            transport,
            codec,
            store,
            bus,
            settings,
            state: SessionState::AwaitingNetConnection,
            activation_token: None,
            published: None,
            sensors,
            outputs,
            last_report: Instant::now(),
            settings_pending_since: None,
            next_connect: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            activation_token: self.activation_token.clone(),
        }
    }

    pub async fn run(mut self, mut mailbox: Mailbox, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Starting cloud session for device {}", self.settings.device_id);
        self.publish_if_changed();

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
                    tracing::info!("Cloud session shutting down");
                    break;
                }
            }
        }

        let undelivered = mailbox.drain();
        if !undelivered.is_empty() {
            tracing::debug!("Dropping {} undelivered events", undelivered.len());
        }
        self.transport.close().await;
        Ok(())
    }

    pub async fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::LinkStatus(link) => {
                if link.state == LinkState::Connected {
                    if self.state == SessionState::AwaitingNetConnection {
                        tracing::info!("Link up, connecting to {}", self.settings.endpoint.url());
                        self.next_connect = None;
                        self.set_state(SessionState::Connect);
                    }
                } else if self.state != SessionState::AwaitingNetConnection {
                    tracing::info!("Link lost ({:?}), dropping session", link.state);
                    self.transport.close().await;
                    self.set_state(SessionState::AwaitingNetConnection);
                }
            }
            Event::SensorSample(sample) => {
                if self.state != SessionState::Connected {
                    return;
                }
                match self.sensors.get_mut(sample.sensor_id as usize) {
                    Some(slot) => {
                        slot.last_sample = Some(sample.value);
                        slot.new_sample = true;
                    }
                    None => tracing::debug!("Sample for unknown sensor {}", sample.sensor_id),
                }
            }
            Event::SensorTimeout(sensor_id) => {
                if let Some(slot) = self.sensors.get_mut(sensor_id as usize) {
                    tracing::debug!("Sensor {} timed out, dropping pending sample", sensor_id);
                    slot.new_sample = false;
                }
            }
            Event::ControllerSettingsChanged(sensor_id) => {
                match self.sensors.get_mut(sensor_id as usize) {
                    Some(slot) => {
                        slot.new_settings = true;
                        self.mark_settings_pending(now);
                    }
                    None => tracing::debug!("Settings change for unknown sensor {}", sensor_id),
                }
            }
            Event::OutputSettingsChanged(output_id) => {
                match self.outputs.get_mut(output_id as usize) {
                    Some(dirty) => {
                        *dirty = true;
                        self.mark_settings_pending(now);
                    }
                    None => tracing::debug!("Settings change for unknown output {}", output_id),
                }
            }
            Event::FirmwareUpdateCheckRequest => {
                if self.state == SessionState::Connected {
                    let current_version = self.settings.firmware_version.clone();
                    self.send(ApiMessage::FirmwareUpdateCheckRequest { current_version })
                        .await;
                }
            }
            Event::FirmwareDownloadStartRequest { version } => {
                if self.state == SessionState::Connected {
                    self.send(ApiMessage::FirmwareDownloadRequest {
                        requested_version: version,
                    })
                    .await;
                }
            }
            other => {
                tracing::debug!("Cloud session ignoring {:?}", other.topic());
            }
        }

        self.publish_if_changed();
    }

    pub async fn on_idle(&mut self, now: Instant) {
        if self.beyond_connect() && self.transport.state() == TransportState::Closed {
            tracing::warn!("Transport closed in {:?}, reconnecting", self.state);
            self.next_connect = Some(now + CONNECT_RETRY_DELAY);
            self.set_state(SessionState::Connect);
        }

        if self.state == SessionState::Connect && self.next_connect.map_or(true, |at| now >= at) {
            match self.transport.connect(&self.settings.endpoint).await {
                Ok(()) => self.set_state(SessionState::Connecting),
                Err(e) => {
                    tracing::warn!("Connect failed: {}", e);
                    self.next_connect = Some(now + CONNECT_RETRY_DELAY);
                }
            }
        }

        if self.state == SessionState::Connecting && self.transport.state() == TransportState::Open {
            self.begin_handshake().await;
        }

        for frame in self.transport.poll() {
            match self.codec.decode(&frame) {
                Ok(message) => self.handle_message(message, now).await,
                Err(e) => tracing::debug!("Dropping frame: {}", e),
            }
        }

        if self.state == SessionState::Connected {
            self.steady_state(now).await;
        }

        self.publish_if_changed();
    }

    fn beyond_connect(&self) -> bool {
        !matches!(
            self.state,
            SessionState::AwaitingNetConnection | SessionState::Connect
        )
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::info!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn publish_if_changed(&mut self) {
        let status = self.status();
        if self.published.as_ref() != Some(&status) {
            self.bus.publish(Event::SessionStatus(status.clone()));
            self.published = Some(status);
        }
    }

    /// The debounce window starts at the first unsent change
    fn mark_settings_pending(&mut self, now: Instant) {
        if self.settings_pending_since.is_none() {
            self.settings_pending_since = Some(now);
        }
    }

    fn enter_connected(&mut self, now: Instant) {
        self.set_state(SessionState::Connected);
        self.last_report = now;
    }

    async fn begin_handshake(&mut self) {
        let auth_token = match self.store.auth_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Failed to read auth token: {:#}", e);
                return;
            }
        };

        if auth_token.is_empty() {
            self.request_activation_token().await;
        } else {
            self.set_state(SessionState::RequestingAuth);
            self.send(ApiMessage::AuthRequest {
                device_id: self.settings.device_id.clone(),
                auth_token,
            })
            .await;
        }
    }

    async fn request_activation_token(&mut self) {
        self.set_state(SessionState::RequestingActivationToken);
        self.send(ApiMessage::ActivationTokenRequest {
            device_id: self.settings.device_id.clone(),
        })
        .await;
    }

    /// The only frame kinds allowed out before the session is connected
    fn may_send(&self, message: &ApiMessage) -> bool {
        match self.state {
            SessionState::Connected => true,
            SessionState::RequestingAuth => matches!(message, ApiMessage::AuthRequest { .. }),
            SessionState::RequestingActivationToken => {
                matches!(message, ApiMessage::ActivationTokenRequest { .. })
            }
            _ => false,
        }
    }

    async fn send(&mut self, message: ApiMessage) {
        if !self.may_send(&message) {
            tracing::warn!("Not sending {} while {:?}", message.name(), self.state);
            return;
        }

        let frame = match self.codec.encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("{}", e);
                return;
            }
        };

        tracing::debug!("Sending {} ({} bytes)", message.name(), frame.len());
        if let Err(e) = self.transport.send(frame).await {
            tracing::warn!("Failed to send {}: {}", message.name(), e);
        }
    }

    async fn handle_message(&mut self, message: ApiMessage, now: Instant) {
        tracing::debug!("Received {} in {:?}", message.name(), self.state);

        match message {
            ApiMessage::ActivationTokenResponse { activation_token } => {
                tracing::info!("Activation token received, waiting for activation");
                self.activation_token = Some(activation_token);
                self.set_state(SessionState::AwaitingActivation);
            }
            ApiMessage::ActivationNotification { auth_token } => {
                tracing::info!("Device activated");
                if let Err(e) = self.store.set_auth_token(auth_token).await {
                    tracing::warn!("Failed to persist auth token: {:#}", e);
                }
                self.activation_token = None;
                self.enter_connected(now);
            }
            ApiMessage::AuthResponse { authenticated: true } => {
                tracing::info!("Authenticated");
                self.enter_connected(now);
            }
            ApiMessage::AuthResponse { authenticated: false } => {
                tracing::warn!("Authentication rejected, falling back to activation");
                if let Err(e) = self.store.set_auth_token("").await {
                    tracing::warn!("Failed to clear auth token: {:#}", e);
                }
                self.request_activation_token().await;
            }
            ApiMessage::FirmwareUpdateCheckResponse(check) => {
                if self.state == SessionState::Connected {
                    self.bus.publish(Event::FirmwareUpdateCheckResponse(check));
                }
            }
            ApiMessage::FirmwareDownloadResponse(chunk) => {
                if self.state == SessionState::Connected {
                    self.bus.publish(Event::FirmwareDownloadChunk(chunk));
                }
            }
            ApiMessage::DeviceSettingsNotification(notification) => {
                self.apply_remote_settings(notification).await;
            }
            other => {
                tracing::debug!("Ignoring unexpected {}", other.name());
            }
        }
    }

    async fn steady_state(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_report) > self.settings.report_interval {
            self.send_report().await;
            self.last_report = now;
        }

        if let Some(since) = self.settings_pending_since {
            if now.saturating_duration_since(since) >= self.settings.settings_debounce {
                self.settings_pending_since = None;
                self.upload_settings(now).await;
            }
        }
    }

    async fn send_report(&mut self) {
        let mut sensor_reports = Vec::new();
        for (id, slot) in self.sensors.iter_mut().enumerate() {
            if !slot.new_sample {
                continue;
            }
            slot.new_sample = false;
            if let Some(value) = slot.last_sample {
                sensor_reports.push(SensorReport {
                    sensor_id: id as u32,
                    value,
                });
            }
        }

        if sensor_reports.is_empty() {
            return;
        }

        self.send(ApiMessage::DeviceReport(DeviceReport {
            device_id: self.settings.device_id.clone(),
            sensor_reports,
        }))
        .await;
    }

    async fn upload_settings(&mut self, now: Instant) {
        let mut notification = DeviceSettingsNotification {
            device_id: self.settings.device_id.clone(),
            ..Default::default()
        };
        let mut retry = false;

        for id in 0..self.sensors.len() {
            if !self.sensors[id].new_settings {
                continue;
            }
            match self.store.controller_settings(id as u32).await {
                Ok(settings) => {
                    notification
                        .sensor_settings
                        .push(WireControllerSettings::from(&settings));
                    self.sensors[id].new_settings = false;
                }
                Err(e) => {
                    tracing::warn!("Failed to read controller {} settings: {:#}", id, e);
                    retry = true;
                }
            }
        }

        for id in 0..self.outputs.len() {
            if !self.outputs[id] {
                continue;
            }
            match self.store.output_settings(id as u32).await {
                Ok(settings) => {
                    notification
                        .output_settings
                        .push(WireOutputSettings::from(&settings));
                    self.outputs[id] = false;
                }
                Err(e) => {
                    tracing::warn!("Failed to read output {} settings: {:#}", id, e);
                    retry = true;
                }
            }
        }

        if retry {
            self.settings_pending_since = Some(now);
        }

        if notification.sensor_settings.is_empty() && notification.output_settings.is_empty() {
            return;
        }

        tracing::info!(
            "Uploading settings: {} controllers, {} outputs",
            notification.sensor_settings.len(),
            notification.output_settings.len()
        );
        self.send(ApiMessage::DeviceSettingsNotification(notification)).await;
    }

    /// Replace the stored configuration wholesale and restart control with it
    async fn apply_remote_settings(&mut self, notification: DeviceSettingsNotification) {
        tracing::info!(
            "Applying remote settings: {} profiles, {} outputs, {} controllers",
            notification.temp_profiles.len(),
            notification.output_settings.len(),
            notification.sensor_settings.len()
        );
        self.bus.publish(Event::ControlHalt);

        for (index, wire) in notification.temp_profiles.iter().enumerate() {
            let profile = TempProfile::from(wire);
            if let Err(e) = self.store.set_temp_profile(index as u32, profile).await {
                tracing::warn!("Failed to store profile {}: {:#}", index, e);
            }
        }

        let mut command = ControlCommand::default();

        for wire in &notification.output_settings {
            let settings = OutputSettings::from(wire);
            if let Err(e) = self.store.set_output_settings(settings).await {
                tracing::warn!("Failed to store output {}: {:#}", settings.output_id, e);
            }
            command.outputs.push(settings);
        }

        for wire in &notification.sensor_settings {
            let settings = match ControllerSettings::try_from(wire) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("Skipping controller settings: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.store.set_controller_settings(settings).await {
                tracing::warn!("Failed to store controller {}: {:#}", settings.sensor_id, e);
            }
            command.controllers.push(settings);
        }

        self.bus.publish(Event::ControlStart(command));
    }
}
