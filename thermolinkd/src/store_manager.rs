use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::Result;
use shared::types::{
    ControllerSettings, NetSettings, OutputId, OutputSettings, SensorId, TempProfile,
};
use crate::store::db::SettingsDb;

/// Commands sent to the store thread
pub enum StoreCommand {
    GetAuthToken(oneshot::Sender<Result<String>>),
    SetAuthToken(String, oneshot::Sender<Result<()>>),
    GetNetSettings(oneshot::Sender<Result<Option<NetSettings>>>),
    SetNetSettings(NetSettings, oneshot::Sender<Result<()>>),
    GetController(SensorId, oneshot::Sender<Result<ControllerSettings>>),
    SetController(ControllerSettings, oneshot::Sender<Result<()>>),
    GetOutput(OutputId, oneshot::Sender<Result<OutputSettings>>),
    SetOutput(OutputSettings, oneshot::Sender<Result<()>>),
    GetTempProfile(u32, oneshot::Sender<Result<Option<TempProfile>>>),
    SetTempProfile(u32, TempProfile, oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Handle to the configuration store. Every read and write is serialized on
/// the store thread, so any number of units may hold a clone.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread around an open database
    pub fn spawn(db: SettingsDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(64);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::GetAuthToken(reply) => {
                        let _ = reply.send(db.auth_token());
                    }
                    StoreCommand::SetAuthToken(token, reply) => {
                        let _ = reply.send(db.set_auth_token(&token));
                    }
                    StoreCommand::GetNetSettings(reply) => {
                        let _ = reply.send(db.net_settings());
                    }
                    StoreCommand::SetNetSettings(settings, reply) => {
                        let _ = reply.send(db.set_net_settings(&settings));
                    }
                    StoreCommand::GetController(sensor_id, reply) => {
                        let _ = reply.send(db.controller_settings(sensor_id));
                    }
                    StoreCommand::SetController(settings, reply) => {
                        let _ = reply.send(db.set_controller_settings(&settings));
                    }
                    StoreCommand::GetOutput(output_id, reply) => {
                        let _ = reply.send(db.output_settings(output_id));
                    }
                    StoreCommand::SetOutput(settings, reply) => {
                        let _ = reply.send(db.set_output_settings(&settings));
                    }
                    StoreCommand::GetTempProfile(index, reply) => {
                        let _ = reply.send(db.temp_profile(index));
                    }
                    StoreCommand::SetTempProfile(index, profile, reply) => {
                        let _ = reply.send(db.set_temp_profile(index, &profile));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn auth_token(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetAuthToken(reply)).await?;
        rx.await?
    }

    pub async fn set_auth_token(&self, token: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SetAuthToken(token.into(), reply)).await?;
        rx.await?
    }

    /// Stored network settings, or the empty default when none were saved
    pub async fn net_settings(&self) -> Result<NetSettings> {
        Ok(self.stored_net_settings().await?.unwrap_or_default())
    }

    pub async fn stored_net_settings(&self) -> Result<Option<NetSettings>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetNetSettings(reply)).await?;
        rx.await?
    }

    pub async fn set_net_settings(&self, settings: NetSettings) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SetNetSettings(settings, reply)).await?;
        rx.await?
    }

    pub async fn controller_settings(&self, sensor_id: SensorId) -> Result<ControllerSettings> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetController(sensor_id, reply)).await?;
        rx.await?
    }

    pub async fn set_controller_settings(&self, settings: ControllerSettings) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SetController(settings, reply)).await?;
        rx.await?
    }

    pub async fn output_settings(&self, output_id: OutputId) -> Result<OutputSettings> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetOutput(output_id, reply)).await?;
        rx.await?
    }

    pub async fn set_output_settings(&self, settings: OutputSettings) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SetOutput(settings, reply)).await?;
        rx.await?
    }

    pub async fn temp_profile(&self, index: u32) -> Result<Option<TempProfile>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetTempProfile(index, reply)).await?;
        rx.await?
    }

    pub async fn set_temp_profile(&self, index: u32, profile: TempProfile) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SetTempProfile(index, profile, reply)).await?;
        rx.await?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}
