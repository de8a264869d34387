use std::time::Duration;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use shared::protocol::{DEVICE_TYPE, DEVICE_TYPE_HEADER};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Framed, persistent connection to the cloud endpoint. Opening and reading
/// never block the caller: `connect` starts the attempt, `state` reports how
/// it went and `poll` hands over whatever frames have arrived.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;
    fn state(&self) -> TransportState;
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
    fn poll(&mut self) -> Vec<Vec<u8>>;
    async fn close(&mut self);
}

struct Connection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    state: watch::Receiver<TransportState>,
    task: JoinHandle<()>,
}

/// WebSocket transport carrying one binary message per frame
#[derive(Default)]
pub struct WebSocketTransport {
    connection: Option<Connection>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.close().await;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);

        let url = endpoint.url();
        let task = tokio::spawn(async move {
            run_connection(url, out_rx, in_tx, &state_tx).await;
            let _ = state_tx.send(TransportState::Closed);
        });

        self.connection = Some(Connection {
            outbound: out_tx,
            inbound: in_rx,
            state: state_rx,
            task,
        });
        Ok(())
    }

    fn state(&self) -> TransportState {
        match &self.connection {
            Some(connection) => *connection.state.borrow(),
            None => TransportState::Closed,
        }
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.state() != TransportState::Open {
            return Err(TransportError::NotOpen);
        }
        let connection = self.connection.as_ref().ok_or(TransportError::NotOpen)?;
        connection
            .outbound
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn poll(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        if let Some(connection) = self.connection.as_mut() {
            while let Ok(frame) = connection.inbound.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
            let _ = connection.task.await;
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
        }
    }
}

async fn run_connection(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    state: &watch::Sender<TransportState>,
) {
    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Invalid endpoint {}: {}", url, e);
            return;
        }
    };
    request
        .headers_mut()
        .insert(DEVICE_TYPE_HEADER, HeaderValue::from_static(DEVICE_TYPE));

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Connection to {} failed: {}", url, e);
            return;
        }
        Err(_) => {
            tracing::warn!("Connection to {} timed out", url);
            return;
        }
    };

    tracing::info!("Connected to {}", url);
    let _ = state.send(TransportState::Open);

    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::binary(frame)).await {
                    tracing::warn!("Send to {} failed: {}", url, e);
                    break;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        if inbound.send(data.to_vec()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Connection to {} closed by peer", url);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Receive from {} failed: {}", url, e);
                        break;
                    }
                }
            }
        }
    }
}
