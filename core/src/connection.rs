//! Realtime connection to the chat server.
//!
//! One socket per signed-in user. Inbound frames are handed, raw, to a single
//! registered consumer; outbound events are serialized onto a write task.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::events::OutboundEvent;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Receives every inbound text frame, in arrival order.
pub type FrameHandler = Arc<dyn Fn(String) + Send + Sync>;

/// The realtime channel the sync core talks through.
pub trait Transport: Send + Sync + 'static {
    /// Queues an event for the server. Returns false when it was dropped.
    fn send(&self, event: &OutboundEvent) -> bool;

    /// Installs the single inbound consumer, replacing any previous one.
    fn on_event(&self, handler: FrameHandler);

    fn clear_handler(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

struct Link {
    state: ConnectionState,
    /// Bumped on every connect/disconnect so tasks of an old socket stay quiet.
    generation: u64,
    sender: Option<mpsc::UnboundedSender<String>>,
    observers: watch::Sender<ConnectionState>,
}

impl Link {
    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.observers.send_replace(state);
    }
}

pub struct ConnectionManager {
    config: ClientConfig,
    link: Arc<Mutex<Link>>,
    handler: Arc<Mutex<Option<FrameHandler>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Disconnected,
                generation: 0,
                sender: None,
                observers: watch::channel(ConnectionState::Disconnected).0,
            })),
            handler: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Observes state transitions, including a close initiated by the server.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.lock().observers.subscribe()
    }

    /// Opens the socket. A no-op while already connecting or open.
    pub async fn connect(&self, token: &str) -> Result<()> {
        let generation = {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Disconnected {
                tracing::debug!("Connect ignored, socket is {:?}", link.state);
                return Ok(());
            }
            link.set_state(ConnectionState::Connecting);
            link.generation += 1;
            link.generation
        };

        let ws_stream = match self.open(token).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("WebSocket connect failed: {}", e);
                let mut link = self.link.lock();
                if link.generation == generation {
                    link.set_state(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        {
            let mut link = self.link.lock();
            if link.generation != generation {
                // disconnect() raced the handshake
                return Ok(());
            }
            link.set_state(ConnectionState::Open);
            link.sender = Some(tx);
        }
        tracing::info!("WebSocket connected to {}", self.config.ws_url());

        // Receive task
        let link = self.link.clone();
        let handler = self.handler.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let consumer = handler.lock().clone();
                        match consumer {
                            Some(consumer) => consumer(text),
                            None => tracing::debug!("Frame dropped, no consumer registered"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            let mut link = link.lock();
            if link.generation == generation {
                link.set_state(ConnectionState::Disconnected);
                link.sender = None;
                tracing::info!("WebSocket disconnected");
            }
        });

        // Send task, ends once the sender is dropped
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });

        if let Some(old) = self.reader.lock().replace(reader) {
            old.abort();
        }

        Ok(())
    }

    async fn open(
        &self,
        token: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let url = self.config.ws_url_with_token(token)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        Ok(ws_stream)
    }

    /// Closes the socket. Nothing reconnects automatically.
    pub fn disconnect(&self) {
        {
            let mut link = self.link.lock();
            link.generation += 1;
            link.set_state(ConnectionState::Disconnected);
            // Dropping the sender lets the write task flush a close frame.
            link.sender = None;
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        tracing::info!("WebSocket closed by client");
    }
}

impl Transport for ConnectionManager {
    fn send(&self, event: &OutboundEvent) -> bool {
        let link = self.link.lock();
        let sender = match (&link.state, &link.sender) {
            (ConnectionState::Open, Some(sender)) => sender,
            _ => {
                tracing::warn!("Dropping {} event, socket not open", event.kind());
                return false;
            }
        };

        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode {} event: {}", event.kind(), e);
                return false;
            }
        };

        if sender.send(frame).is_err() {
            tracing::warn!("Dropping {} event, write task gone", event.kind());
            return false;
        }
        true
    }

    fn on_event(&self, handler: FrameHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn clear_handler(&self) {
        *self.handler.lock() = None;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
