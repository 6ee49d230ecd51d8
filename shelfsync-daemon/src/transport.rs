//! Push-stream transport.
//!
//! ```text
//! ┌──────────┐  ClientMessage  ┌─────────────┐   JSON frames   ┌──────────┐
//! │ Listener │────────────────►│  Transport  │────────────────►│  stream  │
//! │  (task)  │◄────────────────│   (trait)   │◄────────────────│  server  │
//! └──────────┘  ServerMessage  └─────────────┘                 └──────────┘
//! ```
//!
//! [`WebSocketTransport`] speaks the stream protocol over `tokio-tungstenite`;
//! [`MemoryTransport`] is driven by a [`MemoryServer`] handle in tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::DaemonError;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// One credential and the topics registered under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientMessage {
    CreateSubscriptions { subscriptions: Vec<TopicBatch> },
    DeleteSubscriptions { subscriptions: Vec<TopicRef> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<u64>,
    },
    SubscriptionsCreated {
        #[serde(default)]
        subscriptions: Vec<TopicBatch>,
        #[serde(default)]
        errors: Vec<TopicError>,
    },
    TopicUpdated {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    TopicRemoved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        topic: String,
    },
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A reconnectable, message-oriented stream connection.
///
/// `recv` must be cancel-safe: the listener polls it inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), DaemonError>;

    async fn send(&mut self, message: &ClientMessage) -> Result<(), DaemonError>;

    /// Next server message; `Ok(None)` once the connection has closed.
    async fn recv(&mut self) -> Result<Option<ServerMessage>, DaemonError>;

    async fn close(&mut self) -> Result<(), DaemonError>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    url: String,
    socket: Option<Socket>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: None,
        }
    }

    fn socket(&mut self) -> Result<&mut Socket, DaemonError> {
        self.socket
            .as_mut()
            .ok_or_else(|| DaemonError::Transport("not connected".to_string()))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<(), DaemonError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| DaemonError::Transport(format!("connect {}: {e}", self.url)))?;
        tracing::debug!(url = %self.url, "stream socket open");
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), DaemonError> {
        let text = serde_json::to_string(message)?;
        self.socket()?
            .send(Message::Text(text))
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, DaemonError> {
        loop {
            let Some(frame) = self.socket()?.next().await else {
                self.socket = None;
                return Ok(None);
            };
            match frame.map_err(|e| DaemonError::Transport(e.to_string()))? {
                Message::Text(text) => match serde_json::from_str(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(err) => {
                        tracing::debug!(error = %err, frame = %text, "ignoring unrecognised stream event");
                    }
                },
                Message::Close(_) => {
                    self.socket = None;
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read/write.
                _ => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), DaemonError> {
        if let Some(mut socket) = self.socket.take() {
            socket
                .close(None)
                .await
                .map_err(|e| DaemonError::Transport(e.to_string()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

enum Frame {
    Message(ServerMessage),
    Hangup,
}

/// Test-side handle of a [`MemoryTransport`].
pub struct MemoryServer {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    failures: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    connects: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl MemoryServer {
    pub fn push(&self, message: ServerMessage) {
        let _ = self.inbound.send(Frame::Message(message));
    }

    /// Drop the current connection.
    pub fn hangup(&self) {
        let _ = self.inbound.send(Frame::Hangup);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.failures.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Next message the client sent.
    pub async fn next_sent(&mut self) -> Option<ClientMessage> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<ClientMessage> {
        self.outbound.try_recv().ok()
    }
}

/// [`Transport`] over in-process channels. Every successful `connect`
/// queues a `connected` event.
pub struct MemoryTransport {
    inbound_tx: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    failures: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    connects: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    open: bool,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryServer) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let failures = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let connects = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let server = MemoryServer {
            inbound: inbound_tx.clone(),
            outbound: outbound_rx,
            failures: failures.clone(),
            connects: connects.clone(),
        };
        let transport = Self {
            inbound_tx,
            inbound,
            outbound,
            failures,
            connects,
            open: false,
        };
        (transport, server)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self) -> Result<(), DaemonError> {
        use std::sync::atomic::Ordering;

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DaemonError::Transport("connection refused".to_string()));
        }
        // Frames from a dropped connection are not delivered to a new one.
        while self.inbound.try_recv().is_ok() {}
        self.open = true;
        self.connects.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .inbound_tx
            .send(Frame::Message(ServerMessage::Connected { retry: None }));
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), DaemonError> {
        if !self.open {
            return Err(DaemonError::Transport("not connected".to_string()));
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| DaemonError::Transport("server gone".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, DaemonError> {
        if !self.open {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Frame::Message(message)) => Ok(Some(message)),
            Some(Frame::Hangup) | None => {
                self.open = false;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), DaemonError> {
        self.open = false;
        Ok(())
    }
}
