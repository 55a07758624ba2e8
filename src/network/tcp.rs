// TCP Messenger
// Carries peer messages over TCP. Each peer gets one outbound connection,
// dialled lazily and owned by a writer task that drains that peer's FIFO
// outbox. Inbound connections are read by per-connection tasks that push
// decoded messages into the process inbox.

use crate::mutex::ProcessId;
use crate::network::protocol::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use crate::network::{PeerMessage, PeerMessenger, PeerRegistry, PeerUnavailableError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

// ============================================================================
// TCP MESSENGER CONFIG
// ============================================================================

/// Configuration for the TCP messenger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpMessengerConfig {
    /// Address to listen on ("host:port", port 0 for random)
    pub bind_address: String,
    /// Timeout for dialling a peer, in milliseconds
    pub connect_timeout_ms: u64,
    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
    /// Enable TCP_NODELAY
    pub nodelay: bool,
}

impl Default for TcpMessengerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            connect_timeout_ms: 5_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            nodelay: true,
        }
    }
}

impl TcpMessengerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// Errors starting the TCP transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bind to {address} failed: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// LISTENER
// ============================================================================

/// A bound but not yet serving listener.
///
/// Binding is split from starting so every process can learn its real port
/// before the peer registries are built.
pub struct TcpBinding {
    config: TcpMessengerConfig,
    listener: TcpListener,
}

impl TcpBinding {
    /// Bind the configured address
    pub async fn bind(config: TcpMessengerConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| TransportError::BindFailed {
                address: config.bind_address.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { config, listener })
    }

    /// Actual local address
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Start serving. Returns the messenger and the inbox of decoded messages.
    pub fn start(self, registry: PeerRegistry) -> Result<(TcpMessenger, mpsc::UnboundedReceiver<PeerMessage>), TransportError> {
        let local_address = self.local_addr()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let max_frame = self.config.max_frame_bytes;
        let listener = self.listener;
        let listener_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "Accepted peer connection");
                        tokio::spawn(read_connection(stream, remote, inbox_tx.clone(), max_frame));
                    }
                    Err(e) => {
                        warn!(error = %e, "Listener stopped");
                        break;
                    }
                }
            }
        });

        let mut outboxes = HashMap::new();
        for (peer, address) in registry.iter() {
            let (tx, rx) = mpsc::unbounded_channel();
            let writer = PeerWriter {
                peer: peer.clone(),
                address: *address,
                connect_timeout: Duration::from_millis(self.config.connect_timeout_ms),
                max_frame_bytes: max_frame,
                nodelay: self.config.nodelay,
                stream: None,
                failure: None,
            };
            tokio::spawn(writer.run(rx));
            outboxes.insert(peer.clone(), tx);
        }

        info!(process_id = %registry.my_id(), %local_address, peers = registry.len(), "TCP messenger started");

        let messenger = TcpMessenger {
            local_address,
            outboxes,
            listener_handle,
        };
        Ok((messenger, inbox_rx))
    }
}

async fn read_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    inbox: mpsc::UnboundedSender<PeerMessage>,
    max_frame_bytes: usize,
) {
    loop {
        match read_frame(&mut stream, max_frame_bytes).await {
            Ok(Some(message)) => {
                if inbox.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(%remote, "Peer connection closed");
                break;
            }
            Err(e) => {
                warn!(%remote, error = %e, "Dropping peer connection");
                break;
            }
        }
    }
}

// ============================================================================
// OUTBOUND
// ============================================================================

enum Outgoing {
    Message(PeerMessage),
    Flush(oneshot::Sender<Result<(), PeerUnavailableError>>),
}

struct PeerWriter {
    peer: ProcessId,
    address: SocketAddr,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    nodelay: bool,
    stream: Option<TcpStream>,
    /// First failure since the last flush
    failure: Option<PeerUnavailableError>,
}

impl PeerWriter {
    async fn run(mut self, mut outbox: mpsc::UnboundedReceiver<Outgoing>) {
        while let Some(outgoing) = outbox.recv().await {
            match outgoing {
                Outgoing::Message(message) => {
                    if let Err(e) = self.write(&message).await {
                        warn!(peer = %e.peer, reason = %e.reason, "Send failed");
                        self.failure.get_or_insert(e);
                    }
                }
                Outgoing::Flush(ack) => {
                    let result = match self.failure.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                    let _ = ack.send(result);
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<&mut TcpStream, PeerUnavailableError> {
        if self.stream.is_none() {
            let stream = timeout(self.connect_timeout, TcpStream::connect(self.address))
                .await
                .map_err(|_| self.unavailable("connect timeout"))?
                .map_err(|e| self.unavailable(e.to_string()))?;
            stream.set_nodelay(self.nodelay).ok();
            debug!(peer = %self.peer, address = %self.address, "Connected to peer");
            self.stream = Some(stream);
        }

        self.stream
            .as_mut()
            .ok_or_else(|| PeerUnavailableError::new(self.peer.clone(), "not connected"))
    }

    async fn write(&mut self, message: &PeerMessage) -> Result<(), PeerUnavailableError> {
        let max_frame_bytes = self.max_frame_bytes;
        let stream = self.connect().await?;
        if let Err(e) = write_frame(stream, message, max_frame_bytes).await {
            // Next message re-dials; this one is lost
            self.stream = None;
            return Err(self.unavailable(e.to_string()));
        }
        Ok(())
    }

    fn unavailable(&self, reason: impl Into<String>) -> PeerUnavailableError {
        PeerUnavailableError::new(self.peer.clone(), reason)
    }
}

// ============================================================================
// TCP MESSENGER
// ============================================================================

/// PeerMessenger backed by TCP connections
pub struct TcpMessenger {
    local_address: SocketAddr,
    outboxes: HashMap<ProcessId, mpsc::UnboundedSender<Outgoing>>,
    listener_handle: JoinHandle<()>,
}

impl TcpMessenger {
    /// Address the listener is bound to
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    fn outbox(&self, to: &ProcessId) -> Result<&mpsc::UnboundedSender<Outgoing>, PeerUnavailableError> {
        self.outboxes
            .get(to)
            .ok_or_else(|| PeerUnavailableError::new(to.clone(), "unknown peer"))
    }
}

impl Drop for TcpMessenger {
    fn drop(&mut self) {
        self.listener_handle.abort();
    }
}

#[async_trait]
impl PeerMessenger for TcpMessenger {
    fn send(&self, to: &ProcessId, message: PeerMessage) -> Result<(), PeerUnavailableError> {
        self.outbox(to)?
            .send(Outgoing::Message(message))
            .map_err(|_| PeerUnavailableError::new(to.clone(), "writer stopped"))
    }

    async fn flush(&self, to: &ProcessId) -> Result<(), PeerUnavailableError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbox(to)?
            .send(Outgoing::Flush(ack_tx))
            .map_err(|_| PeerUnavailableError::new(to.clone(), "writer stopped"))?;
        ack_rx
            .await
            .map_err(|_| PeerUnavailableError::new(to.clone(), "writer stopped"))?
    }
}
