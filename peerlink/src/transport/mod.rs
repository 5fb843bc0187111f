//! Overlay transport between the two link endpoints.
//!
//! The link only needs three things from a transport: send a payload to a
//! named peer, a stream of inbound payloads, and a stream of "new underlying
//! connection to host H" events. The latter drive host route installation
//! in [`crate::failover`].

mod udp;

pub use udp::UdpTransport;

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Depth of the inbound message queue.
pub const MESSAGE_QUEUE_DEPTH: usize = 1024;

/// Depth of the connection event queue.
pub const CONNECTION_QUEUE_DEPTH: usize = 64;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to resolve peer {peer}: {source}")]
    Resolve { peer: String, source: io::Error },

    #[error("peer {0} resolved to no address")]
    NoAddress(String),

    #[error("failed to send to {peer}: {source}")]
    Send { peer: String, source: io::Error },

    #[error("short send to {peer}: {sent} of {len} bytes")]
    ShortSend {
        peer: String,
        sent: usize,
        len: usize,
    },

    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Identifier of a remote peer as understood by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One payload received from the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
}

/// The transport established a new underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConnection {
    pub remote: SocketAddr,
}

impl PeerConnection {
    /// Host part of the remote address.
    pub fn host(&self) -> IpAddr {
        self.remote.ip()
    }
}

/// Event streams produced by a transport.
pub struct TransportEvents {
    pub messages: mpsc::Receiver<InboundMessage>,
    pub connections: mpsc::Receiver<PeerConnection>,
}

/// Producer side of the connection event stream.
#[derive(Clone)]
pub(crate) struct Announcer(mpsc::Sender<PeerConnection>);

impl Announcer {
    /// Emit a connection event without blocking the caller.
    ///
    /// Dropped when nobody listens or the queue is full.
    pub(crate) fn announce(&self, remote: SocketAddr) {
        match self.0.try_send(PeerConnection { remote }) {
            Ok(()) => debug!(remote = %remote, "Peer connection announced"),
            Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!(remote = %remote, "Connection event queue full, dropping event")
            }
        }
    }
}

/// Producer side of [`TransportEvents`].
pub(crate) struct EventSenders {
    pub(crate) messages: mpsc::Sender<InboundMessage>,
    pub(crate) announcer: Announcer,
}

pub(crate) fn event_channels() -> (EventSenders, TransportEvents) {
    let (messages_tx, messages) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
    let (connections_tx, connections) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
    (
        EventSenders {
            messages: messages_tx,
            announcer: Announcer(connections_tx),
        },
        TransportEvents {
            messages,
            connections,
        },
    )
}

/// A message carrier between named peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` as one message to `peer`.
    async fn send(&self, peer: &PeerId, payload: &[u8]) -> Result<()>;

    /// Stop producing events and release the underlying resources.
    async fn close(&self);
}
