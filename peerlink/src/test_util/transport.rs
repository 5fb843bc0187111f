//! Overlay transport kept in memory.

use crate::transport::{
    EventSenders, InboundMessage, PeerId, Result, Transport, TransportError, TransportEvents,
    event_channels,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// In-memory [`Transport`]. Sent payloads show up on the paired
/// [`TransportHandle`].
pub struct MemoryTransport {
    sent: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

/// Test side of a [`MemoryTransport`].
pub struct TransportHandle {
    events: EventSenders,
    sent: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, TransportEvents, TransportHandle) {
        let (events, streams) = event_channels();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let fail_sends = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Arc::new(MemoryTransport {
            sent: sent_tx,
            fail_sends: Arc::clone(&fail_sends),
            closed: Arc::clone(&closed),
        });
        let handle = TransportHandle {
            events,
            sent: sent_rx,
            fail_sends,
            closed,
        };
        (transport, streams, handle)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &PeerId, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send {
                peer: peer.to_string(),
                source: std::io::Error::other("injected send failure"),
            });
        }

        self.sent
            .send((peer.clone(), payload.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl TransportHandle {
    /// Deliver `payload` as if it arrived from the remote peer.
    ///
    /// Returns false once the receiving side is gone.
    pub async fn deliver(&self, payload: &[u8]) -> bool {
        let message = InboundMessage {
            payload: payload.to_vec(),
        };
        self.events.messages.send(message).await.is_ok()
    }

    /// Report a new underlying connection to `remote`.
    pub fn connect(&self, remote: SocketAddr) {
        self.events.announcer.announce(remote);
    }

    /// Next payload handed to [`Transport::send`].
    pub async fn next_sent(&mut self) -> Option<(PeerId, Vec<u8>)> {
        self.sent.recv().await
    }

    /// Payloads sent so far that were not yet taken with `next_sent`.
    pub fn drain_sent(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        let mut sent = Vec::new();
        while let Ok(item) = self.sent.try_recv() {
            sent.push(item);
        }
        sent
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
