//! Datagram transport over UDP.
//!
//! One frame per datagram, no framing header. The peer identifier is a
//! `host:port` string, resolved once and cached. Only datagrams from
//! resolved peers are accepted.

use super::{
    Announcer, EventSenders, InboundMessage, PeerId, Result, Transport, TransportError,
    TransportEvents, event_channels,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Largest UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Addresses of resolved peers, shared by send and receive paths.
type KnownPeers = Arc<Mutex<HashSet<SocketAddr>>>;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    announcer: Announcer,
    known: KnownPeers,
    resolved: Mutex<HashMap<PeerId, SocketAddr>>,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind to `addr` and start receiving.
    pub async fn bind(addr: SocketAddr) -> Result<(Self, TransportEvents)> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let socket = Arc::new(socket);

        let (events, streams) = event_channels();
        let announcer = events.announcer.clone();
        let known = KnownPeers::default();

        // The receive loop owns the only message sender, so the message
        // stream ends when it does.
        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            events,
            Arc::clone(&known),
        ));

        info!(addr = %addr, "UDP transport bound");

        Ok((
            UdpTransport {
                socket,
                announcer,
                known,
                resolved: Mutex::new(HashMap::new()),
                receiver,
            },
            streams,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Resolve `peer` ahead of the first send.
    ///
    /// Announces the resolved address, so its host route can be in place
    /// before frames start flowing. Datagrams from `peer` are accepted from
    /// then on.
    pub async fn connect(&self, peer: &PeerId) -> Result<SocketAddr> {
        let addr = self.resolve(peer).await?;
        info!(peer = %peer, addr = %addr, "Peer resolved");
        Ok(addr)
    }

    async fn resolve(&self, peer: &PeerId) -> Result<SocketAddr> {
        let cached = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied();
        if let Some(addr) = cached {
            return Ok(addr);
        }

        let addr = tokio::net::lookup_host(peer.as_str())
            .await
            .map_err(|source| TransportError::Resolve {
                peer: peer.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::NoAddress(peer.to_string()))?;

        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone(), addr);
        let first = self
            .known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr);
        if first {
            self.announcer.announce(addr);
        }
        Ok(addr)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, peer: &PeerId, payload: &[u8]) -> Result<()> {
        let addr = self.resolve(peer).await?;
        let sent = self
            .socket
            .send_to(payload, addr)
            .await
            .map_err(|source| TransportError::Send {
                peer: peer.to_string(),
                source,
            })?;

        if sent != payload.len() {
            return Err(TransportError::ShortSend {
                peer: peer.to_string(),
                sent,
                len: payload.len(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.receiver.abort();
        debug!("UDP transport closed");
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, events: EventSenders, known: KnownPeers) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut rejected: u64 = 0;

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!(error = %e, "UDP receive failed");
                return;
            }
        };

        let accepted = known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&from);
        if !accepted {
            rejected += 1;
            debug!(from = %from, rejected, "Datagram from unknown peer dropped");
            continue;
        }

        let message = InboundMessage {
            payload: buf[..len].to_vec(),
        };
        if events.messages.send(message).await.is_err() {
            debug!("Inbound message receiver dropped, stopping UDP receiver");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CONNECTION_QUEUE_DEPTH;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn loopback() -> (UdpTransport, TransportEvents) {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    /// Two transports that resolved each other.
    async fn pair() -> (UdpTransport, TransportEvents, UdpTransport, TransportEvents) {
        let (a, a_events) = loopback().await;
        let (b, b_events) = loopback().await;
        a.connect(&peer_of(&b)).await.unwrap();
        b.connect(&peer_of(&a)).await.unwrap();
        (a, a_events, b, b_events)
    }

    fn peer_of(transport: &UdpTransport) -> PeerId {
        PeerId::new(transport.local_addr().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_datagram_delivered_verbatim() {
        let (a, _a_events, b, mut b_events) = pair().await;

        let payload: Vec<u8> = (0..=255).collect();
        a.send(&peer_of(&b), &payload).await.unwrap();

        let message = timeout(WAIT, b_events.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, payload);
    }

    #[tokio::test]
    async fn test_connection_announced_once_per_address() {
        let (a, mut a_events) = loopback().await;
        let (b, _b_events) = loopback().await;
        let b_addr = b.local_addr().unwrap();

        assert_eq!(a.connect(&peer_of(&b)).await.unwrap(), b_addr);
        let conn = timeout(WAIT, a_events.connections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.remote, b_addr);

        a.connect(&peer_of(&b)).await.unwrap();
        a.send(&peer_of(&b), b"one").await.unwrap();
        assert!(a_events.connections.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_senders_dropped() {
        let (a, mut a_events, b, _b_events) = pair().await;
        assert_eq!(
            timeout(WAIT, a_events.connections.recv())
                .await
                .unwrap()
                .unwrap()
                .remote,
            b.local_addr().unwrap()
        );

        let a_addr = a.local_addr().unwrap();
        for _ in 0..(CONNECTION_QUEUE_DEPTH + 10) {
            let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            stranger.send_to(b"intruder", a_addr).await.unwrap();
        }
        b.send(&peer_of(&a), b"peer").await.unwrap();

        // Datagrams arrive in order on loopback, so the peer's message
        // comes after every stranger datagram was seen.
        let message = timeout(WAIT, a_events.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, b"peer");
        assert!(a_events.messages.try_recv().is_err());
        assert!(a_events.connections.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unresolvable_peer() {
        let (a, _events) = loopback().await;
        let result = a.send(&PeerId::new("not a peer"), b"x").await;
        assert!(matches!(result, Err(TransportError::Resolve { .. })));
    }
}
