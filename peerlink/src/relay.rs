//! Frame relay between the virtual interface and the overlay transport.
//!
//! Two independent directions:
//! - egress: interface -> transport, one frame per message
//! - ingress: transport -> interface, one message per frame
//!
//! Neither direction buffers, reorders or retries. Any error ends the
//! direction and is reported to the lifecycle controller.

use crate::error::{Error, Result};
use crate::frame::{FrameBuffer, log_frame};
use crate::transport::{InboundMessage, PeerId, Transport};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Read side of a virtual interface.
#[async_trait]
pub trait FrameRead: Send {
    /// Wait for the next frame and copy it into `buf`. Returns its length.
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of a virtual interface.
#[async_trait]
pub trait FrameWrite: Send {
    /// Inject one frame. Returns the number of bytes accepted.
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
}

/// Relay settings shared by both directions.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub peer: PeerId,
    pub mtu: usize,
    /// Log every frame at debug level.
    pub debug: bool,
}

/// Forward frames read from the interface to the remote peer.
///
/// Runs until a read or send fails.
pub async fn egress<R, T>(mut reader: R, transport: Arc<T>, config: RelayConfig) -> Result<()>
where
    R: FrameRead,
    T: Transport + ?Sized,
{
    let mut buf = FrameBuffer::new(config.mtu);
    info!(peer = %config.peer, mtu = config.mtu, "Egress relay started");

    loop {
        let len = reader
            .read_frame(buf.as_mut_slice())
            .await
            .map_err(|source| Error::Interface { op: "read", source })?;
        let frame = buf.frame(len);

        if config.debug {
            log_frame("egress", frame);
        }

        transport.send(&config.peer, frame).await?;
    }
}

/// Inject every inbound message into the interface.
///
/// Returns `Ok` once the transport stops delivering messages.
pub async fn ingress<W>(
    mut writer: W,
    mut messages: mpsc::Receiver<InboundMessage>,
    config: RelayConfig,
) -> Result<()>
where
    W: FrameWrite,
{
    info!(peer = %config.peer, "Ingress relay started");

    while let Some(message) = messages.recv().await {
        if config.debug {
            log_frame("ingress", &message.payload);
        }

        let written = writer
            .write_frame(&message.payload)
            .await
            .map_err(|source| Error::Interface { op: "write", source })?;

        if written != message.payload.len() {
            return Err(Error::Interface {
                op: "write",
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {written} of {} bytes", message.payload.len()),
                ),
            });
        }
    }

    info!("Inbound message stream ended");
    Ok(())
}
