//! Virtual interface backed by channels.

use crate::relay::{FrameRead, FrameWrite};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Read half. Yields frames injected through [`InterfaceHandle::inject`].
pub struct ChannelReader {
    frames: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    buffer_lens: Arc<Mutex<Vec<usize>>>,
}

/// Write half. Frames written show up on [`InterfaceHandle::next_written`].
pub struct ChannelWriter {
    written: mpsc::UnboundedSender<Vec<u8>>,
    fail_writes: Arc<AtomicBool>,
}

/// Test side of the interface.
pub struct InterfaceHandle {
    frames: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    buffer_lens: Arc<Mutex<Vec<usize>>>,
    fail_writes: Arc<AtomicBool>,
}

pub fn channel_interface() -> (ChannelReader, ChannelWriter, InterfaceHandle) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let buffer_lens = Arc::new(Mutex::new(Vec::new()));
    let fail_writes = Arc::new(AtomicBool::new(false));

    (
        ChannelReader {
            frames: frames_rx,
            buffer_lens: Arc::clone(&buffer_lens),
        },
        ChannelWriter {
            written: written_tx,
            fail_writes: Arc::clone(&fail_writes),
        },
        InterfaceHandle {
            frames: frames_tx,
            written: written_rx,
            buffer_lens,
            fail_writes,
        },
    )
}

#[async_trait]
impl FrameRead for ChannelReader {
    /// Frames longer than `buf` are truncated, like a TUN read.
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buffer_lens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf.len());

        match self.frames.recv().await {
            Some(Ok(frame)) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            // Nothing more will arrive; behave like an idle device.
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl FrameWrite for ChannelWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        self.written
            .send(frame.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(frame.len())
    }
}

impl InterfaceHandle {
    /// Make `frame` available to the next read.
    pub fn inject(&self, frame: &[u8]) {
        let _ = self.frames.send(Ok(frame.to_vec()));
    }

    /// Make the next read fail with `kind`.
    pub fn inject_error(&self, kind: io::ErrorKind) {
        let _ = self.frames.send(Err(io::Error::from(kind)));
    }

    /// Next frame written to the interface.
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Buffer size passed to each read call so far.
    pub fn read_buffer_lens(&self) -> Vec<usize> {
        self.buffer_lens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}
