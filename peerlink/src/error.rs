//! Error types for peerlink.

use std::io;
use thiserror::Error;

use crate::config::ConfigError;
use crate::routes::RouteError;
use crate::transport::TransportError;
use crate::tun::TunError;

/// Main error type for link operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("TUN device error: {0}")]
    Tun(#[from] TunError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("route error: {0}")]
    Route(#[from] RouteError),

    /// Reading from or writing to the virtual interface failed.
    #[error("virtual interface {op} failed: {source}")]
    Interface {
        op: &'static str,
        source: io::Error,
    },

    #[error("failed to enable IP forwarding: {0}")]
    Forwarding(io::Error),

    /// A long-running task returned although it should run until shutdown.
    #[error("{0} stopped unexpectedly")]
    TaskExited(&'static str),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
