pub mod config;
pub mod error;
pub mod failover;
pub mod frame;
pub mod lifecycle;
pub mod relay;
pub mod routes;
pub mod sysctl;
pub mod test_util;
pub mod transport;
pub mod tun;

pub use config::Config;
pub use error::{Error, Result};
