//! Kernel IP forwarding switch.

use std::io;
use std::path::Path;
use tracing::{debug, info};

const IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// Enable IPv4 forwarding on the host.
pub async fn enable_ip_forwarding() -> io::Result<()> {
    if set_flag(Path::new(IPV4_FORWARD)).await? {
        info!("IPv4 forwarding enabled");
    }
    Ok(())
}

/// Write `1` to a sysctl file. Returns false if it was already set.
async fn set_flag(path: &Path) -> io::Result<bool> {
    let current = tokio::fs::read_to_string(path).await?;
    if current.trim() == "1" {
        debug!(path = %path.display(), "Already enabled");
        return Ok(false);
    }

    tokio::fs::write(path, b"1\n").await?;
    Ok(true)
}
