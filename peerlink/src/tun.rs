//! TUN device backing the link's virtual interface.

use crate::relay::{FrameRead, FrameWrite};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use libc::{IFF_NO_PI, IFF_TUN, IFNAMSIZ, c_char, c_short};
use rtnetlink::Handle;
use std::fs::OpenOptions;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;

/// TUN device errors.
#[derive(Debug, Error)]
pub enum TunError {
    #[error("interface name '{0}' too long (max {max} bytes)", max = IFNAMSIZ - 1)]
    NameTooLong(String),

    #[error("failed to open /dev/net/tun: {0}")]
    Open(io::Error),

    #[error("TUNSETIFF failed for '{name}': {source}")]
    Create { name: String, source: io::Error },

    #[error("interface '{0}' not found")]
    NotFound(String),

    #[error("netlink error on '{name}': {reason}")]
    Netlink { name: String, reason: String },

    #[error("failed to register TUN fd with the runtime: {0}")]
    Register(io::Error),
}

pub type Result<T> = std::result::Result<T, TunError>;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

/// A layer 3 TUN interface without packet info header.
///
/// The interface is not persistent: the kernel removes it once the last
/// file descriptor is closed.
pub struct TunDevice {
    name: String,
    fd: OwnedFd,
    if_index: u32,
    handle: Handle,
}

impl TunDevice {
    /// Create (or attach to) the TUN interface `name`.
    ///
    /// `name` may be a kernel template such as `tun%d`; the device keeps the
    /// name the kernel picked.
    pub async fn create(name: &str) -> Result<Self> {
        if name.len() >= IFNAMSIZ {
            return Err(TunError::NameTooLong(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(TunError::Open)?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: (IFF_TUN | IFF_NO_PI) as c_short,
            _padding: [0; 22],
        };
        for (slot, byte) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
            *slot = byte as c_char;
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if ret < 0 {
            return Err(TunError::Create {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let name = ifreq_name(&ifr);
        let name = name.as_str();

        let (connection, handle, _) = rtnetlink::new_connection().map_err(|e| {
            TunError::Netlink {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        tokio::spawn(connection);

        let if_index = interface_index(&handle, name)
            .await
            .ok_or_else(|| TunError::NotFound(name.to_string()))?;

        info!(name, if_index, "TUN device created");

        Ok(TunDevice {
            name: name.to_string(),
            fd: file.into(),
            if_index,
            handle,
        })
    }

    /// Assign `address`, set the MTU and bring the interface up.
    pub async fn configure(&self, address: Ipv4Net, mtu: u32) -> Result<()> {
        match self
            .handle
            .address()
            .add(
                self.if_index,
                IpAddr::V4(address.addr()),
                address.prefix_len(),
            )
            .execute()
            .await
        {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                debug!(name = %self.name, address = %address, "Address already assigned");
            }
            Err(e) => return Err(self.netlink_error(e)),
        }

        self.handle
            .link()
            .set(self.if_index)
            .mtu(mtu)
            .up()
            .execute()
            .await
            .map_err(|e| self.netlink_error(e))?;

        info!(name = %self.name, address = %address, mtu, "TUN device up");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Split into independent read and write halves over the same fd.
    pub fn split(self) -> Result<(TunReader, TunWriter)> {
        let fd = Arc::new(AsyncFd::new(self.fd).map_err(TunError::Register)?);
        debug!(name = %self.name, "TUN device split");
        Ok((
            TunReader {
                fd: Arc::clone(&fd),
            },
            TunWriter { fd },
        ))
    }

    fn netlink_error(&self, err: rtnetlink::Error) -> TunError {
        TunError::Netlink {
            name: self.name.clone(),
            reason: err.to_string(),
        }
    }
}

/// Interface name as written back by `TUNSETIFF`.
fn ifreq_name(ifr: &IfReq) -> String {
    let bytes: Vec<u8> = ifr
        .ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn interface_index(handle: &Handle, name: &str) -> Option<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Some(link.header.index),
        _ => None,
    }
}

pub struct TunReader {
    fd: Arc<AsyncFd<OwnedFd>>,
}

pub struct TunWriter {
    fd: Arc<AsyncFd<OwnedFd>>,
}

#[async_trait]
impl FrameRead for TunReader {
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|fd| -> io::Result<usize> {
                let ret = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl FrameWrite for TunWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|fd| -> io::Result<usize> {
                let ret = unsafe {
                    libc::write(
                        fd.as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}
