//! Link configuration.
//!
//! Loaded once from a YAML file at startup and passed by reference into
//! every component afterwards. Nothing mutates it after [`Config::load`].

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use thiserror::Error;

/// Default MTU of the TUN device.
pub const DEFAULT_MTU: u32 = 1420;

/// Default TUN device name.
pub const DEFAULT_TUN_NAME: &str = "peerlink0";

/// Default TUN address handed out by `--init`.
pub const DEFAULT_TUN_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const DEFAULT_TUN_PREFIX_LEN: u8 = 24;

/// Default UDP port of the overlay transport.
pub const DEFAULT_LISTEN_PORT: u16 = 7420;

const MIN_MTU: u32 = 576;
const MAX_MTU: u32 = 65535;

/// Linux interface names are limited to IFNAMSIZ - 1 bytes.
const MAX_IFNAME_LEN: usize = 15;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write { path: String, source: io::Error },

    #[error("failed to serialize config: {0}")]
    Serialize(serde_yaml::Error),

    #[error("{0} already exists, refusing to overwrite")]
    AlreadyExists(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Link configuration as stored in `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifier of the remote peer (`host:port` for the UDP transport).
    pub remote_peer: String,

    /// Local bind address of the overlay transport.
    pub listen_address: SocketAddr,

    pub tun_device_name: String,

    /// Local address of the TUN device in CIDR notation.
    pub tun_device_ip_address: Ipv4Net,

    pub mtu: u32,

    /// Route all traffic through the tunnel.
    pub default_route_enable: bool,

    /// Gateway of the tunnel default route. Empty disables the override.
    pub default_route_gateway_address: String,

    /// Put the original default route back at its original metric on exit.
    pub default_route_restore: bool,

    pub enable_ip_forwarding: bool,

    /// Log every relayed frame.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_peer: String::new(),
            listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_LISTEN_PORT)),
            tun_device_name: DEFAULT_TUN_NAME.to_string(),
            tun_device_ip_address: Ipv4Net::new(DEFAULT_TUN_ADDRESS, DEFAULT_TUN_PREFIX_LEN)
                .unwrap_or_default(),
            mtu: DEFAULT_MTU,
            default_route_enable: false,
            default_route_gateway_address: String::new(),
            default_route_restore: false,
            enable_ip_forwarding: false,
            debug: false,
        }
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Write a template config with default settings.
    ///
    /// Fails if `path` already exists.
    pub fn write_template(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.display().to_string()));
        }

        let yaml = serde_yaml::to_string(&Config::default()).map_err(ConfigError::Serialize)?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_peer.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "remote_peer",
                reason: "no remote peer configured".to_string(),
            });
        }

        if self.tun_device_name.is_empty() || self.tun_device_name.len() > MAX_IFNAME_LEN {
            return Err(ConfigError::Invalid {
                field: "tun_device_name",
                reason: format!(
                    "'{}' must be between 1 and {} bytes",
                    self.tun_device_name, MAX_IFNAME_LEN
                ),
            });
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::Invalid {
                field: "mtu",
                reason: format!("{} is outside {}..={}", self.mtu, MIN_MTU, MAX_MTU),
            });
        }

        let gateway = self.default_route_gateway_address.trim();
        if !gateway.is_empty() && gateway.parse::<Ipv4Addr>().is_err() {
            return Err(ConfigError::Invalid {
                field: "default_route_gateway_address",
                reason: format!("'{gateway}' is not an IPv4 address"),
            });
        }

        Ok(())
    }

    /// Gateway of the tunnel default route, if one is configured.
    pub fn default_route_gateway(&self) -> Option<Ipv4Addr> {
        let gateway = self.default_route_gateway_address.trim();
        if gateway.is_empty() {
            return None;
        }
        gateway.parse().ok()
    }

    /// Local address of the TUN device (host part of the CIDR).
    pub fn tun_address(&self) -> Ipv4Addr {
        self.tun_device_ip_address.addr()
    }

    /// MTU as a buffer length.
    pub fn frame_len(&self) -> usize {
        self.mtu as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
remote_peer: 198.51.100.7:7420
tun_device_ip_address: 10.0.0.1/24
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.remote_peer, "198.51.100.7:7420");
        assert_eq!(config.tun_device_name, DEFAULT_TUN_NAME);
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.tun_address(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.tun_device_ip_address.prefix_len(), 24);
        assert!(!config.default_route_enable);
        assert!(!config.enable_ip_forwarding);
        assert_eq!(config.default_route_gateway(), None);
    }

    #[test]
    fn test_full_config() {
        let contents = r#"
remote_peer: relay.example.net:9000
listen_address: 0.0.0.0:9000
tun_device_name: tun0
tun_device_ip_address: 10.8.0.2/30
mtu: 1500
default_route_enable: true
default_route_gateway_address: 203.0.113.1
default_route_restore: true
enable_ip_forwarding: true
"#;
        let config: Config = serde_yaml::from_str(contents).unwrap();
        config.validate().unwrap();

        assert_eq!(config.listen_address.port(), 9000);
        assert_eq!(config.frame_len(), 1500);
        assert!(config.default_route_enable);
        assert!(config.default_route_restore);
        assert_eq!(
            config.default_route_gateway(),
            Some(Ipv4Addr::new(203, 0, 113, 1))
        );
    }

    #[test]
    fn test_blank_gateway_is_unset() {
        let config = Config {
            remote_peer: "peer:1".to_string(),
            default_route_enable: true,
            default_route_gateway_address: "   ".to_string(),
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.default_route_gateway(), None);
    }

    #[test]
    fn test_missing_remote_peer_rejected() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "remote_peer",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = Config {
            remote_peer: "peer:1".to_string(),
            ..Config::default()
        };

        let bad_mtu = Config {
            mtu: 100,
            ..base.clone()
        };
        assert!(bad_mtu.validate().is_err());

        let bad_name = Config {
            tun_device_name: "a-very-long-interface-name".to_string(),
            ..base.clone()
        };
        assert!(bad_name.validate().is_err());

        let bad_gateway = Config {
            default_route_gateway_address: "gateway.local".to_string(),
            ..base
        };
        assert!(bad_gateway.validate().is_err());
    }

    #[test]
    fn test_bad_cidr_fails_to_parse() {
        let contents = "remote_peer: peer:1\ntun_device_ip_address: 10.0.0.1\n";
        assert!(serde_yaml::from_str::<Config>(contents).is_err());
    }

    #[test]
    fn test_template_roundtrip_and_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        Config::write_template(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let template: Config = serde_yaml::from_str(&contents).unwrap();
        assert_eq!(template, Config::default());

        // A template has no peer yet, so loading it must fail validation.
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Invalid { .. })
        ));

        assert!(matches!(
            Config::write_template(&path),
            Err(ConfigError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("nope.yaml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
