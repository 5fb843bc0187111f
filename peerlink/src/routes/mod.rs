//! Host IPv4 routing table access.
//!
//! This module provides:
//! - `RouteRecord`: one IPv4 route as this crate sees it
//! - `RouteTable`: list/add/delete/replace against a routing table
//! - `NetlinkRouteTable`: the kernel table via rtnetlink
//! - `RouteSet`: routes installed by this process, pending rollback

mod netlink;
mod set;

pub use netlink::NetlinkRouteTable;
pub use set::{DrainReport, Install, RouteSet};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Route table errors.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {0} already exists")]
    Exists(String),

    #[error("route {0} not found")]
    NotFound(String),

    #[error("no IPv4 default route found")]
    NoDefaultRoute,

    #[error("route set closed, not installing {0}")]
    Closed(String),

    #[error("netlink error: {0}")]
    Netlink(String),
}

pub type Result<T> = std::result::Result<T, RouteError>;

/// Kernel metric given to the original default route once the tunnel takes over.
pub const DEMOTED_PRIORITY: u32 = 100;

/// Main routing table ID (RT_TABLE_MAIN).
pub const MAIN_TABLE: u32 = 254;

/// One IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    /// Output interface index.
    pub link_index: u32,
    pub destination: Ipv4Net,
    /// Preferred source address.
    pub source: Option<Ipv4Addr>,
    /// Metric; lower wins.
    pub priority: u32,
    pub table: u32,
    pub gateway: Option<Ipv4Addr>,
}

impl RouteRecord {
    /// A `0.0.0.0/0` route through `link_index`.
    pub fn default_via(link_index: u32, gateway: Ipv4Addr, source: Ipv4Addr, table: u32) -> Self {
        RouteRecord {
            link_index,
            destination: Ipv4Net::default(),
            source: Some(source),
            priority: 0,
            table,
            gateway: Some(gateway),
        }
    }

    /// A /32 route to `host` that leaves the way `template` does.
    pub fn host_via(host: Ipv4Addr, template: &RouteRecord) -> Self {
        RouteRecord {
            destination: Ipv4Net::from(host),
            ..template.clone()
        }
    }

    pub fn with_priority(&self, priority: u32) -> Self {
        RouteRecord {
            priority,
            ..self.clone()
        }
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }
}

impl fmt::Display for RouteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " oif {}", self.link_index)?;
        if let Some(src) = self.source {
            write!(f, " src {src}")?;
        }
        write!(f, " metric {} table {}", self.priority, self.table)
    }
}

/// Pick the IPv4 default route: the `0.0.0.0/0` entry with the lowest metric,
/// earlier entries winning ties.
pub fn find_default(routes: &[RouteRecord]) -> Option<&RouteRecord> {
    routes
        .iter()
        .filter(|r| r.is_default())
        .min_by_key(|r| r.priority)
}

/// Access to an IPv4 routing table.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// All IPv4 routes, in the order the table reports them.
    async fn list(&self) -> Result<Vec<RouteRecord>>;

    async fn add(&self, route: &RouteRecord) -> Result<()>;

    async fn delete(&self, route: &RouteRecord) -> Result<()>;

    /// Add `route`, overwriting an existing route with the same key.
    async fn replace(&self, route: &RouteRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dst: &str, priority: u32, link_index: u32) -> RouteRecord {
        RouteRecord {
            link_index,
            destination: dst.parse().unwrap(),
            source: None,
            priority,
            table: MAIN_TABLE,
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
        }
    }

    #[test]
    fn test_find_default_ignores_list_order() {
        let routes = vec![
            route("192.168.1.0/24", 0, 2),
            route("10.1.0.0/16", 0, 3),
            route("0.0.0.0/0", 600, 3),
            route("0.0.0.0/0", 100, 2),
        ];

        let default = find_default(&routes).unwrap();
        assert_eq!(default.link_index, 2);
        assert_eq!(default.priority, 100);
    }

    #[test]
    fn test_find_default_tie_takes_first() {
        let routes = vec![route("0.0.0.0/0", 0, 7), route("0.0.0.0/0", 0, 8)];
        assert_eq!(find_default(&routes).unwrap().link_index, 7);
    }

    #[test]
    fn test_find_default_none() {
        let routes = vec![route("192.168.1.0/24", 0, 2)];
        assert!(find_default(&routes).is_none());
    }

    #[test]
    fn test_host_via_copies_template() {
        let template = route("0.0.0.0/0", DEMOTED_PRIORITY, 2);
        let host = RouteRecord::host_via(Ipv4Addr::new(198, 51, 100, 7), &template);

        assert_eq!(host.destination, "198.51.100.7/32".parse().unwrap());
        assert_eq!(host.gateway, template.gateway);
        assert_eq!(host.link_index, 2);
        assert_eq!(host.priority, DEMOTED_PRIORITY);
        assert_eq!(host.table, MAIN_TABLE);
        assert!(!host.is_default());
    }

    #[test]
    fn test_display() {
        let r = RouteRecord::default_via(
            5,
            Ipv4Addr::new(203, 0, 113, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            MAIN_TABLE,
        );
        assert_eq!(
            r.to_string(),
            "0.0.0.0/0 via 203.0.113.1 oif 5 src 10.0.0.1 metric 0 table 254"
        );
    }
}
