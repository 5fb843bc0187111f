//! Kernel routing table via rtnetlink.

use super::{Result, RouteError, RouteRecord, RouteTable};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use rtnetlink::{Handle, IpVersion, RouteAddRequest};
use std::net::Ipv4Addr;
use tracing::debug;

/// The host's IPv4 routing table.
pub struct NetlinkRouteTable {
    handle: Handle,
}

impl NetlinkRouteTable {
    /// Open a netlink connection. Must be called inside a tokio runtime.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| RouteError::Netlink(e.to_string()))?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    fn add_request(&self, route: &RouteRecord) -> RouteAddRequest<Ipv4Addr> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(route.destination.addr(), route.destination.prefix_len())
            .output_interface(route.link_index)
            .table_id(route.table);

        if let Some(gateway) = route.gateway {
            request = request.gateway(gateway);
        }
        if let Some(source) = route.source {
            request = request.pref_source(source);
        }

        request
            .message_mut()
            .attributes
            .push(RouteAttribute::Priority(route.priority));
        request
    }

    /// Build the RTM_DELROUTE message for `route`.
    ///
    /// Protocol, scope and type are wildcards so routes installed by other
    /// daemons (dhcp, ra) still match.
    fn delete_message(&self, route: &RouteRecord) -> RouteMessage {
        let mut message = self.add_request(route).message_mut().clone();
        message.header.protocol = RouteProtocol::Unspec;
        message.header.scope = RouteScope::NoWhere;
        message.header.kind = RouteType::Unspec;
        message
    }
}

#[async_trait]
impl RouteTable for NetlinkRouteTable {
    async fn list(&self) -> Result<Vec<RouteRecord>> {
        let mut messages = self.handle.route().get(IpVersion::V4).execute();
        let mut routes = Vec::new();

        while let Some(message) = messages
            .try_next()
            .await
            .map_err(|e| RouteError::Netlink(e.to_string()))?
        {
            if let Some(route) = record_from_message(&message) {
                routes.push(route);
            }
        }

        debug!(count = routes.len(), "Listed IPv4 routes");
        Ok(routes)
    }

    async fn add(&self, route: &RouteRecord) -> Result<()> {
        self.add_request(route)
            .execute()
            .await
            .map_err(|e| map_error(e, route))
    }

    async fn delete(&self, route: &RouteRecord) -> Result<()> {
        self.handle
            .route()
            .del(self.delete_message(route))
            .execute()
            .await
            .map_err(|e| map_error(e, route))
    }

    async fn replace(&self, route: &RouteRecord) -> Result<()> {
        self.add_request(route)
            .replace()
            .execute()
            .await
            .map_err(|e| map_error(e, route))
    }
}

fn map_error(err: rtnetlink::Error, route: &RouteRecord) -> RouteError {
    match err {
        rtnetlink::Error::NetlinkError(e) if e.raw_code() == -libc::EEXIST => {
            RouteError::Exists(route.to_string())
        }
        rtnetlink::Error::NetlinkError(e) if e.raw_code() == -libc::ESRCH => {
            RouteError::NotFound(route.to_string())
        }
        e => RouteError::Netlink(e.to_string()),
    }
}

/// Convert a kernel route dump entry. Non-unicast and non-IPv4 entries
/// (local, broadcast, blackhole) are skipped.
fn record_from_message(message: &RouteMessage) -> Option<RouteRecord> {
    if message.header.address_family != AddressFamily::Inet
        || message.header.kind != RouteType::Unicast
    {
        return None;
    }

    let mut destination = Ipv4Addr::UNSPECIFIED;
    let mut route = RouteRecord {
        link_index: 0,
        destination: Ipv4Net::default(),
        source: None,
        priority: 0,
        table: u32::from(message.header.table),
        gateway: None,
    };

    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => destination = *addr,
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => route.gateway = Some(*addr),
            RouteAttribute::PrefSource(RouteAddress::Inet(addr)) => route.source = Some(*addr),
            RouteAttribute::Oif(index) => route.link_index = *index,
            RouteAttribute::Priority(priority) => route.priority = *priority,
            RouteAttribute::Table(table) => route.table = *table,
            _ => {}
        }
    }

    route.destination = Ipv4Net::new(destination, message.header.destination_prefix_length).ok()?;
    Some(route)
}
