//! Default route takeover and host route tracking.
//!
//! Takeover runs once at startup:
//! 1. capture the current IPv4 default route
//! 2. demote it to [`DEMOTED_PRIORITY`]
//! 3. install a default route through the tunnel interface
//!
//! Afterwards every new transport connection gets a /32 route that leaves
//! through the demoted route, so overlay traffic never enters the tunnel
//! it carries. Routes added in steps 3 and later are recorded in the
//! [`RouteSet`] and removed on drain.

use crate::error::{Error, Result};
use crate::routes::{
    DEMOTED_PRIORITY, DrainReport, Install, RouteError, RouteRecord, RouteSet, RouteTable,
    find_default,
};
use crate::transport::PeerConnection;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The tunnel's own default route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelRoute {
    /// Interface index of the TUN device.
    pub link_index: u32,
    pub gateway: Ipv4Addr,
    /// Local address of the TUN device.
    pub source: Ipv4Addr,
}

/// Route state captured and changed during takeover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Takeover {
    /// Default route as found at startup.
    pub original: RouteRecord,
    /// The original route at its demoted metric. Template for host routes.
    pub demoted: RouteRecord,
}

/// Owns the rollback list and the route changes made against one table.
pub struct FailoverManager<T: ?Sized> {
    table: Arc<T>,
    routes: Arc<RouteSet>,
    takeover: Option<Takeover>,
}

impl<T> FailoverManager<T>
where
    T: RouteTable + ?Sized + 'static,
{
    pub fn new(table: Arc<T>) -> Self {
        FailoverManager {
            table,
            routes: Arc::new(RouteSet::new()),
            takeover: None,
        }
    }

    pub fn routes(&self) -> &Arc<RouteSet> {
        &self.routes
    }

    pub fn takeover(&self) -> Option<&Takeover> {
        self.takeover.as_ref()
    }

    /// Capture and demote the default route, then route everything through
    /// the tunnel.
    ///
    /// On failure the table is left as described by [`Self::takeover`]:
    /// `None` means nothing was changed.
    pub async fn take_over(&mut self, tunnel: TunnelRoute) -> Result<()> {
        let original = self.capture().await?;
        let demoted = self.demote(&original).await?;
        self.takeover = Some(Takeover {
            original: original.clone(),
            demoted,
        });

        let route = RouteRecord::default_via(
            tunnel.link_index,
            tunnel.gateway,
            tunnel.source,
            original.table,
        );
        match self.routes.install(self.table.as_ref(), route).await? {
            Install::Added => Ok(()),
            Install::Tracked | Install::Foreign => Err(Error::Route(RouteError::Exists(
                "tunnel default route".to_string(),
            ))),
        }
    }

    async fn capture(&self) -> Result<RouteRecord> {
        let routes = self.table.list().await?;
        let original = find_default(&routes)
            .cloned()
            .ok_or(RouteError::NoDefaultRoute)?;
        info!(route = %original, "Captured default route");
        Ok(original)
    }

    /// Move `original` to the demoted metric, putting it back if that fails.
    async fn demote(&self, original: &RouteRecord) -> Result<RouteRecord> {
        self.table.delete(original).await?;

        let demoted = original.with_priority(DEMOTED_PRIORITY);
        if let Err(e) = self.table.replace(&demoted).await {
            error!(route = %demoted, error = %e, "Failed to demote default route");
            if let Err(restore) = self.table.add(original).await {
                error!(route = %original, error = %restore, "Failed to put default route back");
            }
            return Err(e.into());
        }

        info!(route = %demoted, "Default route demoted");
        Ok(demoted)
    }

    /// Watcher adding host routes for new transport connections.
    ///
    /// `None` until takeover has captured a default route.
    pub fn watcher(&self) -> Option<HostRouteWatcher<T>> {
        let takeover = self.takeover.as_ref()?;
        Some(HostRouteWatcher {
            table: Arc::clone(&self.table),
            routes: Arc::clone(&self.routes),
            template: takeover.demoted.clone(),
        })
    }

    /// Remove every recorded route, newest first.
    ///
    /// With `restore`, the original default route is also put back at its
    /// original metric.
    pub async fn rollback(&self, restore: bool) -> DrainReport {
        let report = self.routes.drain(self.table.as_ref()).await;

        if restore {
            if let Some(takeover) = &self.takeover {
                self.restore(takeover).await;
            }
        }

        report
    }

    async fn restore(&self, takeover: &Takeover) {
        if let Err(e) = self.table.delete(&takeover.demoted).await {
            warn!(route = %takeover.demoted, error = %e, "Failed to remove demoted default route");
            return;
        }
        match self.table.add(&takeover.original).await {
            Ok(()) => info!(route = %takeover.original, "Default route restored"),
            Err(e) => {
                error!(route = %takeover.original, error = %e, "Failed to restore default route")
            }
        }
    }
}

/// Installs a /32 route for every peer host the transport connects to.
pub struct HostRouteWatcher<T: ?Sized> {
    table: Arc<T>,
    routes: Arc<RouteSet>,
    template: RouteRecord,
}

impl<T> HostRouteWatcher<T>
where
    T: RouteTable + ?Sized,
{
    /// Route `connection`'s host through the original default route.
    ///
    /// IPv6 hosts are skipped; the takeover only covers IPv4.
    pub async fn add_host_route(&self, connection: &PeerConnection) -> Result<Option<Install>> {
        let host = match connection.host() {
            IpAddr::V4(host) => host,
            IpAddr::V6(host) => {
                warn!(host = %host, "IPv6 peer, no host route added");
                return Ok(None);
            }
        };

        let route = RouteRecord::host_via(host, &self.template);
        let outcome = self.routes.install(self.table.as_ref(), route).await?;
        if outcome == Install::Tracked {
            debug!(host = %host, "Host route already installed");
        }
        Ok(Some(outcome))
    }

    /// Add host routes until the event stream ends or an install fails.
    pub async fn run(self, mut connections: mpsc::Receiver<PeerConnection>) -> Result<()> {
        info!(template = %self.template, "Host route watch started");

        while let Some(connection) = connections.recv().await {
            self.add_host_route(&connection).await?;
        }

        debug!("Connection event stream ended");
        Ok(())
    }
}
