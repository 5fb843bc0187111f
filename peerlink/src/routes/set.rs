//! Rollback list of routes installed by this process.

use super::{Result, RouteError, RouteRecord, RouteTable};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Outcome of [`RouteSet::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Install {
    /// Installed in the table and recorded for rollback.
    Added,
    /// Already recorded; nothing was sent to the table.
    Tracked,
    /// The table already had the route and it was not installed by us.
    /// Not recorded, so rollback leaves it alone.
    Foreign,
}

/// Result of [`RouteSet::drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
    pub removed: usize,
    pub failed: Vec<RouteRecord>,
}

#[derive(Default)]
struct Inner {
    records: Vec<RouteRecord>,
    closed: bool,
}

/// Routes this process installed and has not removed yet.
///
/// Appends and the drain are serialized by one lock. The lock is held
/// across the table call, so a record is in the set iff its route is in the
/// table, as long as an install is not cancelled halfway. Once drained, the
/// set stays closed and refuses new installs.
#[derive(Default)]
pub struct RouteSet {
    inner: Mutex<Inner>,
}

impl RouteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `route` to `table` and record it.
    ///
    /// A route whose destination and table are already recorded is skipped.
    pub async fn install<T>(&self, table: &T, route: RouteRecord) -> Result<Install>
    where
        T: RouteTable + ?Sized,
    {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(RouteError::Closed(route.to_string()));
        }

        if inner
            .records
            .iter()
            .any(|r| r.destination == route.destination && r.table == route.table)
        {
            return Ok(Install::Tracked);
        }

        match table.add(&route).await {
            Ok(()) => {
                info!(route = %route, "Route installed");
                inner.records.push(route);
                Ok(Install::Added)
            }
            Err(RouteError::Exists(_)) => {
                warn!(route = %route, "Route already present, leaving it unmanaged");
                Ok(Install::Foreign)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy of the recorded routes in install order.
    pub async fn snapshot(&self) -> Vec<RouteRecord> {
        self.inner.lock().await.records.clone()
    }

    /// Close the set and delete every recorded route, newest first.
    ///
    /// Each route gets exactly one delete attempt. Failures are logged and
    /// reported but do not stop the remaining deletes.
    pub async fn drain<T>(&self, table: &T) -> DrainReport
    where
        T: RouteTable + ?Sized,
    {
        let records = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            std::mem::take(&mut inner.records)
        };

        let mut report = DrainReport::default();
        for route in records.into_iter().rev() {
            match table.delete(&route).await {
                Ok(()) => {
                    info!(route = %route, "Route removed");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(route = %route, error = %e, "Failed to remove route");
                    report.failed.push(route);
                }
            }
        }
        report
    }
}
