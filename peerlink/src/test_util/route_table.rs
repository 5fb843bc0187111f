//! Routing table kept in memory.

use crate::routes::{Result, RouteError, RouteRecord, RouteTable};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct State {
    routes: Vec<RouteRecord>,
    added: Vec<RouteRecord>,
    deleted: Vec<RouteRecord>,
    replaced: Vec<RouteRecord>,
    delete_attempts: usize,
    fail_add: HashSet<Ipv4Net>,
    fail_delete: HashSet<Ipv4Net>,
    fail_replace: HashSet<Ipv4Net>,
    add_delay: Option<Duration>,
}

/// Routes are keyed like the kernel keys IPv4 routes: destination, table
/// and metric.
fn same_key(a: &RouteRecord, b: &RouteRecord) -> bool {
    a.destination == b.destination && a.table == b.table && a.priority == b.priority
}

/// In-memory [`RouteTable`].
#[derive(Default)]
pub struct MemoryRouteTable {
    state: Mutex<State>,
}

impl MemoryRouteTable {
    /// Table holding `routes`, listed in the given order.
    pub fn new(routes: Vec<RouteRecord>) -> Self {
        MemoryRouteTable {
            state: Mutex::new(State {
                routes,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every add of a route to `destination`.
    pub fn fail_add(&self, destination: Ipv4Net) {
        self.state().fail_add.insert(destination);
    }

    /// Fail every delete of a route to `destination`.
    pub fn fail_delete(&self, destination: Ipv4Net) {
        self.state().fail_delete.insert(destination);
    }

    /// Fail every replace of a route to `destination`.
    pub fn fail_replace(&self, destination: Ipv4Net) {
        self.state().fail_replace.insert(destination);
    }

    /// Make every later add wait `delay` after the route is in the table
    /// before it returns, like a slow kernel acknowledgement.
    pub fn delay_adds(&self, delay: Duration) {
        self.state().add_delay = Some(delay);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_add.clear();
        state.fail_delete.clear();
        state.fail_replace.clear();
    }

    /// Current table contents.
    pub fn routes(&self) -> Vec<RouteRecord> {
        self.state().routes.clone()
    }

    /// Successful adds, in call order.
    pub fn added(&self) -> Vec<RouteRecord> {
        self.state().added.clone()
    }

    /// Successful deletes, in call order.
    pub fn deleted(&self) -> Vec<RouteRecord> {
        self.state().deleted.clone()
    }

    /// Successful replaces, in call order.
    pub fn replaced(&self) -> Vec<RouteRecord> {
        self.state().replaced.clone()
    }

    /// Delete calls, successful or not.
    pub fn delete_attempts(&self) -> usize {
        self.state().delete_attempts
    }

    /// Number of successful changes of any kind.
    pub fn mutations(&self) -> usize {
        let state = self.state();
        state.added.len() + state.deleted.len() + state.replaced.len()
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn list(&self) -> Result<Vec<RouteRecord>> {
        Ok(self.routes())
    }

    async fn add(&self, route: &RouteRecord) -> Result<()> {
        let delay = {
            let mut state = self.state();
            if state.fail_add.contains(&route.destination) {
                return Err(RouteError::Netlink(format!("injected add failure: {route}")));
            }
            if state.routes.iter().any(|r| same_key(r, route)) {
                return Err(RouteError::Exists(route.to_string()));
            }

            state.routes.push(route.clone());
            state.added.push(route.clone());
            state.add_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn delete(&self, route: &RouteRecord) -> Result<()> {
        let mut state = self.state();
        state.delete_attempts += 1;
        if state.fail_delete.contains(&route.destination) {
            return Err(RouteError::Netlink(format!(
                "injected delete failure: {route}"
            )));
        }

        let position = state
            .routes
            .iter()
            .position(|r| same_key(r, route))
            .ok_or_else(|| RouteError::NotFound(route.to_string()))?;
        let removed = state.routes.remove(position);
        state.deleted.push(removed);
        Ok(())
    }

    async fn replace(&self, route: &RouteRecord) -> Result<()> {
        let mut state = self.state();
        if state.fail_replace.contains(&route.destination) {
            return Err(RouteError::Netlink(format!(
                "injected replace failure: {route}"
            )));
        }

        state.routes.retain(|r| !same_key(r, route));
        state.routes.push(route.clone());
        state.replaced.push(route.clone());
        Ok(())
    }
}
