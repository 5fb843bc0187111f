//! Link lifecycle.
//!
//! `Idle -> Running -> Draining`. Setup happens in `Idle`; any setup error
//! aborts before routes are touched. `Running` ends on a shutdown signal or
//! on the first failed task. Both paths go through `Draining`, which
//! removes every route this process installed.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::failover::{FailoverManager, TunnelRoute};
use crate::relay::{self, FrameRead, FrameWrite, RelayConfig};
use crate::routes::{NetlinkRouteTable, RouteTable};
use crate::sysctl;
use crate::transport::{PeerId, Transport, TransportEvents, UdpTransport};
use crate::tun::{TunDevice, TunReader, TunWriter};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const TASK_EGRESS: &str = "egress relay";
const TASK_INGRESS: &str = "ingress relay";
const TASK_WATCH: &str = "route watch";

type Tasks = JoinSet<(&'static str, Result<()>)>;

/// Exit status after any termination.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Draining,
}

fn enter(state: State) {
    info!(state = ?state, "Link state changed");
}

/// Why [`Link::run`] returned.
#[derive(Debug)]
pub enum Termination {
    /// A shutdown signal arrived.
    Signal(&'static str),
    /// A task or the route takeover failed.
    Failed(Error),
}

impl Termination {
    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

/// Both halves of the virtual interface plus its index.
pub struct Interface<R, W> {
    pub reader: R,
    pub writer: W,
    pub index: u32,
}

/// A fully set up link, ready to run.
pub struct Link<R, W, T: ?Sized, Tb: ?Sized> {
    config: Arc<Config>,
    interface: Interface<R, W>,
    transport: Arc<T>,
    events: TransportEvents,
    table: Arc<Tb>,
}

/// A link on the real TUN device, UDP transport and kernel routing table.
pub type SystemLink = Link<TunReader, TunWriter, UdpTransport, NetlinkRouteTable>;

/// Create the TUN device and the transport, resolve the peer and open the
/// routing table.
pub async fn bootstrap(config: Arc<Config>) -> Result<SystemLink> {
    enter(State::Idle);

    let tun = TunDevice::create(&config.tun_device_name).await?;
    tun.configure(config.tun_device_ip_address, config.mtu)
        .await?;

    if config.enable_ip_forwarding {
        sysctl::enable_ip_forwarding()
            .await
            .map_err(Error::Forwarding)?;
    }

    let (transport, events) = UdpTransport::bind(config.listen_address).await?;
    transport
        .connect(&PeerId::new(config.remote_peer.clone()))
        .await?;

    let table = NetlinkRouteTable::new()?;

    let index = tun.if_index();
    let (reader, writer) = tun.split()?;

    Ok(Link::new(
        config,
        Interface {
            reader,
            writer,
            index,
        },
        Arc::new(transport),
        events,
        Arc::new(table),
    ))
}

impl<R, W, T, Tb> Link<R, W, T, Tb>
where
    R: FrameRead + 'static,
    W: FrameWrite + 'static,
    T: Transport + ?Sized + 'static,
    Tb: RouteTable + ?Sized + 'static,
{
    pub fn new(
        config: Arc<Config>,
        interface: Interface<R, W>,
        transport: Arc<T>,
        events: TransportEvents,
        table: Arc<Tb>,
    ) -> Self {
        Link {
            config,
            interface,
            transport,
            events,
            table,
        }
    }

    /// Take over the default route if configured, relay until `shutdown`
    /// resolves or a task fails, then drain.
    ///
    /// `shutdown` yields the name of the signal that ended the run.
    pub async fn run<S>(self, shutdown: S) -> Termination
    where
        S: Future<Output = &'static str>,
    {
        let Link {
            config,
            interface,
            transport,
            events,
            table,
        } = self;
        let TransportEvents {
            messages,
            connections,
        } = events;

        let mut failover = FailoverManager::new(table);
        if let Err(e) = override_default_route(&config, &mut failover, interface.index).await {
            error!(error = %e, "Default route takeover failed");
            drain(&config, &failover, &mut Tasks::new(), transport.as_ref()).await;
            return Termination::Failed(e);
        }

        let relay_config = RelayConfig {
            peer: PeerId::new(config.remote_peer.clone()),
            mtu: config.frame_len(),
            debug: config.debug,
        };

        let mut tasks = Tasks::new();
        match failover.watcher() {
            Some(watcher) => {
                tasks.spawn(async move { (TASK_WATCH, watcher.run(connections).await) });
            }
            None => drop(connections),
        }

        let egress_transport = Arc::clone(&transport);
        let egress_config = relay_config.clone();
        let reader = interface.reader;
        tasks.spawn(async move {
            (
                TASK_EGRESS,
                relay::egress(reader, egress_transport, egress_config).await,
            )
        });

        let writer = interface.writer;
        tasks.spawn(async move {
            (
                TASK_INGRESS,
                relay::ingress(writer, messages, relay_config).await,
            )
        });

        enter(State::Running);

        tokio::pin!(shutdown);
        let termination = loop {
            tokio::select! {
                signal = &mut shutdown => {
                    info!(signal, "Received signal");
                    break Termination::Signal(signal);
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok((TASK_WATCH, Ok(()))) => debug!("Route watch finished"),
                    Ok((task, Ok(()))) => {
                        error!(task, "Task stopped unexpectedly");
                        break Termination::Failed(Error::TaskExited(task));
                    }
                    Ok((task, Err(e))) => {
                        error!(task, error = %e, "Task failed");
                        break Termination::Failed(e);
                    }
                    Err(e) => {
                        error!(error = %e, "Task panicked");
                        break Termination::Failed(Error::Join(e));
                    }
                },
            }
        };

        drain(&config, &failover, &mut tasks, transport.as_ref()).await;
        termination
    }
}

async fn override_default_route<Tb>(
    config: &Config,
    failover: &mut FailoverManager<Tb>,
    tun_index: u32,
) -> Result<()>
where
    Tb: RouteTable + ?Sized + 'static,
{
    if !config.default_route_enable {
        return Ok(());
    }

    let Some(gateway) = config.default_route_gateway() else {
        warn!("default_route_gateway_address not set, skipping default route override");
        return Ok(());
    };

    failover
        .take_over(TunnelRoute {
            link_index: tun_index,
            gateway,
            source: config.tun_address(),
        })
        .await
}

/// Remove the installed routes, then stop the tasks and the transport.
///
/// Rollback has to run before the route watch is aborted. It waits for an
/// install in progress to be recorded, then closes the set.
async fn drain<Tb, T>(
    config: &Config,
    failover: &FailoverManager<Tb>,
    tasks: &mut Tasks,
    transport: &T,
) where
    Tb: RouteTable + ?Sized + 'static,
    T: Transport + ?Sized,
{
    enter(State::Draining);

    let report = failover.rollback(config.default_route_restore).await;
    if report.failed.is_empty() {
        info!(removed = report.removed, "Routes removed");
    } else {
        warn!(
            removed = report.removed,
            failed = report.failed.len(),
            "Some routes could not be removed"
        );
    }

    tasks.shutdown().await;
    transport.close().await;
    info!("Link stopped");
}
