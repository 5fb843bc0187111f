//! Default route takeover and rollback tests
//!
//! Run against the in-memory route table:
//! 1. takeover on a host with an eth0 default route
//! 2. /32 host routes for peer connections
//! 3. drain leaves exactly the pre-existing routes behind

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use peerlink::failover::{FailoverManager, TunnelRoute};
use peerlink::routes::{DEMOTED_PRIORITY, Install, MAIN_TABLE, RouteRecord};
use peerlink::test_util::MemoryRouteTable;
use peerlink::transport::PeerConnection;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ETH0: u32 = 2;
const TUN0: u32 = 9;
const WAIT: Duration = Duration::from_secs(5);

fn eth0_default(gateway: Ipv4Addr) -> RouteRecord {
    RouteRecord {
        link_index: ETH0,
        destination: "0.0.0.0/0".parse().unwrap(),
        source: None,
        priority: 0,
        table: MAIN_TABLE,
        gateway: Some(gateway),
    }
}

fn lan_route() -> RouteRecord {
    RouteRecord {
        link_index: ETH0,
        destination: "192.168.1.0/24".parse().unwrap(),
        source: Some(Ipv4Addr::new(192, 168, 1, 20)),
        priority: 0,
        table: MAIN_TABLE,
        gateway: None,
    }
}

fn tunnel(gateway: Ipv4Addr) -> TunnelRoute {
    TunnelRoute {
        link_index: TUN0,
        gateway,
        source: Ipv4Addr::new(10, 0, 0, 1),
    }
}

fn peer(a: u8, b: u8, port: u16) -> PeerConnection {
    PeerConnection {
        remote: SocketAddr::from(([198, 51, 100, a], port + u16::from(b))),
    }
}

#[tokio::test]
async fn test_takeover_scenario() {
    let g0 = Ipv4Addr::new(203, 0, 113, 1);
    // The LAN route is listed first; takeover must not pick it.
    let table = Arc::new(MemoryRouteTable::new(vec![lan_route(), eth0_default(g0)]));
    let mut manager = FailoverManager::new(Arc::clone(&table));

    manager.take_over(tunnel(g0)).await.unwrap();

    let demoted = eth0_default(g0).with_priority(DEMOTED_PRIORITY);
    let tunnel_default = RouteRecord {
        link_index: TUN0,
        destination: "0.0.0.0/0".parse().unwrap(),
        source: Some(Ipv4Addr::new(10, 0, 0, 1)),
        priority: 0,
        table: MAIN_TABLE,
        gateway: Some(g0),
    };
    let routes = table.routes();
    assert!(routes.contains(&demoted));
    assert!(routes.contains(&tunnel_default));
    assert!(!routes.contains(&eth0_default(g0)));
    assert_eq!(manager.takeover().unwrap().original, eth0_default(g0));

    let watcher = manager.watcher().unwrap();
    let outcome = watcher
        .add_host_route(&PeerConnection {
            remote: "198.51.100.7:30003".parse().unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, Some(Install::Added));

    let host = table
        .routes()
        .into_iter()
        .find(|r| r.destination == "198.51.100.7/32".parse().unwrap())
        .unwrap();
    assert_eq!(host.gateway, Some(g0));
    assert_eq!(host.link_index, ETH0);
    assert_eq!(host.table, MAIN_TABLE);

    let report = manager.rollback(false).await;
    assert_eq!(report.removed, 2);
    assert!(report.failed.is_empty());

    // The demoted route stays at its demoted metric.
    assert_eq!(table.routes(), vec![lan_route(), demoted]);
}

#[tokio::test]
async fn test_host_routes_never_use_tunnel_gateway() {
    let g0 = Ipv4Addr::new(192, 0, 2, 1);
    let g1 = Ipv4Addr::new(10, 0, 0, 254);
    let table = Arc::new(MemoryRouteTable::new(vec![eth0_default(g0)]));
    let mut manager = FailoverManager::new(Arc::clone(&table));
    manager.take_over(tunnel(g1)).await.unwrap();

    let watcher = manager.watcher().unwrap();
    for i in 1..=10 {
        watcher.add_host_route(&peer(i, 0, 40000)).await.unwrap();
    }

    let hosts: Vec<_> = manager
        .routes()
        .snapshot()
        .await
        .into_iter()
        .filter(|r| r.destination.prefix_len() == 32)
        .collect();
    assert_eq!(hosts.len(), 10);
    for route in hosts {
        assert_eq!(route.gateway, Some(g0));
        assert_eq!(route.link_index, ETH0);
        assert_ne!(route.link_index, TUN0);
    }
}

#[tokio::test]
async fn test_rollback_removes_every_added_route() {
    for n in [0u8, 1, 5, 20] {
        let g0 = Ipv4Addr::new(203, 0, 113, 1);
        let table = Arc::new(MemoryRouteTable::new(vec![lan_route(), eth0_default(g0)]));
        let mut manager = FailoverManager::new(Arc::clone(&table));
        manager.take_over(tunnel(g0)).await.unwrap();

        let (tx, rx) = mpsc::channel(64);
        let watch = tokio::spawn(manager.watcher().unwrap().run(rx));
        for i in 0..n {
            tx.send(peer(i, 0, 30000)).await.unwrap();
        }
        drop(tx);
        timeout(WAIT, watch).await.unwrap().unwrap().unwrap();

        let report = manager.rollback(false).await;
        assert_eq!(report.removed, usize::from(n) + 1);
        assert_eq!(table.added().len(), usize::from(n) + 1);
        assert_eq!(table.deleted().len(), table.added().len() + 1);

        let remaining = table.routes();
        for added in table.added() {
            assert!(!remaining.contains(&added));
        }
    }
}

#[tokio::test]
async fn test_reconnect_to_same_host_is_skipped() {
    let g0 = Ipv4Addr::new(203, 0, 113, 1);
    let table = Arc::new(MemoryRouteTable::new(vec![eth0_default(g0)]));
    let mut manager = FailoverManager::new(Arc::clone(&table));
    manager.take_over(tunnel(g0)).await.unwrap();
    let watcher = manager.watcher().unwrap();

    assert_eq!(
        watcher.add_host_route(&peer(7, 0, 30000)).await.unwrap(),
        Some(Install::Added)
    );
    // New connection, same host, different port.
    assert_eq!(
        watcher.add_host_route(&peer(7, 1, 30000)).await.unwrap(),
        Some(Install::Tracked)
    );

    assert_eq!(table.added().len(), 2);
    assert_eq!(manager.routes().len().await, 2);
}

#[tokio::test]
async fn test_preexisting_host_route_left_alone() {
    let g0 = Ipv4Addr::new(203, 0, 113, 1);
    let existing = RouteRecord::host_via(
        Ipv4Addr::new(198, 51, 100, 7),
        &eth0_default(g0).with_priority(DEMOTED_PRIORITY),
    );
    let table = Arc::new(MemoryRouteTable::new(vec![
        eth0_default(g0),
        existing.clone(),
    ]));
    let mut manager = FailoverManager::new(Arc::clone(&table));
    manager.take_over(tunnel(g0)).await.unwrap();

    let outcome = manager
        .watcher()
        .unwrap()
        .add_host_route(&peer(7, 0, 30000))
        .await
        .unwrap();
    assert_eq!(outcome, Some(Install::Foreign));

    manager.rollback(false).await;
    assert!(table.routes().contains(&existing));
}

#[tokio::test]
async fn test_drain_racing_watch_leaves_nothing_behind() {
    let g0 = Ipv4Addr::new(203, 0, 113, 1);
    let table = Arc::new(MemoryRouteTable::new(vec![eth0_default(g0)]));
    let mut manager = FailoverManager::new(Arc::clone(&table));
    manager.take_over(tunnel(g0)).await.unwrap();

    let (tx, rx) = mpsc::channel(256);
    let watch = tokio::spawn(manager.watcher().unwrap().run(rx));
    let feed = tokio::spawn(async move {
        for i in 0..200u16 {
            let host = PeerConnection {
                remote: SocketAddr::from(([198, 51, (i / 250) as u8, (i % 250) as u8], 30000)),
            };
            if tx.send(host).await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
    });

    tokio::task::yield_now().await;
    manager.rollback(false).await;

    // The watch either finished or hit the closed route set.
    let _ = timeout(WAIT, watch).await.unwrap().unwrap();
    feed.abort();

    let remaining = table.routes();
    for added in table.added() {
        assert!(!remaining.contains(&added), "{added} left behind");
    }
    assert_eq!(table.added().len(), table.deleted().len() - 1);
}
