//! End-to-end mesh formation and controller election over real sockets.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use strata_cluster::{ClusterConfig, NodeCoordinator};

/// Reserves `count` distinct loopback ports. All listeners stay bound
/// until every port is collected so the OS cannot hand one out twice.
fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap().port())
        .collect()
}

fn cluster_config(node_id: u32, ports: &[u16]) -> ClusterConfig {
    let peer_servers = ports
        .iter()
        .enumerate()
        .map(|(i, port)| format!("127.0.0.1:{}:{}", port, i + 1))
        .collect();
    ClusterConfig {
        node_id,
        listen_port: ports[(node_id - 1) as usize],
        advertise_host: "127.0.0.1".to_string(),
        peer_servers,
        worker_count: 2,
        inbound_queue: 64,
        retry_limit: -1,
        default_timeout_ms: 2_000,
    }
}

async fn await_controller(node: &Arc<NodeCoordinator>, within: Duration) -> u32 {
    let mut watch = node.controller_watch();
    tokio::time::timeout(within, async {
        loop {
            if let Some(controller) = *watch.borrow() {
                return controller;
            }
            watch.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("node {} never settled on a controller", node.node_id()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_converge_on_highest_id() {
    let ports = free_ports(3);
    let nodes: Vec<Arc<NodeCoordinator>> = (1..=3)
        .map(|id| NodeCoordinator::new(cluster_config(id, &ports)))
        .collect();
    for node in &nodes {
        node.start().await.unwrap();
    }

    for node in &nodes {
        let controller = await_controller(node, Duration::from_secs(15)).await;
        assert_eq!(controller, 3, "node {} settled elsewhere", node.node_id());
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_survive_simultaneous_dial() {
    let ports = free_ports(2);
    let node1 = NodeCoordinator::new(cluster_config(1, &ports));
    let node2 = NodeCoordinator::new(cluster_config(2, &ports));

    // Start both at once so each dials the other before accepting.
    let (a, b) = tokio::join!(node1.start(), node2.start());
    a.unwrap();
    b.unwrap();

    assert_eq!(await_controller(&node1, Duration::from_secs(15)).await, 2);
    assert_eq!(await_controller(&node2, Duration::from_secs(15)).await, 2);

    // The dial race must collapse to a single endpoint per side.
    assert_eq!(node1.connected_peers().await, 1);
    assert_eq!(node2.connected_peers().await, 1);

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_node_adopts_existing_controller() {
    let ports = free_ports(3);
    let nodes: Vec<Arc<NodeCoordinator>> = (1..=3)
        .map(|id| NodeCoordinator::new(cluster_config(id, &ports)))
        .collect();
    for node in &nodes {
        node.start().await.unwrap();
    }
    for node in &nodes {
        assert_eq!(await_controller(node, Duration::from_secs(15)).await, 3);
    }

    // Take node 1 down and bring a fresh instance back on the same port.
    nodes[0].shutdown().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let revived = NodeCoordinator::new(cluster_config(1, &ports));
    revived.start().await.unwrap();

    // The survivors are already converged, so the newcomer must learn
    // the incumbent instead of forcing a fresh election.
    assert_eq!(await_controller(&revived, Duration::from_secs(15)).await, 3);
    assert_eq!(nodes[1].controller(), Some(3));
    assert_eq!(nodes[2].controller(), Some(3));

    revived.shutdown().await;
    nodes[1].shutdown().await;
    nodes[2].shutdown().await;
}
