//! Multi-node replication over loopback TCP.
//!
//! Nodes in one test share a [`FixedClock`] so that the order in which the
//! test issues writes is also their last-writer-wins order.

use std::sync::Arc;
use std::time::Duration;

use meshmap::replication::PeerRole;
use meshmap::{ConnectionState, FixedClock, PeerInfo, ReplicatedMap, TypedMap};

use crate::helpers::{
    CONVERGENCE_TIMEOUT, Proxy, close_all, contents, converged, expected, free_addr, node_builder,
    open_mesh, wait_for_contents, wait_streaming, wait_until,
};

fn typed(map: &ReplicatedMap) -> TypedMap<i32, String> {
    TypedMap::new(map.clone())
}

/// Peers whose last session ended over an identifier conflict.
fn rejected(peers: &[PeerInfo]) -> usize {
    peers
        .iter()
        .filter(|p| p.last_error.as_deref().is_some_and(|e| e.contains("identifier")))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_node_mesh_converges() {
    let clock = Arc::new(FixedClock::default());
    let nodes = open_mesh(4, clock).await;
    for node in &nodes {
        wait_streaming(node, 3).await;
    }
    let [node1, node2, node3, node4] = [&nodes[0], &nodes[1], &nodes[2], &nodes[3]].map(typed);

    node1.put(&1, &"EXAMPLE-1".to_string()).unwrap();
    node2.put(&2, &"EXAMPLE-2".to_string()).unwrap();
    node3.put(&3, &"EXAMPLE-1".to_string()).unwrap();
    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || node3.contains_key(&2).unwrap()).await,
        "node3 never received key 2"
    );
    assert!(node3.remove(&2).unwrap());
    node3.put(&3, &"EXAMPLE-5".to_string()).unwrap();
    node4.put(&4, &"EXAMPLE-5".to_string()).unwrap();

    wait_for_contents(
        &nodes,
        &expected(&[
            (&1i32.to_be_bytes(), b"EXAMPLE-1"),
            (&3i32.to_be_bytes(), b"EXAMPLE-5"),
            (&4i32.to_be_bytes(), b"EXAMPLE-5"),
        ]),
    )
    .await;

    for node in [&node1, &node2, &node3, &node4] {
        let all = node.to_btree().unwrap();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(all[&3], "EXAMPLE-5");
        assert_eq!(node.get(&2).unwrap(), None);
    }
    assert!(!node2.is_empty().unwrap());

    // The delete of key 2 is held as a tombstone everywhere.
    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || {
            nodes.iter().all(|node| node.tombstones().unwrap() == 1)
        })
        .await
    );

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_joiner_catches_up_from_bootstrap() {
    let clock = Arc::new(FixedClock::default());
    let first_addr = free_addr();
    let first = node_builder(1, clock.clone())
        .listen(first_addr)
        .open()
        .await
        .unwrap();
    for i in 0..50 {
        first.put(format!("key-{i}"), format!("value-{i}")).unwrap();
    }
    first.remove(b"key-7").unwrap();

    let second = node_builder(2, clock).peer(first_addr).open().await.unwrap();
    wait_for_contents(&[second.clone()], &contents(&first)).await;
    assert_eq!(second.len().unwrap(), 49);
    assert!(second.version_of(b"key-7").unwrap().is_some());

    // Writes after bootstrap stream in both directions.
    second.put(b"from-second", b"x").unwrap();
    first.put(b"from-first", b"y").unwrap();
    let nodes = [first, second];
    assert!(wait_until(CONVERGENCE_TIMEOUT, || converged(&nodes)).await);
    assert_eq!(nodes[0].len().unwrap(), 51);

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_catch_up_spans_many_chunks() {
    let clock = Arc::new(FixedClock::default());
    let source_addr = free_addr();
    // 200 bytes fits two 82-byte frames per chunk.
    let source = node_builder(1, clock.clone())
        .chunk_byte_budget(200)
        .listen(source_addr)
        .open()
        .await
        .unwrap();
    for i in 0..300 {
        source.put(format!("bulk-{i:03}"), format!("payload-{i}")).unwrap();
    }

    let sink = node_builder(2, clock)
        .chunk_byte_budget(200)
        .peer(source_addr)
        .open()
        .await
        .unwrap();
    wait_for_contents(&[sink.clone()], &contents(&source)).await;
    assert_eq!(sink.len().unwrap(), 300);

    let sent: u64 = source.peers().iter().map(|p| p.entries_sent).sum();
    assert!(sent >= 300, "source reported {sent} entries sent");

    close_all(&[source, sink]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_records_are_relayed_through_intermediate_node() {
    // a -> hub <- c; a and c never connect to each other.
    let clock = Arc::new(FixedClock::default());
    let hub_addr = free_addr();
    let hub = node_builder(2, clock.clone())
        .listen(hub_addr)
        .open()
        .await
        .unwrap();
    let a = node_builder(1, clock.clone()).peer(hub_addr).open().await.unwrap();
    let c = node_builder(3, clock).peer(hub_addr).open().await.unwrap();
    wait_streaming(&hub, 2).await;
    wait_streaming(&a, 1).await;
    wait_streaming(&c, 1).await;

    a.put(b"from-a", b"1").unwrap();
    c.put(b"from-c", b"3").unwrap();
    let nodes = [a, hub, c];
    wait_for_contents(&nodes, &expected(&[(b"from-a", b"1"), (b"from-c", b"3")])).await;

    nodes[2].remove(b"from-a").unwrap();
    wait_for_contents(&nodes, &expected(&[(b"from-c", b"3")])).await;

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tombstone_beats_older_value() {
    let clock = Arc::new(FixedClock::default());
    let nodes = open_mesh(2, clock).await;
    wait_streaming(&nodes[0], 1).await;
    wait_streaming(&nodes[1], 1).await;

    nodes[0].put(b"k", b"v1").unwrap();
    wait_for_contents(&nodes, &expected(&[(b"k", b"v1")])).await;

    nodes[1].remove(b"k").unwrap();
    wait_for_contents(&nodes, &expected(&[])).await;
    let version = nodes[1].version_of(b"k").unwrap();
    assert!(wait_until(CONVERGENCE_TIMEOUT, || nodes[0].version_of(b"k").unwrap() == version).await);

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_recovers_writes_made_while_partitioned() {
    let clock = Arc::new(FixedClock::default());
    let b_addr = free_addr();
    let b = node_builder(2, clock.clone()).listen(b_addr).open().await.unwrap();
    let proxy = Proxy::start(b_addr).await;
    let a = node_builder(1, clock).peer(proxy.addr()).open().await.unwrap();
    wait_streaming(&a, 1).await;
    wait_streaming(&b, 1).await;

    a.put(b"1", b"a1").unwrap();
    b.put(b"2", b"b2").unwrap();
    let nodes = [a, b];
    wait_for_contents(&nodes, &expected(&[(b"1", b"a1"), (b"2", b"b2")])).await;

    proxy.sever();
    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || nodes[0].peers().iter().all(|p| !p.is_streaming())).await,
        "a never noticed the partition"
    );

    // Both sides keep accepting writes, including to the same key.
    nodes[0].put(b"3", b"a3").unwrap();
    nodes[0].remove(b"1").unwrap();
    nodes[0].put(b"2", b"a2-new").unwrap();
    nodes[1].put(b"4", b"b4").unwrap();
    nodes[1].put(b"2", b"b2-newest").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(nodes[1].get(b"3").unwrap(), None);

    proxy.restore();
    wait_for_contents(
        &nodes,
        &expected(&[(b"2", b"b2-newest"), (b"3", b"a3"), (b"4", b"b4")]),
    )
    .await;

    let peer = nodes[0].peers()[0].clone();
    assert!(peer.connection_attempts > 1);
    assert_eq!(peer.identifier, Some(2));
    assert!(peer.last_bootstrap.is_some());

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_identifier_stops_the_connector() {
    let clock = Arc::new(FixedClock::default());
    let addr = free_addr();
    let listener = node_builder(5, clock.clone()).listen(addr).open().await.unwrap();
    let twin = node_builder(5, clock).peer(addr).open().await.unwrap();

    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || {
            twin.peers()
                .first()
                .is_some_and(|p| p.last_error.is_some() && p.state == ConnectionState::Disconnected)
        })
        .await
    );
    // Backoff tops out at 200ms; a retrying connector would dial again.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let peer = twin.peers()[0].clone();
    assert_eq!(peer.connection_attempts, 1);
    assert_eq!(peer.state, ConnectionState::Disconnected);
    assert!(peer.last_error.unwrap().contains("identifier"));

    close_all(&[listener, twin]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_peers_sharing_an_identifier_are_rejected() {
    let clock = Arc::new(FixedClock::default());
    let b_addr = free_addr();
    let c_addr = free_addr();
    let b = node_builder(2, clock.clone()).listen(b_addr).open().await.unwrap();
    let c = node_builder(2, clock.clone()).listen(c_addr).open().await.unwrap();
    let a = node_builder(1, clock)
        .peer(b_addr)
        .peer(c_addr)
        .open()
        .await
        .unwrap();

    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || {
            let peers = a.peers();
            rejected(&peers) == 1 && peers.iter().any(|p| p.is_streaming())
        })
        .await,
        "expected one accepted and one rejected peer: {:?}",
        a.peers()
    );

    // Backoff tops out at 200ms; a retrying connector would dial again.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let peers = a.peers();
    assert_eq!(rejected(&peers), 1);
    let refused = peers.iter().find(|p| p.last_error.is_some()).unwrap();
    assert_eq!(refused.connection_attempts, 1);
    assert_eq!(refused.state, ConnectionState::Disconnected);
    assert_eq!(refused.identifier, None);
    let accepted = peers.iter().find(|p| p.is_streaming()).unwrap();
    assert_eq!(accepted.identifier, Some(2));
    assert_ne!(accepted.address, refused.address);

    close_all(&[a, b, c]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_cut_during_catch_up_recovers_everything() {
    let clock = Arc::new(FixedClock::default());
    let source_addr = free_addr();
    // One frame per chunk so the catch-up takes many writes.
    let source = node_builder(1, clock.clone())
        .entries(4096)
        .chunk_byte_budget(100)
        .listen(source_addr)
        .open()
        .await
        .unwrap();
    for i in 0..2_000 {
        source.put(format!("bulk-{i:04}"), format!("payload-{i}")).unwrap();
    }

    let proxy = Proxy::start(source_addr).await;
    let sink = node_builder(2, clock)
        .entries(4096)
        .chunk_byte_budget(100)
        .peer(proxy.addr())
        .open()
        .await
        .unwrap();

    assert!(wait_until(CONVERGENCE_TIMEOUT, || sink.len().unwrap() > 0).await);
    proxy.sever();
    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || sink.peers().iter().all(|p| !p.is_streaming())).await,
        "sink never noticed the cut"
    );

    source.put(b"after-cut", b"late").unwrap();
    source.remove(b"bulk-0000").unwrap();

    proxy.restore();
    let nodes = [source, sink];
    wait_for_contents(&nodes, &contents(&nodes[0])).await;
    assert_eq!(nodes[1].len().unwrap(), 2_000);
    assert!(nodes[1].peers()[0].connection_attempts > 1);

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_sessions_stay_up_on_heartbeats() {
    let clock = Arc::new(FixedClock::default());
    let nodes = open_mesh(2, clock).await;
    wait_streaming(&nodes[0], 1).await;
    wait_streaming(&nodes[1], 1).await;

    // Several read-idle timeouts with no data written.
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    for node in &nodes {
        let peers = node.peers();
        assert!(peers.iter().any(|p| p.is_streaming()));
        for connector in peers.iter().filter(|p| p.role == PeerRole::Connector) {
            assert_eq!(connector.connection_attempts, 1, "{connector:?}");
        }
    }

    close_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_node_stops_replicating() {
    let clock = Arc::new(FixedClock::default());
    let nodes = open_mesh(2, clock).await;
    wait_streaming(&nodes[0], 1).await;
    wait_streaming(&nodes[1], 1).await;

    nodes[1].close().await.unwrap();
    assert!(nodes[1].peers().is_empty());
    assert!(nodes[1].get(b"k").unwrap_err().is_closed());

    // The survivor keeps working locally while its peer is gone.
    nodes[0].put(b"k", b"v").unwrap();
    assert_eq!(nodes[0].get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || nodes[0].peers().iter().all(|p| !p.is_streaming())).await
    );

    nodes[0].close().await.unwrap();
}
