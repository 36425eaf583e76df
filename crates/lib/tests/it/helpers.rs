use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use meshmap::{Clock, FixedClock, MapBuilder, MapConfig, ReplicatedMap};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Default deadline for replication to settle in tests.
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

// ==========================
// MAP FACTORIES
// ==========================

/// Small standalone map on a heap-sized layout and a deterministic clock.
pub fn local_map(identifier: u8) -> ReplicatedMap {
    local_builder(identifier)
        .build_local()
        .expect("Failed to build local map")
}

pub fn local_builder(identifier: u8) -> MapBuilder {
    ReplicatedMap::builder()
        .identifier(identifier)
        .entries(256)
        .segments(8)
        .entry_size(64)
        .clock(Arc::new(FixedClock::default()))
}

/// An unused loopback address. The port is released before returning, so a
/// later bind can in rare cases race with another process.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind ephemeral port");
    listener.local_addr().expect("Failed to read ephemeral port")
}

/// Builder for a networked test node with short timeouts.
pub fn node_builder(identifier: u8, clock: Arc<dyn Clock>) -> MapBuilder {
    ReplicatedMap::builder()
        .identifier(identifier)
        .entries(1000)
        .segments(16)
        .entry_size(64)
        .connect_timeout(Duration::from_millis(500))
        .bootstrap_timeout(Duration::from_secs(2))
        .heartbeat_interval(Duration::from_millis(100))
        .reconnect_backoff(Duration::from_millis(10), Duration::from_millis(200))
        .clock(clock)
}

/// Open `count` nodes, identifiers `1..=count`, each listening on its own
/// port and dialling every other node.
pub async fn open_mesh(count: u8, clock: Arc<FixedClock>) -> Vec<ReplicatedMap> {
    let addrs: Vec<SocketAddr> = (0..count).map(|_| free_addr()).collect();
    let mut nodes = Vec::new();
    for (i, &listen) in addrs.iter().enumerate() {
        let peers = addrs.iter().copied().filter(|addr| *addr != listen);
        let node = node_builder(i as u8 + 1, clock.clone())
            .listen(listen)
            .peers(peers)
            .open()
            .await
            .expect("Failed to open mesh node");
        nodes.push(node);
    }
    nodes
}

pub async fn close_all(maps: &[ReplicatedMap]) {
    for map in maps {
        map.close().await.expect("Failed to close map");
    }
}

// ==========================
// POLLING AND ASSERTIONS
// ==========================

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Live contents of a map in key order.
pub fn contents(map: &ReplicatedMap) -> BTreeMap<Vec<u8>, Vec<u8>> {
    map.entries().expect("Failed to read entries").into_iter().collect()
}

pub fn converged(maps: &[ReplicatedMap]) -> bool {
    let first = contents(&maps[0]);
    maps[1..].iter().all(|map| contents(map) == first)
}

/// Wait until every map holds exactly `expected`.
pub async fn wait_for_contents(maps: &[ReplicatedMap], expected: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let reached = wait_until(CONVERGENCE_TIMEOUT, || {
        maps.iter().all(|map| &contents(map) == expected)
    })
    .await;
    if !reached {
        for map in maps {
            eprintln!("node {}: {:?}", map.identifier(), contents(map));
        }
        panic!("maps did not converge to {expected:?}");
    }
}

/// Wait until `map` has at least `count` streaming sessions.
pub async fn wait_streaming(map: &ReplicatedMap, count: usize) {
    let reached = wait_until(CONVERGENCE_TIMEOUT, || {
        map.peers().iter().filter(|p| p.is_streaming()).count() >= count
    })
    .await;
    assert!(
        reached,
        "node {} never reached {count} streaming sessions: {:?}",
        map.identifier(),
        map.peers()
    );
}

pub fn expected(pairs: &[(&[u8], &[u8])]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect()
}

pub fn default_config() -> MapConfig {
    MapConfig::default()
}

// ==========================
// SEVERABLE PROXY
// ==========================

/// TCP relay in front of a node. Severing it kills every relayed
/// connection and refuses new ones until restored.
pub struct Proxy {
    addr: SocketAddr,
    blocked: Arc<AtomicBool>,
    relays: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl Proxy {
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind proxy");
        let addr = listener.local_addr().expect("Failed to read proxy address");
        let blocked = Arc::new(AtomicBool::new(false));
        let relays: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept = {
            let blocked = Arc::clone(&blocked);
            let relays = Arc::clone(&relays);
            tokio::spawn(async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    if blocked.load(Ordering::SeqCst) {
                        drop(inbound);
                        continue;
                    }
                    let relay = tokio::spawn(async move {
                        if let Ok(mut outbound) = TcpStream::connect(target).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                        }
                    });
                    relays.lock().push(relay);
                }
            })
        };

        Self {
            addr,
            blocked,
            relays,
            accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn sever(&self) {
        self.blocked.store(true, Ordering::SeqCst);
        for relay in self.relays.lock().drain(..) {
            relay.abort();
        }
    }

    pub fn restore(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.sever();
        self.accept.abort();
    }
}
