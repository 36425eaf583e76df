//! Peer-to-peer replication over TCP.
//!
//! Every node listens for peers and dials every peer in its configuration,
//! so a pair of nodes that both list each other holds two sessions. That is
//! harmless: records are applied idempotently under last-writer-wins.
//!
//! The [`Replicator`] owns the listener, one connector task per configured
//! peer and a maintenance task. All of them stop when it is shut down or
//! dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::Result;
use crate::map::{ReplicatedMap, WeakMap};

pub mod errors;
pub mod peer;
pub mod queue;
mod server;
mod session;

pub use errors::ReplicationError;
pub use peer::{ConnectionState, PeerInfo, PeerRegistry, PeerRole};
pub use queue::{OutboundQueues, SessionId};
use session::{SessionContext, wait_for_shutdown};

/// Shortest pause between tombstone purges.
const MIN_PURGE_INTERVAL: Duration = Duration::from_millis(100);

/// Background networking for one map.
#[derive(Debug)]
pub struct Replicator {
    shutdown: watch::Sender<bool>,
    registry: Arc<PeerRegistry>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Replicator {
    /// Bind the listener (if configured) and start dialling peers.
    pub(crate) async fn start(map: &ReplicatedMap) -> Result<Self> {
        let config = Arc::new(map.config().clone());
        let identifier = map.identifier();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(PeerRegistry::new());
        let ctx = SessionContext {
            map: map.downgrade(),
            registry: Arc::clone(&registry),
            config: Arc::clone(&config),
            clock: Arc::clone(map.clock().clock()),
            identifier,
            shutdown: shutdown_rx,
        };

        let mut tasks = Vec::new();
        let local_addr = match config.listen {
            Some(address) => {
                let listener = server::bind(address).await?;
                let local = listener.local_addr()?;
                info!(node = identifier, address = %local, "Listening for peers");
                let span = info_span!("listener", node = identifier, address = %local);
                tasks.push(tokio::spawn(
                    server::run_listener(listener, ctx.clone()).instrument(span),
                ));
                Some(local)
            }
            None => None,
        };

        for &peer in &config.peers {
            let span = info_span!("session", node = identifier, role = "connector", peer = %peer);
            tasks.push(tokio::spawn(
                session::run_connector(ctx.clone(), peer).instrument(span),
            ));
        }

        let every = config.tombstone_grace().max(MIN_PURGE_INTERVAL);
        tasks.push(tokio::spawn(
            run_maintenance(map.downgrade(), every, ctx.shutdown.clone())
                .instrument(info_span!("maintenance", node = identifier)),
        ));

        Ok(Self {
            shutdown,
            registry,
            local_addr,
            tasks,
        })
    }

    /// Address the listener is bound to, with any ephemeral port resolved.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.registry.snapshot()
    }

    /// Signal every task to stop and wait for the listener, connectors and
    /// maintenance task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Replication task ended abnormally");
            }
        }
        debug!("Replicator stopped");
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Reclaim expired tombstones on a timer.
async fn run_maintenance(map: WeakMap, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tick.tick() => {
                let Some(map) = map.upgrade() else { break };
                match map.purge_tombstones() {
                    Ok(0) => {}
                    Ok(reclaimed) => debug!(reclaimed, "Purged expired tombstones"),
                    Err(e) if e.is_closed() => break,
                    Err(e) => warn!(error = %e, "Tombstone purge failed"),
                }
            }
        }
    }
}
