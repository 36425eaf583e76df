//! One replication session per peer connection.
//!
//! A session walks `Connecting → Bootstrapping → Streaming` and drops back to
//! `Disconnected` on any I/O or decode failure. While bootstrapping, both
//! sides send their identifier and last-seen vector, then each sends the
//! other every record newer than what the other reported. While streaming,
//! the write half drains this session's outbound queue into chunks and the
//! read half applies inbound chunks through the map, which re-publishes
//! every record that wins to all other sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::errors::ReplicationError;
use super::peer::{ConnectionState, PeerKey, PeerRegistry, PeerRole};
use super::queue::{QueueRegistration, SessionId};
use crate::clock::Clock;
use crate::codec::{self, Bootstrap, ChunkBuilder, Message, io::ReadLimits};
use crate::config::MapConfig;
use crate::constants::{IDENTIFIER_COUNT, PROTOCOL_VERSION};
use crate::map::{ReplicatedMap, WeakMap};
use crate::record::Mutation;
use crate::{Error, Result};

/// Everything a session needs from the replicator that spawned it.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub map: WeakMap,
    pub registry: Arc<PeerRegistry>,
    pub config: Arc<MapConfig>,
    pub clock: Arc<dyn Clock>,
    pub identifier: u8,
    pub shutdown: watch::Receiver<bool>,
}

impl SessionContext {
    fn map(&self) -> Result<ReplicatedMap> {
        self.map
            .upgrade()
            .ok_or_else(|| ReplicationError::MapClosed.into())
    }

    fn read_limits(&self) -> ReadLimits {
        let bootstrap_max = 7 + IDENTIFIER_COUNT * 9;
        ReadLimits {
            max_payload: self.config.max_chunk_payload().max(bootstrap_max),
            entry_size: self.config.entry_size,
        }
    }
}

/// Resolves once shutdown is requested or the replicator is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn is_fatal(err: &Error) -> bool {
    match err {
        Error::Replication(repl_err) => repl_err.is_fatal(),
        other => other.is_closed(),
    }
}

fn log_session_end(err: &Error) {
    if err.is_closed() {
        debug!("Map closed, session ending");
    } else if is_fatal(err) {
        error!(error = %err, "Replication with peer stopped");
    } else {
        warn!(error = %err, "Replication session failed");
    }
}

async fn connect(address: SocketAddr, config: &MapConfig) -> Result<TcpStream> {
    let timeout = config.connect_timeout();
    match time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(ReplicationError::ConnectionFailed {
            address,
            reason: e.to_string(),
        }
        .into()),
        Err(_) => Err(ReplicationError::Timeout {
            phase: "connect",
            address,
            timeout_ms: timeout.as_millis() as u64,
        }
        .into()),
    }
}

/// Spread redials of nodes that lost a peer at the same moment.
fn jittered(backoff: Duration) -> Duration {
    let spread = backoff.as_millis() as u64 / 4;
    if spread == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Dial `address` and keep a session to it alive until shutdown, redialling
/// with exponential backoff after failures.
pub(crate) async fn run_connector(ctx: SessionContext, address: SocketAddr) {
    let key = ctx.registry.register(address, PeerRole::Connector);
    let mut shutdown = ctx.shutdown.clone();
    let initial = ctx.config.reconnect_backoff_initial();
    let max = ctx.config.reconnect_backoff_max();
    let mut backoff = initial;

    loop {
        if *shutdown.borrow() {
            break;
        }
        ctx.registry.update(key, |info| {
            info.state = ConnectionState::Connecting;
            info.connection_attempts += 1;
        });
        trace!("Connecting");

        let attempt = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            attempt = connect(address, &ctx.config) => attempt,
        };
        let connected = attempt.is_ok();
        let outcome = match attempt {
            Ok(stream) => {
                backoff = initial;
                drive(&ctx, key, stream, address).await
            }
            Err(e) => Err(e),
        };
        ctx.registry.set_state(key, ConnectionState::Disconnected);

        match outcome {
            Ok(()) => break,
            Err(e) => {
                ctx.registry
                    .update(key, |info| info.last_error = Some(e.to_string()));
                if connected {
                    log_session_end(&e);
                } else {
                    debug!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Peer unreachable");
                }
                if is_fatal(&e) {
                    break;
                }
            }
        }

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = time::sleep(jittered(backoff)) => {}
        }
        backoff = (backoff * 2).min(max);
    }

    ctx.registry.set_state(key, ConnectionState::Disconnected);
    debug!("Connector stopped");
}

/// Serve a connection a peer opened to us. Inbound sessions do not redial;
/// the remote connector does.
pub(crate) async fn run_acceptor(ctx: SessionContext, stream: TcpStream, address: SocketAddr) {
    let key = ctx.registry.register(address, PeerRole::Acceptor);
    match drive(&ctx, key, stream, address).await {
        Ok(()) => debug!("Inbound session stopped"),
        Err(e) => log_session_end(&e),
    }
    ctx.registry.remove(key);
}

/// Map decode failures on this connection to `MalformedFrame`.
async fn read_message(
    reader: &mut OwnedReadHalf,
    limits: ReadLimits,
    address: SocketAddr,
) -> Result<Option<Message>> {
    codec::io::read_message(reader, limits)
        .await
        .map_err(|err| match err {
            Error::Codec(source) => ReplicationError::MalformedFrame { address, source }.into(),
            other => other,
        })
}

async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    local: &Bootstrap,
    limits: ReadLimits,
    address: SocketAddr,
) -> Result<Bootstrap> {
    codec::io::write_message(writer, &codec::encode_bootstrap(local)).await?;
    match read_message(reader, limits, address).await? {
        Some(Message::Bootstrap(remote)) => Ok(remote),
        Some(Message::Chunk(_)) => Err(ReplicationError::HandshakeFailed(
            "expected bootstrap, received chunk".to_string(),
        )
        .into()),
        None => Err(ReplicationError::ConnectionClosed { address }.into()),
    }
}

/// Run one established connection through bootstrap and streaming.
///
/// Returns `Ok(())` only when shutdown was requested.
async fn drive(
    ctx: &SessionContext,
    key: PeerKey,
    stream: TcpStream,
    address: SocketAddr,
) -> Result<()> {
    ctx.registry.set_state(key, ConnectionState::Bootstrapping);
    let (mut reader, mut writer) = stream.into_split();
    let limits = ctx.read_limits();
    let mut shutdown = ctx.shutdown.clone();

    // Register before reading the vector so nothing written in between is
    // missed; anything caught by both is applied idempotently by the peer.
    let (registration, outbound, local) = {
        let map = ctx.map()?;
        let (registration, outbound) = QueueRegistration::register(Arc::clone(map.queues()));
        let local = Bootstrap {
            protocol_version: PROTOCOL_VERSION,
            identifier: ctx.identifier,
            last_seen: map.last_seen_vector(),
        };
        (registration, outbound, local)
    };

    let timeout = ctx.config.bootstrap_timeout();
    let remote = tokio::select! {
        _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
        exchanged = time::timeout(timeout, handshake(&mut reader, &mut writer, &local, limits, address)) => {
            match exchanged {
                Ok(remote) => remote?,
                Err(_) => {
                    return Err(ReplicationError::Timeout {
                        phase: "bootstrap",
                        address,
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .into());
                }
            }
        }
    };

    if remote.protocol_version != PROTOCOL_VERSION {
        return Err(ReplicationError::ProtocolMismatch {
            expected: PROTOCOL_VERSION,
            received: remote.protocol_version,
        }
        .into());
    }
    if remote.identifier == ctx.identifier {
        return Err(ReplicationError::DuplicateIdentifier {
            address,
            identifier: remote.identifier,
        }
        .into());
    }
    if let Err(holder) = ctx.registry.claim_identifier(key, remote.identifier) {
        return Err(ReplicationError::SharedIdentifier {
            address,
            holder,
            identifier: remote.identifier,
        }
        .into());
    }
    debug!(peer_identifier = remote.identifier, "Bootstrap exchanged");

    let catch_up = ctx.map()?.changes_since(&remote.last_seen)?;
    let session = Session {
        ctx,
        key,
        address,
        origin: registration.id(),
    };
    tokio::try_join!(
        session.read_loop(reader, limits),
        session.write_loop(writer, outbound, catch_up),
    )?;
    drop(registration);
    Ok(())
}

struct Session<'a> {
    ctx: &'a SessionContext,
    key: PeerKey,
    address: SocketAddr,
    origin: SessionId,
}

impl Session<'_> {
    async fn read_loop(&self, mut reader: OwnedReadHalf, limits: ReadLimits) -> Result<()> {
        let mut shutdown = self.ctx.shutdown.clone();
        let idle = self.ctx.config.read_idle_timeout();
        loop {
            let message = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                read = time::timeout(idle, read_message(&mut reader, limits, self.address)) => {
                    match read {
                        Ok(message) => message?,
                        Err(_) => {
                            return Err(ReplicationError::Timeout {
                                phase: "read",
                                address: self.address,
                                timeout_ms: idle.as_millis() as u64,
                            }
                            .into());
                        }
                    }
                }
            };
            match message {
                None => return Err(ReplicationError::ConnectionClosed { address: self.address }.into()),
                Some(Message::Chunk(entries)) if entries.is_empty() => trace!("Heartbeat received"),
                Some(Message::Chunk(entries)) => self.apply(&entries)?,
                Some(Message::Bootstrap(_)) => {
                    return Err(ReplicationError::HandshakeFailed(
                        "bootstrap received while streaming".to_string(),
                    )
                    .into());
                }
            }
        }
    }

    fn apply(&self, entries: &[Mutation]) -> Result<()> {
        let map = self.ctx.map()?;
        let mut applied = 0usize;
        for mutation in entries {
            match map.apply_remote(mutation, Some(self.origin)) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                // The record is lost locally but the connection is healthy.
                Err(e) if e.is_capacity_error() || e.is_retryable() => {
                    warn!(error = %e, key = %hex::encode(&mutation.key), "Dropped inbound entry");
                }
                Err(e) => return Err(e),
            }
        }
        self.ctx
            .registry
            .update(self.key, |info| info.entries_received += entries.len() as u64);
        debug!(received = entries.len(), applied, "Applied chunk");
        Ok(())
    }

    async fn write_loop(
        &self,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Arc<Mutation>>,
        catch_up: Vec<Mutation>,
    ) -> Result<()> {
        let mut shutdown = self.ctx.shutdown.clone();
        let config = &self.ctx.config;
        let max_entries = config.max_entries_per_chunk();
        let max_entry_size = config.max_entry_size();

        let chunks = codec::encode_chunks(&catch_up, max_entries, max_entry_size);
        let timeout = config.bootstrap_timeout();
        let send_catch_up = async {
            for chunk in &chunks {
                codec::io::write_message(&mut writer, chunk).await?;
            }
            Ok::<(), Error>(())
        };
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            sent = time::timeout(timeout, send_catch_up) => match sent {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ReplicationError::Timeout {
                        phase: "catch-up",
                        address: self.address,
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .into());
                }
            },
        }

        let bootstrapped_at = self.ctx.clock.now_rfc3339();
        self.ctx.registry.update(self.key, |info| {
            info.state = ConnectionState::Streaming;
            info.entries_sent += catch_up.len() as u64;
            info.last_bootstrap = Some(bootstrapped_at);
            info.last_error = None;
        });
        info!(catch_up = catch_up.len(), "Streaming");

        let mut heartbeat = time::interval(config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut builder = ChunkBuilder::new(max_entries, max_entry_size);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                next = outbound.recv() => {
                    let Some(first) = next else {
                        return Err(ReplicationError::MapClosed.into());
                    };
                    builder.push(&first)?;
                    while !builder.is_full() {
                        match outbound.try_recv() {
                            Ok(mutation) => builder.push(&mutation)?,
                            Err(_) => break,
                        }
                    }
                    let count = builder.len();
                    codec::io::write_message(&mut writer, &builder.finish()).await?;
                    heartbeat.reset();
                    self.ctx
                        .registry
                        .update(self.key, |info| info.entries_sent += count as u64);
                    trace!(entries = count, "Sent chunk");
                }
                _ = heartbeat.tick() => {
                    codec::io::write_message(&mut writer, &codec::heartbeat()).await?;
                    trace!("Sent heartbeat");
                }
            }
        }
    }
}
