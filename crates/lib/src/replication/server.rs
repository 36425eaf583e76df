//! Listener accepting inbound peer connections.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, info_span, warn};

use super::errors::ReplicationError;
use super::session::{self, SessionContext, wait_for_shutdown};
use crate::Result;

pub(crate) async fn bind(address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address).await.map_err(|e| {
        ReplicationError::ServerBind {
            address,
            reason: e.to_string(),
        }
        .into()
    })
}

/// Accept connections until shutdown, spawning one acceptor session each.
pub(crate) async fn run_listener(listener: TcpListener, ctx: SessionContext) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Could not disable Nagle on inbound connection");
                    }
                    info!(peer = %address, "Accepted peer connection");
                    let span = info_span!("session", node = ctx.identifier, role = "acceptor", peer = %address);
                    tokio::spawn(session::run_acceptor(ctx.clone(), stream, address).instrument(span));
                }
                Err(e) => warn!(error = %e, "Failed to accept peer connection"),
            },
        }
    }
    info!("Listener stopped");
}
