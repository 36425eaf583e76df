//! Serve command - runs a replicating node until a termination signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use meshmap::MapBuilder;
use signal_hook::flag as signal_flag;

use crate::cli::ServeArgs;
use crate::commands::resolve_config;
use crate::output::{OutputFormat, print_peers};

/// Run the node
pub async fn run(args: &ServeArgs, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args.node)?;
    let mut builder = MapBuilder::from_config(config);
    if let Some(path) = &args.arena {
        builder = builder.arena_file(path);
    }
    let map = builder.open().await?;

    let term_signal = Arc::new(AtomicBool::new(false));
    for signal in signal_hook::consts::TERM_SIGNALS {
        signal_flag::register(*signal, Arc::clone(&term_signal))?;
    }

    if format == OutputFormat::Human {
        println!("meshmap node {} started", map.identifier());
        match map.local_addr() {
            Some(addr) => println!("Listening on {addr}"),
            None => println!("Not accepting connections (no listen address)"),
        }
        for peer in &map.config().peers {
            println!("Dialling {peer}");
        }
        println!();
        println!("Press Ctrl+C to shutdown");
    }

    let reporting = args.status_interval > 0;
    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    status.tick().await;

    let mut poll = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if term_signal.load(Ordering::Relaxed) {
                    tracing::info!("Shutdown signal received, closing map...");
                    break;
                }
            }
            _ = status.tick(), if reporting => {
                tracing::info!(
                    entries = map.len()?,
                    tombstones = map.tombstones()?,
                    "Node status"
                );
                print_peers(&map.peers(), format)?;
            }
        }
    }

    map.close().await?;
    if format == OutputFormat::Human {
        println!("Node shut down");
    }
    Ok(())
}
