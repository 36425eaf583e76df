//! CLI argument definitions for the meshmap binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Replicated fixed-capacity key-value node
#[derive(Parser, Debug)]
#[command(name = "meshmap")]
#[command(about = "meshmap: a memory-mapped key-value map replicated across a TCP mesh")]
#[command(version)]
pub struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a replicating node until interrupted
    Serve(ServeArgs),
    /// Print the effective configuration after applying flags
    Config(NodeArgs),
}

/// Node settings shared by every command that builds a configuration.
///
/// Flags override values read from `--config`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// JSON configuration file
    #[arg(short, long, env = "MESHMAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node identifier, unique within the mesh
    #[arg(short, long, env = "MESHMAP_IDENTIFIER")]
    pub identifier: Option<u8>,

    /// Address to accept replication connections on
    #[arg(short, long, env = "MESHMAP_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Peer to dial; repeat for each peer
    #[arg(short, long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Fixed capacity in entries
    #[arg(long)]
    pub entries: Option<usize>,

    /// Maximum key plus value size in bytes
    #[arg(long)]
    pub entry_size: Option<usize>,

    /// Number of lock segments
    #[arg(long)]
    pub segments: Option<usize>,
}

/// Arguments for the serve command
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Map the arena onto this file instead of anonymous memory
    #[arg(short = 'A', long, env = "MESHMAP_ARENA")]
    pub arena: Option<PathBuf>,

    /// Seconds between peer status reports; 0 disables them
    #[arg(long, default_value_t = 30)]
    pub status_interval: u64,
}
