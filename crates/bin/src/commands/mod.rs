//! Subcommand implementations.

pub mod config;
pub mod serve;

use meshmap::MapConfig;

use crate::cli::NodeArgs;

/// Build the node configuration: the file named by `--config` if any,
/// otherwise the defaults, with explicit flags applied on top.
pub fn resolve_config(args: &NodeArgs) -> meshmap::Result<MapConfig> {
    let mut config = match &args.config {
        Some(path) => MapConfig::from_json_file(path)?,
        None => MapConfig::default(),
    };
    if let Some(identifier) = args.identifier {
        config.identifier = identifier;
    }
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }
    if !args.peers.is_empty() {
        config.peers = args.peers.clone();
    }
    if let Some(entries) = args.entries {
        config.entries = entries;
    }
    if let Some(entry_size) = args.entry_size {
        config.entry_size = entry_size;
    }
    if let Some(segments) = args.segments {
        config.segments = segments;
    }
    config.validate()?;
    Ok(config)
}
