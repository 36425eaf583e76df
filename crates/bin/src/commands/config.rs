//! Config command - prints the configuration a node would start with.

use crate::cli::NodeArgs;
use crate::commands::resolve_config;
use crate::output::OutputFormat;

/// Run the config command
pub fn run(args: &NodeArgs, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&config)?),
        OutputFormat::Human => {
            println!("{}", config.to_json_pretty()?);
            println!();
            println!("Max frame size:    {} bytes", config.max_entry_size());
            println!("Entries per chunk: {}", config.max_entries_per_chunk());
            println!("Read idle timeout: {:?}", config.read_idle_timeout());
        }
    }
    Ok(())
}
