//! Output formatting helpers for human-readable and JSON output.

use meshmap::PeerInfo;

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Human }
    }
}

/// Render rows under `headers` with left-aligned, two-space separated
/// columns. Cells beyond the header count are dropped.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = format_line(headers.iter().copied(), &widths);
    for row in rows {
        out.push('\n');
        out.push_str(&format_line(row.iter().map(String::as_str), &widths));
    }
    out
}

fn format_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

/// Print peer status as a table, or nothing when there are no peers.
pub fn print_peers(peers: &[PeerInfo], format: OutputFormat) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(peers)?),
        OutputFormat::Human if peers.is_empty() => {}
        OutputFormat::Human => {
            let rows: Vec<Vec<String>> = peers
                .iter()
                .map(|peer| {
                    vec![
                        peer.address.to_string(),
                        format!("{:?}", peer.role).to_lowercase(),
                        peer.identifier.map_or("-".to_string(), |id| id.to_string()),
                        peer.state.to_string(),
                        peer.connection_attempts.to_string(),
                        peer.entries_sent.to_string(),
                        peer.entries_received.to_string(),
                        peer.last_error.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            println!(
                "{}",
                render_table(
                    &["PEER", "ROLE", "ID", "STATE", "ATTEMPTS", "SENT", "RECEIVED", "LAST ERROR"],
                    &rows,
                )
            );
        }
    }
    Ok(())
}
