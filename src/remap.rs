//! Stamping a destination node with the token range of its source node.

use crate::error::SnapshotError;
use crate::node_config::NodeConfig;
use crate::ring::resolve;
use crate::types::{ClusterMapping, NodeMapping};
use std::io::Write;
use tracing::info;

/// Appends `initial_token` and `auto_bootstrap: false` to the node configuration.
///
/// Refuses to run when the configuration already declares an
/// `initial_token`, and fails with `NodeNotFound` when `destination` is not
/// in the mapping. Nothing is written in either case.
///
/// # Returns
///
/// The mapping entry that was applied.
pub fn apply<'a>(
    config: &NodeConfig,
    mapping: &'a ClusterMapping,
    destination: &str,
) -> Result<&'a NodeMapping, SnapshotError> {
    if config.initial_token_set {
        return Err(SnapshotError::InitialTokenAlreadySet(config.path.clone()));
    }

    let node = resolve(mapping, destination)
        .ok_or_else(|| SnapshotError::NodeNotFound(destination.to_string()))?;

    let existing = std::fs::read(&config.path)?;
    let mut file = std::fs::OpenOptions::new().append(true).open(&config.path)?;

    let mut lines = String::new();
    if existing.last().is_some_and(|b| *b != b'\n') {
        lines.push('\n');
    }
    lines.push_str(&format!("initial_token: {}\n", node.token_range.join(", ")));
    lines.push_str("auto_bootstrap: false\n");
    file.write_all(lines.as_bytes())?;
    file.sync_all()?;

    info!(
        "configured {} with {} token(s) from {}",
        destination,
        node.token_range.len(),
        node.source
    );
    Ok(node)
}
