//! Token range capture and the source to destination node mapping.

use crate::error::SnapshotError;
use crate::nodetool::ClusterTool;
use crate::types::{ClusterMapping, NodeMapping};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extracts the tokens owned by `address` from `nodetool ring` output.
///
/// Every row whose address column equals `address` contributes its last
/// column. Tokens keep the order the ring lists them in.
pub fn parse_ring_tokens(ring_output: &str, address: &str) -> Vec<String> {
    ring_output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some(first) if first == address => fields.last(),
                _ => None,
            }
        })
        .flat_map(|token| token.split(','))
        .map(|token| token.chars().filter(|c| !c.is_whitespace() && !c.is_control()).collect::<String>())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Captures the token range currently owned by `source`.
pub async fn capture(tool: &dyn ClusterTool, source: &str) -> Result<Vec<String>, SnapshotError> {
    let output = tool.ring().await?;
    let tokens = parse_ring_tokens(&output, source);
    if tokens.is_empty() {
        return Err(SnapshotError::Tool {
            tool: "nodetool ring".to_string(),
            message: format!("no tokens found for node {}", source),
        });
    }
    debug!("captured {} token(s) for {}", tokens.len(), source);
    Ok(tokens)
}

/// Pairs `sources[i]` with `destinations[i]` and captures each source's tokens.
///
/// # Arguments
///
/// * `tool` - Ring inspection collaborator
/// * `cluster_name` - Name recorded in the mapping
/// * `sources` - Source node addresses
/// * `destinations` - Destination node addresses, positionally paired
///
/// # Returns
///
/// The mapping, or `NodeCountMismatch` when the lists differ in length and
/// `Config` when an address is repeated.
pub async fn build_mapping(
    tool: &dyn ClusterTool,
    cluster_name: &str,
    sources: &[String],
    destinations: &[String],
) -> Result<ClusterMapping, SnapshotError> {
    if sources.len() != destinations.len() {
        return Err(SnapshotError::NodeCountMismatch {
            sources: sources.len(),
            destinations: destinations.len(),
        });
    }
    for (role, nodes) in [("source", sources), ("destination", destinations)] {
        let mut seen = HashSet::new();
        if let Some(dup) = nodes.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(SnapshotError::Config(format!(
                "{} node {} listed more than once",
                role, dup
            )));
        }
    }

    let mut nodes = Vec::with_capacity(sources.len());
    for (source, destination) in sources.iter().zip(destinations) {
        let token_range = capture(tool, source).await?;
        info!("mapped {} -> {} ({} tokens)", source, destination, token_range.len());
        nodes.push(NodeMapping {
            source: source.clone(),
            destination: destination.clone(),
            token_range,
        });
    }

    Ok(ClusterMapping {
        cluster_name: cluster_name.to_string(),
        nodes,
    })
}

/// Finds the entry for `destination`; the first match wins.
pub fn resolve<'a>(mapping: &'a ClusterMapping, destination: &str) -> Option<&'a NodeMapping> {
    mapping.nodes.iter().find(|node| node.destination == destination)
}

/// Default mapping file name for a cluster.
pub fn mapping_filename(cluster_name: &str) -> PathBuf {
    PathBuf::from(format!("{}-mapping.json", cluster_name))
}

pub fn load_mapping(path: &Path) -> Result<ClusterMapping, SnapshotError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn save_mapping(mapping: &ClusterMapping, path: &Path) -> Result<(), SnapshotError> {
    let json = serde_json::to_string_pretty(mapping)?;
    std::fs::write(path, json)?;
    Ok(())
}
