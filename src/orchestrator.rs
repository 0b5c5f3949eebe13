//! Command-level orchestration: backup, restore prepare, apply and download.

use crate::error::SnapshotError;
use crate::keys::{snapshot_folder, snapshot_prefix, split_table_dir};
use crate::manifest::build_manifest;
use crate::node_config::NodeConfig;
use crate::nodetool::ClusterTool;
use crate::remap;
use crate::ring::{build_mapping, load_mapping, mapping_filename, resolve, save_mapping};
use crate::store::{ListEntry, ObjectStore};
use crate::transfer::TransferEngine;
use crate::types::{ClusterMapping, KeyspaceSnapshot, NodeMapping, SnapshotTable, TransferSummary};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Keyspaces with this prefix belong to Cassandra itself and are never restored.
const SYSTEM_KEYSPACE_PREFIX: &str = "system";

const PROGRESS_TEMPLATE: &str =
    "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}";

/// Byte-unit progress bar for a transfer run.
pub fn transfer_progress_bar(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new(0);
    match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
        Ok(style) => pb.set_style(style.progress_chars("█▓▒░ ")),
        Err(e) => debug!("invalid progress template: {}", e),
    }
    pb.set_message(message.into());
    pb
}

/// Snapshot id for the current time, e.g. `2024-03-01_141502` (UTC).
pub fn generate_snapshot_id() -> String {
    chrono::Utc::now().format("%Y-%m-%d_%H%M%S").to_string()
}

fn elapsed(started: Instant) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_secs(started.elapsed().as_secs()))
}

/// Parameters of a `backup` run.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    /// Tag to snapshot and upload; generated from the clock when `None`.
    pub snapshot_id: Option<String>,
    /// Restrict the snapshot to these keyspaces; empty means all.
    pub keyspaces: Vec<String>,
    /// Upload even when the completion marker already exists.
    pub force: bool,
}

/// What a `backup` run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub snapshot_id: String,
    pub node: String,
    pub summary: TransferSummary,
    /// The marker was already present, so nothing was uploaded.
    pub already_complete: bool,
}

/// Snapshots this node and uploads the snapshot to the store.
///
/// This is the entry point of the `backup` command:
///
/// 1. Takes the snapshot through `tool` (an existing tag is not an error)
/// 2. Stops early if the node's completion marker already exists
/// 3. Builds the manifest from the node's data directories
/// 4. Uploads it and writes the completion marker
///
/// # Arguments
///
/// * `engine` - Transfer engine bound to the destination store
/// * `node` - Parsed `cassandra.yaml` of this node
/// * `tool` - Snapshot collaborator
/// * `request` - Snapshot id, keyspace filter and force flag
///
/// # Returns
///
/// A [`BackupReport`], or the first error encountered.
pub async fn backup(
    engine: &TransferEngine,
    node: &NodeConfig,
    tool: &dyn ClusterTool,
    request: &BackupRequest,
) -> Result<BackupReport, SnapshotError> {
    let started = Instant::now();
    let snapshot_id = request
        .snapshot_id
        .clone()
        .unwrap_or_else(generate_snapshot_id);
    let address = node.node_address()?;
    info!("🚀 Backing up snapshot {} of node {}", snapshot_id, address);

    match tool.snapshot(&snapshot_id, &request.keyspaces).await {
        Ok(()) => info!("created snapshot {}", snapshot_id),
        Err(SnapshotError::SnapshotExists(id)) => {
            warn!("snapshot already exists for [{}], continuing", id)
        }
        Err(e) => return Err(e),
    }

    let prefix = snapshot_prefix(&snapshot_id, &address);
    if !request.force && engine.store().marker_exists(&prefix).await? {
        info!("✅ {} is already complete, nothing to upload", prefix);
        return Ok(BackupReport {
            snapshot_id,
            node: address,
            summary: TransferSummary::default(),
            already_complete: true,
        });
    }

    let manifest = build_manifest(
        &node.data_file_directories,
        &snapshot_id,
        &address,
        &request.keyspaces,
    )?;
    if manifest.is_empty() {
        warn!("no files found for snapshot {} in {:?}", snapshot_id, node.data_file_directories);
    }

    let summary = engine.upload(&manifest).await?;
    engine.progress().finish_with_message(format!(
        "✅ Uploaded {} files, skipped {}",
        summary.transferred, summary.skipped
    ));
    info!(
        "✅ Backup {} complete: {} bytes in {}",
        prefix,
        summary.bytes,
        elapsed(started)
    );

    Ok(BackupReport {
        snapshot_id,
        node: address,
        summary,
        already_complete: false,
    })
}

/// Captures token ranges for `sources` and writes the mapping file.
///
/// The file is written to `output`, or to `<cluster>-mapping.json` in the
/// working directory.
///
/// # Returns
///
/// The path of the mapping file.
pub async fn restore_prepare(
    tool: &dyn ClusterTool,
    cluster_name: &str,
    sources: &[String],
    destinations: &[String],
    output: Option<&Path>,
) -> Result<PathBuf, SnapshotError> {
    let mapping = build_mapping(tool, cluster_name, sources, destinations).await?;
    let path = output.map_or_else(|| mapping_filename(cluster_name), Path::to_path_buf);
    save_mapping(&mapping, &path)?;
    info!("✅ Wrote mapping for {} node(s) to {}", mapping.nodes.len(), path.display());
    Ok(path)
}

/// Applies the token range mapped to `destination` to this node's configuration.
pub fn restore_apply(
    node: &NodeConfig,
    mapping_path: &Path,
    destination: &str,
) -> Result<NodeMapping, SnapshotError> {
    let mapping = load_mapping(mapping_path)?;
    let applied = remap::apply(node, &mapping, destination)?;
    Ok(applied.clone())
}

/// Lists the keyspaces and tables of a backup and pairs each table with its
/// local directory.
///
/// System keyspaces are ignored. A table with no local counterpart fails
/// the listing, unless `skip_tables` is set, in which case it is dropped
/// with a warning.
pub async fn index_snapshot(
    store: &dyn ObjectStore,
    node: &NodeConfig,
    snapshot_folder: &str,
    skip_tables: bool,
) -> Result<Vec<KeyspaceSnapshot>, SnapshotError> {
    let mut index = Vec::new();

    for keyspace in store.list_folders(snapshot_folder).await? {
        if keyspace.starts_with(SYSTEM_KEYSPACE_PREFIX) {
            debug!("skipping system keyspace {}", keyspace);
            continue;
        }

        let mut tables = Vec::new();
        let keyspace_folder = format!("{}{}/", snapshot_folder, keyspace);
        for table_dir in store.list_folders(&keyspace_folder).await? {
            let (name, source_uuid) = split_table_dir(&table_dir);
            match node.find_table(&keyspace, name)? {
                Some(local) => tables.push(SnapshotTable {
                    name: name.to_string(),
                    source_uuid: source_uuid.to_string(),
                    destination_uuid: local.uuid,
                    destination_path: local.path,
                }),
                None if skip_tables => warn!(
                    "tried to locate [keyspace: {}] [table: {}] on local filesystem, \
                     but it looks to be missing. check schema to make sure table exists. skipping...",
                    keyspace, name
                ),
                None => {
                    return Err(SnapshotError::TableMissing {
                        keyspace,
                        table: name.to_string(),
                    })
                }
            }
        }

        if !tables.is_empty() {
            index.push(KeyspaceSnapshot { keyspace, tables });
        }
    }

    Ok(index)
}

/// Restores the backup of the node mapped to `destination` into this node's
/// data directories.
///
/// Tables are downloaded one after another; the objects of each table are
/// transferred concurrently.
///
/// # Arguments
///
/// * `engine` - Transfer engine bound to the source store
/// * `node` - Parsed `cassandra.yaml` of this node
/// * `mapping` - Mapping produced by `restore prepare`
/// * `destination` - Address of this node in the mapping
/// * `snapshot_id` - Snapshot to restore
/// * `skip_tables` - Drop tables missing locally instead of failing
pub async fn download_snapshot(
    engine: &TransferEngine,
    node: &NodeConfig,
    mapping: &ClusterMapping,
    destination: &str,
    snapshot_id: &str,
    skip_tables: bool,
) -> Result<TransferSummary, SnapshotError> {
    let started = Instant::now();
    let source = resolve(mapping, destination)
        .ok_or_else(|| SnapshotError::NodeNotFound(destination.to_string()))?;
    let store = engine.store();
    let folder = snapshot_folder(snapshot_id, &source.source);

    if !store.marker_exists(&snapshot_prefix(snapshot_id, &source.source)).await? {
        warn!("{} has no completion marker, the backup may be incomplete", folder);
    }

    let index = index_snapshot(&**store, node, &folder, skip_tables).await?;

    let mut work = Vec::new();
    let mut total_size = 0u64;
    for keyspace in &index {
        for table in &keyspace.tables {
            let prefix = format!("{}{}/{}/", folder, keyspace.keyspace, table.source_dir());
            let mut keys = Vec::new();
            for entry in store.list(&prefix, None).await? {
                if let ListEntry::Object { key, size } = entry {
                    total_size += size;
                    keys.push(key);
                }
            }
            work.push((keyspace.keyspace.as_str(), table, keys));
        }
    }
    engine.progress().set_length(total_size);

    let mut summary = TransferSummary::default();
    for (keyspace, table, keys) in work {
        info!("Downloading data to {}/{}", keyspace, table.name);
        let table_summary = engine
            .download(&folder, &keys, &table.destination_path)
            .await?;
        debug!(
            "{}/{}: {} downloaded, {} skipped",
            keyspace, table.name, table_summary.transferred, table_summary.skipped
        );
        summary.merge(table_summary);
    }

    engine.progress().finish_with_message(format!(
        "✅ Downloaded {} files, skipped {}",
        summary.transferred, summary.skipped
    ));
    info!(
        "✅ Restored snapshot {} of {} onto {} in {}",
        snapshot_id,
        source.source,
        destination,
        elapsed(started)
    );
    Ok(summary)
}
