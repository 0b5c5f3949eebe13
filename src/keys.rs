//! Mapping between on-disk snapshot files and remote object keys.
//!
//! Every object lives at `backups/<snapshotID>/<node>/<keyspace>/<table>/<file>`,
//! where `<table>` is the on-disk table directory name including its UUID
//! suffix. The layout is shared with other tools reading the same bucket and
//! must not change.

use crate::error::SnapshotError;
use std::path::{Component, Path, PathBuf};

/// Top-level folder for all snapshot objects.
pub const SNAPSHOT_FOLDER_PREFIX: &str = "backups";

/// Name of the zero-byte object marking a finished upload.
pub const SNAPSHOT_COMPLETED: &str = "SNAPSHOT_COMPLETED";

/// Directory Cassandra keeps snapshots in, under each table directory.
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Returns `backups/<snapshot_id>/<node>`.
pub fn snapshot_prefix(snapshot_id: &str, node: &str) -> String {
    format!("{}/{}/{}", SNAPSHOT_FOLDER_PREFIX, snapshot_id, node)
}

/// Returns `backups/<snapshot_id>/<node>/`, the folder used for listings.
pub fn snapshot_folder(snapshot_id: &str, node: &str) -> String {
    format!("{}/", snapshot_prefix(snapshot_id, node))
}

/// Returns the completion marker key for a prefix.
pub fn marker_key(prefix: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), SNAPSHOT_COMPLETED)
}

/// Derives the remote key for a file inside a snapshot.
///
/// `path` must look like `<data_dir>/<keyspace>/<table>/snapshots/<snapshot_id>/<rest>`.
///
/// # Arguments
///
/// * `snapshot_id` - The snapshot the file belongs to
/// * `data_dir` - The data root the path lives under
/// * `node` - Node address used in the key
/// * `path` - Absolute path of the snapshot file
///
/// # Returns
///
/// The key `backups/<snapshot_id>/<node>/<keyspace>/<table>/<rest>`, or
/// `InvalidSnapshotPath` when the path does not contain `snapshots/<snapshot_id>`.
pub fn remote_key(
    snapshot_id: &str,
    data_dir: &Path,
    node: &str,
    path: &Path,
) -> Result<String, SnapshotError> {
    let invalid = || SnapshotError::InvalidSnapshotPath(path.to_path_buf());

    let relative = path.strip_prefix(data_dir).map_err(|_| invalid())?;
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str().ok_or_else(invalid),
            _ => Err(invalid()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    match parts.as_slice() {
        [keyspace, table, snapshots, id, rest @ ..]
            if *snapshots == SNAPSHOTS_DIR && *id == snapshot_id && !rest.is_empty() =>
        {
            Ok(format!(
                "{}/{}/{}/{}",
                snapshot_prefix(snapshot_id, node),
                keyspace,
                table,
                rest.join("/")
            ))
        }
        _ => Err(invalid()),
    }
}

/// Resolves where a downloaded object should land locally.
///
/// Strips `snapshot_folder` and the `<keyspace>/<table>` segments from `key`
/// and places the remainder under `table_dir`.
pub fn local_destination(
    snapshot_folder: &str,
    key: &str,
    table_dir: &Path,
) -> Result<PathBuf, SnapshotError> {
    let invalid = || SnapshotError::InvalidRemoteKey {
        key: key.to_string(),
        prefix: snapshot_folder.to_string(),
    };

    let relative = key.strip_prefix(snapshot_folder).ok_or_else(invalid)?;
    let segments: Vec<&str> = relative.split('/').collect();
    if segments.len() < 3 {
        return Err(invalid());
    }

    let mut destination = table_dir.to_path_buf();
    for segment in &segments[2..] {
        // Keys come from a remote listing; never let them escape the table dir.
        if segment.is_empty() || *segment == "." || *segment == ".." {
            return Err(invalid());
        }
        destination.push(segment);
    }
    Ok(destination)
}

/// Splits a table directory name into `(name, uuid)` on the first `-`.
pub fn split_table_dir(dir_name: &str) -> (&str, &str) {
    dir_name.split_once('-').unwrap_or((dir_name, ""))
}
