//! Building the local path to remote key manifest for a snapshot.

use crate::error::SnapshotError;
use crate::keys::{remote_key, snapshot_prefix, SNAPSHOTS_DIR};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Files of one node's snapshot and the keys they upload to.
///
/// Built once per backup run and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotManifest {
    snapshot_id: String,
    node: String,
    entries: BTreeMap<PathBuf, String>,
}

impl SnapshotManifest {
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// `backups/<snapshot_id>/<node>`, the prefix of every key and of the completion marker.
    pub fn prefix(&self) -> String {
        snapshot_prefix(&self.snapshot_id, &self.node)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// Entries ordered by local path.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.entries.iter().map(|(p, k)| (p.as_path(), k.as_str()))
    }
}

/// Lists the sub-directories of `dir`, sorted by name.
fn subdirectories(dir: &Path) -> Result<Vec<(String, PathBuf)>, SnapshotError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| SnapshotError::InvalidSnapshotPath(entry.path()))?;
        dirs.push((name, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

/// Collects every file of snapshot `snapshot_id` under `data_dirs`.
///
/// Walks `<data_dir>/<keyspace>/<table>/snapshots/<snapshot_id>/` for each
/// keyspace and table. Tables without that directory had no data when the
/// snapshot was taken and are skipped. Any directory that cannot be read,
/// or whose name is not UTF-8, fails the whole build, as does a file whose
/// key is already taken by a file in another data directory.
///
/// # Arguments
///
/// * `data_dirs` - Cassandra `data_file_directories`
/// * `snapshot_id` - Snapshot tag
/// * `node` - Node address used in the remote keys
/// * `keyspaces` - Restrict to these keyspaces; empty means all
pub fn build_manifest(
    data_dirs: &[PathBuf],
    snapshot_id: &str,
    node: &str,
    keyspaces: &[String],
) -> Result<SnapshotManifest, SnapshotError> {
    let mut entries = BTreeMap::new();
    let mut owners: HashMap<String, PathBuf> = HashMap::new();

    for data_dir in data_dirs {
        for (keyspace, keyspace_dir) in subdirectories(data_dir)? {
            if !keyspaces.is_empty() && !keyspaces.contains(&keyspace) {
                continue;
            }

            for (table, table_dir) in subdirectories(&keyspace_dir)? {
                let snapshot_dir = table_dir.join(SNAPSHOTS_DIR).join(snapshot_id);
                if !snapshot_dir.is_dir() {
                    continue;
                }
                debug!("collecting {}/{} from {}", keyspace, table, snapshot_dir.display());

                for entry in WalkDir::new(&snapshot_dir).sort_by_file_name() {
                    let entry = entry.map_err(|e| {
                        SnapshotError::IoError(e.into_io_error().unwrap_or_else(|| {
                            std::io::Error::other("filesystem loop in snapshot directory")
                        }))
                    })?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let key = remote_key(snapshot_id, data_dir, node, entry.path())?;
                    if let Some(first) = owners.get(&key) {
                        return Err(SnapshotError::DuplicateKey {
                            key,
                            first: first.clone(),
                            second: entry.into_path(),
                        });
                    }
                    owners.insert(key.clone(), entry.path().to_path_buf());
                    entries.insert(entry.into_path(), key);
                }
            }
        }
    }

    Ok(SnapshotManifest {
        snapshot_id: snapshot_id.to_string(),
        node: node.to_string(),
        entries,
    })
}
