//! Local Cassandra node configuration.
//!
//! `cassandra.yaml` is parsed once into an immutable [`NodeConfig`] that is
//! passed by reference to everything needing the data directories or the
//! node address.

use crate::error::SnapshotError;
use crate::keys::split_table_dir;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directories searched for `cassandra.yaml` and `nodetool`.
pub const SEARCH_PATHS: &[&str] = &[
    "/etc/cassandra",
    "/etc/cassandra/conf",
    "/etc/dse/cassandra",
    "/etc/dse",
    "/usr/local/share/cassandra",
    "/usr/local/share/cassandra/conf",
    "/opt/cassandra",
    "/opt/cassandra/conf",
    "/usr/bin",
    "/usr/sbin",
];

pub const CONFIG_FILENAME: &str = "cassandra.yaml";

/// Returns the first `<search path>/<filename>` that exists.
pub fn find_in_search_paths(filename: &str) -> Option<PathBuf> {
    SEARCH_PATHS
        .iter()
        .map(|dir| Path::new(dir).join(filename))
        .find(|candidate| candidate.is_file())
}

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    data_file_directories: Option<Vec<PathBuf>>,
    #[serde(default)]
    listen_address: Option<String>,
}

/// Key the remap applier appends; its presence alone marks a node as stamped.
const INITIAL_TOKEN_KEY: &str = "initial_token";

/// Settings read from a node's `cassandra.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// File the settings were read from; the remap applier appends to it.
    pub path: PathBuf,
    pub data_file_directories: Vec<PathBuf>,
    pub listen_address: Option<String>,
    /// Whether an `initial_token` key is already present, even null or blank.
    pub initial_token_set: bool,
}

/// A table directory on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTable {
    pub uuid: String,
    pub path: PathBuf,
}

impl NodeConfig {
    /// Parses `path`.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(path, &contents)
    }

    /// Finds `cassandra.yaml` on the search paths and parses it.
    pub fn discover() -> Result<Self, SnapshotError> {
        let path = find_in_search_paths(CONFIG_FILENAME).ok_or_else(|| {
            SnapshotError::Config(format!("{} not found in {:?}", CONFIG_FILENAME, SEARCH_PATHS))
        })?;
        debug!("using node configuration {}", path.display());
        Self::load(&path)
    }

    pub fn parse(path: &Path, contents: &str) -> Result<Self, SnapshotError> {
        // An empty document deserializes to unit, not a mapping.
        let document: serde_yaml::Value = if contents.trim().is_empty() {
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        } else {
            serde_yaml::from_str(contents)?
        };

        // A second `initial_token` key would make the file unreadable, so a
        // bare `initial_token:` counts as set too.
        let initial_token_set = document.get(INITIAL_TOKEN_KEY).is_some();
        let raw: RawConfig = serde_yaml::from_value(document)?;

        Ok(Self {
            path: path.to_path_buf(),
            data_file_directories: raw.data_file_directories.unwrap_or_default(),
            listen_address: raw
                .listen_address
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            initial_token_set,
        })
    }

    /// The node address used in remote keys.
    ///
    /// Falls back to the first non-loopback IPv4 address when
    /// `listen_address` is not configured.
    pub fn node_address(&self) -> Result<String, SnapshotError> {
        if let Some(address) = &self.listen_address {
            return Ok(address.clone());
        }
        let local = local_ipv4().ok_or_else(|| {
            SnapshotError::Config("could not find a local ip".to_string())
        })?;
        warn!(
            "could not find a listen_address in {}, falling back to using {}",
            self.path.display(),
            local
        );
        Ok(local)
    }

    /// Locates the live directory of `keyspace.table` on this node.
    ///
    /// A table that was dropped and recreated leaves several `<table>-<uuid>`
    /// directories behind; the most recently modified one is the live table.
    pub fn find_table(&self, keyspace: &str, table: &str) -> Result<Option<LocalTable>, SnapshotError> {
        let mut best: Option<(std::time::SystemTime, LocalTable)> = None;

        for data_dir in &self.data_file_directories {
            let keyspace_dir = data_dir.join(keyspace);
            if !keyspace_dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&keyspace_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let dir_name = entry.file_name();
                let Some(dir_name) = dir_name.to_str() else {
                    continue;
                };
                let (name, uuid) = split_table_dir(dir_name);
                if name != table {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                if best.as_ref().map_or(true, |(m, _)| modified > *m) {
                    best = Some((
                        modified,
                        LocalTable {
                            uuid: uuid.to_string(),
                            path: entry.path(),
                        },
                    ));
                }
            }
        }

        Ok(best.map(|(_, table)| table))
    }
}

/// First non-loopback IPv4 address of this host.
fn local_ipv4() -> Option<String> {
    if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip.to_string()),
            _ => None,
        })
}
