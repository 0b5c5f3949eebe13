//! Error types for snapshot operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur during backup, restore and remap operations.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// JSON serialization/deserialization error (mapping file).
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// YAML parse error (node configuration).
    #[error(transparent)]
    SerdeYamlError(#[from] serde_yaml::Error),

    /// Remote object store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid or incomplete configuration supplied by the user.
    #[error("configuration error: {0}")]
    Config(String),

    /// `restore prepare` was given node lists of different lengths.
    #[error("the number of source nodes ({sources}) must match the number of destination nodes ({destinations})")]
    NodeCountMismatch { sources: usize, destinations: usize },

    /// The destination node has no entry in the mapping file.
    #[error("could not find node: {0} in mapping file")]
    NodeNotFound(String),

    /// The node configuration already carries an `initial_token`.
    #[error("initial_token has already been set in {0}, aborting")]
    InitialTokenAlreadySet(PathBuf),

    /// `nodetool snapshot` reported that the snapshot id is taken.
    #[error("snapshot already exists for [{0}]")]
    SnapshotExists(String),

    /// An external tool exited unsuccessfully.
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// A local file is not laid out as `<ks>/<table>/snapshots/<id>/...`.
    #[error("path {0} is not inside a snapshot directory")]
    InvalidSnapshotPath(PathBuf),

    /// A remote key does not sit under the expected snapshot folder.
    #[error("remote key {key} is not under {prefix}")]
    InvalidRemoteKey { key: String, prefix: String },

    /// Two local files of one snapshot map to the same remote key.
    #[error("{first:?} and {second:?} both upload to {key}")]
    DuplicateKey {
        key: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// A table found in the backup has no local counterpart.
    #[error(
        "tried to locate [keyspace: {keyspace}] [table: {table}] on local filesystem, \
         but it looks to be missing. check schema to make sure table exists"
    )]
    TableMissing { keyspace: String, table: String },

    /// A unit of work stopped because a sibling failed.
    #[error("transfer cancelled")]
    Cancelled,

    /// A spawned transfer task panicked or was aborted.
    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl SnapshotError {
    /// Whether retrying the same operation may succeed.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            SnapshotError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
