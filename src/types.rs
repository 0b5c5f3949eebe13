//! Data structures shared across backup and restore.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Cloud provider hosting the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CloudProvider {
    /// Amazon S3 or any S3-compatible endpoint.
    Aws,
    /// Google Cloud Storage.
    Gcp,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "AWS"),
            CloudProvider::Gcp => write!(f, "GCP"),
        }
    }
}

/// Configuration for talking to the remote store.
///
/// # Example
///
/// ```
/// use cassnap::{CloudConfig, CloudProvider};
///
/// let config = CloudConfig {
///     provider: CloudProvider::Aws,
///     region: "us-east-1".to_string(),
///     bucket: "cassandra-backups".to_string(),
///     throttle_mbps: 0, // unlimited
///     ..CloudConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub provider: CloudProvider,
    pub region: String,
    pub bucket: String,
    /// Custom endpoint (S3-compatible services, local emulators).
    pub endpoint: Option<String>,
    /// Aggregate bandwidth cap in megabits per second, `0` = unlimited.
    pub throttle_mbps: u64,
    /// Maximum number of objects transferred at once (default: 8).
    ///
    /// Every transfer shares one rate limiter, so raising this does not
    /// raise total bandwidth past `throttle_mbps`.
    pub max_concurrent_transfers: usize,
    /// Attempts per object after the first failure on transient errors.
    pub retry_attempts: usize,
    pub retry_interval_ms: u64,
    /// Size of each multipart chunk for uploads.
    pub part_size: usize,
    /// Compare MD5 against single-part ETags before skipping existing files.
    pub verify_checksums: bool,
    /// OAuth2 bearer token for the GCS JSON API.
    pub gcs_access_token: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: CloudProvider::Aws,
            region: "us-east-1".to_string(),
            bucket: String::new(),
            endpoint: None,
            throttle_mbps: 200,
            max_concurrent_transfers: 8,
            retry_attempts: 3,
            retry_interval_ms: 5_000,
            part_size: 64 * 1024 * 1024,
            verify_checksums: false,
            gcs_access_token: None,
        }
    }
}

/// Source to destination pairing for one node, as stored in the mapping file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeMapping {
    pub source: String,
    pub destination: String,
    /// Tokens owned by the source node, in ring order.
    pub token_range: Vec<String>,
}

/// Mapping file produced by `restore prepare`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterMapping {
    pub cluster_name: String,
    #[serde(default)]
    pub nodes: Vec<NodeMapping>,
}

/// A table present in a backup together with its local counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTable {
    pub name: String,
    /// UUID suffix of the table directory in the backup.
    pub source_uuid: String,
    /// UUID suffix of the table directory on this node.
    pub destination_uuid: String,
    pub destination_path: PathBuf,
}

impl SnapshotTable {
    /// Table directory name as it appears in remote keys.
    pub fn source_dir(&self) -> String {
        if self.source_uuid.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, self.source_uuid)
        }
    }
}

/// Tables of one keyspace to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceSnapshot {
    pub keyspace: String,
    pub tables: Vec<SnapshotTable>,
}

/// What happened to a single object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Already present with a matching size.
    Skipped,
    Transferred,
}

/// Totals for a batch of transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub transferred: usize,
    pub skipped: usize,
    pub bytes: u64,
}

impl TransferSummary {
    pub(crate) fn record(&mut self, outcome: TransferOutcome, bytes: u64) {
        match outcome {
            TransferOutcome::Skipped => self.skipped += 1,
            TransferOutcome::Transferred => {
                self.transferred += 1;
                self.bytes += bytes;
            }
        }
    }

    pub(crate) fn merge(&mut self, other: TransferSummary) {
        self.transferred += other.transferred;
        self.skipped += other.skipped;
        self.bytes += other.bytes;
    }
}
