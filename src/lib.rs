//! Cassnap - Cassandra snapshot backup to S3/GCS and token range remapping
//!
//! This library uploads a node's snapshot files to an object store, restores
//! them onto another node, and carries each source node's token ranges over
//! to its replacement so the new cluster owns data exactly as the old one did.
//!
//! # Features
//!
//! - **Stable key layout**: `backups/<snapshot>/<node>/<keyspace>/<table>/<file>`
//! - **Completion marker**: a snapshot counts as uploaded only once `SNAPSHOT_COMPLETED` exists
//! - **Resumable transfers**: objects already present with the same size are skipped
//! - **Shared bandwidth cap**: one token bucket throttles every concurrent transfer
//! - **Fail fast**: the first failed object cancels the rest of the batch
//! - **Automatic retry**: transient store errors are retried at a fixed interval
//!
//! # Example
//!
//! ```no_run
//! use cassnap::{backup, connect, BackupRequest, CloudConfig, Nodetool, NodeConfig, TransferEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CloudConfig {
//!     bucket: "cassandra-backups".to_string(),
//!     ..CloudConfig::default()
//! };
//! let store = connect(&config).await?;
//! let engine = TransferEngine::new(store, (&config).into());
//! let node = NodeConfig::discover()?;
//! let nodetool = Nodetool::discover()?;
//!
//! backup(&engine, &node, &nodetool, &BackupRequest::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod keys;
pub mod manifest;
pub mod node_config;
pub mod nodetool;
pub mod orchestrator;
pub mod remap;
pub mod ring;
pub mod store;
pub mod throttle;
pub mod transfer;
pub mod types;
mod verify;

pub use error::SnapshotError;
pub use manifest::{build_manifest, SnapshotManifest};
pub use node_config::NodeConfig;
pub use nodetool::{ClusterTool, Nodetool};
pub use orchestrator::{
    backup, download_snapshot, generate_snapshot_id, restore_apply, restore_prepare,
    transfer_progress_bar, BackupReport, BackupRequest,
};
pub use store::{connect, ObjectStore, StoreError};
pub use transfer::{TransferEngine, TransferOptions};
pub use types::{
    CloudConfig, CloudProvider, ClusterMapping, KeyspaceSnapshot, NodeMapping, SnapshotTable,
    TransferSummary,
};
