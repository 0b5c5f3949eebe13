//! Object store abstraction shared by the S3 and GCS backends.
//!
//! The transfer engine only ever talks to [`ObjectStore`], so a backup
//! written through one backend can be listed and restored through another
//! as long as the keys match.

use crate::keys::marker_key;
use crate::throttle::RateLimiter;
use crate::types::{CloudConfig, CloudProvider};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub mod gcs;
#[cfg(test)]
pub(crate) mod memory;
pub mod s3;

pub use gcs::GcsStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket [{0}] not found or you do not have sufficient permissions")]
    BucketUnavailable(String),
    #[error("failed to list objects under {prefix}: {message}")]
    List { prefix: String, message: String },
    #[error("head {key}: {message}")]
    Head { key: String, message: String },
    #[error("error uploading {key}: {message}")]
    Put { key: String, message: String },
    #[error("error downloading {key}: {message}")]
    Get { key: String, message: String },
    #[error("object {0} not found")]
    NotFound(String),
    #[error("client error: {0}")]
    Client(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Network and service failures may succeed on retry; missing objects,
    /// permissions and local I/O do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::List { .. }
                | StoreError::Head { .. }
                | StoreError::Put { .. }
                | StoreError::Get { .. }
        )
    }
}

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    /// A "folder" produced by delimiter grouping, ending in the delimiter.
    Prefix(String),
    /// An actual object.
    Object { key: String, size: u64 },
}

/// Remote object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: Option<String>,
}

/// Capabilities every backend provides.
///
/// Implementations must be safe to share between concurrent transfers.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Streams a local file to `key` without buffering it whole.
    async fn put(&self, local_path: &Path, key: &str) -> Result<(), StoreError>;

    /// Stores a small in-memory body at `key`.
    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Returns object metadata, or `None` if the key does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    /// Lists everything under `prefix`, following every page.
    ///
    /// With a delimiter, keys sharing a segment after `prefix` are folded
    /// into one [`ListEntry::Prefix`]. A failing page fails the whole listing.
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>, StoreError>;

    /// Downloads `key` into `destination`, creating parent directories.
    async fn get(&self, key: &str, destination: &Path) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;

    async fn head_size(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.head(key).await?.map(|meta| meta.size))
    }

    async fn marker_exists(&self, prefix: &str) -> Result<bool, StoreError> {
        Ok(self.head(&marker_key(prefix)).await?.is_some())
    }

    async fn write_marker(&self, prefix: &str) -> Result<(), StoreError> {
        self.put_bytes(&marker_key(prefix), Bytes::new()).await
    }

    /// Names of the "folders" directly under `prefix`, without the trailing `/`.
    async fn list_folders(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.list(prefix, Some("/")).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                ListEntry::Prefix(p) => p
                    .strip_prefix(prefix)
                    .map(|name| name.trim_end_matches('/').to_string())
                    .filter(|name| !name.is_empty()),
                ListEntry::Object { .. } => None,
            })
            .collect())
    }

    /// Every object key under `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.list(prefix, None).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                ListEntry::Object { key, .. } => Some(key),
                ListEntry::Prefix(_) => None,
            })
            .collect())
    }
}

/// Builds the backend selected by `config` and checks the bucket is reachable.
///
/// Every transfer of the run shares the returned store and its rate limiter.
pub async fn connect(config: &CloudConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let limiter = RateLimiter::from_megabits(config.throttle_mbps);
    match config.provider {
        CloudProvider::Aws => Ok(Arc::new(S3Store::connect(config, limiter).await?)),
        CloudProvider::Gcp => Ok(Arc::new(GcsStore::connect(config, limiter).await?)),
    }
}

/// Groups flat keys into a listing, the way a delimiter listing does.
pub(crate) fn fold_listing<I>(prefix: &str, delimiter: Option<&str>, objects: I) -> Vec<ListEntry>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut entries = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    for (key, size) in objects {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        match delimiter.and_then(|d| rest.find(d).map(|idx| (idx, d))) {
            Some((idx, d)) => {
                let folder = format!("{}{}{}", prefix, &rest[..idx], d);
                if seen.insert(folder.clone()) {
                    entries.push(ListEntry::Prefix(folder));
                }
            }
            None => entries.push(ListEntry::Object { key, size }),
        }
    }
    entries
}
