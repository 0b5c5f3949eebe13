//! Concurrent upload and download of snapshot objects.
//!
//! Each object is an independent unit of work. Units run concurrently up
//! to `max_concurrent`, and the first unit to fail cancels the rest; the
//! engine then returns that error. A batch never reports partial success.

use crate::error::SnapshotError;
use crate::keys::local_destination;
use crate::manifest::SnapshotManifest;
use crate::store::{ObjectMeta, ObjectStore, StoreError};
use crate::types::{CloudConfig, TransferOutcome, TransferSummary};
use crate::verify::local_file_matches;
use indicatif::ProgressBar;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Suffix of files still being downloaded.
const PARTIAL_SUFFIX: &str = ".part";

/// Knobs for a transfer run.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub max_concurrent: usize,
    /// Extra attempts per object on transient store errors.
    pub retry_attempts: usize,
    pub retry_interval: Duration,
    pub verify_checksums: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions::from(&CloudConfig::default())
    }
}

impl From<&CloudConfig> for TransferOptions {
    fn from(config: &CloudConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_transfers.max(1),
            retry_attempts: config.retry_attempts,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            verify_checksums: config.verify_checksums,
        }
    }
}

/// Moves manifests up to, and table listings down from, an [`ObjectStore`].
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    options: TransferOptions,
    progress: ProgressBar,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn ObjectStore>, options: TransferOptions) -> Self {
        Self {
            store,
            options,
            progress: ProgressBar::hidden(),
        }
    }

    /// Reports transferred bytes to `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn progress(&self) -> &ProgressBar {
        &self.progress
    }

    /// Uploads every file of `manifest`, then writes the completion marker.
    ///
    /// All files are stat-ed before anything is sent; a file that vanished
    /// since the manifest was built fails the run. Objects already present
    /// remotely with the same size are skipped. The marker is only written
    /// once every file succeeded.
    pub async fn upload(&self, manifest: &SnapshotManifest) -> Result<TransferSummary, SnapshotError> {
        let mut jobs = Vec::with_capacity(manifest.len());
        let mut total_size = 0u64;
        for (path, key) in manifest.iter() {
            let size = tokio::fs::metadata(path).await?.len();
            total_size += size;
            jobs.push((path.to_path_buf(), key.to_string(), size));
        }
        self.progress.set_length(total_size);
        info!("uploading {} files ({} bytes) to {}", jobs.len(), total_size, self.store.name());

        let store = self.store.clone();
        let options = self.options.clone();
        let summary = self
            .run_all(jobs, move |(path, key, size), cancel| {
                upload_one(store.clone(), options.clone(), path, key, size, cancel)
            })
            .await?;

        self.store.write_marker(&manifest.prefix()).await?;
        debug!("wrote completion marker under {}", manifest.prefix());
        Ok(summary)
    }

    /// Downloads `keys` from under `snapshot_folder` into `table_dir`.
    ///
    /// Each key loses its `<snapshot_folder><keyspace>/<table>/` prefix and
    /// the rest is placed under `table_dir`. Existing files whose size
    /// matches the remote object are kept.
    pub async fn download(
        &self,
        snapshot_folder: &str,
        keys: &[String],
        table_dir: &Path,
    ) -> Result<TransferSummary, SnapshotError> {
        let jobs = keys
            .iter()
            .map(|key| Ok((key.clone(), local_destination(snapshot_folder, key, table_dir)?)))
            .collect::<Result<Vec<_>, SnapshotError>>()?;

        let store = self.store.clone();
        let options = self.options.clone();
        self.run_all(jobs, move |(key, destination), cancel| {
            download_one(store.clone(), options.clone(), key, destination, cancel)
        })
        .await
    }

    /// Runs `unit` for every item with bounded concurrency and waits for all
    /// of them. The first failure cancels the remaining units.
    async fn run_all<T, F, Fut>(&self, items: Vec<T>, unit: F) -> Result<TransferSummary, SnapshotError>
    where
        T: Send + 'static,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(TransferOutcome, u64), SnapshotError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent.max(1)));
        let cancel = CancellationToken::new();
        let unit = Arc::new(unit);
        let mut tasks = JoinSet::new();

        for item in items {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let unit = Arc::clone(&unit);
            let progress = self.progress.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|e| SnapshotError::TaskFailed(e.to_string()))?
                    }
                    _ = cancel.cancelled() => return Err(SnapshotError::Cancelled),
                };
                if cancel.is_cancelled() {
                    return Err(SnapshotError::Cancelled);
                }

                let result = (*unit)(item, cancel.clone()).await;
                match &result {
                    Ok((_, bytes)) => progress.inc(*bytes),
                    Err(SnapshotError::Cancelled) => {}
                    Err(_) => cancel.cancel(),
                }
                result
            });
        }

        let mut summary = TransferSummary::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(SnapshotError::TaskFailed(e.to_string())));
            match result {
                Ok((outcome, bytes)) => summary.record(outcome, bytes),
                Err(SnapshotError::Cancelled) => {}
                Err(e) => {
                    cancel.cancel();
                    if first_error.is_none() {
                        error!("Transfer failed: {}", e);
                        first_error = Some(e);
                    } else {
                        debug!("additional transfer failure: {}", e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Retries `op` on transient errors with a fixed interval.
async fn with_retry<T, F, Fut>(options: &TransferOptions, what: &str, mut op: F) -> Result<T, SnapshotError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SnapshotError>>,
{
    let interval = options.retry_interval.as_millis() as u64;
    let strategy = FixedInterval::from_millis(interval).take(options.retry_attempts);

    Retry::spawn(strategy, || {
        let attempt = op();
        async move {
            match attempt.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() => {
                    warn!("Failed to transfer {} due to error: {}", what, e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        }
    })
    .await
}

/// Races `op` against cancellation of the batch.
async fn unless_cancelled<T>(
    cancel: &CancellationToken,
    op: impl Future<Output = Result<T, SnapshotError>>,
) -> Result<T, SnapshotError> {
    tokio::select! {
        result = op => result,
        _ = cancel.cancelled() => Err(SnapshotError::Cancelled),
    }
}

/// Looks up `key` with the same retry and cancellation as a transfer.
async fn head_with_retry(
    store: &Arc<dyn ObjectStore>,
    options: &TransferOptions,
    key: &str,
    cancel: &CancellationToken,
) -> Result<Option<ObjectMeta>, SnapshotError> {
    let head = with_retry(options, key, || {
        let store = Arc::clone(store);
        let key = key.to_string();
        async move { store.head(&key).await.map_err(SnapshotError::from) }
    });
    unless_cancelled(cancel, head).await
}

async fn upload_one(
    store: Arc<dyn ObjectStore>,
    options: TransferOptions,
    path: PathBuf,
    key: String,
    size: u64,
    cancel: CancellationToken,
) -> Result<(TransferOutcome, u64), SnapshotError> {
    if let Some(remote) = head_with_retry(&store, &options, &key, &cancel).await? {
        if remote.size == size {
            debug!("already uploaded, skipping: {}", key);
            return Ok((TransferOutcome::Skipped, size));
        }
    }

    let put = with_retry(&options, &key, || {
        let store = Arc::clone(&store);
        let path = path.clone();
        let key = key.clone();
        async move { store.put(&path, &key).await.map_err(SnapshotError::from) }
    });
    unless_cancelled(&cancel, put).await?;

    debug!("uploaded [{}] -> [{}]", path.display(), key);
    Ok((TransferOutcome::Transferred, size))
}

/// `<destination>.part`, where an object is written before being renamed into place.
fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

async fn download_one(
    store: Arc<dyn ObjectStore>,
    options: TransferOptions,
    key: String,
    destination: PathBuf,
    cancel: CancellationToken,
) -> Result<(TransferOutcome, u64), SnapshotError> {
    if let Ok(local) = tokio::fs::metadata(&destination).await {
        if local.is_file() {
            let remote = head_with_retry(&store, &options, &key, &cancel)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if local_file_matches(&destination, local.len(), &remote, options.verify_checksums).await? {
                debug!("file was already downloaded, skipping: {}", destination.display());
                return Ok((TransferOutcome::Skipped, local.len()));
            }
        }
    }

    let partial = partial_path(&destination);
    let fetch = with_retry(&options, &key, || {
        let store = Arc::clone(&store);
        let key = key.clone();
        let partial = partial.clone();
        async move { store.get(&key, &partial).await.map_err(SnapshotError::from) }
    });

    let result = match unless_cancelled(&cancel, fetch).await {
        Ok(()) => tokio::fs::rename(&partial, &destination)
            .await
            .map_err(SnapshotError::from),
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        match tokio::fs::remove_file(&partial).await {
            Err(rm) if rm.kind() != std::io::ErrorKind::NotFound => {
                warn!("could not remove partial file {}: {}", partial.display(), rm);
            }
            _ => {}
        }
        return Err(e);
    }

    let size = tokio::fs::metadata(&destination).await?.len();
    debug!("Downloaded file: {}", destination.display());
    Ok((TransferOutcome::Transferred, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::snapshot_folder;
    use crate::manifest::build_manifest;
    use crate::manifest::tests::write_snapshot_file;
    use crate::store::memory::MemoryStore;

    fn engine(store: Arc<MemoryStore>) -> TransferEngine {
        let options = TransferOptions {
            max_concurrent: 4,
            retry_attempts: 0,
            retry_interval: Duration::from_millis(1),
            verify_checksums: false,
        };
        TransferEngine::new(store, options)
    }

    #[tokio::test]
    async fn test_upload_writes_objects_then_marker() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_snapshot_file(&data, "ks1", "t1-uuid1", "s1", "mc-1-big-Data.db", 100);
        let manifest = build_manifest(&[data], "s1", "10.0.0.1", &[]).unwrap();

        let store = Arc::new(MemoryStore::new());
        assert!(!store.marker_exists(&manifest.prefix()).await.unwrap());

        let summary = engine(store.clone()).upload(&manifest).await.unwrap();
        assert_eq!(
            summary,
            TransferSummary {
                transferred: 1,
                skipped: 0,
                bytes: 100
            }
        );
        assert_eq!(
            store.object("backups/s1/10.0.0.1/ks1/t1-uuid1/mc-1-big-Data.db"),
            Some(vec![b'x'; 100])
        );
        assert!(store.marker_exists("backups/s1/10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_skips_objects_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_snapshot_file(&data, "ks1", "t1-a", "s1", "f1", 10);
        write_snapshot_file(&data, "ks1", "t1-a", "s1", "f2", 20);
        let manifest = build_manifest(&[data], "s1", "n", &[]).unwrap();

        let store = Arc::new(MemoryStore::new());
        store.insert("backups/s1/n/ks1/t1-a/f1", vec![b'x'; 10]);
        store.insert("backups/s1/n/ks1/t1-a/f2", vec![b'y'; 5]);

        let summary = engine(store.clone()).upload(&manifest).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.transferred, 1);
        assert_eq!(store.puts(), 1);
        assert_eq!(store.object("backups/s1/n/ks1/t1-a/f2"), Some(vec![b'x'; 20]));
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        for i in 0..8 {
            write_snapshot_file(&data, "ks1", "t1-a", "s1", &format!("f{}", i), 10);
        }
        let manifest = build_manifest(&[data], "s1", "n", &[]).unwrap();

        let store = Arc::new(MemoryStore::new());
        store.fail_on("backups/s1/n/ks1/t1-a/f3");

        let err = engine(store.clone()).upload(&manifest).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Store(StoreError::Client(_))));
        assert!(!store.marker_exists("backups/s1/n").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_fails_when_file_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_snapshot_file(&data, "ks1", "t1-a", "s1", "f1", 10);
        let gone = write_snapshot_file(&data, "ks1", "t1-a", "s1", "f2", 10);
        let manifest = build_manifest(&[data], "s1", "n", &[]).unwrap();
        std::fs::remove_file(gone).unwrap();

        let store = Arc::new(MemoryStore::new());
        let err = engine(store.clone()).upload(&manifest).await.unwrap_err();
        assert!(matches!(err, SnapshotError::IoError(_)));
        assert_eq!(store.puts(), 0);
        assert!(!store.marker_exists("backups/s1/n").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_into_table_dir() {
        let store = Arc::new(MemoryStore::new());
        store.insert("backups/s1/n1/ks1/t1-src/mc-1-big-Data.db", vec![1; 30]);
        store.insert("backups/s1/n1/ks1/t1-src/.idx/mc-1-big-Index.db", vec![2; 5]);

        let dir = tempfile::tempdir().unwrap();
        let table_dir = dir.path().join("ks1/t1-dst");
        let folder = snapshot_folder("s1", "n1");
        let keys = store.list_keys("backups/s1/n1/ks1/t1-src/").await.unwrap();

        let summary = engine(store.clone()).download(&folder, &keys, &table_dir).await.unwrap();
        assert_eq!(summary.transferred, 2);
        assert_eq!(summary.bytes, 35);
        assert_eq!(std::fs::read(table_dir.join("mc-1-big-Data.db")).unwrap(), vec![1; 30]);
        assert_eq!(std::fs::read(table_dir.join(".idx/mc-1-big-Index.db")).unwrap(), vec![2; 5]);
        assert!(!table_dir.join("mc-1-big-Data.db.part").exists());
    }

    #[tokio::test]
    async fn test_download_skips_matching_size_and_refetches_mismatch() {
        let store = Arc::new(MemoryStore::new());
        store.insert("backups/s1/n1/ks1/t-a/same", vec![9; 10]);
        store.insert("backups/s1/n1/ks1/t-a/differs", vec![9; 10]);

        let dir = tempfile::tempdir().unwrap();
        let table_dir = dir.path().join("ks1/t-b");
        std::fs::create_dir_all(&table_dir).unwrap();
        std::fs::write(table_dir.join("same"), vec![0; 10]).unwrap();
        std::fs::write(table_dir.join("differs"), vec![0; 3]).unwrap();

        let keys = vec![
            "backups/s1/n1/ks1/t-a/same".to_string(),
            "backups/s1/n1/ks1/t-a/differs".to_string(),
        ];
        let summary = engine(store.clone())
            .download(&snapshot_folder("s1", "n1"), &keys, &table_dir)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.transferred, 1);
        assert_eq!(store.gets(), 1);
        // size matched, so the local copy was left untouched
        assert_eq!(std::fs::read(table_dir.join("same")).unwrap(), vec![0; 10]);
        assert_eq!(std::fs::read(table_dir.join("differs")).unwrap(), vec![9; 10]);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let store = Arc::new(MemoryStore::new());
        store.insert("backups/s1/n1/ks1/t-a/bad", vec![1; 10]);
        store.fail_on("backups/s1/n1/ks1/t-a/bad");

        let dir = tempfile::tempdir().unwrap();
        let table_dir = dir.path().join("ks1/t-b");
        let keys = vec!["backups/s1/n1/ks1/t-a/bad".to_string()];

        let err = engine(store)
            .download(&snapshot_folder("s1", "n1"), &keys, &table_dir)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Store(_)));
        assert!(!table_dir.join("bad").exists());
        assert!(!table_dir.join("bad.part").exists());
    }

    #[tokio::test]
    async fn test_download_rejects_foreign_keys() {
        let store = Arc::new(MemoryStore::new());
        let keys = vec!["backups/s2/n1/ks1/t-a/f".to_string()];
        let err = engine(store)
            .download(&snapshot_folder("s1", "n1"), &keys, Path::new("/tmp/unused"))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidRemoteKey { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_units_do_not_mask_the_error() {
        let store = Arc::new(MemoryStore::new());
        let mut keys = Vec::new();
        for i in 0..20 {
            let key = format!("backups/s1/n1/ks1/t-a/f{}", i);
            store.insert(&key, vec![0; 4]);
            keys.push(key);
        }
        store.fail_on("backups/s1/n1/ks1/t-a/f0");

        let dir = tempfile::tempdir().unwrap();
        let err = engine(store)
            .download(&snapshot_folder("s1", "n1"), &keys, dir.path())
            .await
            .unwrap_err();
        assert!(!matches!(err, SnapshotError::Cancelled));
    }

    #[tokio::test]
    async fn test_transient_head_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_snapshot_file(&data, "ks1", "t1-a", "s1", "f1", 10);
        let manifest = build_manifest(&[data], "s1", "n", &[]).unwrap();
        let key = "backups/s1/n/ks1/t1-a/f1";

        let store = Arc::new(MemoryStore::new());
        store.fail_head_times(key, 2);
        let options = TransferOptions {
            max_concurrent: 1,
            retry_attempts: 2,
            retry_interval: Duration::from_millis(1),
            verify_checksums: false,
        };
        let summary = TransferEngine::new(store.clone(), options)
            .upload(&manifest)
            .await
            .unwrap();
        assert_eq!(summary.transferred, 1);
        assert!(store.object(key).is_some());

        // without retries the same failure ends the run
        let table_dir = dir.path().join("restore");
        std::fs::create_dir_all(&table_dir).unwrap();
        std::fs::write(table_dir.join("f1"), vec![0; 10]).unwrap();
        store.fail_head_times(key, 1);
        let err = engine(store)
            .download(&snapshot_folder("s1", "n"), &[key.to_string()], &table_dir)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Store(StoreError::Head { .. })));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/data/ks/t/mc-1-big-Data.db")),
            PathBuf::from("/data/ks/t/mc-1-big-Data.db.part")
        );
    }
}
