//! File verification utilities (MD5 checksums and size checks).

use crate::error::SnapshotError;
use crate::store::ObjectMeta;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Computes the MD5 hash of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
///
/// # Arguments
///
/// * `path` - Path to the file
///
/// # Returns
///
/// The MD5 hash as a hexadecimal string, or an error.
pub(crate) async fn compute_file_md5(path: &Path) -> Result<String, SnapshotError> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use md5::{Digest, Md5};
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok::<String, SnapshotError>(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| SnapshotError::TaskFailed(e.to_string()))?
}

/// Decides whether an existing local file already matches the remote object.
///
/// Sizes must match. With `verify_checksums`, a single-part ETag (plain MD5,
/// no `-`) must also match the local MD5; multipart ETags cannot be checked
/// and fall back to the size comparison.
///
/// # Returns
///
/// `Ok(true)` if the file can be kept, `Ok(false)` if it must be fetched again.
pub(crate) async fn local_file_matches(
    path: &Path,
    local_size: u64,
    remote: &ObjectMeta,
    verify_checksums: bool,
) -> Result<bool, SnapshotError> {
    if local_size != remote.size {
        debug!(
            "Size mismatch for {}: local={} bytes, remote={} bytes",
            path.display(),
            local_size,
            remote.size
        );
        return Ok(false);
    }

    if !verify_checksums {
        return Ok(true);
    }

    match remote.etag.as_deref() {
        Some(etag) if !etag.contains('-') => {
            let local = compute_file_md5(path).await?;
            if local.eq_ignore_ascii_case(etag) {
                Ok(true)
            } else {
                warn!(
                    "MD5 mismatch for {}: local={}, remote={}",
                    path.display(),
                    local,
                    etag
                );
                Ok(false)
            }
        }
        _ => Ok(true),
    }
}
