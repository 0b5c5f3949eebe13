//! In-memory store for exercising the engine without a network.

use super::{fold_listing, ListEntry, ObjectMeta, ObjectStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    flaky_heads: Mutex<HashMap<String, usize>>,
    puts: AtomicUsize,
    gets: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, key: &str, body: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), body);
    }

    pub(crate) fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Makes every put or get of `key` fail with a non-transient error.
    pub(crate) fn fail_on(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    /// Makes the next `times` heads of `key` fail with a transient error.
    pub(crate) fn fail_head_times(&self, key: &str, times: usize) {
        self.flaky_heads.lock().unwrap().insert(key.to_string(), times);
    }

    pub(crate) fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub(crate) fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.failing.lock().unwrap().contains(key) {
            return Err(StoreError::Client(format!("injected failure for {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, local_path: &Path, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        let body = tokio::fs::read(local_path).await?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert(key, body);
        Ok(())
    }

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.check(key)?;
        self.insert(key, body.to_vec());
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        if let Some(remaining) = self.flaky_heads.lock().unwrap().get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Head {
                    key: key.to_string(),
                    message: "injected transient failure".to_string(),
                });
            }
        }
        Ok(self.object(key).map(|body| ObjectMeta {
            size: body.len() as u64,
            etag: None,
        }))
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>, StoreError> {
        let objects: Vec<(String, u64)> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.len() as u64))
            .collect();
        Ok(fold_listing(prefix, delimiter, objects))
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<(), StoreError> {
        self.check(key)?;
        let body = self
            .object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.gets.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(destination, body).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
