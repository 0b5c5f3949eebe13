//! Amazon S3 backend.

use super::{ListEntry, ObjectMeta, ObjectStore, StoreError};
use crate::throttle::{RateLimiter, Throttled};
use crate::types::CloudConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// S3 allows at most this many parts per multipart upload.
const MAX_UPLOAD_PARTS: i32 = 10_000;

pub struct S3Store {
    client: Client,
    bucket: String,
    part_size: usize,
    limiter: Option<Arc<RateLimiter>>,
}

impl S3Store {
    /// Creates a client from the default credential chain and checks the bucket is reachable.
    pub async fn connect(
        config: &CloudConfig,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self, StoreError> {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        if let Err(e) = client.head_bucket().bucket(&config.bucket).send().await {
            info!("{}", DisplayErrorContext(&e));
            return Err(StoreError::BucketUnavailable(config.bucket.clone()));
        }

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            part_size: config.part_size.max(5 * 1024 * 1024),
            limiter,
        })
    }

    async fn upload_parts<R>(
        &self,
        reader: &mut R,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
    ) -> Result<Vec<CompletedPart>, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut parts = Vec::new();
        let mut chunk = first;
        let mut part_number = 1;

        loop {
            if part_number > MAX_UPLOAD_PARTS {
                return Err(put_error(key, "file exceeds the maximum number of upload parts"));
            }

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| put_error(key, DisplayErrorContext(&e)))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );

            chunk = read_part(reader, self.part_size).await?;
            if chunk.is_empty() {
                return Ok(parts);
            }
            part_number += 1;
        }
    }
}

/// Reads up to `size` bytes; a short result means EOF.
async fn read_part<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

fn put_error(key: &str, message: impl std::fmt::Display) -> StoreError {
    StoreError::Put {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, local_path: &Path, key: &str) -> Result<(), StoreError> {
        let file = tokio::fs::File::open(local_path).await?;
        let mut reader = Throttled::new(file, self.limiter.clone());

        debug!("uploading file [{}] -> [{}]", local_path.display(), key);
        let first = read_part(&mut reader, self.part_size).await?;
        if first.len() < self.part_size {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|e| put_error(key, DisplayErrorContext(&e)))?;
            return Ok(());
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| put_error(key, DisplayErrorContext(&e)))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| put_error(key, "no upload id returned"))?
            .to_string();

        let parts = match self.upload_parts(&mut reader, key, &upload_id, first).await {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("failed to abort upload of {}: {}", key, DisplayErrorContext(&abort));
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| put_error(key, DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| put_error(key, DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(|s| s.trim_matches('"').to_string()),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(StoreError::Head {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>, StoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_string))
            .into_paginator()
            .send();

        let mut entries = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StoreError::List {
                prefix: prefix.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
            for common in page.common_prefixes() {
                if let Some(p) = common.prefix() {
                    entries.push(ListEntry::Prefix(p.to_string()));
                }
            }
            for object in page.contents() {
                if let Some(key) = object.key() {
                    entries.push(ListEntry::Object {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<(), StoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => {
                return Err(StoreError::Get {
                    key: key.to_string(),
                    message: DisplayErrorContext(&e).to_string(),
                })
            }
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut reader = Throttled::new(
            Box::pin(output.body.into_async_read()),
            self.limiter.clone(),
        );
        let mut file = tokio::fs::File::create(destination).await?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StoreError::Get {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}
