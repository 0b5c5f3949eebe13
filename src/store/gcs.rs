//! Google Cloud Storage backend over the JSON API.
//!
//! Authentication is a bearer token handed in through [`CloudConfig`];
//! obtaining it is left to the caller.

use super::{ListEntry, ObjectMeta, ObjectStore, StoreError};
use crate::throttle::{RateLimiter, Throttled};
use crate::types::CloudConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

pub struct GcsStore {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
    limiter: Option<Arc<RateLimiter>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

impl GcsStore {
    /// Creates a client and checks the bucket is reachable.
    pub async fn connect(
        config: &CloudConfig,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            client: Client::new(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            bucket: config.bucket.clone(),
            token: config.gcs_access_token.clone(),
            limiter,
        };

        let url = store.url(&["storage", "v1", "b", &store.bucket])?;
        let response = store
            .authorized(store.client.get(url))
            .send()
            .await
            .map_err(|e| StoreError::Client(e.to_string()))?;
        if !response.status().is_success() {
            info!("bucket check returned HTTP {}", response.status());
            return Err(StoreError::BucketUnavailable(store.bucket.clone()));
        }
        Ok(store)
    }

    /// Builds a URL from path segments; each segment is percent-encoded,
    /// so object names keep their `/` inside a single segment.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| StoreError::Client(format!("invalid endpoint {}: {}", self.endpoint, e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Client(format!("invalid endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        self.url(&["storage", "v1", "b", &self.bucket, "o", key])
    }

    fn upload_url(&self) -> Result<Url, StoreError> {
        self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn upload(
        &self,
        key: &str,
        body: reqwest::Body,
        length: u64,
    ) -> Result<(), StoreError> {
        let response = self
            .authorized(self.client.post(self.upload_url()?))
            .query(&[("uploadType", "media"), ("name", key)])
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(|e| put_error(key, e))?;
        expect_success(response)
            .await
            .map_err(|message| put_error(key, message))?;
        Ok(())
    }
}

fn put_error(key: &str, message: impl std::fmt::Display) -> StoreError {
    StoreError::Put {
        key: key.to_string(),
        message: message.to_string(),
    }
}

async fn expect_success(response: Response) -> Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("HTTP {}: {}", status, body.trim()))
}

/// GCS reports sizes as decimal strings.
fn parse_size(size: Option<&str>) -> Result<u64, String> {
    let size = size.ok_or_else(|| "object resource has no size".to_string())?;
    size.parse()
        .map_err(|e| format!("invalid object size {:?}: {}", size, e))
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put(&self, local_path: &Path, key: &str) -> Result<(), StoreError> {
        let file = tokio::fs::File::open(local_path).await?;
        let length = file.metadata().await?.len();
        let reader = Throttled::new(file, self.limiter.clone());

        debug!("uploading file [{}] -> [{}]", local_path.display(), key);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        self.upload(key, body, length).await
    }

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let length = body.len() as u64;
        self.upload(key, reqwest::Body::from(body), length).await
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let head_error = |message: String| StoreError::Head {
            key: key.to_string(),
            message,
        };

        let response = self
            .authorized(self.client.get(self.object_url(key)?))
            .send()
            .await
            .map_err(|e| head_error(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resource: ObjectResource = expect_success(response)
            .await
            .map_err(head_error)?
            .json()
            .await
            .map_err(|e| head_error(e.to_string()))?;

        // GCS ETags are not content hashes, so none is reported.
        Ok(Some(ObjectMeta {
            size: parse_size(resource.size.as_deref()).map_err(head_error)?,
            etag: None,
        }))
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>, StoreError> {
        let list_error = |message: String| StoreError::List {
            prefix: prefix.to_string(),
            message,
        };

        let url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", prefix.to_string())];
            if let Some(d) = delimiter {
                query.push(("delimiter", d.to_string()));
            }
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let response = self
                .authorized(self.client.get(url.clone()))
                .query(&query)
                .send()
                .await
                .map_err(|e| list_error(e.to_string()))?;
            let page: ListResponse = expect_success(response)
                .await
                .map_err(list_error)?
                .json()
                .await
                .map_err(|e| list_error(e.to_string()))?;

            entries.extend(page.prefixes.into_iter().map(ListEntry::Prefix));
            for item in page.items {
                let size = parse_size(item.size.as_deref()).map_err(list_error)?;
                entries.push(ListEntry::Object {
                    key: item.name,
                    size,
                });
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(entries),
            }
        }
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<(), StoreError> {
        let get_error = |message: String| StoreError::Get {
            key: key.to_string(),
            message,
        };

        let response = self
            .authorized(self.client.get(self.object_url(key)?))
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| get_error(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let response = expect_success(response).await.map_err(get_error)?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = Throttled::new(Box::pin(StreamReader::new(stream)), self.limiter.clone());
        let mut file = tokio::fs::File::create(destination).await?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| get_error(e.to_string()))?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "gcs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> GcsStore {
        GcsStore {
            client: Client::new(),
            endpoint: endpoint.to_string(),
            bucket: "backups-bucket".to_string(),
            token: None,
            limiter: None,
        }
    }

    #[test]
    fn test_object_url_encodes_key() {
        let url = store(DEFAULT_ENDPOINT)
            .object_url("backups/s1/10.0.0.1/ks/t-1/mc-1-big-Data.db")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/backups-bucket/o/backups%2Fs1%2F10.0.0.1%2Fks%2Ft-1%2Fmc-1-big-Data.db"
        );
    }

    #[test]
    fn test_upload_url_with_custom_endpoint() {
        let url = store("http://localhost:4443").upload_url().unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:4443/upload/storage/v1/b/backups-bucket/o"
        );
    }

    #[test]
    fn test_list_response_parsing() {
        let page: ListResponse = serde_json::from_str(
            r#"{"prefixes": ["backups/s/n/ks1/"], "items": [{"name": "backups/s/n/f", "size": "42"}], "nextPageToken": "abc"}"#,
        )
        .unwrap();
        assert_eq!(page.prefixes, vec!["backups/s/n/ks1/"]);
        assert_eq!(parse_size(page.items[0].size.as_deref()), Ok(42));
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));

        let empty: ListResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty() && empty.next_page_token.is_none());
    }

    #[test]
    fn test_parse_size_rejects_missing_or_garbage() {
        assert!(parse_size(None).is_err());
        assert!(parse_size(Some("")).is_err());
        assert!(parse_size(Some("12kb")).is_err());
        assert_eq!(parse_size(Some("0")), Ok(0));
    }

    /// Answers one request per connection with the next canned response and
    /// returns the request lines it saw.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut request_lines = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let request = String::from_utf8_lossy(&request);
                request_lines.push(request.lines().next().unwrap_or_default().to_string());

                let response = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            request_lines
        });
        (endpoint, handle)
    }

    const FIRST_PAGE: &str = r#"{"prefixes": ["backups/s/n/ks1/"], "items": [{"name": "backups/s/n/a", "size": "1"}], "nextPageToken": "page-2"}"#;

    #[tokio::test]
    async fn test_list_follows_every_page() {
        let second = r#"{"items": [{"name": "backups/s/n/b", "size": "2"}]}"#;
        let (endpoint, server) = serve(vec![(200, FIRST_PAGE), (200, second)]).await;

        let entries = store(&endpoint).list("backups/s/n/", Some("/")).await.unwrap();
        assert_eq!(
            entries,
            vec![
                ListEntry::Prefix("backups/s/n/ks1/".to_string()),
                ListEntry::Object {
                    key: "backups/s/n/a".to_string(),
                    size: 1
                },
                ListEntry::Object {
                    key: "backups/s/n/b".to_string(),
                    size: 2
                },
            ]
        );

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("/storage/v1/b/backups-bucket/o?"));
        assert!(requests[0].contains("delimiter=%2F"));
        assert!(!requests[0].contains("pageToken"));
        assert!(requests[1].contains("pageToken=page-2"));
    }

    #[tokio::test]
    async fn test_failing_page_fails_whole_listing() {
        let (endpoint, server) = serve(vec![(200, FIRST_PAGE), (500, r#"{"error": "backend"}"#)]).await;

        let result = store(&endpoint).list("backups/s/n/", Some("/")).await;
        match result {
            Err(StoreError::List { prefix, message }) => {
                assert_eq!(prefix, "backups/s/n/");
                assert!(message.contains("500"), "{}", message);
            }
            other => panic!("expected a listing error, got {:?}", other),
        }
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_rejects_object_without_size() {
        let page = r#"{"items": [{"name": "backups/s/n/a"}]}"#;
        let (endpoint, _server) = serve(vec![(200, page)]).await;

        let err = store(&endpoint).list("backups/s/n/", None).await.unwrap_err();
        assert!(matches!(err, StoreError::List { .. }));
    }
}
