use std::path::Path;
use std::time::Duration;

use rusoto_core::credential::StaticProvider;
use rusoto_core::request::TlsError;
use rusoto_core::{HttpClient, Region, RusotoError};
use rusoto_credential::AwsCredentials;
use rusoto_s3::util::{PreSignedRequest, PreSignedRequestOption};
use rusoto_s3::{
    GetObjectError, GetObjectRequest, HeadObjectRequest, ListObjectsV2Error,
    ListObjectsV2Request, PutObjectError, PutObjectRequest, S3Client, StreamingBody, S3,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::config::StoreSettings;

/// Default lifetime of a presigned GET URL.
pub const PRESIGN_TTL: Duration = Duration::from_secs(3600);

/// Transient storage errors are retried this many times, linear backoff.
const STORE_RETRIES: u32 = 3;

type StoreResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage: upload failed: {0}")]
    Upload(#[from] RusotoError<PutObjectError>),
    #[error("storage: fetch failed: {0}")]
    Fetch(#[from] RusotoError<GetObjectError>),
    #[error("storage: list failed: {0}")]
    List(#[from] RusotoError<ListObjectsV2Error>),
    #[error("storage: object {0} has no body")]
    EmptyObject(String),
    #[error("storage: '{0}' is not a content hash")]
    BadHash(String),
    #[error("storage: download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("storage: download of {url} got HTTP {status}")]
    DownloadStatus { url: String, status: u16 },
    #[error("storage: io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    HttpClient(#[from] TlsError),
}

/// Content-addressed object store over S3-style semantics at a custom
/// endpoint. Objects are keyed by the hex SHA-256 of their bytes, which
/// makes every upload idempotent.
pub struct ObjectStore {
    s3: S3Client,
    region: Region,
    credentials: AwsCredentials,
    bucket: String,
    endpoint: String,
    http: reqwest::Client,
}

impl ObjectStore {
    pub fn new(settings: &StoreSettings) -> StoreResult<Self> {
        let region = Region::Custom {
            name: "o3".to_string(),
            endpoint: settings.endpoint.clone(),
        };
        let provider =
            StaticProvider::new_minimal(settings.access_key.clone(), settings.secret_key.clone());
        let dispatcher = HttpClient::new()?;
        let s3 = S3Client::new_with(dispatcher, provider, region.clone());

        Ok(Self {
            s3,
            region,
            credentials: AwsCredentials::new(
                settings.access_key.clone(),
                settings.secret_key.clone(),
                None,
                None,
            ),
            bucket: settings.bucket.clone(),
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        })
    }

    /// Upload a payload, keyed by its content hash. Re-uploading the same
    /// bytes is a no-op.
    pub async fn upload(&self, data: Vec<u8>) -> StoreResult<String> {
        let hash = content_hash(&data);

        let head = HeadObjectRequest {
            bucket: self.bucket.clone(),
            key: hash.clone(),
            ..Default::default()
        };
        if self.s3.head_object(head).await.is_ok() {
            tracing::debug!(key = %hash, "Object already present, skipping upload");
            return Ok(hash);
        }

        let mut attempt = 0;
        loop {
            let req = PutObjectRequest {
                bucket: self.bucket.clone(),
                key: hash.clone(),
                body: Some(StreamingBody::from(data.clone())),
                ..Default::default()
            };
            match self.s3.put_object(req).await {
                Ok(_) => {
                    tracing::debug!(key = %hash, bytes = data.len(), "Uploaded object");
                    return Ok(hash);
                }
                Err(e) if attempt + 1 < STORE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(key = %hash, attempt, error = %e, "Upload failed, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sign a time-limited GET URL for a stored object.
    pub fn presign_get(&self, hash: &str, ttl: Duration) -> StoreResult<String> {
        if !is_content_hash(hash) {
            return Err(StorageError::BadHash(hash.to_string()));
        }
        let req = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: hash.to_string(),
            ..Default::default()
        };
        Ok(req.get_presigned_url(
            &self.region,
            &self.credentials,
            &PreSignedRequestOption { expires_in: ttl },
        ))
    }

    /// Unauthenticated fallback URL when presigning is unavailable; the
    /// store will answer 403 unless the bucket is public, which the UI
    /// handles by retrying through `/generate-presigned-url`.
    pub fn raw_url(&self, hash: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, hash)
    }

    /// Fetch an object's bytes by content hash.
    pub async fn fetch(&self, hash: &str) -> StoreResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            let req = GetObjectRequest {
                bucket: self.bucket.clone(),
                key: hash.to_string(),
                ..Default::default()
            };
            match self.s3.get_object(req).await {
                Ok(output) => {
                    let body = output
                        .body
                        .ok_or_else(|| StorageError::EmptyObject(hash.to_string()))?;
                    let mut bytes = Vec::new();
                    body.into_async_read().read_to_end(&mut bytes).await?;
                    return Ok(bytes);
                }
                Err(e) if attempt + 1 < STORE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(key = %hash, attempt, error = %e, "Fetch failed, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// List object keys in the bucket.
    pub async fn list(&self) -> StoreResult<Vec<String>> {
        let req = ListObjectsV2Request {
            bucket: self.bucket.clone(),
            max_keys: Some(1000),
            ..Default::default()
        };
        let output = self.s3.list_objects_v2(req).await?;
        Ok(output
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|obj| obj.key)
            .collect())
    }

    /// Download the body behind a signed URL.
    pub async fn download(&self, url: &str) -> StoreResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            let result = async {
                let resp = self.http.get(url).send().await?;
                if !resp.status().is_success() {
                    return Err(StorageError::DownloadStatus {
                        url: url.to_string(),
                        status: resp.status().as_u16(),
                    });
                }
                Ok(resp.bytes().await?.to_vec())
            }
            .await;

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt + 1 < STORE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(url, attempt, error = %e, "Download failed, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Split a CSV dataset into header-preserving chunks, upload each one,
    /// and upload a manifest whose body is the comma-joined signed chunk
    /// URLs. Returns a signed URL to the manifest and the chunk count.
    pub async fn upload_dataset_as_chunks(
        &self,
        path: &Path,
        chunk_bytes: usize,
    ) -> StoreResult<(String, usize)> {
        let content = tokio::fs::read_to_string(path).await?;
        let chunks = split_csv_chunks(&content, chunk_bytes);
        let count = chunks.len();

        let mut urls = Vec::with_capacity(count);
        for chunk in chunks {
            let hash = self.upload(chunk.into_bytes()).await?;
            urls.push(self.presign_get(&hash, PRESIGN_TTL)?);
        }

        let manifest_hash = self.upload(urls.join(",").into_bytes()).await?;
        let manifest_url = self.presign_get(&manifest_hash, PRESIGN_TTL)?;
        tracing::info!(chunks = count, manifest = %manifest_hash, "Dataset uploaded");
        Ok((manifest_url, count))
    }
}

/// Hex SHA-256 of a payload; doubles as the object key.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Line-oriented CSV splitter. The first line is the header and is
/// prepended to every chunk; lines are never split across chunks, so a
/// chunk may exceed the budget when a single line does.
pub fn split_csv_chunks(content: &str, budget: usize) -> Vec<String> {
    let mut lines = content.lines();
    let header = match lines.next() {
        Some(h) => h,
        None => return Vec::new(),
    };

    let mut chunks = Vec::new();
    let mut current = String::from(header);
    let mut current_has_data = false;

    for line in lines {
        if current_has_data && current.len() + line.len() + 1 > budget {
            current.push('\n');
            chunks.push(std::mem::replace(&mut current, String::from(header)));
            current_has_data = false;
        }
        current.push('\n');
        current.push_str(line);
        current_has_data = true;
    }

    if current_has_data || chunks.is_empty() {
        current.push('\n');
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv(rows: usize) -> String {
        let mut s = String::from("id,label,value");
        for i in 0..rows {
            s.push_str(&format!("\n{i},cat,{}", i * 3));
        }
        s
    }

    #[test]
    fn every_chunk_starts_with_the_header() {
        let data = csv(500);
        let chunks = split_csv_chunks(&data, 256);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.starts_with("id,label,value\n"));
        }
    }

    #[test]
    fn no_row_is_split_or_lost() {
        let data = csv(200);
        let chunks = split_csv_chunks(&data, 128);
        let mut rows = Vec::new();
        for chunk in &chunks {
            for line in chunk.lines().skip(1) {
                assert_eq!(line.split(',').count(), 3);
                rows.push(line.to_string());
            }
        }
        assert_eq!(rows.len(), 200);
        assert_eq!(rows[0], "0,cat,0");
        assert_eq!(rows[199], "199,cat,597");
    }

    #[test]
    fn small_dataset_is_one_chunk() {
        let chunks = split_csv_chunks(&csv(2), 50 * 1024);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn header_only_file_yields_one_chunk() {
        let chunks = split_csv_chunks("id,label,value", 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "id,label,value\n");
    }

    #[test]
    fn oversize_single_row_still_fits_somewhere() {
        let long_row = format!("0,cat,{}", "x".repeat(4096));
        let data = format!("id,label,value\n{long_row}\n1,dog,2");
        let chunks = split_csv_chunks(&data, 64);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains(&long_row));
        assert!(chunks[1].contains("1,dog,2"));
    }

    #[test]
    fn content_hash_is_stable_and_shaped() {
        let hash = content_hash(b"weights");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash(b"weights"));
        assert!(is_content_hash(&hash));
        assert!(!is_content_hash("https://store/object"));
    }
}
