//! S3 adapter: aws-sdk-s3 backed `ObjectStore` with multipart upload for
//! large objects, basic retries and Content-MD5 validation.

use crate::cadapter::client::{
    BucketInfo, ObjectInfo, ObjectStore, ObjectVersion, StoreError, VersioningState,
};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// S3 backend configuration options.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint URL (e.g. a MinIO instance); None uses the SDK default.
    pub endpoint_url: Option<String>,
    pub region: String,
    /// Multipart part size in bytes.
    pub part_size: usize,
    /// Maximum concurrent part uploads.
    pub max_concurrency: usize,
    /// Maximum retry attempts for failed calls.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds (doubles per attempt).
    pub initial_retry_delay_ms: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: "us-east-1".to_string(),
            part_size: 8 * 1024 * 1024,
            max_concurrency: 8,
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    /// Build a store from environment credentials, the way the daemon is
    /// expected to run (no credential files are parsed here).
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::ConfigLoader::default()
            .credentials_provider(
                aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
            )
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let conf = loader.load().await;
        let client = Client::new(&conf);
        Self { client, config }
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    fn split_key(key: &str) -> Result<(&str, &str), StoreError> {
        key.trim_start_matches('/')
            .split_once('/')
            .ok_or_else(|| StoreError::Remote(format!("key without bucket component: {key}")))
    }

    fn map_err<E: std::fmt::Display>(what: &str, e: E) -> StoreError {
        let msg = format!("{e}");
        if msg.contains("NoSuchKey") || msg.contains("NoSuchBucket") || msg.contains("NotFound") {
            StoreError::NotFound(format!("{what}: {msg}"))
        } else {
            StoreError::Remote(format!("{what}: {msg}"))
        }
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let msg = format!("{e}");
                    let terminal = msg.contains("NoSuchKey")
                        || msg.contains("NoSuchBucket")
                        || msg.contains("NotFound");
                    if terminal || attempt > self.config.max_retries {
                        return Err(Self::map_err(operation_name, msg));
                    }
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    debug!("{operation_name} attempt {attempt} failed, retrying: {msg}");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn put_multipart(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_err("create_multipart_upload", e))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency));

        let mut parts = Vec::new();
        let total = data.len();
        let mut idx = 0usize;
        let mut part_number = 1i32;
        while idx < total {
            let end = (idx + self.config.part_size).min(total);
            let chunk = data[idx..end].to_vec();
            let client = self.client.clone();
            let bucket = bucket.to_string();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            let sem = sem.clone();
            let pn = part_number;
            parts.push(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|e| StoreError::Remote(format!("upload pool closed: {e}")))?;
                let checksum = Self::md5_base64(&chunk);
                let resp = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(pn)
                    .content_md5(checksum)
                    .body(chunk.into())
                    .send()
                    .await
                    .map_err(|e| Self::map_err("upload_part", e))?;
                Ok::<_, StoreError>((pn, resp.e_tag().map(|s| s.to_string())))
            });
            idx = end;
            part_number += 1;
        }

        let results = match futures::future::try_join_all(parts).await {
            Ok(v) => v,
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("abort_multipart_upload failed for {key}: {abort_err}");
                }
                return Err(e);
            }
        };

        let completed_parts = results
            .into_iter()
            .map(|(pn, etag)| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(pn)
                    .set_e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();
        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| Self::map_err("complete_multipart_upload", e))?;
        Ok(())
    }
}

fn to_system_time(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> SystemTime {
    match dt {
        Some(d) if d.secs() >= 0 => UNIX_EPOCH + Duration::from_secs(d.secs() as u64),
        _ => UNIX_EPOCH,
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StoreError> {
        let resp = self
            .execute_with_retry(|| self.client.list_buckets().send(), "list_buckets")
            .await?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| {
                b.name().map(|name| BucketInfo {
                    name: name.to_string(),
                    created: to_system_time(b.creation_date()),
                })
            })
            .collect())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .max_keys(max_keys);
            if let Some(p) = prefix {
                req = req.prefix(p);
            }
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = self
                .execute_with_retry(|| req.clone().send(), "list_objects_v2")
                .await?;
            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                out.push(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0),
                    modified: to_system_time(obj.last_modified()),
                });
            }
            if out.len() >= max_keys as usize {
                out.truncate(max_keys as usize);
                break;
            }
            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(out)
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        let mut req = self
            .client
            .list_object_versions()
            .bucket(bucket)
            .max_keys(max_keys);
        if let Some(p) = prefix {
            req = req.prefix(p);
        }
        let resp = self
            .execute_with_retry(|| req.clone().send(), "list_object_versions")
            .await?;

        // The SDK splits versions and delete markers into two lists; fold them
        // back into one stream ordered by key, newest first within a key.
        let mut out: Vec<ObjectVersion> = Vec::new();
        for v in resp.versions() {
            let Some(key) = v.key() else { continue };
            out.push(ObjectVersion {
                key: key.to_string(),
                version_id: v.version_id().map(|s| s.to_string()),
                size: v.size().unwrap_or(0),
                modified: to_system_time(v.last_modified()),
                is_latest: v.is_latest().unwrap_or(false),
                delete_marker: false,
            });
        }
        for m in resp.delete_markers() {
            let Some(key) = m.key() else { continue };
            out.push(ObjectVersion {
                key: key.to_string(),
                version_id: m.version_id().map(|s| s.to_string()),
                size: 0,
                modified: to_system_time(m.last_modified()),
                is_latest: m.is_latest().unwrap_or(false),
                delete_marker: true,
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key).then(b.modified.cmp(&a.modified)));
        out.truncate(max_keys as usize);
        Ok(out)
    }

    async fn get_object(
        &self,
        key: &str,
        version_id: Option<&str>,
        dest: &Path,
    ) -> Result<(), StoreError> {
        let (bucket, rest) = Self::split_key(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut req = self.client.get_object().bucket(bucket).key(rest);
        if let Some(id) = version_id {
            req = req.version_id(id);
        }
        let resp = req.send().await.map_err(|e| Self::map_err("get_object", e))?;
        let mut body = resp.body.into_async_read();
        let mut file = tokio::fs::File::create(dest).await?;
        tokio::io::copy(&mut body, &mut file).await?;
        Ok(())
    }

    async fn put_object(&self, key: &str, src: &Path) -> Result<(), StoreError> {
        let (bucket, rest) = Self::split_key(key)?;
        let data = tokio::fs::read(src).await?;
        if data.len() > self.config.part_size {
            return self.put_multipart(bucket, rest, &data).await;
        }
        // Small objects: direct put with a short retry loop.
        let checksum = Self::md5_base64(&data);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let req = self
                .client
                .put_object()
                .bucket(bucket)
                .key(rest)
                .body(data.clone().into())
                .content_md5(checksum.clone());
            match req.send().await {
                Ok(_) => return Ok(()),
                Err(_e) if attempt < self.config.max_retries => {
                    sleep(Duration::from_millis(
                        self.config.initial_retry_delay_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(Self::map_err("put_object", e)),
            }
        }
    }

    async fn delete_object(&self, key: &str, version_id: Option<&str>) -> Result<(), StoreError> {
        let (bucket, rest) = Self::split_key(key)?;
        let mut req = self.client.delete_object().bucket(bucket).key(rest);
        if let Some(id) = version_id {
            req = req.version_id(id);
        }
        req.send()
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err("delete_object", e))
    }

    async fn create_bucket(&self, name: &str) -> Result<(), StoreError> {
        self.client
            .create_bucket()
            .bucket(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err("create_bucket", e))
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        self.client
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err("delete_bucket", e))
    }

    async fn get_bucket_versioning(&self, bucket: &str) -> Result<VersioningState, StoreError> {
        let resp = self
            .execute_with_retry(
                || self.client.get_bucket_versioning().bucket(bucket).send(),
                "get_bucket_versioning",
            )
            .await?;
        Ok(match resp.status().map(|s| s.as_str()) {
            Some("Enabled") => VersioningState::Enabled,
            Some("Suspended") => VersioningState::Suspended,
            _ => VersioningState::Unversioned,
        })
    }
}
