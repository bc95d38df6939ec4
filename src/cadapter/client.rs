//! Object-store client abstraction.
//!
//! The rest of the crate talks to the remote store exclusively through
//! [`ObjectStore`]: bucket/prefix listings, version listings and the basic
//! get/put/delete calls, all normalized into the uniform shapes below.
//! Backends live in sibling modules (`s3` for the real thing, `memory` for
//! tests and demos).

use async_trait::async_trait;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;

/// Failures surfaced by a store backend. Anything transport-level is folded
/// into `Remote` with the backend's own detail string preserved for logs.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store call failed: {0}")]
    Remote(String),
    #[error("no such bucket or key: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BucketInfo {
    pub name: String,
    pub created: SystemTime,
}

/// One entry of a bucket/prefix listing. `key` is relative to the bucket.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    pub modified: SystemTime,
}

/// One entry of a version listing, delete markers included.
#[derive(Debug, Clone)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
    pub size: i64,
    pub modified: SystemTime,
    pub is_latest: bool,
    pub delete_marker: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningState {
    Enabled,
    Suspended,
    Unversioned,
}

impl VersioningState {
    /// Enabled and Suspended buckets both carry version history worth listing.
    pub fn is_versioned(self) -> bool {
        !matches!(self, VersioningState::Unversioned)
    }
}

/// Narrow procedural interface to the remote object store.
///
/// Full object keys passed to `get_object`/`put_object`/`delete_object` are
/// `bucket/rest-of-key` with no leading slash; listing calls take the bucket
/// and an optional key prefix separately.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StoreError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectInfo>, StoreError>;

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectVersion>, StoreError>;

    /// Download one object (optionally a specific version) into `dest`,
    /// creating parent directories as needed.
    async fn get_object(
        &self,
        key: &str,
        version_id: Option<&str>,
        dest: &Path,
    ) -> Result<(), StoreError>;

    /// Upload the file at `src` under `key`.
    async fn put_object(&self, key: &str, src: &Path) -> Result<(), StoreError>;

    async fn delete_object(&self, key: &str, version_id: Option<&str>) -> Result<(), StoreError>;

    async fn create_bucket(&self, name: &str) -> Result<(), StoreError>;

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError>;

    async fn get_bucket_versioning(&self, bucket: &str) -> Result<VersioningState, StoreError>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<T> {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StoreError> {
        (**self).list_buckets().await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectInfo>, StoreError> {
        (**self).list_objects(bucket, prefix, max_keys).await
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys: i32,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        (**self).list_object_versions(bucket, prefix, max_keys).await
    }

    async fn get_object(
        &self,
        key: &str,
        version_id: Option<&str>,
        dest: &Path,
    ) -> Result<(), StoreError> {
        (**self).get_object(key, version_id, dest).await
    }

    async fn put_object(&self, key: &str, src: &Path) -> Result<(), StoreError> {
        (**self).put_object(key, src).await
    }

    async fn delete_object(&self, key: &str, version_id: Option<&str>) -> Result<(), StoreError> {
        (**self).delete_object(key, version_id).await
    }

    async fn create_bucket(&self, name: &str) -> Result<(), StoreError> {
        (**self).create_bucket(name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        (**self).delete_bucket(name).await
    }

    async fn get_bucket_versioning(&self, bucket: &str) -> Result<VersioningState, StoreError> {
        (**self).get_bucket_versioning(bucket).await
    }
}
